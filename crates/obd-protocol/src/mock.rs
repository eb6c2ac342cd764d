//! Simulated ELM327 Adapter
//!
//! An in-memory [`SerialLink`] that answers AT commands and scripted OBD
//! requests the way an ELM327 does, including echo, baud rate switching and
//! bus failures. Used to exercise the engine without hardware.

use crate::error::TransportError;
use crate::transport::{SerialLink, PROMPT};
use std::collections::{HashMap, HashSet, VecDeque};

/// Baud rate the adapter powers up at
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Identity string answered to `AT I`
pub const DEFAULT_IDENTITY: &str = "ELM327 v1.5";

/// `AT BRD` divisors the simulator understands
const BRD_RATES: [(&str, u32); 4] = [
    ("45", 57600),
    ("23", 115200),
    ("11", 230400),
    ("08", 500000),
];

/// A baud switch in progress: `OK` sent, waiting for the host to follow
#[derive(Debug, Clone, Copy)]
struct PendingSwitch {
    from: u32,
    to: u32,
}

/// Scriptable ELM327 simulator
#[derive(Debug, Clone)]
pub struct MockAdapter {
    name: String,
    open: bool,
    link_baud: u32,
    adapter_baud: u32,
    identity: String,
    echo: bool,
    linefeeds: bool,
    spaces: bool,
    max_baud: u32,
    garbled_rates: HashSet<u32>,
    refuse_ack: bool,
    bus_connected: bool,
    bus_error: String,
    searching: bool,
    slow_init: bool,
    noise: bool,
    fail_open: bool,
    rejected: HashSet<String>,
    at_answers: HashMap<String, String>,
    responses: HashMap<String, String>,
    pending: Option<PendingSwitch>,
    awaiting_ack: Option<u32>,
    input: Vec<u8>,
    output: VecDeque<u8>,
    requests: Vec<String>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Conforming adapter on a connected bus that supports no PIDs
    pub fn new() -> Self {
        let at_answers = [
            ("AT@1", "OBDII to RS232 Interpreter"),
            ("AT@2", "?"),
            ("ATDP", "AUTO, ISO 9141-2"),
            ("ATRV", "12.6V"),
            ("ATCS", "T:00 R:00"),
            ("ATKW", "1:08 2:08"),
            ("ATBD", "00 00 00 00 00 00 00 00 00 00 00 00 00"),
            ("ATPPS", "00:FF F 01:FF F 02:FF F 03:32 F"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            name: "mock-elm327".to_string(),
            open: false,
            link_baud: 0,
            adapter_baud: DEFAULT_BAUD_RATE,
            identity: DEFAULT_IDENTITY.to_string(),
            echo: true,
            linefeeds: true,
            spaces: true,
            max_baud: 500000,
            garbled_rates: HashSet::new(),
            refuse_ack: false,
            bus_connected: true,
            bus_error: "UNABLE TO CONNECT".to_string(),
            searching: true,
            slow_init: false,
            noise: false,
            fail_open: false,
            rejected: HashSet::new(),
            at_answers,
            responses: HashMap::new(),
            pending: None,
            awaiting_ack: None,
            input: Vec::new(),
            output: VecDeque::new(),
            requests: Vec::new(),
        }
    }

    /// Answer an OBD request (e.g. "010C") with `response`.
    ///
    /// The response is given as hex bytes, one ECU line per `\n`; spacing
    /// follows the simulated `AT S` setting.
    pub fn with_response(mut self, request: &str, response: &str) -> Self {
        self.responses.insert(compact(request), response.to_string());
        self
    }

    /// Highest rate `AT BRD` may switch to; faster requests answer `?`
    pub fn with_max_baud(mut self, baud_rate: u32) -> Self {
        self.max_baud = baud_rate;
        self
    }

    /// Corrupt the identity sent after switching to `baud_rate`
    pub fn with_garbled_rate(mut self, baud_rate: u32) -> Self {
        self.garbled_rates.insert(baud_rate);
        self
    }

    /// Never confirm a baud switch
    pub fn with_refused_ack(mut self) -> Self {
        self.refuse_ack = true;
        self
    }

    /// Answer `?` to the given AT command (e.g. "AT H0")
    pub fn with_rejected(mut self, command: &str) -> Self {
        self.rejected.insert(compact(command));
        self
    }

    /// Answer every OBD request with a bus failure message
    pub fn with_bus_disconnected(mut self, message: &str) -> Self {
        self.bus_connected = false;
        self.bus_error = message.to_string();
        self
    }

    /// Report an ISO 9141 slow init (`BUS INIT: ...OK`) on the first OBD request
    pub fn with_slow_init(mut self) -> Self {
        self.slow_init = true;
        self
    }

    /// Prefix every response with bytes that have the high bit set
    pub fn with_noise(mut self) -> Self {
        self.noise = true;
        self
    }

    /// Fail every open, as if no device were plugged in
    pub fn with_open_failure(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Every command received so far, spaces preserved, without terminator
    pub fn requests(&self) -> &[String] {
        &self.requests
    }

    /// Rate the simulated adapter is currently listening at
    pub fn adapter_baud(&self) -> u32 {
        self.adapter_baud
    }

    fn line_end(&self) -> &'static str {
        if self.linefeeds {
            "\r\n"
        } else {
            "\r"
        }
    }

    fn push(&mut self, text: &str) {
        self.output.extend(text.bytes());
    }

    fn push_prompted(&mut self, lines: &[String]) {
        if self.noise {
            self.output.push_back(0xFF);
        }
        let end = self.line_end();
        let mut text = String::new();
        for line in lines {
            text.push_str(line);
            text.push_str(end);
        }
        text.push_str(end);
        self.push(&text);
        self.output.push_back(PROMPT);
    }

    fn format_hex(&self, line: &str) -> String {
        let digits = compact(line);
        if !self.spaces {
            return digits;
        }
        digits
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn process(&mut self, raw: &str) {
        let command = compact(raw);
        self.requests.push(raw.to_string());

        if command.is_empty() {
            self.confirm_switch();
            return;
        }

        if self.echo {
            let echoed = format!("{}{}", raw, self.line_end());
            self.push(&echoed);
        }

        if self.rejected.contains(&command) {
            self.push_prompted(&["?".to_string()]);
            return;
        }

        if let Some(divisor) = command.strip_prefix("ATBRD") {
            self.request_switch(divisor);
            return;
        }

        let lines = match command.as_str() {
            "ATZ" => {
                self.echo = true;
                self.linefeeds = true;
                self.spaces = true;
                self.adapter_baud = DEFAULT_BAUD_RATE;
                // Reset banner is preceded by a blank line
                vec![String::new(), self.identity.clone()]
            }
            "ATI" => vec![self.identity.clone()],
            "ATE0" | "ATE1" => {
                self.echo = command == "ATE1";
                vec!["OK".to_string()]
            }
            "ATL0" | "ATL1" => {
                self.linefeeds = command == "ATL1";
                vec!["OK".to_string()]
            }
            "ATS0" | "ATS1" => {
                self.spaces = command == "ATS1";
                vec!["OK".to_string()]
            }
            "ATR1" | "ATH0" | "ATH1" => vec!["OK".to_string()],
            c if c.starts_with("ATSP") => vec!["OK".to_string()],
            c if c.starts_with("AT") => match self.at_answers.get(c) {
                Some(answer) => vec![answer.clone()],
                None => vec!["?".to_string()],
            },
            c if c.bytes().all(|b| b.is_ascii_hexdigit()) => self.obd_lines(c),
            _ => vec!["?".to_string()],
        };
        self.push_prompted(&lines);
    }

    fn obd_lines(&mut self, command: &str) -> Vec<String> {
        let mut lines = Vec::new();
        if self.searching {
            self.searching = false;
            lines.push("SEARCHING...".to_string());
        }
        if !self.bus_connected {
            lines.push(self.bus_error.clone());
            return lines;
        }
        if self.slow_init {
            self.slow_init = false;
            lines.push("BUS INIT: ...OK".to_string());
        }
        match self.responses.get(command).cloned() {
            Some(response) => lines.extend(response.lines().map(|line| self.format_hex(line))),
            None => lines.push("NO DATA".to_string()),
        }
        lines
    }

    fn request_switch(&mut self, divisor: &str) {
        let rate = BRD_RATES
            .iter()
            .find(|(d, _)| *d == divisor)
            .map(|(_, rate)| *rate);

        match rate {
            Some(to) if to <= self.max_baud => {
                // "OK" without a prompt, then the adapter changes rate
                let text = format!("OK{}", self.line_end());
                self.push(&text);
                self.pending = Some(PendingSwitch {
                    from: self.adapter_baud,
                    to,
                });
            }
            _ => self.push_prompted(&["?".to_string()]),
        }
    }

    fn confirm_switch(&mut self) {
        match self.awaiting_ack.take() {
            Some(from) if self.refuse_ack => {
                // Confirmation lost, the adapter falls back silently
                self.adapter_baud = from;
            }
            Some(_) => self.push_prompted(&["OK".to_string()]),
            None => self.output.push_back(PROMPT),
        }
    }
}

impl SerialLink for MockAdapter {
    fn open(&mut self, baud_rate: u32) -> Result<(), TransportError> {
        if self.fail_open {
            return Err(TransportError::Open {
                port: self.name.clone(),
                baud_rate,
                reason: "No such file or directory".to_string(),
            });
        }

        self.open = true;
        self.link_baud = baud_rate;
        self.output.clear();
        self.input.clear();

        if let Some(switch) = self.pending.take() {
            if baud_rate == switch.to {
                self.adapter_baud = switch.to;
                self.awaiting_ack = Some(switch.from);
                let identity = format!("{}\r", self.identity);
                if self.garbled_rates.contains(&baud_rate) {
                    self.output.extend(identity.bytes().map(|b| b | 0x80));
                } else {
                    self.output.extend(identity.bytes());
                }
            } else {
                self.adapter_baud = switch.from;
            }
        } else if let Some(from) = self.awaiting_ack.take() {
            self.adapter_baud = from;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.output.clear();
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        if self.link_baud != self.adapter_baud {
            // Framing errors on the adapter side, nothing is understood
            return Ok(());
        }

        for &byte in data {
            match byte {
                b'\r' => {
                    let raw = String::from_utf8_lossy(&self.input).into_owned();
                    self.input.clear();
                    self.process(raw.trim());
                }
                b'\n' => {}
                _ => self.input.push(byte),
            }
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        Ok(self.output.pop_front())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Uppercase with all whitespace removed
fn compact(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::transport::Transport;

    fn open(adapter: MockAdapter) -> Transport<MockAdapter> {
        let mut transport = Transport::new(adapter, &TransportConfig::default());
        transport.open(DEFAULT_BAUD_RATE).unwrap();
        transport
    }

    #[test]
    fn test_echo_then_echo_off() {
        let mut t = open(MockAdapter::new());
        assert_eq!(t.get_response(b"AT E0\r").unwrap(), "AT E0\nOK\n");
        assert_eq!(t.get_response(b"AT L0\r").unwrap(), "OK\n");
    }

    #[test]
    fn test_reset_banner() {
        let mut t = open(MockAdapter::new());
        assert_eq!(t.get_response(b"AT Z\r").unwrap(), "AT Z\nELM327 v1.5\n");
    }

    #[test]
    fn test_obd_response_spacing() {
        let adapter = MockAdapter::new().with_response("0100", "4100BE3EB811");
        let mut t = open(adapter);
        t.get_response(b"AT E0\r").unwrap();
        assert_eq!(t.get_response(b"0100\r").unwrap(), "41 00 BE 3E B8 11\n");
        t.get_response(b"AT S0\r").unwrap();
        assert_eq!(t.get_response(b"0100\r").unwrap(), "4100BE3EB811\n");
        assert_eq!(t.get_response(b"0105\r").unwrap(), "00000000000000\n");
    }

    #[test]
    fn test_baud_switch_sequence() {
        let mut t = open(MockAdapter::new());
        assert_eq!(t.get_response(b"AT BRD 23\r").unwrap(), "AT BRD 23\nOK\n");
        t.open(115200).unwrap();
        assert_eq!(t.read_byte().unwrap(), Some(b'E'));
        assert_eq!(t.get_response(b"\r").unwrap(), "LM327 v1.5\nOK\n");
        assert_eq!(t.link().adapter_baud(), 115200);
    }

    #[test]
    fn test_baud_switch_abandoned() {
        let mut t = open(MockAdapter::new());
        t.get_response(b"AT BRD 23\r").unwrap();
        t.open(115200).unwrap();
        t.open(DEFAULT_BAUD_RATE).unwrap();
        assert_eq!(t.link().adapter_baud(), DEFAULT_BAUD_RATE);
        assert_eq!(t.get_response(b"AT I\r").unwrap(), "AT I\nELM327 v1.5\n");
    }

    #[test]
    fn test_rate_mismatch_is_silent() {
        let mut t = open(MockAdapter::new());
        t.open(115200).unwrap();
        assert_eq!(t.transact(b"AT I\r").unwrap(), "");
    }

    #[test]
    fn test_slow_init_reported_once() {
        let adapter = MockAdapter::new()
            .with_slow_init()
            .with_response("0101", "4101830701FF");
        let mut t = open(adapter);
        t.get_response(b"AT E0\r").unwrap();
        let first = t.transact(b"0101\r").unwrap();
        assert!(first.contains("BUS INIT: ...OK"));
        let second = t.transact(b"0101\r").unwrap();
        assert!(!second.contains("BUS INIT"));
    }

    #[test]
    fn test_bus_disconnected() {
        let mut t = open(MockAdapter::new().with_bus_disconnected("UNABLE TO CONNECT"));
        assert_eq!(
            t.get_response(b"0101\r").unwrap(),
            "0101\nUNABLE TO CONNECT\n"
        );
    }
}
