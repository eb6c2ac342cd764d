//! Connection Negotiation
//!
//! Brings an ELM327 from power-up to a configured adapter on a live bus:
//!
//! `Disconnected → AdapterReset → BaudProbe(step) → ModeConfig → BusProbe → Connected`
//!
//! Any state may end in `Failed`. Baud stepping is best effort; a failed
//! step falls back to the last confirmed rate and is kept as a diagnostic.

use crate::config::NegotiatorConfig;
use crate::decode::Payload;
use crate::error::{ConnectError, TransportError};
use crate::response::{contains_any, last_line, prune};
use crate::session::Session;
use crate::transport::{SerialLink, Transport};
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Final diagnostic appended when the adapter could not be initialized
pub const INIT_FAILED: &str = "FAILED TO INITIALIZE ELM327 DEVICE.";

/// Probe responses meaning the adapter could not reach the ECU
pub const BUS_FAILURE_MARKERS: [&str; 3] = ["UNABLE TO CONNECT", "BUS INIT: ...ERROR", "CAN ERROR"];

/// Bus probe request: monitor status, also the MIL source
const BUS_PROBE: &[u8] = b"0101\r";

/// One candidate rate for `AT BRD`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaudStep {
    /// Hex divisor argument of `AT BRD`
    pub divisor: &'static str,
    pub baud_rate: u32,
    pub label: &'static str,
}

impl BaudStep {
    fn command(&self) -> String {
        format!("AT BRD {}", self.divisor)
    }

    fn failure(&self, detail: &str) -> String {
        format!(
            "FAILED: {} (Set {}){}",
            self.command(),
            self.label,
            detail
        )
    }
}

/// Rates tried in order, fastest last
pub const BAUD_STEPS: [BaudStep; 4] = [
    BaudStep {
        divisor: "45",
        baud_rate: 57600,
        label: "57.6kbps",
    },
    BaudStep {
        divisor: "23",
        baud_rate: 115200,
        label: "115.2kbps",
    },
    BaudStep {
        divisor: "11",
        baud_rate: 230400,
        label: "230.4kbps",
    },
    BaudStep {
        divisor: "08",
        baud_rate: 500000,
        label: "500.0kbps",
    },
];

/// Negotiation progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Disconnected,
    AdapterReset,
    /// Index into [`BAUD_STEPS`]
    BaudProbe(usize),
    ModeConfig,
    BusProbe,
    Connected,
    Failed(String),
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Disconnected => write!(f, "Disconnected"),
            NegotiationState::AdapterReset => write!(f, "AdapterReset"),
            NegotiationState::BaudProbe(step) => write!(f, "BaudProbe({})", step),
            NegotiationState::ModeConfig => write!(f, "ModeConfig"),
            NegotiationState::BusProbe => write!(f, "BusProbe"),
            NegotiationState::Connected => write!(f, "Connected"),
            NegotiationState::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// Result of one baud step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaudStepOutcome {
    /// Adapter confirmed the new rate
    Adopted,
    /// Adapter refused the `AT BRD` request
    Refused,
    /// First byte at the new rate did not match the identity
    IdentityMismatch,
    /// Identity matched but the confirmation was not acknowledged
    NotAcknowledged,
}

/// Adapter configuration commands and what they set
fn mode_commands(config: &NegotiatorConfig) -> Vec<(String, String)> {
    let mut commands: Vec<(String, String)> = [
        ("AT E0", "Set Echo Off"),
        ("AT L0", "Set Linefeed Off"),
        ("AT R1", "Set Responses On"),
        ("AT H0", "Set Headers Off"),
        ("AT S0", "Set Space Characters Off"),
    ]
    .iter()
    .map(|(c, d)| (c.to_string(), d.to_string()))
    .collect();
    commands.push((
        config.protocol.to_elm_command(),
        "Set Protocol".to_string(),
    ));
    commands
}

/// Whether `response` is exactly an `OK`, optionally after the echo of
/// `command` (echo is still on when `AT E0` is sent)
fn acknowledged(command: &str, response: &str) -> bool {
    let response = response.trim_start_matches('\n');
    response == "OK\n" || response == format!("{}\nOK\n", command)
}

/// Drives one connection attempt over a transport
pub struct Negotiator<'a, L: SerialLink> {
    transport: &'a mut Transport<L>,
    config: &'a NegotiatorConfig,
    state: NegotiationState,
    good_baud: u32,
    diagnostics: Vec<String>,
}

impl<'a, L: SerialLink> Negotiator<'a, L> {
    pub fn new(transport: &'a mut Transport<L>, config: &'a NegotiatorConfig) -> Self {
        Self {
            transport,
            config,
            state: NegotiationState::Disconnected,
            good_baud: config.initial_baud_rate,
            diagnostics: Vec::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    /// Diagnostics recorded so far, in order
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Vec<String> {
        self.diagnostics
    }

    fn transition(&mut self, state: NegotiationState) {
        info!("Negotiation {} -> {}", self.state, state);
        self.state = state;
    }

    fn pause(&self, period: Duration) {
        if !period.is_zero() {
            thread::sleep(period);
        }
    }

    /// Run the whole sequence.
    ///
    /// On failure the transport is left closed for bus failures and as-is
    /// otherwise; the reason is in [`Negotiator::state`].
    pub fn run(&mut self) -> Result<Session, ConnectError> {
        let result = self.negotiate();
        if let Err(e) = &result {
            self.transition(NegotiationState::Failed(e.to_string()));
        }
        result
    }

    fn negotiate(&mut self) -> Result<Session, ConnectError> {
        let adapter = self
            .reset()
            .and_then(|_| self.probe_baud_rates())
            .map_err(ConnectError::from)
            .and_then(|_| self.configure());

        if let Err(e) = adapter {
            if !matches!(e, ConnectError::AdapterNotConforming { .. }) {
                warn!("Adapter initialization failed: {}", e);
            }
            self.diagnostics.push(INIT_FAILED.to_string());
            return Err(e);
        }

        let status = self.probe_bus()?;
        self.transition(NegotiationState::Connected);

        let mut session = Session {
            port: self.transport.name().to_string(),
            baud_rate: self.transport.baud_rate(),
            mil_on: false,
            stored_code_count: 0,
            diagnostics: self.diagnostics.clone(),
        };
        session.apply_status_byte(status);
        Ok(session)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.transition(NegotiationState::AdapterReset);
        self.transport.open(self.config.initial_baud_rate)?;
        self.good_baud = self.config.initial_baud_rate;

        self.pause(self.config.reset_period());
        let banner = self.transport.get_response(b"AT Z\r")?;
        if last_line(&banner).is_empty() {
            return Err(TransportError::Silent {
                request: "AT Z".to_string(),
            });
        }
        debug!("Adapter reset: {}", last_line(&banner));
        self.pause(self.config.reset_period());
        Ok(())
    }

    fn probe_baud_rates(&mut self) -> Result<(), TransportError> {
        if !self.config.baud_stepping {
            return Ok(());
        }

        for (index, step) in BAUD_STEPS.iter().enumerate() {
            self.transition(NegotiationState::BaudProbe(index));
            let outcome = self.baud_step(step)?;
            debug!("Baud step {} -> {:?}", step.baud_rate, outcome);
            if outcome != BaudStepOutcome::Adopted {
                break;
            }
        }
        info!("Adapter link at {} baud", self.good_baud);
        Ok(())
    }

    /// Try one rate; the transport is back at a confirmed rate afterwards
    pub fn baud_step(&mut self, step: &BaudStep) -> Result<BaudStepOutcome, TransportError> {
        let identity_response = self.transport.get_response(b"AT I\r")?;
        let identity = last_line(&identity_response).to_string();

        let request = format!("{}\r", step.command());
        let answer = self.transport.get_response(request.as_bytes())?;
        if last_line(&answer) != "OK" {
            info!("Adapter refused {}, staying at {} baud", step.command(), self.good_baud);
            return Ok(BaudStepOutcome::Refused);
        }

        self.transport.open(step.baud_rate)?;
        let first = self.transport.read_byte()?;
        let matched = matches!((first, identity.bytes().next()), (Some(a), Some(b)) if a == b);
        if !matched {
            warn!(
                "Identity mismatch at {} baud (got {:?}), falling back to {}",
                step.baud_rate, first, self.good_baud
            );
            self.diagnostics.push(step.failure(" - identity mismatch"));
            self.fall_back()?;
            return Ok(BaudStepOutcome::IdentityMismatch);
        }

        let confirmation = self.transport.get_response(b"\r")?;
        if last_line(&confirmation) != "OK" {
            warn!(
                "{} not acknowledged, falling back to {}",
                step.command(),
                self.good_baud
            );
            self.diagnostics.push(step.failure(""));
            self.fall_back()?;
            return Ok(BaudStepOutcome::NotAcknowledged);
        }

        self.good_baud = step.baud_rate;
        Ok(BaudStepOutcome::Adopted)
    }

    fn fall_back(&mut self) -> Result<(), TransportError> {
        self.transport.open(self.good_baud)?;
        self.pause(self.config.reset_period());
        Ok(())
    }

    fn configure(&mut self) -> Result<(), ConnectError> {
        self.transition(NegotiationState::ModeConfig);

        for (command, description) in mode_commands(self.config) {
            let request = format!("{}\r", command);
            let response = self.transport.get_response(request.as_bytes())?;
            if !acknowledged(&command, &response) {
                warn!("{} rejected: {:?}", command, response);
                self.diagnostics
                    .push(format!("FAILED: {} ({})", command, description));
                return Err(ConnectError::AdapterNotConforming { step: command });
            }
        }
        Ok(())
    }

    /// Returns byte A of the monitor status
    fn probe_bus(&mut self) -> Result<u8, ConnectError> {
        self.transition(NegotiationState::BusProbe);
        self.pause(self.config.settle_period());

        let response = self.transport.get_response(BUS_PROBE)?;
        if contains_any(&response, &BUS_FAILURE_MARKERS) {
            return Err(self.bus_failure(&response));
        }

        let payload = prune(&response, 2);
        match Payload::new(&payload).byte(0) {
            Ok(status) => Ok(status),
            Err(e) => {
                warn!("Unreadable bus probe payload {:?}: {}", payload, e);
                Err(self.bus_failure(&response))
            }
        }
    }

    fn bus_failure(&mut self, response: &str) -> ConnectError {
        let reason = last_line(response).to_string();
        warn!("Vehicle bus not connected: {}", reason);
        self.diagnostics.push(format!("FAILED TO CONNECT TO VEHICLE BUS: {}", reason));
        self.transport.close();
        ConnectError::BusNotConnected { response: reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::mock::MockAdapter;

    fn negotiate(adapter: MockAdapter) -> (Result<Session, ConnectError>, Vec<String>, Transport<MockAdapter>) {
        let mut transport = Transport::new(adapter, &TransportConfig::default());
        let config = NegotiatorConfig::immediate();
        let mut negotiator = Negotiator::new(&mut transport, &config);
        let result = negotiator.run();
        let diagnostics = negotiator.into_diagnostics();
        (result, diagnostics, transport)
    }

    #[test]
    fn test_full_negotiation() {
        let adapter = MockAdapter::new().with_response("0101", "4101830701FF");
        let (result, diagnostics, transport) = negotiate(adapter);
        let session = result.unwrap();
        assert_eq!(session.baud_rate, 500000);
        assert!(session.mil_on);
        assert_eq!(session.stored_code_count, 3);
        assert!(diagnostics.is_empty());
        assert!(transport.is_open());

        let requests = transport.link().requests();
        assert!(requests.iter().any(|r| r == "AT SP A3"));
        assert_eq!(requests.last().map(String::as_str), Some("0101"));
    }

    #[test]
    fn test_identity_mismatch_keeps_good_rate() {
        let adapter = MockAdapter::new()
            .with_response("0101", "41010007E500")
            .with_garbled_rate(230400);
        let (result, diagnostics, transport) = negotiate(adapter);
        let session = result.unwrap();
        assert_eq!(session.baud_rate, 115200);
        assert_eq!(transport.link().adapter_baud(), 115200);
        assert_eq!(
            diagnostics,
            vec!["FAILED: AT BRD 11 (Set 230.4kbps) - identity mismatch".to_string()]
        );
        assert_eq!(session.diagnostics, diagnostics);
        assert!(!session.mil_on);
    }

    #[test]
    fn test_unacknowledged_step() {
        let adapter = MockAdapter::new().with_refused_ack();
        let (result, diagnostics, _) = negotiate(adapter);
        let session = result.unwrap();
        assert_eq!(session.baud_rate, 38400);
        assert_eq!(diagnostics, vec!["FAILED: AT BRD 45 (Set 57.6kbps)".to_string()]);
    }

    #[test]
    fn test_refused_step_stops_silently() {
        let adapter = MockAdapter::new().with_max_baud(115200);
        let (result, diagnostics, _) = negotiate(adapter);
        assert_eq!(result.unwrap().baud_rate, 115200);
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_mode_config_failure() {
        let adapter = MockAdapter::new().with_rejected("AT H0");
        let (result, diagnostics, transport) = negotiate(adapter);
        match result {
            Err(ConnectError::AdapterNotConforming { step }) => assert_eq!(step, "AT H0"),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(
            diagnostics,
            vec![
                "FAILED: AT H0 (Set Headers Off)".to_string(),
                INIT_FAILED.to_string()
            ]
        );

        // Configuration stops at the rejected command
        let requests = transport.link().requests();
        assert_eq!(requests.last().map(String::as_str), Some("AT H0"));
        for skipped in ["AT S0", "AT SP A3", "0101"] {
            assert!(!requests.iter().any(|r| r == skipped), "{} was sent", skipped);
        }
    }

    #[test]
    fn test_slow_init_connects() {
        let adapter = MockAdapter::new()
            .with_slow_init()
            .with_response("0101", "4101830701FF");
        let (result, diagnostics, transport) = negotiate(adapter);
        let session = result.unwrap();
        assert!(session.mil_on);
        assert_eq!(session.stored_code_count, 3);
        assert!(diagnostics.is_empty());
        assert!(transport.is_open());
    }

    #[test]
    fn test_slow_init_error_is_bus_failure() {
        let adapter = MockAdapter::new().with_bus_disconnected("BUS INIT: ...ERROR");
        let (result, diagnostics, _) = negotiate(adapter);
        match result {
            Err(ConnectError::BusNotConnected { response }) => {
                assert_eq!(response, "BUS INIT: ...ERROR")
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(
            diagnostics,
            vec!["FAILED TO CONNECT TO VEHICLE BUS: BUS INIT: ...ERROR".to_string()]
        );
    }

    #[test]
    fn test_bus_not_connected() {
        let adapter = MockAdapter::new().with_bus_disconnected("UNABLE TO CONNECT");
        let (result, _, transport) = negotiate(adapter);
        assert!(matches!(result, Err(ConnectError::BusNotConnected { .. })));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_can_error_is_bus_failure() {
        let adapter = MockAdapter::new().with_bus_disconnected("CAN ERROR");
        let (result, _, _) = negotiate(adapter);
        match result {
            Err(ConnectError::BusNotConnected { response }) => assert_eq!(response, "CAN ERROR"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_adapter_unreachable() {
        let (result, diagnostics, _) = negotiate(MockAdapter::new().with_open_failure());
        assert!(matches!(result, Err(ConnectError::AdapterUnreachable(_))));
        assert_eq!(diagnostics, vec![INIT_FAILED.to_string()]);
    }

    #[test]
    fn test_state_after_failure() {
        let mut transport = Transport::new(
            MockAdapter::new().with_rejected("AT E0"),
            &TransportConfig::default(),
        );
        let config = NegotiatorConfig::immediate();
        let mut negotiator = Negotiator::new(&mut transport, &config);
        assert!(negotiator.run().is_err());
        assert!(matches!(negotiator.state(), NegotiationState::Failed(_)));
    }

    #[test]
    fn test_acknowledged() {
        assert!(acknowledged("AT E0", "AT E0\nOK\n"));
        assert!(acknowledged("AT L0", "OK\n"));
        assert!(!acknowledged("AT L0", "?\n"));
        assert!(!acknowledged("AT L0", "OK\nOK\n"));
    }
}
