//! Byte-Stream Transport
//!
//! One request/response transaction at a time over a half-duplex serial
//! link. The ELM327 ends every answer with a `>` prompt; a transaction reads
//! until that prompt, end-of-stream or the idle timeout.

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::response::normalize;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::{debug, info};

/// Prompt the adapter prints when it is ready for the next request
pub const PROMPT: u8 = b'>';

/// A duplex serial-like channel that can be reopened at a new baud rate.
pub trait SerialLink: Send {
    /// Open (or reopen) the channel at `baud_rate`
    fn open(&mut self, baud_rate: u32) -> Result<(), TransportError>;

    /// Close the channel; pending reads are abandoned
    fn close(&mut self);

    /// Whether the channel is currently open
    fn is_open(&self) -> bool;

    /// Write all bytes
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read one byte; `None` on end-of-stream or idle timeout
    fn read_byte(&mut self) -> Result<Option<u8>, TransportError>;

    /// Human readable channel name (device path for serial ports)
    fn name(&self) -> &str;
}

/// [`SerialLink`] over a physical or USB serial port
pub struct SerialPortLink {
    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    device: String,
    /// Per-byte idle timeout
    timeout: Duration,
    port: Option<Box<dyn tokio_serial::SerialPort>>,
}

impl SerialPortLink {
    /// Create a closed link for `device`
    pub fn new(device: &str, timeout: Duration) -> Self {
        Self {
            device: device.to_string(),
            timeout,
            port: None,
        }
    }

    /// Create a closed link from transport configuration
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(&config.port, config.timeout())
    }
}

impl SerialLink for SerialPortLink {
    fn open(&mut self, baud_rate: u32) -> Result<(), TransportError> {
        // Drop the old handle first, some drivers refuse a second open.
        self.port = None;
        let port = tokio_serial::new(self.device.as_str(), baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|e| TransportError::Open {
                port: self.device.clone(),
                baud_rate,
                reason: e.to_string(),
            })?;
        info!("Opened {} at {} baud", self.device, baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed {}", self.device);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        let mut byte = [0u8; 1];
        match port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.device
    }
}

/// Request/response framing on top of a [`SerialLink`].
///
/// All methods take `&mut self`, so a second transaction cannot start before
/// the previous prompt has been consumed.
pub struct Transport<L: SerialLink> {
    link: L,
    line_ending: Vec<u8>,
    baud_rate: u32,
}

impl<L: SerialLink> Transport<L> {
    /// Wrap a link; nothing is opened yet
    pub fn new(link: L, config: &TransportConfig) -> Self {
        Self {
            link,
            line_ending: config.line_ending.as_bytes().to_vec(),
            baud_rate: 0,
        }
    }

    /// Open or reopen the link at `baud_rate`
    pub fn open(&mut self, baud_rate: u32) -> Result<(), TransportError> {
        self.link.open(baud_rate)?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    /// Close the link
    pub fn close(&mut self) {
        self.link.close();
    }

    /// Whether the link is open
    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Baud rate the link was last opened at
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Name of the underlying channel
    pub fn name(&self) -> &str {
        self.link.name()
    }

    /// Borrow the underlying link
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Read a single raw byte, used to sample the adapter after a baud change
    pub fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        self.link.read_byte()
    }

    /// Send `request` and collect the response up to the prompt.
    ///
    /// `\r` in the request is replaced with the configured line ending. Bytes
    /// with the high bit set are line noise and dropped. A timeout returns
    /// whatever was read so far.
    pub fn transact(&mut self, request: &[u8]) -> Result<String, TransportError> {
        let mut data = Vec::with_capacity(request.len() + 1);
        for &byte in request {
            if byte == b'\r' {
                data.extend_from_slice(&self.line_ending);
            } else {
                data.push(byte);
            }
        }

        debug!("Sending [{}] {:?}", data.len(), String::from_utf8_lossy(&data));
        self.link.write_all(&data)?;

        let mut response = String::new();
        while let Some(byte) = self.link.read_byte()? {
            if byte > 127 {
                debug!("Rejecting received byte {}", byte);
                continue;
            }
            if byte == PROMPT {
                break;
            }
            response.push(byte as char);
        }

        debug!("Received [{}] {:?}", response.len(), response);
        Ok(response)
    }

    /// [`Transport::transact`] followed by [`normalize`]
    pub fn get_response(&mut self, request: &[u8]) -> Result<String, TransportError> {
        Ok(normalize(&self.transact(request)?))
    }
}
