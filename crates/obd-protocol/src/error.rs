//! OBD-II Error Types

use thiserror::Error;

/// Errors raised by the byte-stream transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Serial port could not be opened
    #[error("Failed to open serial port {port} at {baud_rate} baud: {reason}")]
    Open {
        port: String,
        baud_rate: u32,
        reason: String,
    },

    /// Read or write failure on an open port
    #[error("Serial port error: {0}")]
    Io(String),

    /// Transaction attempted on a closed port
    #[error("Serial port is not open")]
    Closed,

    /// Nothing came back before the idle timeout
    #[error("No response to {request}")]
    Silent { request: String },
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Terminal outcome of a failed connection attempt
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Serial open or I/O failure, nothing usable on the other end
    #[error("ELM327 adapter unreachable: {0}")]
    AdapterUnreachable(#[from] TransportError),

    /// Adapter answered but rejected the configuration sequence
    #[error("ELM327 adapter not conforming, failed at {step}")]
    AdapterNotConforming { step: String },

    /// Adapter is fine, the ECU could not be reached over the bus
    #[error("Vehicle bus not connected: {response}")]
    BusNotConnected { response: String },
}

/// Failure while applying a decode formula to a payload
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// Payload shorter than the formula requires
    #[error("Payload too short: need {needed} hex digits, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Payload contains characters that are not hex digits
    #[error("Invalid hex payload: {0:?}")]
    InvalidHex(String),

    /// Trouble code prefix digit missing from the prefix table
    #[error("No trouble code prefix for digit {0}")]
    UnknownPrefix(char),

    /// Text payload is not valid UTF-8
    #[error("Invalid text payload: {0}")]
    InvalidText(String),

    /// Supported-PID bitmaps update the valid set instead of decoding
    #[error("Supported-PID bitmaps are read by discovery")]
    DiscoveryOnly,
}

/// Failure reading a static lookup table
#[derive(Debug, Error)]
pub enum TableError {
    #[error("FAILED TO READ FILE: {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Unknown table: {0}")]
    Unknown(String),
}
