//! OBD-II Protocol Engine
//!
//! This crate talks to ELM327-compatible adapters over a serial link:
//! connection negotiation, supported-PID discovery, table-driven PID
//! decoding and diagnostic trouble code lookup.

mod client;
mod config;
pub mod decode;
pub mod discovery;
pub mod dtc;
mod error;
pub mod mock;
pub mod negotiator;
pub mod pid;
mod protocol;
pub mod response;
mod session;
pub mod tables;
pub mod transport;

pub use client::{ObdClient, INFO_WARNING};
pub use config::{NegotiatorConfig, TableConfig, TransportConfig};
pub use discovery::{BitmapSource, ValidPidSet};
pub use error::{ConnectError, DecodeError, TableError, TransportError};
pub use negotiator::{BaudStepOutcome, NegotiationState};
pub use pid::{DecodeResult, Field, FieldValue, PidRegistry, Sentinel};
pub use protocol::{ObdProtocol, ProtocolSelection};
pub use session::Session;
pub use tables::{DirTableLoader, LookupTables, MemoryTableLoader, TableLoader};
pub use transport::{SerialLink, SerialPortLink, Transport};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Oxygen sensor monitoring
    pub const O2_MONITOR: u8 = 0x05;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
}
