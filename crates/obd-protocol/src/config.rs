//! Engine configuration

use crate::protocol::ProtocolSelection;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serial transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    pub port: String,
    /// Idle read/write timeout per transaction (milliseconds)
    pub timeout_ms: u64,
    /// Line terminator sent in place of `\r`
    pub line_ending: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            timeout_ms: 7000,
            line_ending: "\r".to_string(),
        }
    }
}

impl TransportConfig {
    /// Idle timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Connection negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// Baud rate the adapter powers up at
    pub initial_baud_rate: u32,
    /// Pause around the adapter reset (milliseconds)
    pub reset_period_ms: u64,
    /// Pause before the first bus request (milliseconds)
    pub settle_period_ms: u64,
    /// Try to step the adapter to faster baud rates
    pub baud_stepping: bool,
    /// Bus protocol selection sent during mode configuration
    pub protocol: ProtocolSelection,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            initial_baud_rate: 38400,
            reset_period_ms: 1000,
            settle_period_ms: 5000,
            baud_stepping: true,
            protocol: ProtocolSelection::default(),
        }
    }
}

impl NegotiatorConfig {
    /// Config without any settle delays, for simulated adapters
    pub fn immediate() -> Self {
        Self {
            reset_period_ms: 0,
            settle_period_ms: 0,
            ..Default::default()
        }
    }

    pub fn reset_period(&self) -> Duration {
        Duration::from_millis(self.reset_period_ms)
    }

    pub fn settle_period(&self) -> Duration {
        Duration::from_millis(self.settle_period_ms)
    }
}

/// Static lookup table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Directory holding the `<name>.txt` tables
    pub data_dir: String,
    /// Vehicle-specific trouble code table layered over the ISO/SAE one
    pub vehicle: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            data_dir: "DATA".to_string(),
            vehicle: "TroubleCodes-R53_Cooper_S".to_string(),
        }
    }
}
