//! Connection Session

use serde::{Deserialize, Serialize};

/// State of an established adapter connection.
///
/// Created by a successful connect; the MIL flag and stored code count are
/// refreshed by every current-data read of PID 0101.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Serial port device path
    pub port: String,
    /// Baud rate the adapter was left at
    pub baud_rate: u32,
    /// Malfunction indicator lamp state
    pub mil_on: bool,
    /// Number of stored trouble codes
    pub stored_code_count: u8,
    /// Ordered initialization log; failed steps and unreadable tables
    pub diagnostics: Vec<String>,
}

impl Session {
    /// Update MIL and code count from byte A of a PID 0101 payload
    pub fn apply_status_byte(&mut self, status: u8) {
        self.mil_on = status & 0x80 != 0;
        self.stored_code_count = status & 0x7F;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_status_byte() {
        let mut session = Session {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 38400,
            mil_on: false,
            stored_code_count: 0,
            diagnostics: Vec::new(),
        };
        session.apply_status_byte(0x83);
        assert!(session.mil_on);
        assert_eq!(session.stored_code_count, 3);

        session.apply_status_byte(0x00);
        assert!(!session.mil_on);
        assert_eq!(session.stored_code_count, 0);
    }
}
