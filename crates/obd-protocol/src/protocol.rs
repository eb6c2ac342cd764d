//! OBD-II Protocol Selection

use serde::{Deserialize, Serialize};

/// OBD-II bus protocols the ELM327 can speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    /// ELM327 protocol number, as used by `AT SP`
    pub fn number(&self) -> char {
        match self {
            ObdProtocol::Auto => '0',
            ObdProtocol::J1850Pwm => '1',
            ObdProtocol::J1850Vpw => '2',
            ObdProtocol::Iso9141_2 => '3',
            ObdProtocol::Iso14230_4Kwp => '4',
            ObdProtocol::Iso14230_4KwpFast => '5',
            ObdProtocol::Iso15765_4Can11bit500 => '6',
            ObdProtocol::Iso15765_4Can29bit500 => '7',
            ObdProtocol::Iso15765_4Can11bit250 => '8',
            ObdProtocol::Iso15765_4Can29bit250 => '9',
        }
    }
}

impl Default for ObdProtocol {
    fn default() -> Self {
        ObdProtocol::Auto
    }
}

/// How the adapter picks the bus protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "protocol", rename_all = "snake_case")]
pub enum ProtocolSelection {
    /// Use exactly this protocol
    Fixed(ObdProtocol),
    /// Search automatically, trying this protocol first
    AutoWithFallback(ObdProtocol),
}

impl ProtocolSelection {
    /// `AT SP` command selecting the protocol, without line ending
    pub fn to_elm_command(&self) -> String {
        match self {
            ProtocolSelection::Fixed(protocol) => format!("AT SP {}", protocol.number()),
            ProtocolSelection::AutoWithFallback(ObdProtocol::Auto) => "AT SP 0".to_string(),
            ProtocolSelection::AutoWithFallback(protocol) => {
                format!("AT SP A{}", protocol.number())
            }
        }
    }
}

impl Default for ProtocolSelection {
    fn default() -> Self {
        ProtocolSelection::AutoWithFallback(ObdProtocol::Iso9141_2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_selection_command() {
        assert_eq!(ProtocolSelection::default().to_elm_command(), "AT SP A3");
    }

    #[test]
    fn test_fixed_selection_command() {
        let selection = ProtocolSelection::Fixed(ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(selection.to_elm_command(), "AT SP 6");
        assert_eq!(
            ProtocolSelection::AutoWithFallback(ObdProtocol::Auto).to_elm_command(),
            "AT SP 0"
        );
    }
}
