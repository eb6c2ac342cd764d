//! OBD-II PID Definitions and Decode Results
//!
//! Every decodable PID is one row in a static table pairing its code with a
//! formula descriptor. A single evaluator (see `decode`) interprets the
//! descriptors, so adding a PID is a table edit rather than a new routine.

use crate::discovery::BitmapSource;
use crate::tables::TableKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

/// km/h → mph, the display unit for vehicle speed
pub const KMH_TO_MPH: f64 = 0.621371;

/// Placeholder results used instead of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sentinel {
    /// PID not reported supported by the ECU
    NoData,
    /// PID not known to the registry
    NotImplemented,
    /// Payload could not be decoded
    Error,
    /// Code missing from a lookup table
    Invalid,
    /// Trouble code missing from the description table
    NoDescription,
    /// Known PID whose decoding is still pending
    Todo,
}

impl Sentinel {
    /// Display text for the sentinel
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentinel::NoData => "N/A",
            Sentinel::NotImplemented => "!NOT IMPLEMENTED!",
            Sentinel::Error => "!ERROR!",
            Sentinel::Invalid => "[INVALID]",
            Sentinel::NoDescription => "[NO DESCRIPTION]",
            Sentinel::Todo => ":TODO:",
        }
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of one named field in a multi-value result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Flag(bool),
    /// Readiness monitor that the ECU supports
    Monitor { complete: bool },
    Sentinel(Sentinel),
}

/// A named field of a multi-value result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

impl Field {
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Result of a PID request.
///
/// The shape depends on the PID; callers that do not know a PID's contract
/// must handle every variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DecodeResult {
    Number(f64),
    Fields(Vec<Field>),
    Text(String),
    /// Trouble code → description
    TroubleCodes(BTreeMap<String, String>),
    /// PID codes added by a supported-PID request
    PidList(Vec<String>),
    Sentinel(Sentinel),
}

impl DecodeResult {
    /// Whether this is a sentinel rather than data
    pub fn is_sentinel(&self) -> bool {
        matches!(self, DecodeResult::Sentinel(_))
    }

    /// Numeric value, if this is a scalar
    pub fn as_number(&self) -> Option<f64> {
        match self {
            DecodeResult::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Look up a field by name in a multi-value result
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        match self {
            DecodeResult::Fields(fields) => fields.iter().find(|f| f.name == name).map(|f| &f.value),
            _ => None,
        }
    }
}

impl From<Sentinel> for DecodeResult {
    fn from(sentinel: Sentinel) -> Self {
        DecodeResult::Sentinel(sentinel)
    }
}

/// How a PID's payload turns into a [`DecodeResult`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Formula {
    /// Supported-PID bitmap at `anchor`; reruns discovery
    SupportedPids { source: BitmapSource, anchor: u8 },
    /// Big-endian integer of `bytes` bytes, times `scale`, plus `offset`
    Scaled { bytes: usize, scale: f64, offset: f64 },
    /// Monitor status since codes cleared (PID 01)
    MonitorStatus,
    /// Trouble code that caused the freeze frame (PID 02)
    FreezeDtc,
    /// Two fuel system status bytes (PID 03)
    FuelSystemStatus,
    /// First byte as a key into a lookup table
    Lookup(TableKind),
    /// Oxygen sensors present, one nibble per bank
    O2Presence,
    /// Narrow-band O2 voltage + short term fuel trim
    O2VoltageTrim,
    /// Wide-range O2 equivalence ratio + voltage
    WideRangeVoltage,
    /// Wide-range O2 equivalence ratio + current
    WideRangeCurrent,
    /// Mode 09 message count
    MessageCount,
    /// Mode 09 ASCII payload (VIN, calibration ID, ECU name)
    VehicleText,
    /// Payload returned undecoded as hex text
    RawHex,
    /// Mode 03/07 trouble code list
    TroubleCodes,
    /// Mode 04 clear request; returns the adapter's answer
    ClearCodes,
    Todo,
}

const fn scaled(bytes: usize, scale: f64, offset: f64) -> Formula {
    Formula::Scaled {
        bytes,
        scale,
        offset,
    }
}

const TEMPERATURE: Formula = scaled(1, 1.0, -40.0);
const PERCENT: Formula = scaled(1, 100.0 / 255.0, 0.0);
const FUEL_TRIM: Formula = scaled(1, 100.0 / 128.0, -100.0);
const COUNTER: Formula = scaled(2, 1.0, 0.0);

/// One registry row
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidDescriptor {
    /// Request code, e.g. "010C"
    pub code: &'static str,
    pub description: &'static str,
    pub formula: Formula,
    /// Echo bytes to strip from a current-data response
    pub prune: usize,
    /// Whether the PID can be read from a freeze frame through Mode 02
    pub freeze: bool,
}

const fn current(code: &'static str, description: &'static str, formula: Formula) -> PidDescriptor {
    PidDescriptor {
        code,
        description,
        formula,
        prune: 2,
        freeze: true,
    }
}

const fn supported(code: &'static str, source: BitmapSource, anchor: u8) -> PidDescriptor {
    PidDescriptor {
        code,
        description: "Supported PIDs",
        formula: Formula::SupportedPids { source, anchor },
        prune: source.prune(),
        freeze: matches!(source, BitmapSource::CurrentData),
    }
}

const fn info(code: &'static str, description: &'static str, formula: Formula, prune: usize) -> PidDescriptor {
    PidDescriptor {
        code,
        description,
        formula,
        prune,
        freeze: false,
    }
}

/// Stored, clear and pending trouble code requests; no capability bitmap
pub const BUS_MANAGEMENT: [PidDescriptor; 3] = [
    info("03", "Show stored Diagnostic Trouble Codes", Formula::TroubleCodes, 1),
    info("04", "Clear Diagnostic Trouble Codes and stored values", Formula::ClearCodes, 0),
    info(
        "07",
        "Show pending Diagnostic Trouble Codes (detected during current or last driving cycle)",
        Formula::TroubleCodes,
        1,
    ),
];

use BitmapSource::{CurrentData, O2Monitor, VehicleInfo};

/// Every PID the engine can decode
pub static PID_TABLE: &[PidDescriptor] = &[
    // Mode 01 - current data
    supported("0100", CurrentData, 0x00),
    current("0101", "Monitor status since DTCs cleared", Formula::MonitorStatus),
    current("0102", "Freeze DTC", Formula::FreezeDtc),
    current("0103", "Fuel system status", Formula::FuelSystemStatus),
    current("0104", "Calculated engine load", PERCENT),
    current("0105", "Engine coolant temperature", TEMPERATURE),
    current("0106", "Short term fuel trim - Bank 1", FUEL_TRIM),
    current("0107", "Long term fuel trim - Bank 1", FUEL_TRIM),
    current("0108", "Short term fuel trim - Bank 2", FUEL_TRIM),
    current("0109", "Long term fuel trim - Bank 2", FUEL_TRIM),
    current("010A", "Fuel pressure", scaled(1, 3.0, 0.0)),
    current("010B", "Intake manifold absolute pressure", scaled(1, 1.0, 0.0)),
    current("010C", "Engine RPM", scaled(2, 0.25, 0.0)),
    current("010D", "Vehicle speed", scaled(1, KMH_TO_MPH, 0.0)),
    current("010E", "Timing advance", scaled(1, 0.5, -64.0)),
    current("010F", "Intake air temperature", TEMPERATURE),
    current("0110", "MAF air flow rate", scaled(2, 0.01, 0.0)),
    current("0111", "Throttle position", PERCENT),
    current("0112", "Commanded secondary air status", Formula::Lookup(TableKind::SecondaryAirStatus)),
    current("0113", "Oxygen sensors present (in 2 banks)", Formula::O2Presence),
    current("0114", "Oxygen Sensor 1 voltage and short term fuel trim", Formula::O2VoltageTrim),
    current("0115", "Oxygen Sensor 2 voltage and short term fuel trim", Formula::O2VoltageTrim),
    current("0116", "Oxygen Sensor 3 voltage and short term fuel trim", Formula::O2VoltageTrim),
    current("0117", "Oxygen Sensor 4 voltage and short term fuel trim", Formula::O2VoltageTrim),
    current("0118", "Oxygen Sensor 5 voltage and short term fuel trim", Formula::O2VoltageTrim),
    current("0119", "Oxygen Sensor 6 voltage and short term fuel trim", Formula::O2VoltageTrim),
    current("011A", "Oxygen Sensor 7 voltage and short term fuel trim", Formula::O2VoltageTrim),
    current("011B", "Oxygen Sensor 8 voltage and short term fuel trim", Formula::O2VoltageTrim),
    current("011C", "OBD standards this vehicle conforms to", Formula::Lookup(TableKind::ObdStandards)),
    current("011F", "Run time since engine start", COUNTER),
    supported("0120", CurrentData, 0x20),
    current("0121", "Distance traveled with MIL on", COUNTER),
    PidDescriptor {
        freeze: false,
        ..current("0122", "Fuel rail pressure (relative to manifold vacuum)", scaled(2, 0.079, 0.0))
    },
    PidDescriptor {
        freeze: false,
        ..current("0123", "Fuel rail gauge pressure", scaled(2, 10.0, 0.0))
    },
    current("0124", "Oxygen Sensor 1 equivalence ratio and voltage", Formula::WideRangeVoltage),
    current("0125", "Oxygen Sensor 2 equivalence ratio and voltage", Formula::WideRangeVoltage),
    current("0126", "Oxygen Sensor 3 equivalence ratio and voltage", Formula::WideRangeVoltage),
    current("0127", "Oxygen Sensor 4 equivalence ratio and voltage", Formula::WideRangeVoltage),
    current("0128", "Oxygen Sensor 5 equivalence ratio and voltage", Formula::WideRangeVoltage),
    current("0129", "Oxygen Sensor 6 equivalence ratio and voltage", Formula::WideRangeVoltage),
    current("012A", "Oxygen Sensor 7 equivalence ratio and voltage", Formula::WideRangeVoltage),
    current("012B", "Oxygen Sensor 8 equivalence ratio and voltage", Formula::WideRangeVoltage),
    current("0131", "Distance traveled since codes cleared", COUNTER),
    current("0134", "Oxygen Sensor 1 equivalence ratio and current", Formula::WideRangeCurrent),
    current("0135", "Oxygen Sensor 2 equivalence ratio and current", Formula::WideRangeCurrent),
    current("0136", "Oxygen Sensor 3 equivalence ratio and current", Formula::WideRangeCurrent),
    current("0137", "Oxygen Sensor 4 equivalence ratio and current", Formula::WideRangeCurrent),
    current("0138", "Oxygen Sensor 5 equivalence ratio and current", Formula::WideRangeCurrent),
    current("0139", "Oxygen Sensor 6 equivalence ratio and current", Formula::WideRangeCurrent),
    current("013A", "Oxygen Sensor 7 equivalence ratio and current", Formula::WideRangeCurrent),
    current("013B", "Oxygen Sensor 8 equivalence ratio and current", Formula::WideRangeCurrent),
    supported("0140", CurrentData, 0x40),
    supported("0160", CurrentData, 0x60),
    supported("0180", CurrentData, 0x80),
    supported("01A0", CurrentData, 0xA0),
    supported("01C0", CurrentData, 0xC0),
    // Mode 03/04/07 - trouble codes
    BUS_MANAGEMENT[0],
    BUS_MANAGEMENT[1],
    BUS_MANAGEMENT[2],
    // Mode 05 - oxygen sensor monitoring
    supported("050100", O2Monitor, 0x00),
    // Mode 09 - vehicle information
    supported("0900", VehicleInfo, 0x00),
    info("0901", "VIN message count", Formula::MessageCount, 2),
    info("0902", "Vehicle Identification Number (VIN)", Formula::VehicleText, 3),
    info("0903", "Calibration ID message count", Formula::MessageCount, 2),
    info("0904", "Calibration ID", Formula::VehicleText, 3),
    info("0905", "Calibration verification numbers (CVN) message count", Formula::MessageCount, 2),
    info("0906", "Calibration Verification Numbers (CVN)", Formula::RawHex, 3),
    info("0907", "In-use performance tracking message count", Formula::MessageCount, 2),
    info("0908", "In-use performance tracking for spark ignition vehicles", Formula::Todo, 2),
    info("0909", "ECU name message count", Formula::MessageCount, 2),
    info("090A", "ECU name", Formula::VehicleText, 3),
    info("090B", "In-use performance tracking for compression ignition vehicles", Formula::Todo, 2),
];

/// Resolved request for one PID
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidRequest<'a> {
    pub descriptor: &'a PidDescriptor,
    /// Freeze frame index, `None` for current data
    pub freeze_index: Option<u8>,
}

impl PidRequest<'_> {
    /// Request line sent to the adapter, `\r` terminated
    pub fn request_line(&self) -> String {
        match self.freeze_index {
            Some(index) => format!("02{}{:02}\r", &self.descriptor.code[2..], index),
            None => format!("{}\r", self.descriptor.code),
        }
    }

    /// Echo bytes to strip; the freeze index adds one byte
    pub fn prune(&self) -> usize {
        self.descriptor.prune + usize::from(self.freeze_index.is_some())
    }

    /// Key of this PID in the matching valid PID set
    pub fn valid_key(&self) -> String {
        match self.freeze_index {
            Some(index) => format!("02{}{:02}", &self.descriptor.code[2..], index),
            None => self.descriptor.code.to_string(),
        }
    }
}

/// Immutable code → descriptor map, built once from [`PID_TABLE`]
#[derive(Debug, Clone)]
pub struct PidRegistry {
    by_code: HashMap<&'static str, &'static PidDescriptor>,
}

static STANDARD_REGISTRY: OnceLock<PidRegistry> = OnceLock::new();

impl PidRegistry {
    /// Registry of every PID in [`PID_TABLE`]
    pub fn standard() -> Self {
        Self::from_table(PID_TABLE)
    }

    /// Shared standard registry, built on first use
    pub fn global() -> &'static PidRegistry {
        STANDARD_REGISTRY.get_or_init(Self::standard)
    }

    pub fn from_table(table: &'static [PidDescriptor]) -> Self {
        Self {
            by_code: table.iter().map(|d| (d.code, d)).collect(),
        }
    }

    /// Descriptor for an exact code
    pub fn get(&self, code: &str) -> Option<&'static PidDescriptor> {
        self.by_code.get(code).copied()
    }

    /// Resolve a caller-supplied code and optional freeze index.
    ///
    /// Mode 02 codes map onto their Mode 01 counterpart. A Mode 02 code may
    /// carry its frame index as two decimal digits (`020C01`, the form
    /// `valid_pids` returns); without one it reads `freeze_index`, else
    /// frame 0. Returns `None` for codes the registry does not know, codes
    /// with no freeze frame counterpart, and an embedded index that
    /// disagrees with `freeze_index`.
    pub fn resolve(&self, code: &str, freeze_index: Option<u8>) -> Option<PidRequest<'static>> {
        let code = code.trim().to_ascii_uppercase();
        let (lookup, freeze_index) = match code.strip_prefix("02") {
            Some(pid) if pid.len() == 2 => (format!("01{}", pid), Some(freeze_index.unwrap_or(0))),
            Some(keyed) if keyed.len() == 4 => {
                let (pid, index) = keyed.split_at(2);
                if !index.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let index: u8 = index.parse().ok()?;
                if freeze_index.is_some_and(|requested| requested != index) {
                    return None;
                }
                (format!("01{}", pid), Some(index))
            }
            _ => (code, freeze_index),
        };

        let descriptor = self.get(&lookup)?;
        if freeze_index.is_some() && !descriptor.freeze {
            return None;
        }
        Some(PidRequest {
            descriptor,
            freeze_index,
        })
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

impl Default for PidRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_codes_unique() {
        let registry = PidRegistry::standard();
        assert_eq!(registry.len(), PID_TABLE.len());
    }

    #[test]
    fn test_resolve_current_data() {
        let registry = PidRegistry::standard();
        let request = registry.resolve("010c", None).unwrap();
        assert_eq!(request.descriptor.code, "010C");
        assert_eq!(request.request_line(), "010C\r");
        assert_eq!(request.prune(), 2);
        assert_eq!(request.valid_key(), "010C");
    }

    #[test]
    fn test_resolve_freeze_frame() {
        let registry = PidRegistry::standard();
        let request = registry.resolve("010C", Some(1)).unwrap();
        assert_eq!(request.request_line(), "020C01\r");
        assert_eq!(request.prune(), 3);
        assert_eq!(request.valid_key(), "020C01");

        let request = registry.resolve("0205", None).unwrap();
        assert_eq!(request.descriptor.code, "0105");
        assert_eq!(request.freeze_index, Some(0));
    }

    #[test]
    fn test_resolve_keyed_freeze_code() {
        let registry = PidRegistry::standard();
        let request = registry.resolve("020501", None).unwrap();
        assert_eq!(request.descriptor.code, "0105");
        assert_eq!(request.freeze_index, Some(1));
        assert_eq!(request.valid_key(), "020501");
        assert_eq!(request.request_line(), "020501\r");

        assert!(registry.resolve("020501", Some(1)).is_some());
        assert!(registry.resolve("020501", Some(2)).is_none());
        assert!(registry.resolve("0205A1", None).is_none());
        assert!(registry.resolve("022200", None).is_none());
    }

    #[test]
    fn test_resolve_rejects_freeze_without_counterpart() {
        let registry = PidRegistry::standard();
        assert!(registry.resolve("0122", Some(0)).is_none());
        assert!(registry.resolve("0902", Some(0)).is_none());
        assert!(registry.resolve("0122", None).is_some());
    }

    #[test]
    fn test_unknown_code() {
        assert!(PidRegistry::standard().resolve("01FF", None).is_none());
    }

    #[test]
    fn test_sentinel_display() {
        assert_eq!(Sentinel::NoData.to_string(), "N/A");
        assert_eq!(Sentinel::NotImplemented.to_string(), "!NOT IMPLEMENTED!");
    }
}
