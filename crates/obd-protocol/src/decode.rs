//! PID Formula Evaluation
//!
//! Interprets a [`Formula`] against a pruned hex payload. [`decode`] is the
//! only place evaluation failures turn into the `!ERROR!` sentinel.

use crate::dtc::{data_to_trouble_codes, describe};
use crate::error::DecodeError;
use crate::pid::{DecodeResult, Field, FieldValue, Formula, Sentinel};
use crate::tables::{LookupTables, TableKind};
use tracing::warn;

/// Readiness monitors reported in bytes C/D of PID 01 for spark ignition
const SPARK_MONITORS: [&str; 8] = [
    "CATALYST",
    "HEATED CATALYST",
    "EVAPORATIVE SYSTEM",
    "SECONDARY AIR SYSTEM",
    "A/C REFRIGERANT",
    "OXYGEN SENSOR",
    "OXYGEN SENSOR HEATER",
    "EGR SYSTEM",
];

/// Readiness monitors reported in bytes C/D of PID 01 for compression ignition
const COMPRESSION_MONITORS: [&str; 8] = [
    "NMHC CATALYST",
    "NOx/SCR MONITOR",
    "RESERVED 1",
    "BOOST PRESSURE",
    "RESERVED 2",
    "EXHAUST GAS SENSOR",
    "PM FILTER MONITORING",
    "EGR/VVT SYSTEM",
];

/// Monitors common to both ignition types, byte B bits 0-2
const COMMON_MONITORS: [&str; 3] = ["MISFIRE", "FUEL SYSTEM", "COMPONENTS"];

/// Bounds-checked byte access over a hex payload
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    hex: &'a str,
}

impl<'a> Payload<'a> {
    pub fn new(hex: &'a str) -> Self {
        Self { hex: hex.trim() }
    }

    /// Hex text of the payload
    pub fn as_str(&self) -> &'a str {
        self.hex
    }

    /// Number of complete bytes
    pub fn len(&self) -> usize {
        self.hex.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.hex.is_empty()
    }

    /// Fail unless at least `count` bytes are present
    pub fn require(&self, count: usize) -> Result<(), DecodeError> {
        if self.hex.len() < 2 * count {
            return Err(DecodeError::Truncated {
                needed: 2 * count,
                available: self.hex.len(),
            });
        }
        Ok(())
    }

    /// Two-digit hex text of byte `index`
    pub fn byte_hex(&self, index: usize) -> Result<&'a str, DecodeError> {
        self.require(index + 1)?;
        self.hex
            .get(2 * index..2 * index + 2)
            .ok_or_else(|| DecodeError::InvalidHex(self.hex.to_string()))
    }

    /// Byte `index` (A = 0, B = 1, ...)
    pub fn byte(&self, index: usize) -> Result<u8, DecodeError> {
        let digits = self.byte_hex(index)?;
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DecodeError::InvalidHex(self.hex.to_string()));
        }
        u8::from_str_radix(digits, 16).map_err(|_| DecodeError::InvalidHex(self.hex.to_string()))
    }

    /// Big-endian value of `count` bytes starting at `index`
    pub fn uint(&self, index: usize, count: usize) -> Result<u32, DecodeError> {
        (index..index + count).try_fold(0u32, |acc, i| Ok((acc << 8) | u32::from(self.byte(i)?)))
    }

    /// Every complete byte of the payload
    pub fn bytes(&self) -> Result<Vec<u8>, DecodeError> {
        if self.hex.len() % 2 != 0 {
            return Err(DecodeError::Truncated {
                needed: self.hex.len() + 1,
                available: self.hex.len(),
            });
        }
        (0..self.len()).map(|i| self.byte(i)).collect()
    }
}

/// Evaluate `formula` against a pruned payload
pub fn evaluate(
    formula: &Formula,
    payload: &str,
    tables: &LookupTables,
) -> Result<DecodeResult, DecodeError> {
    let payload = Payload::new(payload);

    match *formula {
        // The client answers these from discovery before evaluating
        Formula::SupportedPids { .. } => Err(DecodeError::DiscoveryOnly),
        Formula::Scaled {
            bytes,
            scale,
            offset,
        } => {
            let raw = payload.uint(0, bytes)?;
            Ok(DecodeResult::Number(f64::from(raw) * scale + offset))
        }
        Formula::MonitorStatus => monitor_status(payload),
        Formula::FreezeDtc => freeze_dtc(payload, tables),
        Formula::FuelSystemStatus => {
            let table = tables.table(TableKind::FuelSystemStatus);
            let fields = (0..2)
                .map(|i| {
                    let key = payload.byte_hex(i)?.to_ascii_uppercase();
                    let value = match table.get(&key) {
                        Some(status) => FieldValue::Text(status.clone()),
                        None => FieldValue::Sentinel(Sentinel::Invalid),
                    };
                    Ok(Field::new(format!("Fuel System {}", i + 1), value))
                })
                .collect::<Result<Vec<_>, DecodeError>>()?;
            Ok(DecodeResult::Fields(fields))
        }
        Formula::Lookup(kind) => {
            let key = payload.byte_hex(0)?.to_ascii_uppercase();
            Ok(match tables.table(kind).get(&key) {
                Some(text) => DecodeResult::Text(text.clone()),
                None => Sentinel::Invalid.into(),
            })
        }
        Formula::O2Presence => {
            let value = payload.byte(0)?;
            Ok(DecodeResult::Fields(vec![
                Field::new("BANK1", FieldValue::Number(f64::from(value & 0x0F))),
                Field::new("BANK2", FieldValue::Number(f64::from(value >> 4))),
            ]))
        }
        Formula::O2VoltageTrim => {
            let voltage = f64::from(payload.byte(0)?) / 200.0;
            let trim = f64::from(payload.byte(1)?) * 100.0 / 128.0 - 100.0;
            Ok(DecodeResult::Fields(vec![
                Field::new("Voltage", FieldValue::Number(voltage)),
                Field::new("Short term fuel trim", FieldValue::Number(trim)),
            ]))
        }
        Formula::WideRangeVoltage => {
            let ratio = equivalence_ratio(payload)?;
            let voltage = 8.0 / 65536.0 * f64::from(payload.uint(2, 2)?);
            Ok(DecodeResult::Fields(vec![
                Field::new("Equivalence ratio", FieldValue::Number(ratio)),
                Field::new("Voltage", FieldValue::Number(voltage)),
            ]))
        }
        Formula::WideRangeCurrent => {
            let ratio = equivalence_ratio(payload)?;
            let current =
                f64::from(payload.byte(2)?) + f64::from(payload.byte(3)?) / 256.0 - 128.0;
            Ok(DecodeResult::Fields(vec![
                Field::new("Equivalence ratio", FieldValue::Number(ratio)),
                Field::new("Current", FieldValue::Number(current)),
            ]))
        }
        Formula::MessageCount => Ok(DecodeResult::Number(f64::from(payload.byte(0)?))),
        Formula::VehicleText => {
            let bytes = payload
                .bytes()?
                .into_iter()
                .map(|b| if b == 0 { b' ' } else { b })
                .collect::<Vec<_>>();
            let text = String::from_utf8(bytes).map_err(|e| DecodeError::InvalidText(e.to_string()))?;
            Ok(DecodeResult::Text(text))
        }
        Formula::RawHex => Ok(DecodeResult::Text(payload.as_str().to_string())),
        Formula::TroubleCodes => {
            let codes = data_to_trouble_codes(payload.as_str(), &tables.trouble_code_prefix)?;
            Ok(DecodeResult::TroubleCodes(describe(
                &codes,
                &tables.trouble_code_descriptions,
                Sentinel::NoDescription.as_str(),
            )))
        }
        Formula::ClearCodes => Ok(DecodeResult::Text(payload.as_str().to_string())),
        Formula::Todo => Ok(Sentinel::Todo.into()),
    }
}

/// Evaluate and convert any failure into the `!ERROR!` sentinel
pub fn decode(code: &str, formula: &Formula, payload: &str, tables: &LookupTables) -> DecodeResult {
    match evaluate(formula, payload, tables) {
        Ok(result) => result,
        Err(e) => {
            warn!("Failed to decode {} payload {:?}: {}", code, payload, e);
            Sentinel::Error.into()
        }
    }
}

fn equivalence_ratio(payload: Payload<'_>) -> Result<f64, DecodeError> {
    Ok(2.0 / 65536.0 * f64::from(payload.uint(0, 2)?))
}

fn freeze_dtc(payload: Payload<'_>, tables: &LookupTables) -> Result<DecodeResult, DecodeError> {
    payload.require(2)?;
    let group = payload
        .as_str()
        .get(..4)
        .ok_or_else(|| DecodeError::InvalidHex(payload.as_str().to_string()))?;
    let codes = data_to_trouble_codes(group, &tables.trouble_code_prefix)?;
    let Some(code) = codes.first() else {
        return Ok(Sentinel::NoData.into());
    };
    Ok(match tables.trouble_code_descriptions.get(code) {
        Some(description) => DecodeResult::Text(format!("{} {}", code, description)),
        None => Sentinel::NoDescription.into(),
    })
}

/// PID 01: MIL, stored code count and the readiness monitors.
///
/// Only monitors the ECU supports are listed; each carries whether its test
/// has completed.
fn monitor_status(payload: Payload<'_>) -> Result<DecodeResult, DecodeError> {
    payload.require(4)?;
    let a = payload.byte(0)?;
    let b = payload.byte(1)?;
    let c = payload.byte(2)?;
    let d = payload.byte(3)?;

    let mut fields = vec![
        Field::new("MIL", FieldValue::Flag(a & 0x80 != 0)),
        Field::new(
            "STORED TROUBLE CODE COUNT",
            FieldValue::Number(f64::from(a & 0x7F)),
        ),
    ];

    for (bit, name) in COMMON_MONITORS.iter().enumerate() {
        if b & (1 << bit) != 0 {
            let incomplete = b & (0x10 << bit) != 0;
            fields.push(Field::new(
                *name,
                FieldValue::Monitor {
                    complete: !incomplete,
                },
            ));
        }
    }

    let compression = b & 0x08 != 0;
    let (ignition, monitors) = if compression {
        ("COMPRESSION", &COMPRESSION_MONITORS)
    } else {
        ("SPARK", &SPARK_MONITORS)
    };
    fields.push(Field::new("IGNITION", FieldValue::Text(ignition.to_string())));

    for (bit, name) in monitors.iter().enumerate() {
        if c & (1 << bit) != 0 {
            fields.push(Field::new(
                *name,
                FieldValue::Monitor {
                    complete: d & (1 << bit) == 0,
                },
            ));
        }
    }

    Ok(DecodeResult::Fields(fields))
}
