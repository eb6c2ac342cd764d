//! Supported-PID Discovery
//!
//! The ECU reports which PIDs it supports as 32-bit bitmaps at fixed anchor
//! addresses. Bit 31 of the bitmap at anchor `A` stands for PID `A + 1`, bit
//! 0 for PID `A + 0x20`, which is itself the next anchor. The next anchor is
//! only requested when the current bitmap marked it supported.

use crate::error::{DecodeError, TransportError};
use crate::mode;
use crate::response::prune;
use crate::tables::LookupTables;
use crate::transport::{SerialLink, Transport};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Anchor addresses of the supported-PID bitmaps
pub const ANCHORS: [u8; 7] = [0x00, 0x20, 0x40, 0x60, 0x80, 0xA0, 0xC0];

/// Description used when the mode's description table has no entry
pub const NO_DESCRIPTION: &str = "[NO DESCRIPTION]";

/// Which service a supported-PID bitmap comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitmapSource {
    /// Mode 01, chained over every anchor
    CurrentData,
    /// Mode 02 for one freeze frame index, chained over every anchor
    FreezeFrame,
    /// Mode 05 oxygen sensor monitoring (request `0501xx`)
    O2Monitor,
    /// Mode 09 vehicle information
    VehicleInfo,
}

impl BitmapSource {
    /// Service number, also selecting the description table
    pub const fn mode(self) -> u8 {
        match self {
            BitmapSource::CurrentData => mode::CURRENT_DATA,
            BitmapSource::FreezeFrame => mode::FREEZE_FRAME,
            BitmapSource::O2Monitor => mode::O2_MONITOR,
            BitmapSource::VehicleInfo => mode::VEHICLE_INFO,
        }
    }

    /// Prefix of both the request and the valid-set key
    pub const fn prefix(self) -> &'static str {
        match self {
            BitmapSource::CurrentData => "01",
            BitmapSource::FreezeFrame => "02",
            BitmapSource::O2Monitor => "0501",
            BitmapSource::VehicleInfo => "09",
        }
    }

    /// Echo bytes to strip, before any freeze index byte
    pub const fn prune(self) -> usize {
        match self {
            BitmapSource::O2Monitor => 3,
            _ => 2,
        }
    }

    /// Anchors this source may chain through
    pub fn anchors(self) -> &'static [u8] {
        match self {
            BitmapSource::CurrentData | BitmapSource::FreezeFrame => &ANCHORS,
            BitmapSource::O2Monitor | BitmapSource::VehicleInfo => &ANCHORS[..1],
        }
    }

    fn suffix(freeze_index: Option<u8>) -> String {
        freeze_index
            .map(|index| format!("{:02}", index))
            .unwrap_or_default()
    }

    /// Request line for the bitmap at `anchor`
    pub fn request_line(self, anchor: u8, freeze_index: Option<u8>) -> String {
        format!("{}{:02X}{}\r", self.prefix(), anchor, Self::suffix(freeze_index))
    }

    /// Valid-set key for `pid`
    pub fn key(self, pid: u8, freeze_index: Option<u8>) -> String {
        format!("{}{:02X}{}", self.prefix(), pid, Self::suffix(freeze_index))
    }
}

/// PIDs the connected ECU reported supported, code → description
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidPidSet {
    entries: BTreeMap<String, String>,
}

impl ValidPidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a code; returns whether it was new
    pub fn insert(&mut self, code: impl Into<String>, description: impl Into<String>) -> bool {
        self.entries.insert(code.into(), description.into()).is_none()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.entries.contains_key(code)
    }

    pub fn description(&self, code: &str) -> Option<&str> {
        self.entries.get(code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Snapshot as a plain map
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries.clone()
    }
}

/// Decode one bitmap payload into the PIDs it marks supported, ascending.
///
/// The payload is read as an unsigned integer; the walk starts at
/// `anchor + 4 * digits` on the least significant bit and counts down.
pub fn resolve_bitmap(payload: &str, anchor: u8) -> Result<Vec<u8>, DecodeError> {
    let payload = payload.trim();
    let mut count = u32::from(anchor) + 4 * payload.len() as u32;
    let mut pids = Vec::new();

    for digit in payload.chars().rev() {
        let value = digit
            .to_digit(16)
            .ok_or_else(|| DecodeError::InvalidHex(payload.to_string()))?;
        for bit in 0..4 {
            if value & (1 << bit) != 0 && count <= 0xFF {
                pids.push(count as u8);
            }
            count -= 1;
        }
    }

    pids.reverse();
    Ok(pids)
}

/// Request one bitmap and add its PIDs to `valid`.
///
/// Returns the keys that were newly added. A malformed bitmap is logged and
/// adds nothing.
pub fn discover_anchor<L: SerialLink>(
    transport: &mut Transport<L>,
    tables: &LookupTables,
    valid: &mut ValidPidSet,
    source: BitmapSource,
    anchor: u8,
    freeze_index: Option<u8>,
) -> Result<Vec<String>, TransportError> {
    let request = source.request_line(anchor, freeze_index);
    let response = transport.get_response(request.as_bytes())?;
    let payload = prune(&response, source.prune() + usize::from(freeze_index.is_some()));

    let pids = match resolve_bitmap(&payload, anchor) {
        Ok(pids) => pids,
        Err(e) => {
            warn!("Ignoring supported-PID bitmap for {}: {}", request.trim_end(), e);
            return Ok(Vec::new());
        }
    };

    let descriptions = tables.pid_descriptions(source.mode());
    let mut added = Vec::new();
    for pid in pids {
        let pid_hex = format!("{:02X}", pid);
        let description = descriptions
            .and_then(|table| table.get(&pid_hex))
            .map(String::as_str)
            .unwrap_or(NO_DESCRIPTION);
        let key = source.key(pid, freeze_index);
        debug!("Valid PID found: {} -> {}", key, description);
        if valid.insert(key.clone(), description) {
            added.push(key);
        }
    }
    Ok(added)
}

/// Walk the anchor chain of `source`, starting at anchor 00
pub fn discover<L: SerialLink>(
    transport: &mut Transport<L>,
    tables: &LookupTables,
    valid: &mut ValidPidSet,
    source: BitmapSource,
    freeze_index: Option<u8>,
) -> Result<Vec<String>, TransportError> {
    let mut added = Vec::new();
    let anchors = source.anchors();

    for (i, &anchor) in anchors.iter().enumerate() {
        if i > 0 && !valid.contains(&source.key(anchor, freeze_index)) {
            break;
        }
        added.extend(discover_anchor(
            transport,
            tables,
            valid,
            source,
            anchor,
            freeze_index,
        )?);
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resolve_single_msb() {
        assert_eq!(resolve_bitmap("80000000", 0x00).unwrap(), vec![0x01]);
    }

    #[test]
    fn test_resolve_lsb_is_next_anchor() {
        assert_eq!(resolve_bitmap("00000001", 0x00).unwrap(), vec![0x20]);
        assert_eq!(resolve_bitmap("00000001", 0x20).unwrap(), vec![0x40]);
    }

    #[test]
    fn test_resolve_first_byte() {
        assert_eq!(
            resolve_bitmap("FF000000", 0x00).unwrap(),
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn test_resolve_typical_bitmap() {
        // BE = 1011 1110, 3E = 0011 1110, B8 = 1011 1000, 11 = 0001 0001
        let pids = resolve_bitmap("BE3EB811", 0x00).unwrap();
        assert_eq!(
            pids,
            vec![
                0x01, 0x03, 0x04, 0x05, 0x06, 0x07, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x11, 0x13,
                0x14, 0x15, 0x1C, 0x20
            ]
        );
        assert!(!pids.contains(&0x02));
        assert!(!pids.contains(&0x08));
    }

    #[test]
    fn test_resolve_zero_and_invalid() {
        assert!(resolve_bitmap("0000000000", 0x00).unwrap().is_empty());
        assert!(resolve_bitmap("", 0x00).unwrap().is_empty());
        assert!(resolve_bitmap("BE3?B811", 0x00).is_err());
    }

    #[test]
    fn test_keys_and_requests() {
        assert_eq!(BitmapSource::CurrentData.request_line(0x20, None), "0120\r");
        assert_eq!(BitmapSource::FreezeFrame.request_line(0x00, Some(1)), "020001\r");
        assert_eq!(BitmapSource::FreezeFrame.key(0x0C, Some(1)), "020C01");
        assert_eq!(BitmapSource::O2Monitor.request_line(0x00, None), "050100\r");
        assert_eq!(BitmapSource::O2Monitor.key(0x01, None), "050101");
        assert_eq!(BitmapSource::VehicleInfo.key(0x02, None), "0902");
    }

    proptest! {
        #[test]
        fn prop_set_bits_map_to_pids(value in any::<u32>(), anchor_index in 0usize..7) {
            let anchor = ANCHORS[anchor_index];
            let pids = resolve_bitmap(&format!("{:08X}", value), anchor).unwrap();
            for i in 0..32u32 {
                let pid = anchor as u32 + i + 1;
                let set = value & (1 << (31 - i)) != 0;
                prop_assert_eq!(set && pid <= 0xFF, pids.contains(&(pid as u8)));
            }
        }
    }
}
