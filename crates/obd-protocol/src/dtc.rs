//! Diagnostic Trouble Codes
//!
//! Mode 03/07 responses carry two bytes per code. The first hex digit
//! selects the domain prefix (`0` → `P0`, `4` → `C0`, ...) and the remaining
//! three digits are kept verbatim. Empty slots are all-zero and dropped, as
//! is a trailing group shorter than one code (frame padding).

use crate::error::DecodeError;
use std::collections::{BTreeMap, HashMap};

/// Convert a pruned hex payload into trouble code strings
pub fn data_to_trouble_codes(
    data: &str,
    prefixes: &HashMap<String, String>,
) -> Result<Vec<String>, DecodeError> {
    let data = data.trim();
    if !data.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DecodeError::InvalidHex(data.to_string()));
    }

    let mut codes = Vec::new();
    // Hex digits are ASCII, byte-slicing on 4-char groups is safe.
    for group in data.as_bytes().chunks(4) {
        let group = std::str::from_utf8(group)
            .map_err(|_| DecodeError::InvalidHex(data.to_string()))?
            .to_ascii_uppercase();
        if group.len() < 4 || u16::from_str_radix(&group, 16).unwrap_or(0) == 0 {
            continue;
        }
        let (first, rest) = group.split_at(1);
        let prefix = prefixes
            .get(first)
            .ok_or_else(|| DecodeError::UnknownPrefix(first.chars().next().unwrap_or('?')))?;
        codes.push(format!("{}{}", prefix, rest));
    }
    Ok(codes)
}

/// Attach descriptions; codes missing from the table map to `no_description`
pub fn describe(
    codes: &[String],
    descriptions: &HashMap<String, String>,
    no_description: &str,
) -> BTreeMap<String, String> {
    codes
        .iter()
        .map(|code| {
            let description = descriptions
                .get(code)
                .cloned()
                .unwrap_or_else(|| no_description.to_string());
            (code.clone(), description)
        })
        .collect()
}
