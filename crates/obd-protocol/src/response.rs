//! ELM327 Response Normalization
//!
//! Turns raw adapter text into newline-separated lines and strips the echo
//! or header bytes that prefix OBD-II response lines.

/// Payload substituted for `NO DATA`, wide enough for a 3 byte echo plus a
/// 4 byte value so numeric decoding never special-cases missing data.
pub const NO_DATA_PAYLOAD: &str = "00000000000000";

const NO_DATA_TOKEN: &str = "NO DATA";
const SEARCHING_TOKEN: &str = "SEARCHING...";
const BUS_INIT_TOKEN: &str = "BUS INIT:";
const ERROR_TOKEN: &str = "ERROR";

/// Protocol search and successful slow-init lines carry no data.
/// A failed `BUS INIT: ...ERROR` is kept for bus failure detection.
fn is_progress_line(line: &str) -> bool {
    line == SEARCHING_TOKEN || (line.starts_with(BUS_INIT_TOKEN) && !line.contains(ERROR_TOKEN))
}

/// Normalize raw transaction text into canonical lines.
///
/// Carriage returns become newlines, `SEARCHING...` and `BUS INIT: ...OK`
/// progress lines are dropped, `NO DATA` becomes [`NO_DATA_PAYLOAD`], runs of newlines collapse
/// to one and the result always ends with a newline.
pub fn normalize(raw: &str) -> String {
    let text = raw.replace('\r', "\n").replace(NO_DATA_TOKEN, NO_DATA_PAYLOAD);

    let mut result = String::with_capacity(text.len() + 1);
    let mut pending_newline = false;

    // A leading newline is kept so the adapter's reset banner shape survives.
    if text.starts_with('\n') {
        result.push('\n');
    }

    for line in text.split('\n') {
        if line.is_empty() || is_progress_line(line) {
            continue;
        }
        if pending_newline {
            result.push('\n');
        }
        result.push_str(line);
        pending_newline = true;
    }

    if !result.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// Strip `remove_bytes` leading bytes from every line and join the rest.
///
/// Spaces are removed first so responses with `AT S1` still prune on byte
/// boundaries.
pub fn prune(data: &str, remove_bytes: usize) -> String {
    data.split('\n')
        .map(|line| {
            let compact: String = line.chars().filter(|c| *c != ' ').collect();
            compact.chars().skip(2 * remove_bytes).collect::<String>()
        })
        .collect()
}

/// Last non-empty line of a normalized response, trimmed.
///
/// With echo still enabled the adapter repeats the command on the first
/// line; the answer is on the last one.
pub fn last_line(normalized: &str) -> &str {
    normalized
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("")
}

/// Whether the response contains one of the given markers.
pub fn contains_any(normalized: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| normalized.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_prompted_response() {
        assert_eq!(normalize("41 00 BE 3E B8 11\r"), "41 00 BE 3E B8 11\n");
    }

    #[test]
    fn test_normalize_and_prune_bitmap() {
        let normalized = normalize("41 00 BE 3E B8 11\r");
        assert_eq!(prune(&normalized, 2), "BE3EB811");
    }

    #[test]
    fn test_normalize_collapses_blank_lines() {
        assert_eq!(normalize("OK\r\r\r\n"), "OK\n");
        assert_eq!(normalize("\r\rELM327 v1.5\r\r"), "\nELM327 v1.5\n");
    }

    #[test]
    fn test_normalize_no_data() {
        let normalized = normalize("NO DATA\r\r");
        assert_eq!(normalized, format!("{}\n", NO_DATA_PAYLOAD));
        assert_eq!(prune(&normalized, 2), "0000000000");
    }

    #[test]
    fn test_normalize_strips_searching() {
        assert_eq!(normalize("SEARCHING...\r410C1AF8\r\r"), "410C1AF8\n");
    }

    #[test]
    fn test_normalize_strips_slow_init() {
        let normalized = normalize("BUS INIT: ...OK\r41 01 83 07 01 FF\r\r");
        assert_eq!(normalized, "41 01 83 07 01 FF\n");
        assert_eq!(prune(&normalized, 2), "830701FF");
        assert_eq!(
            normalize("SEARCHING...\rBUS INIT: ...OK\r410C1AF8\r"),
            "410C1AF8\n"
        );
    }

    #[test]
    fn test_normalize_keeps_slow_init_error() {
        assert_eq!(normalize("BUS INIT: ...ERROR\r\r"), "BUS INIT: ...ERROR\n");
    }

    #[test]
    fn test_normalize_empty_response() {
        assert_eq!(normalize(""), "\n");
    }

    #[test]
    fn test_prune_multiline() {
        assert_eq!(prune("4902014A4D31\n4902024E41\n", 3), "4A4D314E41");
    }

    #[test]
    fn test_last_line_skips_echo() {
        assert_eq!(last_line("AT I\nELM327 v1.5\n"), "ELM327 v1.5");
        assert_eq!(last_line("\n"), "");
    }

    proptest! {
        #[test]
        fn prop_normalize_idempotent(lines in proptest::collection::vec("[0-9A-F ]{1,16}", 1..6)) {
            let raw = lines.join("\r");
            let once = normalize(&raw);
            prop_assert_eq!(normalize(&once), once.clone());
        }
    }
}
