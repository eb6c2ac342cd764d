//! Static Lookup Tables
//!
//! Code→description mappings loaded once at startup. A table that fails to
//! load stays empty and the failure is kept as a diagnostic; lookups then
//! degrade to sentinels.

use crate::error::TableError;
use crate::mode;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Table names understood by [`LookupTables::load`]
pub mod names {
    pub const OBD_STANDARDS: &str = "VehicleObdStandards";
    pub const SECONDARY_AIR_STATUS: &str = "CommandedSecondaryAirStatus";
    pub const FUEL_SYSTEM_STATUS: &str = "FuelSystemStatus";
    pub const TROUBLE_CODE_PREFIX: &str = "TroubleCodePrefix";
    pub const TROUBLE_CODES_GENERIC: &str = "TroubleCodes-ISO-SAE";
    pub const PID_DESCRIPTIONS_MODE01: &str = "PidDescriptionsMode01";
    pub const PID_DESCRIPTIONS_MODE05: &str = "PidDescriptionsMode05";
    pub const PID_DESCRIPTIONS_MODE09: &str = "PidDescriptionsMode09";
}

/// ISO 15031-6 first-digit mapping, overlaid by any loaded prefix table
const DEFAULT_DTC_PREFIX: [(&str, &str); 16] = [
    ("0", "P0"),
    ("1", "P1"),
    ("2", "P2"),
    ("3", "P3"),
    ("4", "C0"),
    ("5", "C1"),
    ("6", "C2"),
    ("7", "C3"),
    ("8", "B0"),
    ("9", "B1"),
    ("A", "B2"),
    ("B", "B3"),
    ("C", "U0"),
    ("D", "U1"),
    ("E", "U2"),
    ("F", "U3"),
];

/// Source of `(key, value)` pairs for a named table
pub trait TableLoader {
    fn load(&self, name: &str) -> Result<Vec<(String, String)>, TableError>;
}

/// Parse "key<space>value" lines; the value is trimmed, blank lines skipped
pub fn parse_table(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            (key.trim().to_string(), value.trim().to_string())
        })
        .collect()
}

/// Loads `<root>/<name>.txt`
#[derive(Debug, Clone)]
pub struct DirTableLoader {
    root: PathBuf,
}

impl DirTableLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TableLoader for DirTableLoader {
    fn load(&self, name: &str) -> Result<Vec<(String, String)>, TableError> {
        let path = self.root.join(format!("{}.txt", name));
        let text = std::fs::read_to_string(&path).map_err(|e| TableError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(parse_table(&text))
    }
}

/// In-memory tables, for embedded data and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryTableLoader {
    tables: HashMap<String, Vec<(String, String)>>,
}

impl MemoryTableLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table from `(key, value)` pairs
    pub fn with_table(mut self, name: &str, entries: &[(&str, &str)]) -> Self {
        self.tables.insert(
            name.to_string(),
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }
}

impl TableLoader for MemoryTableLoader {
    fn load(&self, name: &str) -> Result<Vec<(String, String)>, TableError> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| TableError::Unknown(name.to_string()))
    }
}

/// Which code-lookup table a decoder reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    ObdStandards,
    SecondaryAirStatus,
    FuelSystemStatus,
}

/// All lookup tables used by the engine
#[derive(Debug, Clone, Default)]
pub struct LookupTables {
    pub obd_standards: HashMap<String, String>,
    pub secondary_air_status: HashMap<String, String>,
    pub fuel_system_status: HashMap<String, String>,
    pub trouble_code_prefix: HashMap<String, String>,
    pub trouble_code_descriptions: HashMap<String, String>,
    pub pid_descriptions_mode01: HashMap<String, String>,
    pub pid_descriptions_mode05: HashMap<String, String>,
    pub pid_descriptions_mode09: HashMap<String, String>,
}

impl LookupTables {
    /// Load every table through `loader`.
    ///
    /// Returns the tables and one diagnostic line per table that failed.
    pub fn load(loader: &dyn TableLoader, vehicle: &str) -> (Self, Vec<String>) {
        let mut diagnostics = Vec::new();
        let mut read = |name: &str| -> HashMap<String, String> {
            load_into(loader, name, HashMap::new(), &mut diagnostics)
        };

        let mut tables = Self {
            obd_standards: read(names::OBD_STANDARDS),
            secondary_air_status: read(names::SECONDARY_AIR_STATUS),
            fuel_system_status: read(names::FUEL_SYSTEM_STATUS),
            trouble_code_prefix: HashMap::new(),
            trouble_code_descriptions: HashMap::new(),
            pid_descriptions_mode01: read(names::PID_DESCRIPTIONS_MODE01),
            pid_descriptions_mode05: read(names::PID_DESCRIPTIONS_MODE05),
            pid_descriptions_mode09: read(names::PID_DESCRIPTIONS_MODE09),
        };

        let prefix = DEFAULT_DTC_PREFIX
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        tables.trouble_code_prefix =
            load_into(loader, names::TROUBLE_CODE_PREFIX, prefix, &mut diagnostics);

        diagnostics.extend(tables.load_vehicle(loader, vehicle));
        (tables, diagnostics)
    }

    /// Rebuild the trouble code descriptions: generic ISO/SAE entries first,
    /// then the vehicle table, whose entries win on collision.
    pub fn load_vehicle(&mut self, loader: &dyn TableLoader, vehicle: &str) -> Vec<String> {
        let mut diagnostics = Vec::new();
        let generic = load_into(
            loader,
            names::TROUBLE_CODES_GENERIC,
            HashMap::new(),
            &mut diagnostics,
        );
        self.trouble_code_descriptions = load_into(loader, vehicle, generic, &mut diagnostics);
        diagnostics
    }

    /// Table backing a code-lookup decoder
    pub fn table(&self, kind: TableKind) -> &HashMap<String, String> {
        match kind {
            TableKind::ObdStandards => &self.obd_standards,
            TableKind::SecondaryAirStatus => &self.secondary_air_status,
            TableKind::FuelSystemStatus => &self.fuel_system_status,
        }
    }

    /// PID description table for a discovery mode, if the mode has one
    pub fn pid_descriptions(&self, mode: u8) -> Option<&HashMap<String, String>> {
        match mode {
            mode::CURRENT_DATA | mode::FREEZE_FRAME => Some(&self.pid_descriptions_mode01),
            mode::O2_MONITOR => Some(&self.pid_descriptions_mode05),
            mode::VEHICLE_INFO => Some(&self.pid_descriptions_mode09),
            _ => None,
        }
    }
}

fn load_into(
    loader: &dyn TableLoader,
    name: &str,
    mut base: HashMap<String, String>,
    diagnostics: &mut Vec<String>,
) -> HashMap<String, String> {
    match loader.load(name) {
        Ok(entries) => {
            debug!("Loaded {} entries from table {}", entries.len(), name);
            base.extend(entries);
        }
        Err(e) => {
            warn!("Table {} unavailable: {}", name, e);
            diagnostics.push(format!("FAILED TO READ TABLE: {}", name));
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table() {
        let entries = parse_table("01 Open loop\n02 Closed loop \n\nP0133 O2 Sensor Slow\n");
        assert_eq!(
            entries,
            vec![
                ("01".to_string(), "Open loop".to_string()),
                ("02".to_string(), "Closed loop".to_string()),
                ("P0133".to_string(), "O2 Sensor Slow".to_string()),
            ]
        );
    }

    #[test]
    fn test_vehicle_overrides_generic() {
        let loader = MemoryTableLoader::new()
            .with_table(
                names::TROUBLE_CODES_GENERIC,
                &[("P0133", "Generic"), ("P0300", "Misfire")],
            )
            .with_table("Vehicle", &[("P0133", "Vehicle specific")]);
        let (tables, _) = LookupTables::load(&loader, "Vehicle");
        assert_eq!(tables.trouble_code_descriptions["P0133"], "Vehicle specific");
        assert_eq!(tables.trouble_code_descriptions["P0300"], "Misfire");
    }

    #[test]
    fn test_missing_tables_are_diagnostics() {
        let (tables, diagnostics) = LookupTables::load(&MemoryTableLoader::new(), "Vehicle");
        assert!(tables.fuel_system_status.is_empty());
        assert_eq!(diagnostics.len(), 9);
        assert!(diagnostics.contains(&"FAILED TO READ TABLE: Vehicle".to_string()));
        // Prefix table falls back to the ISO mapping
        assert_eq!(tables.trouble_code_prefix["4"], "C0");
    }

    #[test]
    fn test_dir_loader_missing_file() {
        let loader = DirTableLoader::new("/nonexistent-obd-data");
        assert!(matches!(
            loader.load(names::FUEL_SYSTEM_STATUS),
            Err(TableError::Read { .. })
        ));
    }
}
