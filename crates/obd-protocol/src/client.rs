//! OBD-II Client for ELM327 Adapters
//!
//! Owns the transport, the lookup tables and the valid PID sets of one
//! session. All calls block until the adapter answers or times out.

use crate::config::{NegotiatorConfig, TransportConfig};
use crate::decode::{decode, Payload};
use crate::discovery::{discover, discover_anchor, BitmapSource, ValidPidSet};
use crate::error::{ConnectError, TransportError};
use crate::negotiator::Negotiator;
use crate::pid::{DecodeResult, Formula, PidRegistry, PidRequest, Sentinel, BUS_MANAGEMENT};
use crate::response::{last_line, prune};
use crate::session::Session;
use crate::tables::{LookupTables, TableLoader};
use crate::transport::{SerialLink, Transport};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Adapter information requests, in the order they are issued
const INFO_QUERIES: [(&str, &str); 9] = [
    ("ELM Device Version", "AT I"),
    ("ELM Device Description", "AT @1"),
    ("ELM Device User Data", "AT @2"),
    ("Using CAN BUS Protocol", "AT DP"),
    ("Volt At OBDII Connector", "AT RV"),
    ("CAN Status", "AT CS"),
    ("Key Words", "AT KW"),
    ("ELM327 Buffer Dump", "AT BD"),
    ("ELM327 Programmable Parameters", "AT PPS"),
];

/// Key of the warning entry added to partial adapter information
pub const INFO_WARNING: &str = "WARNING";

/// OBD-II client for ELM327-compatible adapters
pub struct ObdClient<L: SerialLink> {
    transport: Transport<L>,
    negotiator: NegotiatorConfig,
    registry: &'static PidRegistry,
    tables: LookupTables,
    /// Table load failures, reported ahead of negotiation diagnostics
    table_diagnostics: Vec<String>,
    connect_diagnostics: Vec<String>,
    session: Option<Session>,
    valid: ValidPidSet,
    freeze_valid: ValidPidSet,
    /// Freeze frame indices whose bitmaps have been read
    freeze_frames: BTreeSet<u8>,
}

impl<L: SerialLink> ObdClient<L> {
    /// Create a client over `link` and load the lookup tables.
    ///
    /// Nothing is opened until [`ObdClient::connect`].
    pub fn new(
        link: L,
        transport: &TransportConfig,
        negotiator: NegotiatorConfig,
        loader: &dyn TableLoader,
        vehicle: &str,
    ) -> Self {
        info!("Creating OBD client for device: {}", link.name());
        let (tables, table_diagnostics) = LookupTables::load(loader, vehicle);

        Self {
            transport: Transport::new(link, transport),
            negotiator,
            registry: PidRegistry::global(),
            tables,
            table_diagnostics,
            connect_diagnostics: Vec::new(),
            session: None,
            valid: ValidPidSet::new(),
            freeze_valid: ValidPidSet::new(),
            freeze_frames: BTreeSet::new(),
        }
    }

    /// Negotiate with the adapter and discover the supported PIDs.
    ///
    /// Any previous session and its valid PID sets are discarded first.
    pub fn connect(&mut self) -> Result<Session, ConnectError> {
        self.reset_session();

        let mut negotiator = Negotiator::new(&mut self.transport, &self.negotiator);
        let result = negotiator.run();
        self.connect_diagnostics = negotiator.into_diagnostics();
        let mut session = result?;

        for descriptor in BUS_MANAGEMENT.iter() {
            self.valid.insert(descriptor.code, descriptor.description);
        }

        if let Err(e) = self.discover_all() {
            warn!("PID discovery failed: {}", e);
            self.connect_diagnostics
                .push(format!("FAILED TO READ SUPPORTED PIDS: {}", e));
            self.transport.close();
            self.reset_session();
            return Err(ConnectError::AdapterUnreachable(e));
        }

        session.diagnostics = self.init_diagnostics();
        info!(
            "Connected on {} at {} baud, {} valid PIDs",
            session.port,
            session.baud_rate,
            self.valid.len()
        );
        self.session = Some(session.clone());
        Ok(session)
    }

    fn discover_all(&mut self) -> Result<(), TransportError> {
        for source in [
            BitmapSource::CurrentData,
            BitmapSource::O2Monitor,
            BitmapSource::VehicleInfo,
        ] {
            let added = discover(&mut self.transport, &self.tables, &mut self.valid, source, None)?;
            debug!("{:?} discovery added {} PIDs", source, added.len());
        }
        Ok(())
    }

    fn reset_session(&mut self) {
        self.session = None;
        self.valid.clear();
        self.freeze_valid.clear();
        self.freeze_frames.clear();
    }

    /// Read the supported-PID bitmaps of a freeze frame once per session.
    ///
    /// A frame whose discovery failed is retried on the next request.
    fn ensure_freeze_frame(&mut self, index: u8) {
        if self.session.is_none() || self.freeze_frames.contains(&index) {
            return;
        }
        match discover(
            &mut self.transport,
            &self.tables,
            &mut self.freeze_valid,
            BitmapSource::FreezeFrame,
            Some(index),
        ) {
            Ok(added) => {
                debug!("Freeze frame {} discovery added {} PIDs", index, added.len());
                self.freeze_frames.insert(index);
            }
            Err(e) => warn!("Freeze frame {} discovery failed, will retry: {}", index, e),
        }
    }

    /// Supported PIDs, code → description.
    ///
    /// With a freeze frame index, the Mode 02 keys of that frame; the frame's
    /// bitmaps are read on first request.
    pub fn valid_pids(&mut self, freeze_index: Option<u8>) -> BTreeMap<String, String> {
        match freeze_index {
            None => self.valid.to_map(),
            Some(index) => {
                self.ensure_freeze_frame(index);
                let suffix = format!("{:02}", index);
                self.freeze_valid
                    .iter()
                    .filter(|(code, _)| code.len() == 6 && code.ends_with(&suffix))
                    .map(|(code, description)| (code.to_string(), description.to_string()))
                    .collect()
            }
        }
    }

    /// Request and decode one PID.
    ///
    /// Never fails: unknown codes give `NotImplemented`, unsupported ones
    /// `NoData` without touching the adapter, and transport or decode
    /// failures `Error`.
    pub fn do_pid(&mut self, code: &str, freeze_index: Option<u8>) -> DecodeResult {
        let Some(request) = self.registry.resolve(code, freeze_index) else {
            debug!("PID {} not implemented", code);
            return Sentinel::NotImplemented.into();
        };
        if self.session.is_none() {
            return Sentinel::NoData.into();
        }
        if let Some(index) = request.freeze_index {
            self.ensure_freeze_frame(index);
        }

        let key = request.valid_key();
        let valid = match request.freeze_index {
            Some(_) => &self.freeze_valid,
            None => &self.valid,
        };
        // The first bitmap of every mode is always requestable
        let root_bitmap = matches!(request.descriptor.formula, Formula::SupportedPids { anchor: 0, .. });
        if !root_bitmap && !valid.contains(&key) {
            return Sentinel::NoData.into();
        }

        match request.descriptor.formula {
            Formula::Todo => Sentinel::Todo.into(),
            Formula::SupportedPids { source, anchor } => self.rediscover(&request, source, anchor),
            formula => {
                let response = match self.transport.get_response(request.request_line().as_bytes()) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Request {} failed: {}", key, e);
                        return Sentinel::Error.into();
                    }
                };
                let payload = prune(&response, request.prune());
                if request.descriptor.code == "0101" && request.freeze_index.is_none() {
                    self.refresh_status(&payload);
                }
                decode(&key, &formula, &payload, &self.tables)
            }
        }
    }

    fn rediscover(&mut self, request: &PidRequest<'_>, source: BitmapSource, anchor: u8) -> DecodeResult {
        let (source, valid) = match request.freeze_index {
            Some(_) => (BitmapSource::FreezeFrame, &mut self.freeze_valid),
            None => (source, &mut self.valid),
        };
        match discover_anchor(
            &mut self.transport,
            &self.tables,
            valid,
            source,
            anchor,
            request.freeze_index,
        ) {
            Ok(added) => DecodeResult::PidList(added),
            Err(e) => {
                warn!("Supported PID request {} failed: {}", request.valid_key(), e);
                Sentinel::Error.into()
            }
        }
    }

    fn refresh_status(&mut self, payload: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match Payload::new(payload).byte(0) {
            Ok(status) => session.apply_status_byte(status),
            Err(e) => debug!("Monitor status not refreshed: {}", e),
        }
    }

    /// Adapter information, label → answer.
    ///
    /// A transport failure part way through keeps what was read and adds a
    /// [`INFO_WARNING`] entry.
    pub fn info(&mut self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        info.insert("Serial Port".to_string(), self.transport.name().to_string());

        for (label, command) in INFO_QUERIES {
            let request = format!("{}\r", command);
            match self.transport.get_response(request.as_bytes()) {
                Ok(response) => {
                    info.insert(label.to_string(), response.trim().to_string());
                }
                Err(e) => {
                    warn!("Adapter information incomplete at {}: {}", command, e);
                    info.insert(
                        INFO_WARNING.to_string(),
                        "PARTIAL DATA RETURNED. THIS COULD BE A FAKE ELM327 DEVICE AND SHOULD NOT BE USED IF IT IS FAKE."
                            .to_string(),
                    );
                    break;
                }
            }
        }
        info
    }

    /// Whether the adapter answers `AT @1`
    pub fn is_adapter_present(&mut self) -> bool {
        match self.transport.get_response(b"AT @1\r") {
            Ok(response) => !last_line(&response).is_empty(),
            Err(e) => {
                debug!("Adapter presence check failed: {}", e);
                false
            }
        }
    }

    /// Table load failures followed by the last connect attempt's log
    pub fn init_diagnostics(&self) -> Vec<String> {
        self.table_diagnostics
            .iter()
            .chain(self.connect_diagnostics.iter())
            .cloned()
            .collect()
    }

    /// Replace the vehicle-specific trouble code table
    pub fn load_vehicle(&mut self, loader: &dyn TableLoader, vehicle: &str) -> Vec<String> {
        let diagnostics = self.tables.load_vehicle(loader, vehicle);
        self.table_diagnostics.extend(diagnostics.iter().cloned());
        diagnostics
    }

    /// Close the adapter link and drop the session
    pub fn close(&mut self) {
        if self.session.is_some() {
            info!("Disconnecting OBD client");
        }
        self.transport.close();
        self.reset_session();
    }

    /// Current session, if connected
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// MIL state from the latest 0101 read
    pub fn mil_on(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.mil_on)
    }

    /// Stored trouble code count from the latest 0101 read
    pub fn stored_code_count(&self) -> u8 {
        self.session.as_ref().map_or(0, |s| s.stored_code_count)
    }

    pub fn tables(&self) -> &LookupTables {
        &self.tables
    }

    /// Borrow the underlying link
    pub fn link(&self) -> &L {
        self.transport.link()
    }
}
