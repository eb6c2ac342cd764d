//! OBD-II Scanner
//!
//! Connects to an ELM327 adapter, reports what the vehicle supports and
//! decodes it, writing one JSON object per line.

use anyhow::Result;
use obd_protocol::{
    mode, DecodeResult, DirTableLoader, NegotiatorConfig, ObdClient, SerialPortLink, Session,
    TableConfig, TransportConfig,
};
use obd_scheduler::{ObdWorker, PidReading, PidScheduler, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Configuration file read when none is named
pub const DEFAULT_CONFIG: &str = "obd.toml";

/// Prefix of environment overrides, e.g. `OBD_TRANSPORT__PORT`
pub const ENV_PREFIX: &str = "OBD";

/// Scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObdConfig {
    pub transport: TransportConfig,
    pub negotiator: NegotiatorConfig,
    pub tables: TableConfig,
    pub scheduler: SchedulerConfig,
    /// Maximum tracing level
    pub log_level: String,
    /// Live polling after the scan (seconds, 0 disables)
    pub poll_seconds: u64,
}

impl Default for ObdConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            negotiator: NegotiatorConfig::default(),
            tables: TableConfig::default(),
            scheduler: SchedulerConfig::default(),
            log_level: "info".to_string(),
            poll_seconds: 0,
        }
    }
}

impl ObdConfig {
    /// Load from an optional file at `path`, overlaid by `OBD_*` variables
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Initialize logging at `level`, on stderr so stdout stays JSON
pub fn init_logging(level: &str) -> Result<()> {
    let level: Level = level.parse()?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// One line of scanner output
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ScanLine<'a> {
    Diagnostic(&'a str),
    Session(&'a Session),
    Info(&'a BTreeMap<String, String>),
    ValidPids(&'a BTreeMap<String, String>),
    Decode {
        code: &'a str,
        result: &'a DecodeResult,
    },
    Reading(&'a PidReading),
}

fn emit(out: &mut impl Write, line: &ScanLine<'_>) -> Result<()> {
    serde_json::to_writer(&mut *out, line)?;
    writeln!(out)?;
    Ok(())
}

/// Connect and report adapter info, supported PIDs and a decode of each.
///
/// Clearing trouble codes is never part of a scan. On a failed connection
/// the initialization diagnostics are written before the error returns.
pub async fn scan(worker: &ObdWorker, out: &mut impl Write) -> Result<BTreeMap<String, String>> {
    let session = match worker.connect().await {
        Ok(session) => session,
        Err(e) => {
            for line in worker.diagnostics().await? {
                emit(out, &ScanLine::Diagnostic(&line))?;
            }
            return Err(e.into());
        }
    };
    emit(out, &ScanLine::Session(&session))?;

    let adapter = worker.info().await?;
    emit(out, &ScanLine::Info(&adapter))?;

    let valid = worker.valid_pids(None).await?;
    emit(out, &ScanLine::ValidPids(&valid))?;

    let clear = format!("{:02X}", mode::CLEAR_DTC);
    for code in valid.keys().filter(|code| **code != clear) {
        let result = worker.do_pid(code, None).await?;
        emit(out, &ScanLine::Decode { code, result: &result })?;
    }

    Ok(valid)
}

/// Poll the supported default PIDs for `duration`
pub async fn poll(
    worker: &ObdWorker,
    config: &SchedulerConfig,
    valid: &BTreeMap<String, String>,
    duration: Duration,
    out: &mut impl Write,
) -> Result<()> {
    let mut scheduler = PidScheduler::new(config.clone());
    scheduler.retain_supported(valid);
    if scheduler.pid_count() == 0 {
        warn!("No schedulable PIDs supported, skipping live polling");
        return Ok(());
    }

    let (reading_tx, mut reading_rx) = mpsc::channel(config.channel_capacity);
    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { scheduler.run(&worker, reading_tx).await })
    };

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            reading = reading_rx.recv() => match reading {
                Some(reading) => emit(out, &ScanLine::Reading(&reading))?,
                None => break,
            },
        }
    }
    drop(reading_rx);

    runner.await??;
    Ok(())
}

/// Scan the adapter named by `config`, then optionally poll it
pub async fn run(config: ObdConfig) -> Result<()> {
    let link = SerialPortLink::from_config(&config.transport);
    let loader = DirTableLoader::new(&config.tables.data_dir);
    let client = ObdClient::new(
        link,
        &config.transport,
        config.negotiator.clone(),
        &loader,
        &config.tables.vehicle,
    );
    let (worker, handle) = ObdWorker::spawn(client);
    let mut out = std::io::stdout();

    let outcome = async {
        let valid = scan(&worker, &mut out).await?;
        if config.poll_seconds > 0 {
            info!("Polling live data for {} s", config.poll_seconds);
            let duration = Duration::from_secs(config.poll_seconds);
            poll(&worker, &config.scheduler, &valid, duration, &mut out).await?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    worker.close().await?;
    drop(worker);
    handle.await?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::MockAdapter;
    use obd_protocol::MemoryTableLoader;
    use serde_json::Value;

    fn spawn(adapter: MockAdapter) -> (ObdWorker, tokio::task::JoinHandle<ObdClient<MockAdapter>>) {
        let client = ObdClient::new(
            adapter,
            &TransportConfig::default(),
            NegotiatorConfig::immediate(),
            &MemoryTableLoader::new(),
            "Vehicle",
        );
        ObdWorker::spawn(client)
    }

    fn vehicle() -> MockAdapter {
        MockAdapter::new()
            .with_response("0101", "4101000701FF")
            .with_response("0100", "4100BE3EB810")
            .with_response("010C", "410C1AF8")
            .with_response("010D", "410D32")
    }

    fn lines(out: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_config_defaults() {
        let config = ObdConfig::from_toml("").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.transport.timeout_ms, 7000);
        assert_eq!(config.negotiator.initial_baud_rate, 38400);
        assert_eq!(config.tables.data_dir, "DATA");
        assert_eq!(config.poll_seconds, 0);
    }

    #[test]
    fn test_config_overrides() {
        let config = ObdConfig::from_toml(
            r#"
            log_level = "debug"
            poll_seconds = 10

            [transport]
            port = "/dev/ttyACM0"

            [negotiator]
            baud_stepping = false

            [scheduler]
            base_rate_hz = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.poll_seconds, 10);
        assert_eq!(config.transport.port, "/dev/ttyACM0");
        assert_eq!(config.transport.timeout_ms, 7000);
        assert!(!config.negotiator.baud_stepping);
        assert_eq!(config.scheduler.base_rate_hz, 2.0);
    }

    #[test]
    fn test_missing_config_file() {
        let config = ObdConfig::load("does-not-exist.toml").unwrap();
        assert_eq!(config.tables.vehicle, "TroubleCodes-R53_Cooper_S");
    }

    #[tokio::test]
    async fn test_scan_output() {
        let (worker, handle) = spawn(vehicle());
        let mut out = Vec::new();
        let valid = scan(&worker, &mut out).await.unwrap();
        assert!(valid.contains_key("04"));

        let lines = lines(&out);
        assert_eq!(lines[0]["type"], "session");
        assert_eq!(lines[0]["data"]["port"], "mock-elm327");
        assert_eq!(lines[1]["type"], "info");
        assert_eq!(lines[2]["type"], "valid_pids");

        let rpm = lines
            .iter()
            .find(|line| line["type"] == "decode" && line["data"]["code"] == "010C")
            .unwrap();
        assert_eq!(rpm["data"]["result"]["kind"], "number");
        assert_eq!(rpm["data"]["result"]["value"], 1726.0);
        assert!(!lines
            .iter()
            .any(|line| line["type"] == "decode" && line["data"]["code"] == "04"));

        drop(worker);
        let client = handle.await.unwrap();
        assert!(!client.link().requests().iter().any(|r| r == "04"));
    }

    #[tokio::test]
    async fn test_scan_failure_writes_diagnostics() {
        let (worker, _handle) = spawn(MockAdapter::new().with_bus_disconnected("UNABLE TO CONNECT"));
        let mut out = Vec::new();
        assert!(scan(&worker, &mut out).await.is_err());

        let lines = lines(&out);
        assert!(!lines.is_empty());
        assert!(lines.iter().all(|line| line["type"] == "diagnostic"));
        assert!(lines
            .iter()
            .any(|line| line["data"].as_str().unwrap_or("").contains("UNABLE TO CONNECT")));
    }

    #[tokio::test]
    async fn test_poll_streams_readings() {
        let (worker, _handle) = spawn(vehicle());
        let mut out = Vec::new();
        let valid = scan(&worker, &mut out).await.unwrap();

        let config = SchedulerConfig {
            base_rate_hz: 50.0,
            ..Default::default()
        };
        let mut polled = Vec::new();
        poll(&worker, &config, &valid, Duration::from_millis(200), &mut polled)
            .await
            .unwrap();

        let lines = lines(&polled);
        assert!(!lines.is_empty());
        assert!(lines.iter().all(|line| line["type"] == "reading"));
        assert!(lines.iter().any(|line| line["data"]["code"] == "010C"));
    }
}
