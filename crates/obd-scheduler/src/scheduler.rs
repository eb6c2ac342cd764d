//! PID Scheduler Implementation

use crate::worker::{ObdWorker, WorkerError};
use obd_protocol::DecodeResult;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Configuration for the PID scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Base sampling rate in Hz (default: 5.0)
    pub base_rate_hz: f64,
    /// Consecutive failed polls before a PID is dropped
    pub max_failures: u8,
    /// Capacity of the reading channel
    pub channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_rate_hz: 5.0,
            max_failures: 3,
            channel_capacity: 64,
        }
    }
}

/// One decoded PID sample
#[derive(Debug, Clone, Serialize)]
pub struct PidReading {
    pub code: String,
    pub result: DecodeResult,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl PidReading {
    fn now(code: &str, result: DecodeResult) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            code: code.to_string(),
            result,
            timestamp_ms,
        }
    }
}

/// Sampling priority of a Mode 01 code (higher = more important)
fn sampling_priority(code: &str) -> u8 {
    match code {
        "010C" | "010D" | "0105" | "0104" => 10,
        "0110" => 5,
        _ => 2,
    }
}

/// A scheduled PID with priority and timing info
#[derive(Debug, Clone)]
pub struct ScheduledPid {
    /// The PID code to query
    pub code: String,
    /// Current sampling rate in Hz
    pub rate_hz: f64,
    /// Next scheduled query time
    pub next_query: Instant,
    /// Priority (higher = more important)
    pub priority: u8,
    /// Consecutive failure count
    pub failures: u8,
}

impl ScheduledPid {
    /// Create a new scheduled PID
    pub fn new(code: &str, rate_hz: f64) -> Self {
        Self {
            code: code.to_uppercase(),
            rate_hz,
            next_query: Instant::now(),
            priority: sampling_priority(&code.to_uppercase()),
            failures: 0,
        }
    }

    /// Calculate interval between queries
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    /// Schedule next query
    pub fn schedule_next(&mut self) {
        self.next_query = Instant::now() + self.interval();
    }
}

impl Eq for ScheduledPid {}

impl PartialEq for ScheduledPid {
    fn eq(&self, other: &Self) -> bool {
        self.next_query == other.next_query && self.priority == other.priority
    }
}

impl Ord for ScheduledPid {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest time first, then higher priority
        other
            .next_query
            .cmp(&self.next_query)
            .then_with(|| self.priority.cmp(&other.priority))
    }
}

impl PartialOrd for ScheduledPid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Periodic poller for live data PIDs
pub struct PidScheduler {
    /// Scheduled PIDs in priority queue
    queue: BinaryHeap<ScheduledPid>,
    /// Configuration
    config: SchedulerConfig,
}

impl PidScheduler {
    /// Create a scheduler with the default engine PIDs
    pub fn new(config: SchedulerConfig) -> Self {
        let base = config.base_rate_hz;
        let mut scheduler = Self::empty(config);

        // Engine state at the base rate
        for code in ["010C", "010D", "0105", "0104"] {
            scheduler.add_pid(code, base);
        }
        scheduler.add_pid("0110", 1.0);
        // Fuel trims and O2 sensor slowly
        for code in ["0106", "0107", "0114"] {
            scheduler.add_pid(code, 0.5);
        }

        info!("PID scheduler created with {} PIDs", scheduler.pid_count());
        scheduler
    }

    /// Create a scheduler with nothing to poll
    pub fn empty(config: SchedulerConfig) -> Self {
        Self {
            queue: BinaryHeap::new(),
            config,
        }
    }

    /// Poll `code` at `rate_hz`, replacing any earlier rate for it
    pub fn add_pid(&mut self, code: &str, rate_hz: f64) {
        let scheduled = ScheduledPid::new(code, rate_hz);
        self.queue.retain(|item| item.code != scheduled.code);
        debug!("Scheduling {} at {} Hz", scheduled.code, rate_hz);
        self.queue.push(scheduled);
    }

    /// Drop PIDs missing from a session's supported set
    pub fn retain_supported(&mut self, valid: &BTreeMap<String, String>) {
        let before = self.queue.len();
        self.queue.retain(|item| valid.contains_key(&item.code));
        if self.queue.len() < before {
            info!(
                "Dropped {} unsupported PIDs, {} remain",
                before - self.queue.len(),
                self.queue.len()
            );
        }
    }

    /// Poll through `worker` until the reading receiver is dropped or no
    /// PIDs remain.
    pub async fn run(
        &mut self,
        worker: &ObdWorker,
        reading_tx: mpsc::Sender<PidReading>,
    ) -> Result<(), WorkerError> {
        info!("Starting PID scheduler");

        while let Some(mut scheduled) = self.queue.pop() {
            // Wait until it's time
            let now = Instant::now();
            if scheduled.next_query > now {
                tokio::time::sleep(scheduled.next_query - now).await;
            }

            let result = worker.do_pid(&scheduled.code, None).await?;
            if result.is_sentinel() {
                scheduled.failures += 1;
                warn!(
                    "PID {} poll gave {:?} (attempt {})",
                    scheduled.code, result, scheduled.failures
                );
            } else {
                scheduled.failures = 0;
            }

            match reading_tx.try_send(PidReading::now(&scheduled.code, result)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("Reading channel full, sample dropped"),
                Err(TrySendError::Closed(_)) => {
                    self.queue.push(scheduled);
                    break;
                }
            }

            if scheduled.failures >= self.config.max_failures {
                warn!("Max failures reached for PID {}, unscheduling", scheduled.code);
                continue;
            }
            scheduled.schedule_next();
            self.queue.push(scheduled);
        }

        info!("PID scheduler stopped");
        Ok(())
    }

    /// Get the number of scheduled PIDs
    pub fn pid_count(&self) -> usize {
        self.queue.len()
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::MockAdapter;
    use obd_protocol::{MemoryTableLoader, NegotiatorConfig, ObdClient, Sentinel, TransportConfig};

    fn spawn_worker() -> ObdWorker {
        let adapter = MockAdapter::new()
            .with_response("0101", "4101000701FF")
            .with_response("0100", "4100BE3EB810")
            .with_response("010C", "410C1AF8")
            .with_response("010D", "410D32");
        let client = ObdClient::new(
            adapter,
            &TransportConfig::default(),
            NegotiatorConfig::immediate(),
            &MemoryTableLoader::new(),
            "Vehicle",
        );
        ObdWorker::spawn(client).0
    }

    fn fast() -> SchedulerConfig {
        SchedulerConfig {
            base_rate_hz: 100.0,
            max_failures: 2,
            channel_capacity: 16,
        }
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = PidScheduler::new(SchedulerConfig::default());
        assert_eq!(scheduler.pid_count(), 8);
    }

    #[test]
    fn test_scheduled_pid_ordering() {
        let now = Instant::now();
        let mut rpm = ScheduledPid::new("010C", 5.0);
        let mut maf = ScheduledPid::new("0110", 1.0);
        rpm.next_query = now;
        maf.next_query = now;
        assert!(rpm > maf);

        // Earlier deadline wins over priority
        maf.next_query = now;
        rpm.next_query = now + Duration::from_millis(10);
        assert!(maf > rpm);
    }

    #[test]
    fn test_add_pid_replaces_rate() {
        let mut scheduler = PidScheduler::empty(fast());
        scheduler.add_pid("010c", 1.0);
        scheduler.add_pid("010C", 2.0);
        assert_eq!(scheduler.pid_count(), 1);
    }

    #[test]
    fn test_retain_supported() {
        let mut scheduler = PidScheduler::new(SchedulerConfig::default());
        let valid: BTreeMap<String, String> = [("010C", "RPM"), ("010D", "Speed")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        scheduler.retain_supported(&valid);
        assert_eq!(scheduler.pid_count(), 2);
    }

    #[tokio::test]
    async fn test_run_until_receiver_dropped() {
        let worker = spawn_worker();
        worker.connect().await.unwrap();

        let mut scheduler = PidScheduler::empty(fast());
        scheduler.add_pid("010C", 100.0);
        scheduler.add_pid("010D", 100.0);

        let (tx, mut rx) = mpsc::channel(16);
        let runner = {
            let worker = worker.clone();
            tokio::spawn(async move {
                let result = scheduler.run(&worker, tx).await;
                (scheduler, result)
            })
        };

        let mut seen = Vec::new();
        for _ in 0..4 {
            let reading = rx.recv().await.unwrap();
            seen.push(reading);
        }
        drop(rx);

        let (scheduler, result) = runner.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(scheduler.pid_count(), 2);

        let rpm = seen.iter().find(|r| r.code == "010C").unwrap();
        assert_eq!(rpm.result, DecodeResult::Number(1726.0));
        let speed = seen.iter().find(|r| r.code == "010D").unwrap();
        let mph = speed.result.as_number().unwrap();
        assert!((mph - 31.07).abs() < 0.01);
        assert!(seen.iter().all(|r| r.timestamp_ms > 0));
    }

    #[tokio::test]
    async fn test_failing_pid_unscheduled() {
        let worker = spawn_worker();
        worker.connect().await.unwrap();

        // 0105 is not in the supported set, so every poll is NoData
        let mut scheduler = PidScheduler::empty(fast());
        scheduler.add_pid("0105", 100.0);

        let (tx, mut rx) = mpsc::channel(16);
        scheduler.run(&worker, tx).await.unwrap();
        assert_eq!(scheduler.pid_count(), 0);

        let mut readings = Vec::new();
        while let Some(reading) = rx.recv().await {
            readings.push(reading);
        }
        assert_eq!(readings.len(), 2);
        assert!(readings
            .iter()
            .all(|r| r.result == DecodeResult::Sentinel(Sentinel::NoData)));
    }

    #[tokio::test]
    async fn test_empty_scheduler_returns() {
        let worker = spawn_worker();
        let mut scheduler = PidScheduler::empty(fast());
        let (tx, _rx) = mpsc::channel(1);
        assert!(scheduler.run(&worker, tx).await.is_ok());
    }
}
