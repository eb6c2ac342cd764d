//! OBD-II Live Data Scheduling
//!
//! Runs the blocking protocol client on a dedicated task and polls
//! supported PIDs at per-PID rates, streaming decoded readings.

mod scheduler;
mod worker;

pub use scheduler::{PidReading, PidScheduler, ScheduledPid, SchedulerConfig};
pub use worker::{ObdWorker, WorkerError};
