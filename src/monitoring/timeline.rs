//! Run Timeline
//!
//! Turns the receive/start/finish timestamps of a run's job into the
//! durations reported in its run log.

use chrono::{DateTime, Utc};

use crate::run::{Internal, RunLog};

/// Format of timestamps shown in the run log.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Seconds from `start` to `end`, if both are known.
pub fn seconds_between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<f64> {
    let (start, end) = (start?, end?);
    Some((end - start).num_microseconds()? as f64 / 1_000_000.0)
}

/// Job timestamps of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunTimeline {
    pub received: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

impl RunTimeline {
    pub fn of(internal: &Internal) -> Self {
        Self {
            received: internal.task_received,
            started: internal.task_started,
            finished: internal.task_finished,
        }
    }

    /// Time spent waiting in the queue.
    pub fn time_queue(&self) -> Option<f64> {
        seconds_between(self.received, self.started)
    }

    pub fn time_execution(&self) -> Option<f64> {
        seconds_between(self.started, self.finished)
    }

    pub fn time_total(&self) -> Option<f64> {
        seconds_between(self.received, self.finished)
    }

    /// Fills in every duration whose inputs are known. Durations already in
    /// `run_log` are kept when an input is missing.
    pub fn apply(&self, run_log: &mut RunLog) {
        if let Some(secs) = self.time_queue() {
            run_log.time_queue = Some(secs);
        }
        if let Some(secs) = self.time_execution() {
            run_log.time_execution = Some(secs);
        }
        if let Some(secs) = self.time_total() {
            run_log.time_total = Some(secs);
        }
    }
}
