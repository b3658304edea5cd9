//! Metric emission seam
//!
//! The core emits named counters and timers; wiring them to a backend is the
//! embedding process's concern. [`Recorder`] keeps everything in memory for
//! tests and local inspection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Upload wall-clock time.
pub const METRIC_UPLOAD_TIME: &str = "upload_time";
/// Uploads that ran past the long-running threshold.
pub const METRIC_LONG_RUNNING_UPLOAD: &str = "long_running_upload";
/// Uploads that hit the abort rule.
pub const METRIC_UPLOAD_ABORTED: &str = "upload_aborted";
/// Uploads that reached the final stage successfully.
pub const METRIC_UPLOAD_COMPLETED: &str = "upload_completed";
/// Load files produced by the workers for one upload.
pub const METRIC_LOAD_FILES_GENERATED: &str = "load_files_generated";
/// Rows exported into destination tables.
pub const METRIC_ROWS_EXPORTED: &str = "rows_exported";

pub trait MetricsSink: Send + Sync {
    fn incr(&self, name: &str, value: u64);
    fn timing(&self, name: &str, elapsed: Duration);
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _name: &str, _value: u64) {}
    fn timing(&self, _name: &str, _elapsed: Duration) {}
}

/// In-memory recorder with snapshot access.
#[derive(Debug, Default)]
pub struct Recorder {
    counters: Mutex<HashMap<String, u64>>,
    timings: Mutex<HashMap<String, Vec<Duration>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .expect("metrics lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn timings_for(&self, name: &str) -> Vec<Duration> {
        self.timings
            .lock()
            .expect("metrics lock poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for Recorder {
    fn incr(&self, name: &str, value: u64) {
        *self
            .counters
            .lock()
            .expect("metrics lock poisoned")
            .entry(name.to_string())
            .or_insert(0) += value;
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        self.timings
            .lock()
            .expect("metrics lock poisoned")
            .entry(name.to_string())
            .or_default()
            .push(elapsed);
    }
}
