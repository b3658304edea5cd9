//! Uploader configuration

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::Duration;
use wh_common::{Result, WhError};

use crate::model::DISCARDS_TABLE;
use crate::warehouse::destination;

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| WhError::Config(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}

// ============================================================================
// Defaults
// ============================================================================

/// Default staging-file batch size for one notifier publish.
pub const DEFAULT_PUBLISH_BATCH_SIZE: usize = 100;

/// Default failed attempts tolerated per stage before the abort rule applies.
pub const DEFAULT_MIN_RETRY_ATTEMPTS: i64 = 3;

/// Default window, from the first attempt, after which exhausted retries abort.
pub const DEFAULT_RETRY_TIME_WINDOW_MINS: i64 = 180;

/// Default base of the exponential retry backoff.
pub const DEFAULT_RETRY_BACKOFF_BASE_SECS: i64 = 60;

/// Default cap of the exponential retry backoff.
pub const DEFAULT_RETRY_BACKOFF_MAX_SECS: i64 = 1800;

/// Default threshold after which a still-running upload emits the
/// long-running metric.
pub const DEFAULT_LONG_RUNNING_THRESHOLD_MINS: u64 = 120;

/// Default per-destination parallel table loads, applied to any destination
/// type not present in the configured map.
pub const DEFAULT_PARALLEL_LOADS: usize = 1;

/// Retry and abort policy for stage failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts beyond this count become candidates for aborting.
    pub min_retry_attempts: i64,
    /// An exhausted stage aborts only once this much time passed since the
    /// upload's first attempt.
    pub retry_time_window: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_retry_attempts: DEFAULT_MIN_RETRY_ATTEMPTS,
            retry_time_window: Duration::minutes(DEFAULT_RETRY_TIME_WINDOW_MINS),
            backoff_base: Duration::seconds(DEFAULT_RETRY_BACKOFF_BASE_SECS),
            backoff_max: Duration::seconds(DEFAULT_RETRY_BACKOFF_MAX_SECS),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next retry after `attempts` failures of a stage:
    /// `base * 2^(attempts-1)`, capped.
    pub fn backoff(&self, attempts: i64) -> Duration {
        let shift = attempts.saturating_sub(1).clamp(0, 16) as u32;
        let base_ms = self.backoff_base.num_milliseconds();
        let delay_ms = base_ms.saturating_mul(1i64 << shift);
        Duration::milliseconds(delay_ms.min(self.backoff_max.num_milliseconds()))
    }
}

/// Configuration for the upload orchestrator.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Staging files per notifier publish.
    pub publish_batch_size: usize,
    /// Parallel table loads per destination type.
    pub max_parallel_loads: HashMap<String, usize>,
    pub retry: RetryPolicy,
    /// Runtime after which the long-running metric fires.
    pub long_running_threshold: StdDuration,
    /// Global identity-resolution switch.
    pub id_resolution_enabled: bool,
    /// Destination types identity resolution applies to.
    pub identity_destinations: Vec<String>,
    /// Tables marked exported without driver work when they have no load files.
    pub always_mark_exported: Vec<String>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        let mut max_parallel_loads = HashMap::new();
        max_parallel_loads.insert(destination::BIGQUERY.to_string(), 20);
        for dest in [
            destination::POSTGRES,
            destination::SNOWFLAKE,
            destination::REDSHIFT,
            destination::CLICKHOUSE,
            destination::MSSQL,
            destination::DELTALAKE,
        ] {
            max_parallel_loads.insert(dest.to_string(), 3);
        }

        Self {
            publish_batch_size: DEFAULT_PUBLISH_BATCH_SIZE,
            max_parallel_loads,
            retry: RetryPolicy::default(),
            long_running_threshold: StdDuration::from_secs(
                DEFAULT_LONG_RUNNING_THRESHOLD_MINS * 60,
            ),
            id_resolution_enabled: false,
            identity_destinations: vec![
                destination::SNOWFLAKE.to_string(),
                destination::BIGQUERY.to_string(),
                destination::POSTGRES.to_string(),
            ],
            always_mark_exported: vec![DISCARDS_TABLE.to_string()],
        }
    }
}

impl UploaderConfig {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults.
    ///
    /// - `WH_PUBLISH_BATCH_SIZE`
    /// - `WH_MIN_RETRY_ATTEMPTS`
    /// - `WH_RETRY_TIME_WINDOW_MINS`
    /// - `WH_RETRY_BACKOFF_BASE_SECS` / `WH_RETRY_BACKOFF_MAX_SECS`
    /// - `WH_LONG_RUNNING_UPLOAD_THRESHOLD_MINS`
    /// - `WH_ID_RESOLUTION_ENABLED`
    /// - `WH_IDENTITY_DESTINATIONS` (comma-separated destination types)
    /// - `WH_ALWAYS_MARK_EXPORTED` (comma-separated table names)
    /// - `WH_MAX_PARALLEL_LOADS` (e.g. "bigquery=20,postgres=3")
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Some(v) = env_parse("WH_PUBLISH_BATCH_SIZE")? {
            config.publish_batch_size = v;
        }
        if let Some(v) = env_parse("WH_MIN_RETRY_ATTEMPTS")? {
            config.retry.min_retry_attempts = v;
        }
        if let Some(v) = env_parse("WH_RETRY_TIME_WINDOW_MINS")? {
            config.retry.retry_time_window = Duration::minutes(v);
        }
        if let Some(v) = env_parse("WH_RETRY_BACKOFF_BASE_SECS")? {
            config.retry.backoff_base = Duration::seconds(v);
        }
        if let Some(v) = env_parse("WH_RETRY_BACKOFF_MAX_SECS")? {
            config.retry.backoff_max = Duration::seconds(v);
        }
        if let Some(v) = env_parse::<u64>("WH_LONG_RUNNING_UPLOAD_THRESHOLD_MINS")? {
            config.long_running_threshold = StdDuration::from_secs(v * 60);
        }
        if let Some(v) = env_parse("WH_ID_RESOLUTION_ENABLED")? {
            config.id_resolution_enabled = v;
        }
        if let Ok(v) = std::env::var("WH_IDENTITY_DESTINATIONS") {
            config.identity_destinations =
                v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("WH_ALWAYS_MARK_EXPORTED") {
            config.always_mark_exported =
                v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("WH_MAX_PARALLEL_LOADS") {
            for pair in v.split(',') {
                let (dest, n) = pair.split_once('=').ok_or_else(|| {
                    WhError::Config(format!("invalid WH_MAX_PARALLEL_LOADS entry: {pair}"))
                })?;
                let n = n.trim().parse().map_err(|e| {
                    WhError::Config(format!("WH_MAX_PARALLEL_LOADS ({dest}): {e}"))
                })?;
                config.max_parallel_loads.insert(dest.trim().to_string(), n);
            }
        }

        Ok(config)
    }

    /// Parallelism cap for a destination type.
    pub fn parallel_loads_for(&self, destination_type: &str) -> usize {
        self.max_parallel_loads
            .get(destination_type)
            .copied()
            .unwrap_or(DEFAULT_PARALLEL_LOADS)
            .max(1)
    }

    /// Whether identity resolution applies to this destination.
    pub fn identity_enabled_for(&self, destination_type: &str) -> bool {
        self.id_resolution_enabled
            && self
                .identity_destinations
                .iter()
                .any(|d| d == destination_type)
    }
}
