//! Durable persistence for uploads, per-table uploads, staging files and
//! load files
//!
//! Store failures are non-recoverable for a running job; callers terminate
//! with the current stage's failure label instead of journaling them.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::config::RetryPolicy;
use crate::model::{
    ErrorJournal, LoadFile, PendingTableStatus, StagingFileStatus, TableUpload,
    TableUploadStatus, Upload,
};
use crate::schema::Schema;
use crate::state::ABORTED;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Error raised by a store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported column: {0}")]
    UnsupportedColumn(String),
}

/// Typed value for a parameterised column update.
#[derive(Debug, Clone)]
pub enum ColumnValue {
    BigInt(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

/// `(column, value)` pair; column names come from the fixed schema, values
/// are always bound.
pub type ColumnUpdate = (&'static str, ColumnValue);

#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn get_upload(&self, id: i64) -> Result<Upload, StoreError>;

    /// Write `status`, append one timings entry and bump `updated_at`, plus
    /// any extra columns, in one durable write.
    async fn set_upload_status(
        &self,
        id: i64,
        status: &str,
        extra: &[ColumnUpdate],
    ) -> Result<(), StoreError>;

    async fn set_upload_columns(&self, id: i64, columns: &[ColumnUpdate])
        -> Result<(), StoreError>;

    /// Record a stage failure: bump the journal, decide between the stage's
    /// failure label and `aborted`, write `next_retry_time`. Returns the
    /// status written.
    async fn set_upload_error(
        &self,
        id: i64,
        journal_key: &str,
        failed_status: &str,
        message: &str,
        policy: &RetryPolicy,
    ) -> Result<String, StoreError>;

    /// Time of the first status write, from the head of the timings journal.
    async fn get_first_attempt_time(
        &self,
        id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Idempotent: existing `(upload_id, table_name)` rows are left alone.
    async fn create_table_uploads(
        &self,
        upload_id: i64,
        tables: &[String],
    ) -> Result<(), StoreError>;

    async fn table_upload(
        &self,
        upload_id: i64,
        table: &str,
    ) -> Result<Option<TableUpload>, StoreError>;

    async fn table_uploads(&self, upload_id: i64) -> Result<Vec<TableUpload>, StoreError>;

    async fn set_table_upload_status(
        &self,
        upload_id: i64,
        table: &str,
        status: TableUploadStatus,
    ) -> Result<(), StoreError>;

    async fn set_table_upload_error(
        &self,
        upload_id: i64,
        table: &str,
        status: TableUploadStatus,
        error: &str,
    ) -> Result<(), StoreError>;

    async fn set_table_upload_events(
        &self,
        upload_id: i64,
        table: &str,
        total_events: i64,
    ) -> Result<(), StoreError>;

    async fn set_table_upload_location(
        &self,
        upload_id: i64,
        table: &str,
        location: &str,
    ) -> Result<(), StoreError>;

    /// Table-upload rows of uploads with id ≤ `upload_id` to the same
    /// destination and namespace whose upload is not yet terminal, filtered
    /// to the given tables.
    async fn pending_table_statuses(
        &self,
        upload_id: i64,
        destination_id: &str,
        namespace: &str,
        tables: &[String],
    ) -> Result<Vec<PendingTableStatus>, StoreError>;

    async fn set_staging_file_statuses(
        &self,
        ids: &[i64],
        status: StagingFileStatus,
    ) -> Result<(), StoreError>;

    async fn load_files_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        table: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<LoadFile>, StoreError>;

    async fn count_load_files_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        table: &str,
        start: i64,
        end: i64,
    ) -> Result<i64, StoreError>;

    /// Locally cached schema snapshot for the namespace; empty when absent.
    async fn namespace_schema(
        &self,
        destination_id: &str,
        namespace: &str,
    ) -> Result<Schema, StoreError>;

    async fn save_namespace_schema(
        &self,
        source_id: &str,
        destination_id: &str,
        namespace: &str,
        schema: &Schema,
    ) -> Result<(), StoreError>;
}

/// Outcome of one error write, shared by the store implementations.
#[derive(Debug, Clone)]
pub(crate) struct ErrorWriteOutcome {
    pub status: String,
    pub attempts: i64,
    pub next_retry_at: DateTime<Utc>,
}

/// Bump the journal for `journal_key` and decide the status to write: the
/// stage's failure label, or `aborted` once the attempt count exceeds the
/// policy minimum and the first attempt is outside the retry window.
pub(crate) fn plan_error_write(
    journal: &mut ErrorJournal,
    journal_key: &str,
    failed_status: &str,
    message: &str,
    first_attempt_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> ErrorWriteOutcome {
    let attempts = journal.record(journal_key, message);

    let window_exceeded = first_attempt_at
        .map(|first| now - first > policy.retry_time_window)
        .unwrap_or(false);

    let status = if attempts > policy.min_retry_attempts && window_exceeded {
        ABORTED.to_string()
    } else {
        failed_status.to_string()
    };

    ErrorWriteOutcome {
        status,
        attempts,
        next_retry_at: now + policy.backoff(attempts),
    }
}

/// RFC3339 with millisecond precision, the format of every persisted
/// timestamp string.
pub(crate) fn rfc3339_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            min_retry_attempts: 3,
            retry_time_window: Duration::minutes(180),
            backoff_base: Duration::seconds(60),
            backoff_max: Duration::seconds(1800),
        }
    }

    #[test]
    fn test_plan_error_write_keeps_failing_within_budget() {
        let mut journal = ErrorJournal::default();
        let now = Utc::now();

        let outcome = plan_error_write(
            &mut journal,
            "exporting_data",
            "failed_exporting_data",
            "table b failed",
            Some(now - Duration::minutes(5)),
            now,
            &policy(),
        );

        assert_eq!(outcome.status, "failed_exporting_data");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.next_retry_at, now + Duration::seconds(60));
    }

    #[test]
    fn test_plan_error_write_aborts_only_with_both_conditions() {
        let now = Utc::now();

        // Attempts exhausted but still inside the window: no abort.
        let mut journal = ErrorJournal::default();
        for _ in 0..4 {
            journal.record("exporting_data", "boom");
        }
        let outcome = plan_error_write(
            &mut journal,
            "exporting_data",
            "failed_exporting_data",
            "boom",
            Some(now - Duration::minutes(5)),
            now,
            &policy(),
        );
        assert_eq!(outcome.status, "failed_exporting_data");

        // Attempts exhausted and window exceeded: abort.
        let mut journal = ErrorJournal::default();
        for _ in 0..4 {
            journal.record("exporting_data", "boom");
        }
        let outcome = plan_error_write(
            &mut journal,
            "exporting_data",
            "failed_exporting_data",
            "boom",
            Some(now - Duration::minutes(181)),
            now,
            &policy(),
        );
        assert_eq!(outcome.status, ABORTED);
        assert_eq!(outcome.attempts, 5);
    }

    #[test]
    fn test_plan_error_write_without_first_attempt_never_aborts() {
        let mut journal = ErrorJournal::default();
        for _ in 0..10 {
            journal.record("exporting_data", "boom");
        }
        let outcome = plan_error_write(
            &mut journal,
            "exporting_data",
            "failed_exporting_data",
            "boom",
            None,
            Utc::now(),
            &policy(),
        );
        assert_eq!(outcome.status, "failed_exporting_data");
    }
}
