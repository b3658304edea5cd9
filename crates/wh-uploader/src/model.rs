//! Row types for the `wh_*` tables and their status vocabularies

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::schema::Schema;

/// User-identity table loaded alongside `users` during the user-table stage.
pub const IDENTIFIES_TABLE: &str = "identifies";
/// Companion of [`IDENTIFIES_TABLE`].
pub const USERS_TABLE: &str = "users";
/// Identity-resolution rule table.
pub const IDENTITY_MERGE_RULES_TABLE: &str = "rudder_identity_merge_rules";
/// Identity-resolution mapping table.
pub const IDENTITY_MAPPINGS_TABLE: &str = "rudder_identity_mappings";
/// Discarded-rows table; marked exported without driver work.
pub const DISCARDS_TABLE: &str = "rudder_discards";

/// Per-table upload status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableUploadStatus {
    Waiting,
    UpdatingSchema,
    UpdatedSchema,
    Executing,
    ExportedData,
    UpdatingSchemaFailed,
    ExportingDataFailed,
}

impl TableUploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableUploadStatus::Waiting => "waiting",
            TableUploadStatus::UpdatingSchema => "updating_schema",
            TableUploadStatus::UpdatedSchema => "updated_schema",
            TableUploadStatus::Executing => "executing",
            TableUploadStatus::ExportedData => "exported_data",
            TableUploadStatus::UpdatingSchemaFailed => "updating_schema_failed",
            TableUploadStatus::ExportingDataFailed => "exporting_data_failed",
        }
    }
}

impl std::fmt::Display for TableUploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Staging-file status, written by the core for the batch it owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingFileStatus {
    Waiting,
    Executing,
    Succeeded,
    Failed,
}

impl StagingFileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingFileStatus::Waiting => "waiting",
            StagingFileStatus::Executing => "executing",
            StagingFileStatus::Succeeded => "succeeded",
            StagingFileStatus::Failed => "failed",
        }
    }
}

/// One status write with its wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingEntry {
    pub status: String,
    pub at: DateTime<Utc>,
}

/// Append-only journal of status writes.
///
/// Persisted as an array of single-key objects,
/// `[{"generating_upload_schema": "2026-08-01T10:15:00.123Z"}, …]`, with
/// millisecond-precision RFC3339 timestamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timings(Vec<TimingEntry>);

impl Timings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, status: impl Into<String>, at: DateTime<Utc>) {
        self.0.push(TimingEntry {
            status: status.into(),
            at,
        });
    }

    pub fn first(&self) -> Option<&TimingEntry> {
        self.0.first()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimingEntry> {
        self.0.iter()
    }

    pub fn contains_status(&self, status: &str) -> bool {
        self.0.iter().any(|e| e.status == status)
    }
}

impl Serialize for Timings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<BTreeMap<&str, String>> = self
            .0
            .iter()
            .map(|e| {
                let mut m = BTreeMap::new();
                m.insert(
                    e.status.as_str(),
                    e.at.to_rfc3339_opts(SecondsFormat::Millis, true),
                );
                m
            })
            .collect();
        entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Timings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Vec<BTreeMap<String, String>> = Vec::deserialize(deserializer)?;
        let mut entries = Vec::with_capacity(raw.len());
        for map in raw {
            let mut it = map.into_iter();
            let (status, ts) = it
                .next()
                .ok_or_else(|| D::Error::custom("empty timings entry"))?;
            if it.next().is_some() {
                return Err(D::Error::custom("timings entry with multiple keys"));
            }
            let at = DateTime::parse_from_rfc3339(&ts)
                .map_err(D::Error::custom)?
                .with_timezone(&Utc);
            entries.push(TimingEntry { status, at });
        }
        Ok(Timings(entries))
    }
}

/// Failure record for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub attempt: i64,
    pub errors: Vec<String>,
}

/// Stage-keyed error journal persisted on the upload row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorJournal(pub BTreeMap<String, StageFailure>);

impl ErrorJournal {
    /// Increment the stage's attempt counter and append one message.
    /// Returns the new attempt count.
    pub fn record(&mut self, stage: &str, message: impl Into<String>) -> i64 {
        let failure = self.0.entry(stage.to_string()).or_default();
        failure.attempt += 1;
        failure.errors.push(message.into());
        failure.attempt
    }

    pub fn attempts(&self, stage: &str) -> i64 {
        self.0.get(stage).map(|f| f.attempt).unwrap_or(0)
    }

    pub fn stage(&self, stage: &str) -> Option<&StageFailure> {
        self.0.get(stage)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One row of `wh_uploads`: a single attempt to load a contiguous range of
/// staging files into a destination.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Upload {
    pub id: i64,
    pub namespace: String,
    pub source_id: String,
    pub destination_id: String,
    pub destination_type: String,
    pub start_staging_file_id: i64,
    pub end_staging_file_id: i64,
    pub start_load_file_id: Option<i64>,
    pub end_load_file_id: Option<i64>,
    pub status: String,
    #[sqlx(json)]
    pub schema: Schema,
    #[sqlx(json)]
    pub error: ErrorJournal,
    #[sqlx(json)]
    pub timings: Timings,
    pub attempts: i64,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_exec_at: Option<DateTime<Utc>>,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    #[sqlx(json)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    /// Closed load-file interval persisted during load-file generation.
    pub fn load_file_range(&self) -> Option<(i64, i64)> {
        match (self.start_load_file_id, self.end_load_file_id) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }

    pub fn metadata_bool(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// One row of `wh_table_uploads`, unique per `(upload_id, table_name)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TableUpload {
    pub id: i64,
    pub upload_id: i64,
    pub table_name: String,
    pub status: String,
    pub error: Option<String>,
    pub location: Option<String>,
    pub total_events: Option<i64>,
    pub last_exec_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of `wh_staging_files`. Read-only to the core apart from status.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StagingFile {
    pub id: i64,
    pub location: String,
    pub source_id: String,
    pub destination_id: String,
    pub status: String,
    pub error: Option<String>,
    /// Schema sampled by the ingester from the file's events.
    #[sqlx(json)]
    pub schema: Schema,
}

/// One row of `wh_load_files`, produced by the worker processes.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LoadFile {
    pub id: i64,
    pub staging_file_id: i64,
    pub source_id: String,
    pub destination_id: String,
    pub table_name: String,
    pub location: String,
}

/// Table-upload status of an earlier (or the current) upload to the same
/// destination and namespace.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingTableStatus {
    pub upload_id: i64,
    pub table_name: String,
    pub status: String,
}
