//! Notification-bus seam for load-file generation
//!
//! Worker processes consume published staging-file batches and reply once
//! per batch. Each publish binds its own one-shot completion channel, so no
//! correlation ids are needed on this side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::schema::Schema;

/// Error raised by the notification bus.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct NotifierError {
    pub message: String,
}

impl NotifierError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Message published per staging file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadFileRequest {
    pub upload_id: i64,
    pub staging_file_id: i64,
    pub staging_file_location: String,
    pub schema: Schema,
    pub source_id: String,
    pub source_name: String,
    pub destination_id: String,
    pub destination_name: String,
    pub destination_type: String,
    pub destination_config: serde_json::Value,
    /// Unique per `create_load_files` invocation; workers tag emitted rows
    /// with it.
    pub unique_load_gen_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Succeeded,
    Aborted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerPayload {
    #[serde(rename = "LoadFileIDs", default)]
    pub load_file_ids: Vec<i64>,
}

/// One worker reply, covering one staging file of a published batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub payload: WorkerPayload,
}

/// Publish seam. One call publishes one batch and returns the channel its
/// responses arrive on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(
        &self,
        batch: Vec<LoadFileRequest>,
    ) -> Result<oneshot::Receiver<Vec<WorkerResponse>>, NotifierError>;
}
