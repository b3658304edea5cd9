//! Error types for the upload orchestrator

use thiserror::Error;

use crate::notifier::NotifierError;
use crate::store::StoreError;
use crate::warehouse::DriverError;

/// Errors surfaced by one upload job run.
///
/// `Store` failures are non-recoverable and bubble out without touching the
/// error journal; everything else is recorded against the failing stage.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("warehouse driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("notifier error: {0}")]
    Notifier(#[from] NotifierError),

    #[error("no load files generated")]
    NoLoadFilesGenerated,

    #[error("fetching remote schema failed: {0}")]
    FetchingRemoteSchema(String),

    #[error("internal processing failed: {0}")]
    InternalProcessing(String),

    #[error("loading tables failed: {0}")]
    TableLoads(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl UploadError {
    /// Whether this error must terminate the job without journaling.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UploadError::Store(_))
    }
}
