//! Load-file generation through the notification bus
//!
//! Staging files are published to the workers in chunks; every chunk binds
//! its own completion channel. All chunks are published before the first
//! wait, so the workers run them concurrently.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::UploadError;
use crate::model::{StagingFile, StagingFileStatus, Upload};
use crate::notifier::{LoadFileRequest, Notifier, WorkerStatus};
use crate::schema::Schema;
use crate::store::UploadStore;
use crate::warehouse::Warehouse;

pub struct LoadFileBuilder {
    store: Arc<dyn UploadStore>,
    notifier: Arc<dyn Notifier>,
    publish_batch_size: usize,
}

impl LoadFileBuilder {
    pub fn new(
        store: Arc<dyn UploadStore>,
        notifier: Arc<dyn Notifier>,
        publish_batch_size: usize,
    ) -> Self {
        Self {
            store,
            notifier,
            publish_batch_size: publish_batch_size.max(1),
        }
    }

    /// Dispatch the staging files to the workers and collect the ids of the
    /// load files they emitted, sorted ascending.
    ///
    /// The staging files move to `executing` before publishing and to
    /// `succeeded` or `failed` after every chunk replied. An empty aggregate
    /// fails with [`UploadError::NoLoadFilesGenerated`].
    pub async fn create_load_files(
        &self,
        warehouse: &Warehouse,
        upload: &Upload,
        upload_schema: &Schema,
        staging_files: &[StagingFile],
    ) -> Result<Vec<i64>, UploadError> {
        let staging_ids: Vec<i64> = staging_files.iter().map(|f| f.id).collect();
        self.store
            .set_staging_file_statuses(&staging_ids, StagingFileStatus::Executing)
            .await?;

        let load_gen_id = Uuid::new_v4().to_string();
        let requests: Vec<LoadFileRequest> = staging_files
            .iter()
            .map(|file| LoadFileRequest {
                upload_id: upload.id,
                staging_file_id: file.id,
                staging_file_location: file.location.clone(),
                schema: upload_schema.clone(),
                source_id: warehouse.source_id.clone(),
                source_name: warehouse.source_name.clone(),
                destination_id: warehouse.destination_id.clone(),
                destination_name: warehouse.destination_name.clone(),
                destination_type: warehouse.destination_type.clone(),
                destination_config: warehouse.destination_config.clone(),
                unique_load_gen_id: load_gen_id.clone(),
            })
            .collect();

        // Publish every chunk before waiting on any reply.
        let mut receivers = Vec::new();
        for chunk in requests.chunks(self.publish_batch_size) {
            receivers.push(self.notifier.publish(chunk.to_vec()).await?);
        }
        info!(
            upload_id = upload.id,
            staging_files = staging_files.len(),
            chunks = receivers.len(),
            load_gen_id = %load_gen_id,
            "Published staging files for load-file generation"
        );

        let mut load_file_ids = Vec::new();
        for replies in join_all(receivers).await {
            let responses = match replies {
                Ok(responses) => responses,
                Err(_) => {
                    error!(upload_id = upload.id, "Worker reply channel dropped");
                    continue;
                }
            };
            for response in responses {
                match response.status {
                    WorkerStatus::Succeeded => {
                        load_file_ids.extend(response.payload.load_file_ids);
                    }
                    WorkerStatus::Aborted => {
                        warn!(
                            upload_id = upload.id,
                            error = response.error.as_deref().unwrap_or("unknown"),
                            "Worker aborted load-file generation for a staging file"
                        );
                    }
                }
            }
        }

        load_file_ids.sort_unstable();

        if load_file_ids.is_empty() {
            self.store
                .set_staging_file_statuses(&staging_ids, StagingFileStatus::Failed)
                .await?;
            return Err(UploadError::NoLoadFilesGenerated);
        }

        self.store
            .set_staging_file_statuses(&staging_ids, StagingFileStatus::Succeeded)
            .await?;

        Ok(load_file_ids)
    }
}
