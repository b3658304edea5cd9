//! The upload job: one crash-resumable run of the loading pipeline
//!
//! Drives the stage machine over the persisted upload row, composing the
//! schema registry, the load-file builder and the table loaders. On stage
//! failure the error journal decides between the stage's failure label and
//! `aborted`; the job then stops and leaves resumption to the scheduler.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::identity::IdentityLoader;
use crate::load_files::LoadFileBuilder;
use crate::loader::TableLoader;
use crate::metrics::{
    MetricsSink, METRIC_LOAD_FILES_GENERATED, METRIC_LONG_RUNNING_UPLOAD,
    METRIC_UPLOAD_ABORTED, METRIC_UPLOAD_COMPLETED, METRIC_UPLOAD_TIME,
};
use crate::model::{
    StagingFile, TableUploadStatus, Upload, IDENTIFIES_TABLE, IDENTITY_MAPPINGS_TABLE,
    IDENTITY_MERGE_RULES_TABLE, USERS_TABLE,
};
use crate::notifier::Notifier;
use crate::schema::{Schema, SchemaRegistry, TableSchema};
use crate::state::{
    UploadStage, ABORTED, FETCHING_REMOTE_SCHEMA_FAILED, INTERNAL_PROCESSING_FAILED,
};
use crate::store::{ColumnValue, StoreError, UploadStore};
use crate::warehouse::{IdentityResolver, Uploader, Warehouse, WarehouseManager};

/// Metadata key requesting historic identity resolution for this upload.
pub const POPULATE_HISTORIC_IDENTITIES_KEY: &str = "populate_historic_identities";

type LoadFileRange = Arc<RwLock<Option<(i64, i64)>>>;

/// What to record a failure against: a stage, or one of the two
/// out-of-band failure labels.
#[derive(Debug, Clone, Copy)]
enum FailureKind {
    Stage(UploadStage),
    FetchingRemoteSchema,
    InternalProcessing,
}

impl FailureKind {
    fn journal_key(&self) -> &'static str {
        match self {
            FailureKind::Stage(stage) => stage.task(),
            FailureKind::FetchingRemoteSchema => FETCHING_REMOTE_SCHEMA_FAILED,
            FailureKind::InternalProcessing => INTERNAL_PROCESSING_FAILED,
        }
    }

    fn failed_status(&self) -> &'static str {
        match self {
            FailureKind::Stage(stage) => stage.failed_status(),
            FailureKind::FetchingRemoteSchema => FETCHING_REMOTE_SCHEMA_FAILED,
            FailureKind::InternalProcessing => INTERNAL_PROCESSING_FAILED,
        }
    }
}

/// Collaborators and inputs for one upload job.
pub struct UploadJobParams {
    pub upload: Upload,
    pub warehouse: Warehouse,
    pub staging_files: Vec<StagingFile>,
    pub store: Arc<dyn UploadStore>,
    pub manager: Arc<dyn WarehouseManager>,
    pub notifier: Arc<dyn Notifier>,
    pub identity_resolver: Option<Arc<dyn IdentityResolver>>,
    pub config: Arc<UploaderConfig>,
    pub metrics: Arc<dyn MetricsSink>,
}

pub struct UploadJob {
    upload: Upload,
    warehouse: Warehouse,
    staging_files: Vec<StagingFile>,
    store: Arc<dyn UploadStore>,
    manager: Arc<dyn WarehouseManager>,
    notifier: Arc<dyn Notifier>,
    identity_resolver: Option<Arc<dyn IdentityResolver>>,
    config: Arc<UploaderConfig>,
    metrics: Arc<dyn MetricsSink>,
    registry: Arc<SchemaRegistry>,
    load_file_range: LoadFileRange,
}

impl UploadJob {
    pub fn new(params: UploadJobParams) -> Self {
        let registry = Arc::new(SchemaRegistry::new(
            params.warehouse.destination_type.clone(),
        ));
        let load_file_range = Arc::new(RwLock::new(params.upload.load_file_range()));
        Self {
            upload: params.upload,
            warehouse: params.warehouse,
            staging_files: params.staging_files,
            store: params.store,
            manager: params.manager,
            notifier: params.notifier,
            identity_resolver: params.identity_resolver,
            config: params.config,
            metrics: params.metrics,
            registry,
            load_file_range,
        }
    }

    /// The in-memory upload row as the job last wrote it.
    pub fn upload(&self) -> &Upload {
        &self.upload
    }

    /// Run the pipeline to completion, a stage-failure label, or `aborted`.
    pub async fn run(&mut self) -> Result<(), UploadError> {
        let started = Instant::now();

        let watchdog = {
            let metrics = self.metrics.clone();
            let threshold = self.config.long_running_threshold;
            let upload_id = self.upload.id;
            tokio::spawn(async move {
                tokio::time::sleep(threshold).await;
                warn!(upload_id, "Upload still running past the long-running threshold");
                metrics.incr(METRIC_LONG_RUNNING_UPLOAD, 1);
            })
        };

        let result = self.execute().await;

        watchdog.abort();
        self.metrics.timing(METRIC_UPLOAD_TIME, started.elapsed());
        result
    }

    async fn execute(&mut self) -> Result<(), UploadError> {
        let now = Utc::now();
        self.store
            .set_upload_columns(
                self.upload.id,
                &[("last_exec_at", ColumnValue::Timestamp(now))],
            )
            .await?;
        self.upload.last_exec_at = Some(now);

        if self.staging_files.is_empty() {
            return self
                .fail(
                    FailureKind::InternalProcessing,
                    UploadError::InternalProcessing("upload owns no staging files".into()),
                )
                .await;
        }

        let local = self
            .store
            .namespace_schema(&self.warehouse.destination_id, &self.warehouse.namespace)
            .await?;
        self.registry.set_local_schema(local);

        let schema_changed = match self
            .registry
            .sync_remote(self.manager.as_ref(), self.store.as_ref(), &self.warehouse)
            .await
        {
            Ok(changed) => changed,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return self.fail(FailureKind::FetchingRemoteSchema, e).await,
        };

        // May be empty on the first run; filled by the first stage.
        self.registry.set_upload_schema(self.upload.schema.clone());

        let context: Arc<dyn Uploader> = Arc::new(JobContext {
            registry: self.registry.clone(),
            store: self.store.clone(),
            upload_id: self.upload.id,
            source_id: self.warehouse.source_id.clone(),
            destination_id: self.warehouse.destination_id.clone(),
            load_file_range: self.load_file_range.clone(),
        });

        if let Err(e) = self.manager.setup(&self.warehouse, context).await {
            let result = self.fail(FailureKind::InternalProcessing, e.into()).await;
            self.manager.cleanup().await;
            return result;
        }

        let result = self.run_stages(schema_changed).await;
        self.manager.cleanup().await;
        result
    }

    async fn run_stages(&mut self, schema_changed: bool) -> Result<(), UploadError> {
        let mut next = if schema_changed {
            info!(
                upload_id = self.upload.id,
                "Remote schema changed; restarting from the first stage"
            );
            Some(UploadStage::first())
        } else {
            UploadStage::next_for_db_status(&self.upload.status)
        };

        while let Some(stage) = next {
            debug!(upload_id = self.upload.id, stage = stage.task(), "Entering stage");
            self.set_status(stage.in_progress_status()).await?;

            match self.run_stage(stage).await {
                Ok(()) => {
                    self.set_status(stage.completed_status()).await?;
                    if stage == UploadStage::ExportedData {
                        info!(upload_id = self.upload.id, "Upload completed");
                        self.metrics.incr(METRIC_UPLOAD_COMPLETED, 1);
                    }
                    next = stage.next();
                }
                Err(e) => return self.fail(FailureKind::Stage(stage), e).await,
            }
        }

        Ok(())
    }

    async fn run_stage(&mut self, stage: UploadStage) -> Result<(), UploadError> {
        match stage {
            UploadStage::GeneratedUploadSchema => self.generate_upload_schema().await,
            UploadStage::CreatedTableUploads => self.create_table_uploads().await,
            UploadStage::GeneratedLoadFiles => self.generate_load_files().await,
            UploadStage::UpdatedTableUploadsCounts => self.update_table_upload_counts().await,
            UploadStage::CreatedRemoteSchema => self.create_remote_schema().await,
            UploadStage::ExportedUserTables => self.export_user_tables().await,
            UploadStage::ExportedIdentities => self.export_identities().await,
            UploadStage::ExportedData => self.export_data().await,
        }
    }

    async fn set_status(&mut self, status: &str) -> Result<(), StoreError> {
        self.store
            .set_upload_status(self.upload.id, status, &[])
            .await?;
        self.upload.status = status.to_string();
        Ok(())
    }

    /// Record the failure, decide retry vs. abort, and surface the error.
    async fn fail(
        &mut self,
        kind: FailureKind,
        err: UploadError,
    ) -> Result<(), UploadError> {
        if err.is_fatal() {
            return Err(err);
        }

        error!(
            upload_id = self.upload.id,
            stage = kind.journal_key(),
            error = %err,
            "Upload stage failed"
        );

        let status = self
            .store
            .set_upload_error(
                self.upload.id,
                kind.journal_key(),
                kind.failed_status(),
                &err.to_string(),
                &self.config.retry,
            )
            .await?;
        self.upload.status = status.clone();

        if status == ABORTED {
            warn!(upload_id = self.upload.id, "Upload aborted after exhausting retries");
            self.metrics.incr(METRIC_UPLOAD_ABORTED, 1);
        }

        Err(err)
    }

    fn table_loader(&self) -> TableLoader {
        TableLoader::new(
            self.store.clone(),
            self.registry.clone(),
            self.manager.clone(),
            self.config.clone(),
            self.metrics.clone(),
            self.warehouse.clone(),
            self.upload.id,
            self.upload.load_file_range(),
        )
    }

    fn identity_enabled(&self) -> bool {
        self.config
            .identity_enabled_for(&self.warehouse.destination_type)
    }

    // ------------------------------------------------------------------
    // Stage units
    // ------------------------------------------------------------------

    async fn generate_upload_schema(&mut self) -> Result<(), UploadError> {
        let schema = self.registry.consolidate(&self.staging_files);
        if schema.is_empty() {
            return Err(UploadError::InternalProcessing(
                "staging files carry no schema".into(),
            ));
        }

        self.store
            .set_upload_columns(
                self.upload.id,
                &[(
                    "schema",
                    ColumnValue::Json(serde_json::to_value(&schema).map_err(StoreError::from)?),
                )],
            )
            .await?;
        self.registry.set_upload_schema(schema.clone());
        self.upload.schema = schema;
        Ok(())
    }

    async fn create_table_uploads(&mut self) -> Result<(), UploadError> {
        let schema = self.registry.upload_schema();
        let mut tables: Vec<String> = schema.table_names().cloned().collect();

        if self.identity_enabled()
            && schema.contains_table(IDENTITY_MERGE_RULES_TABLE)
            && !tables.iter().any(|t| t == IDENTITY_MAPPINGS_TABLE)
        {
            tables.push(IDENTITY_MAPPINGS_TABLE.to_string());
        }

        self.store
            .create_table_uploads(self.upload.id, &tables)
            .await?;
        Ok(())
    }

    async fn generate_load_files(&mut self) -> Result<(), UploadError> {
        let builder = LoadFileBuilder::new(
            self.store.clone(),
            self.notifier.clone(),
            self.config.publish_batch_size,
        );
        let ids = builder
            .create_load_files(
                &self.warehouse,
                &self.upload,
                &self.registry.upload_schema(),
                &self.staging_files,
            )
            .await?;

        // Non-empty and sorted by construction.
        let start = ids[0];
        let end = ids[ids.len() - 1];

        self.store
            .set_upload_columns(
                self.upload.id,
                &[
                    ("start_load_file_id", ColumnValue::BigInt(start)),
                    ("end_load_file_id", ColumnValue::BigInt(end)),
                ],
            )
            .await?;
        self.upload.start_load_file_id = Some(start);
        self.upload.end_load_file_id = Some(end);
        *self
            .load_file_range
            .write()
            .expect("load file range lock poisoned") = Some((start, end));

        info!(
            upload_id = self.upload.id,
            load_files = ids.len(),
            start_load_file_id = start,
            end_load_file_id = end,
            "Generated load files"
        );
        self.metrics
            .incr(METRIC_LOAD_FILES_GENERATED, ids.len() as u64);
        Ok(())
    }

    async fn update_table_upload_counts(&mut self) -> Result<(), UploadError> {
        let (start, end) = self.upload.load_file_range().ok_or_else(|| {
            UploadError::InternalProcessing("load-file range not recorded".into())
        })?;

        for table in self.registry.upload_schema().table_names() {
            let files = self
                .store
                .load_files_in_range(
                    &self.warehouse.source_id,
                    &self.warehouse.destination_id,
                    table,
                    start,
                    end,
                )
                .await?;
            self.store
                .set_table_upload_events(self.upload.id, table, files.len() as i64)
                .await?;
            if let Some(first) = files.first() {
                self.store
                    .set_table_upload_location(self.upload.id, table, &first.location)
                    .await?;
            }
        }
        Ok(())
    }

    async fn create_remote_schema(&mut self) -> Result<(), UploadError> {
        if self.registry.warehouse_schema_is_empty() {
            self.manager.create_schema().await?;
        }
        Ok(())
    }

    async fn export_user_tables(&mut self) -> Result<(), UploadError> {
        let errors = self.table_loader().load_user_tables().await?;
        if !errors.is_empty() {
            return Err(UploadError::TableLoads(errors.join("; ")));
        }
        Ok(())
    }

    async fn export_identities(&mut self) -> Result<(), UploadError> {
        if !self.identity_enabled() {
            return Ok(());
        }
        if !self
            .registry
            .upload_schema()
            .contains_table(IDENTITY_MERGE_RULES_TABLE)
        {
            return Ok(());
        }

        let resolver = self.identity_resolver.clone().ok_or_else(|| {
            UploadError::InternalProcessing(
                "identity resolution enabled without a resolver".into(),
            )
        })?;

        let loader = IdentityLoader::new(
            self.store.clone(),
            self.manager.clone(),
            resolver,
            self.table_loader(),
            self.upload.id,
        );
        let historic = self.upload.metadata_bool(POPULATE_HISTORIC_IDENTITIES_KEY);
        let errors = loader.load_identity_tables(historic).await?;
        if !errors.is_empty() {
            return Err(UploadError::TableLoads(errors.join("; ")));
        }
        Ok(())
    }

    async fn export_data(&mut self) -> Result<(), UploadError> {
        let schema = self.registry.upload_schema();
        let tables: Vec<String> = schema.table_names().cloned().collect();

        // Identity and user tables were handled by the earlier stages.
        let mut skip: HashSet<String> = [
            IDENTIFIES_TABLE,
            USERS_TABLE,
            IDENTITY_MERGE_RULES_TABLE,
            IDENTITY_MAPPINGS_TABLE,
        ]
        .iter()
        .map(|t| t.to_string())
        .collect();

        let pending = self
            .store
            .pending_table_statuses(
                self.upload.id,
                &self.warehouse.destination_id,
                &self.warehouse.namespace,
                &tables,
            )
            .await?;
        let mut previously_failed: Vec<String> = pending
            .iter()
            .filter(|p| {
                p.upload_id < self.upload.id
                    && p.status == TableUploadStatus::ExportingDataFailed.as_str()
            })
            .map(|p| p.table_name.clone())
            .collect();
        previously_failed.sort();
        previously_failed.dedup();

        for tu in self.store.table_uploads(self.upload.id).await? {
            if tu.status == TableUploadStatus::ExportedData.as_str() {
                skip.insert(tu.table_name);
            }
        }
        skip.extend(previously_failed.iter().cloned());

        let mut errors = self.table_loader().load_all_tables_except(&skip).await?;

        // Loading behind a failed predecessor would break ordering between
        // uploads to the same namespace, so the stage fails even when the
        // current tables all loaded.
        if !previously_failed.is_empty() {
            errors.push(format!(
                "skipping the following tables because they failed previously: [{}]",
                previously_failed.join(", ")
            ));
        }

        if !errors.is_empty() {
            return Err(UploadError::TableLoads(errors.join("; ")));
        }
        Ok(())
    }
}

/// Callback context handed to the destination driver.
struct JobContext {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn UploadStore>,
    upload_id: i64,
    source_id: String,
    destination_id: String,
    load_file_range: LoadFileRange,
}

impl JobContext {
    fn range(&self) -> Option<(i64, i64)> {
        *self
            .load_file_range
            .read()
            .expect("load file range lock poisoned")
    }
}

#[async_trait]
impl Uploader for JobContext {
    fn schema_in_warehouse(&self) -> Schema {
        self.registry.warehouse_schema()
    }

    fn table_schema_in_warehouse(&self, table: &str) -> TableSchema {
        self.registry.table_schema_in_warehouse(table)
    }

    fn table_schema_in_upload(&self, table: &str) -> TableSchema {
        self.registry.table_schema_in_upload(table)
    }

    async fn load_file_locations(&self, table: &str) -> Result<Vec<String>, UploadError> {
        let (start, end) = match self.range() {
            Some(range) => range,
            None => return Ok(Vec::new()),
        };
        let files = self
            .store
            .load_files_in_range(&self.source_id, &self.destination_id, table, start, end)
            .await?;
        Ok(files.into_iter().map(|f| f.location).collect())
    }

    async fn sample_load_file_location(&self, table: &str) -> Result<String, UploadError> {
        self.load_file_locations(table)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| UploadError::NotFound(format!("no load files for table {table}")))
    }

    async fn single_load_file_location(&self, table: &str) -> Result<String, UploadError> {
        self.store
            .table_upload(self.upload_id, table)
            .await?
            .and_then(|tu| tu.location)
            .ok_or_else(|| {
                UploadError::NotFound(format!("no load-file location recorded for table {table}"))
            })
    }
}
