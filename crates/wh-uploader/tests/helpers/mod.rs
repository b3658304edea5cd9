//! Scripted collaborators for the upload-job scenario tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;

use wh_uploader::config::UploaderConfig;
use wh_uploader::job::{UploadJob, UploadJobParams};
use wh_uploader::metrics::Recorder;
use wh_uploader::model::{LoadFile, StagingFile, Upload};
use wh_uploader::notifier::{
    LoadFileRequest, Notifier, NotifierError, WorkerPayload, WorkerResponse, WorkerStatus,
};
use wh_uploader::schema::{ColumnType, Schema, TableSchema};
use wh_uploader::state::WAITING;
use wh_uploader::store::MemoryStore;
use wh_uploader::warehouse::{
    destination, DriverError, IdentityResolver, Uploader, Warehouse, WarehouseManager,
};

pub fn table_schema(columns: &[(&str, ColumnType)]) -> TableSchema {
    columns.iter().map(|(c, t)| (c.to_string(), *t)).collect()
}

pub fn schema_of(tables: &[(&str, &[(&str, ColumnType)])]) -> Schema {
    let mut schema = Schema::new();
    for (table, columns) in tables {
        schema.insert(*table, table_schema(columns));
    }
    schema
}

/// `{events: {id: string, received_at: datetime}}`
pub fn events_schema() -> Schema {
    schema_of(&[(
        "events",
        &[("id", ColumnType::String), ("received_at", ColumnType::Datetime)],
    )])
}

pub fn test_warehouse() -> Warehouse {
    Warehouse {
        source_id: "src-1".into(),
        source_name: "webapp".into(),
        destination_id: "dst-1".into(),
        destination_name: "analytics-pg".into(),
        destination_type: destination::POSTGRES.into(),
        namespace: "analytics".into(),
        destination_config: serde_json::json!({"host": "wh.internal"}),
    }
}

pub fn upload_row(id: i64, schema: Schema) -> Upload {
    let now = Utc::now();
    Upload {
        id,
        namespace: "analytics".into(),
        source_id: "src-1".into(),
        destination_id: "dst-1".into(),
        destination_type: destination::POSTGRES.into(),
        start_staging_file_id: id * 10,
        end_staging_file_id: id * 10 + 1,
        start_load_file_id: None,
        end_load_file_id: None,
        status: WAITING.into(),
        schema,
        error: Default::default(),
        timings: Default::default(),
        attempts: 0,
        first_attempt_at: None,
        last_attempt_at: None,
        last_exec_at: None,
        first_event_at: None,
        last_event_at: None,
        metadata: serde_json::json!({}),
        created_at: now,
        updated_at: now,
    }
}

pub fn load_file(id: i64, staging_file_id: i64, table: &str) -> LoadFile {
    LoadFile {
        id,
        staging_file_id,
        source_id: "src-1".into(),
        destination_id: "dst-1".into(),
        table_name: table.to_string(),
        location: format!("s3://loads/{table}/{id}.csv.gz"),
    }
}

pub fn staging_file(id: i64, schema: Schema) -> StagingFile {
    StagingFile {
        id,
        location: format!("s3://staging/src-1/{id}.json.gz"),
        source_id: "src-1".into(),
        destination_id: "dst-1".into(),
        status: "succeeded".into(),
        error: None,
        schema,
    }
}

// ============================================================================
// Mock destination driver
// ============================================================================

#[derive(Default)]
pub struct MockWarehouse {
    pub remote_schema: Mutex<Schema>,
    pub fail_fetch: AtomicBool,
    /// Tables whose `load_table` (or user-table load) fails, with the error.
    pub fail_load: Mutex<HashMap<String, String>>,
    pub load_delay: Mutex<Option<Duration>>,
    pub loaded_tables: Mutex<Vec<String>>,
    pub created_tables: Mutex<Vec<String>>,
    pub added_columns: Mutex<Vec<(String, String)>>,
    pub create_schema_calls: AtomicUsize,
    pub setup_calls: AtomicUsize,
    pub cleanup_calls: AtomicUsize,
    pub user_table_load_calls: AtomicUsize,
    pub merge_rules_load_calls: AtomicUsize,
    pub mappings_load_calls: AtomicUsize,
}

impl MockWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_remote_schema(&self, schema: Schema) {
        *self.remote_schema.lock().unwrap() = schema;
    }

    pub fn fail_load_of(&self, table: &str, error: &str) {
        self.fail_load
            .lock()
            .unwrap()
            .insert(table.to_string(), error.to_string());
    }

    fn load_result(&self, table: &str) -> Result<(), DriverError> {
        match self.fail_load.lock().unwrap().get(table) {
            Some(message) => Err(DriverError::new(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WarehouseManager for MockWarehouse {
    async fn setup(
        &self,
        _warehouse: &Warehouse,
        _uploader: Arc<dyn Uploader>,
    ) -> Result<(), DriverError> {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self) {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn create_schema(&self) -> Result<(), DriverError> {
        self.create_schema_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_table(&self, name: &str, columns: &TableSchema) -> Result<(), DriverError> {
        self.created_tables.lock().unwrap().push(name.to_string());
        self.remote_schema
            .lock()
            .unwrap()
            .insert(name, columns.clone());
        Ok(())
    }

    async fn add_column(
        &self,
        table: &str,
        column: &str,
        column_type: ColumnType,
    ) -> Result<(), DriverError> {
        self.added_columns
            .lock()
            .unwrap()
            .push((table.to_string(), column.to_string()));
        let mut remote = self.remote_schema.lock().unwrap();
        if let Some(columns) = remote.0.get_mut(table) {
            columns.insert(column.to_string(), column_type);
        }
        Ok(())
    }

    async fn alter_column(
        &self,
        table: &str,
        column: &str,
        column_type: ColumnType,
    ) -> Result<(), DriverError> {
        let mut remote = self.remote_schema.lock().unwrap();
        if let Some(columns) = remote.0.get_mut(table) {
            columns.insert(column.to_string(), column_type);
        }
        Ok(())
    }

    async fn load_table(&self, name: &str) -> Result<(), DriverError> {
        let delay = *self.load_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.load_result(name)?;
        self.loaded_tables.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn load_user_tables(&self) -> HashMap<String, Result<(), DriverError>> {
        self.user_table_load_calls.fetch_add(1, Ordering::SeqCst);
        let mut results = HashMap::new();
        for table in ["identifies", "users"] {
            results.insert(table.to_string(), self.load_result(table));
        }
        results
    }

    async fn load_identity_merge_rules_table(&self) -> Result<(), DriverError> {
        self.merge_rules_load_calls.fetch_add(1, Ordering::SeqCst);
        self.load_result("rudder_identity_merge_rules")
    }

    async fn load_identity_mappings_table(&self) -> Result<(), DriverError> {
        self.mappings_load_calls.fetch_add(1, Ordering::SeqCst);
        self.load_result("rudder_identity_mappings")
    }

    async fn fetch_schema(&self) -> Result<Schema, DriverError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(DriverError::new("warehouse unreachable"));
        }
        Ok(self.remote_schema.lock().unwrap().clone())
    }
}

// ============================================================================
// Mock notification bus
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierMode {
    /// Workers succeed and write one load file per (staging file, table).
    GenerateLoadFiles,
    /// Every worker reply is `aborted`.
    AbortAll,
}

pub struct MockNotifier {
    store: Arc<MemoryStore>,
    mode: Mutex<NotifierMode>,
    next_load_file_id: AtomicI64,
    /// Chunk sizes in publish order.
    pub published_batches: Mutex<Vec<usize>>,
}

impl MockNotifier {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            mode: Mutex::new(NotifierMode::GenerateLoadFiles),
            next_load_file_id: AtomicI64::new(100),
            published_batches: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: NotifierMode) {
        *self.mode.lock().unwrap() = mode;
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn publish(
        &self,
        batch: Vec<LoadFileRequest>,
    ) -> Result<oneshot::Receiver<Vec<WorkerResponse>>, NotifierError> {
        self.published_batches.lock().unwrap().push(batch.len());
        let mode = *self.mode.lock().unwrap();

        let responses: Vec<WorkerResponse> = batch
            .iter()
            .map(|request| match mode {
                NotifierMode::AbortAll => WorkerResponse {
                    status: WorkerStatus::Aborted,
                    error: Some("worker ran out of memory".into()),
                    payload: WorkerPayload::default(),
                },
                NotifierMode::GenerateLoadFiles => {
                    let mut ids = Vec::new();
                    for table in request.schema.table_names() {
                        let id = self.next_load_file_id.fetch_add(1, Ordering::SeqCst);
                        self.store.insert_load_files(vec![LoadFile {
                            id,
                            staging_file_id: request.staging_file_id,
                            source_id: request.source_id.clone(),
                            destination_id: request.destination_id.clone(),
                            table_name: table.clone(),
                            location: format!("s3://loads/{table}/{id}.csv.gz"),
                        }]);
                        ids.push(id);
                    }
                    WorkerResponse {
                        status: WorkerStatus::Succeeded,
                        error: None,
                        payload: WorkerPayload { load_file_ids: ids },
                    }
                }
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        let _ = tx.send(responses);
        Ok(rx)
    }
}

// ============================================================================
// Mock identity resolver
// ============================================================================

#[derive(Default)]
pub struct MockResolver {
    pub resolve_calls: AtomicUsize,
    pub historic_calls: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl IdentityResolver for MockResolver {
    async fn resolve(&self) -> Result<(), DriverError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(DriverError::new("identity graph unavailable"));
        }
        Ok(())
    }

    async fn resolve_historic_identities(&self) -> Result<(), DriverError> {
        self.historic_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(DriverError::new("identity graph unavailable"));
        }
        Ok(())
    }
}

// ============================================================================
// Test rig
// ============================================================================

pub struct Rig {
    pub store: Arc<MemoryStore>,
    pub manager: Arc<MockWarehouse>,
    pub notifier: Arc<MockNotifier>,
    pub resolver: Arc<MockResolver>,
    pub metrics: Arc<Recorder>,
    pub config: Arc<UploaderConfig>,
}

impl Rig {
    pub fn new() -> Self {
        // Idempotent across tests; later calls fail on the global subscriber.
        let _ = wh_common::logging::init_logging(&wh_common::logging::LogConfig::default());

        let store = Arc::new(MemoryStore::new());
        Self {
            notifier: Arc::new(MockNotifier::new(store.clone())),
            store,
            manager: Arc::new(MockWarehouse::new()),
            resolver: Arc::new(MockResolver::default()),
            metrics: Arc::new(Recorder::new()),
            config: Arc::new(UploaderConfig::default()),
        }
    }

    pub fn with_config(config: UploaderConfig) -> Self {
        let mut rig = Self::new();
        rig.config = Arc::new(config);
        rig
    }

    pub fn job(&self, upload: Upload, staging_files: Vec<StagingFile>) -> UploadJob {
        self.store.insert_upload(upload.clone());
        self.store.insert_staging_files(staging_files.clone());
        UploadJob::new(UploadJobParams {
            upload,
            warehouse: test_warehouse(),
            staging_files,
            store: self.store.clone(),
            manager: self.manager.clone(),
            notifier: self.notifier.clone(),
            identity_resolver: Some(self.resolver.clone()),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        })
    }
}
