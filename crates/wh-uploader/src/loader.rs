//! Per-table loading
//!
//! Drives schema sync and data load for the tables of the upload schema
//! under the destination's parallelism cap. Every dispatched table is
//! awaited; stage errors are collected, not fast-failed. Store errors are
//! the exception: they terminate the loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::metrics::{MetricsSink, METRIC_ROWS_EXPORTED};
use crate::model::{TableUploadStatus, IDENTIFIES_TABLE, USERS_TABLE};
use crate::schema::{ColumnType, SchemaRegistry};
use crate::store::UploadStore;
use crate::warehouse::{Warehouse, WarehouseManager};

/// Add-column failures for columns that already exist are reported but do
/// not fail the table.
fn is_already_exists(message: &str) -> bool {
    message.to_lowercase().contains("already exists")
}

#[derive(Clone)]
pub struct TableLoader {
    store: Arc<dyn UploadStore>,
    registry: Arc<SchemaRegistry>,
    manager: Arc<dyn WarehouseManager>,
    config: Arc<UploaderConfig>,
    metrics: Arc<dyn MetricsSink>,
    warehouse: Warehouse,
    upload_id: i64,
    load_file_range: (i64, i64),
}

impl TableLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn UploadStore>,
        registry: Arc<SchemaRegistry>,
        manager: Arc<dyn WarehouseManager>,
        config: Arc<UploaderConfig>,
        metrics: Arc<dyn MetricsSink>,
        warehouse: Warehouse,
        upload_id: i64,
        load_file_range: Option<(i64, i64)>,
    ) -> Self {
        Self {
            store,
            registry,
            manager,
            config,
            metrics,
            warehouse,
            upload_id,
            // An absent range matches no load files.
            load_file_range: load_file_range.unwrap_or((0, -1)),
        }
    }

    pub async fn has_load_files(&self, table: &str) -> Result<bool, UploadError> {
        let (start, end) = self.load_file_range;
        let count = self
            .store
            .count_load_files_in_range(
                &self.warehouse.source_id,
                &self.warehouse.destination_id,
                table,
                start,
                end,
            )
            .await?;
        Ok(count > 0)
    }

    /// Apply the table's schema diff against the live warehouse, then merge
    /// the applied changes into the warehouse snapshot. Returns whether the
    /// schema was altered.
    pub async fn sync_table_schema(&self, table: &str) -> Result<bool, UploadError> {
        let diff = self.registry.diff(table);

        self.store
            .set_table_upload_status(self.upload_id, table, TableUploadStatus::UpdatingSchema)
            .await?;

        if diff.exists {
            if let Err(e) = self.apply_diff(table, &diff).await {
                self.store
                    .set_table_upload_error(
                        self.upload_id,
                        table,
                        TableUploadStatus::UpdatingSchemaFailed,
                        &e.to_string(),
                    )
                    .await?;
                return Err(e);
            }

            let mut applied = diff.column_map.clone();
            for column in &diff.string_columns_to_be_altered_to_text {
                applied.insert(column.clone(), ColumnType::Text);
            }
            self.registry.set_updated_table_schema(table, &applied);
        }

        self.store
            .set_table_upload_status(self.upload_id, table, TableUploadStatus::UpdatedSchema)
            .await?;

        Ok(diff.exists)
    }

    async fn apply_diff(
        &self,
        table: &str,
        diff: &crate::schema::TableSchemaDiff,
    ) -> Result<(), UploadError> {
        if diff.table_to_be_created {
            self.manager.create_table(table, &diff.column_map).await?;
            return Ok(());
        }

        for (column, column_type) in &diff.column_map {
            if let Err(e) = self.manager.add_column(table, column, *column_type).await {
                if is_already_exists(&e.message) {
                    warn!(
                        table = %table,
                        column = %column,
                        error = %e,
                        "Column addition reported an existing column"
                    );
                    continue;
                }
                return Err(e.into());
            }
        }

        for column in &diff.string_columns_to_be_altered_to_text {
            self.manager
                .alter_column(table, column, ColumnType::Text)
                .await?;
        }

        Ok(())
    }

    /// Mark the table executing, run the driver load and record the result.
    pub async fn export_table(&self, table: &str) -> Result<(), UploadError> {
        self.store
            .set_table_upload_status(self.upload_id, table, TableUploadStatus::Executing)
            .await?;

        if let Err(e) = self.manager.load_table(table).await {
            self.store
                .set_table_upload_error(
                    self.upload_id,
                    table,
                    TableUploadStatus::ExportingDataFailed,
                    &e.to_string(),
                )
                .await?;
            return Err(e.into());
        }

        self.store
            .set_table_upload_status(self.upload_id, table, TableUploadStatus::ExportedData)
            .await?;
        self.record_rows_exported(table).await?;

        Ok(())
    }

    pub(crate) async fn record_rows_exported(&self, table: &str) -> Result<(), UploadError> {
        if let Some(tu) = self.store.table_upload(self.upload_id, table).await? {
            let rows = tu.total_events.unwrap_or(0);
            if rows > 0 {
                self.metrics.incr(METRIC_ROWS_EXPORTED, rows as u64);
            }
        }
        Ok(())
    }

    async fn load_one(&self, table: &str, altered: &AtomicBool) -> Result<(), UploadError> {
        if !self.has_load_files(table).await? {
            if self
                .config
                .always_mark_exported
                .iter()
                .any(|t| t == table)
            {
                self.store
                    .set_table_upload_status(
                        self.upload_id,
                        table,
                        TableUploadStatus::ExportedData,
                    )
                    .await?;
            }
            return Ok(());
        }

        if self.sync_table_schema(table).await? {
            altered.store(true, Ordering::Relaxed);
        }
        self.export_table(table).await
    }

    /// Load every table of the upload schema outside the skip set, bounded
    /// by the destination's parallelism cap. Returns the collected stage
    /// errors; store errors abort instead.
    pub async fn load_all_tables_except(
        &self,
        skip: &HashSet<String>,
    ) -> Result<Vec<String>, UploadError> {
        let tables: Vec<String> = self
            .registry
            .upload_schema()
            .table_names()
            .filter(|t| !skip.contains(*t))
            .cloned()
            .collect();

        let parallel = self
            .config
            .parallel_loads_for(&self.warehouse.destination_type);
        info!(
            upload_id = self.upload_id,
            tables = tables.len(),
            parallel,
            "Loading tables"
        );

        let semaphore = Arc::new(Semaphore::new(parallel));
        let altered = Arc::new(AtomicBool::new(false));
        let mut tasks: JoinSet<Result<(), (String, UploadError)>> = JoinSet::new();

        for table in tables {
            let loader = self.clone();
            let semaphore = semaphore.clone();
            let altered = altered.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    (
                        table.clone(),
                        UploadError::InternalProcessing(format!("semaphore closed: {e}")),
                    )
                })?;
                loader
                    .load_one(&table, &altered)
                    .await
                    .map_err(|e| (table, e))
            });
        }

        // Every dispatched table is awaited, even after failures.
        let mut stage_errors = Vec::new();
        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((table, e))) if e.is_fatal() => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    } else {
                        warn!(table = %table, error = %e, "Further store failure while draining table loads");
                    }
                }
                Ok(Err((table, e))) => stage_errors.push(format!("table {table}: {e}")),
                Err(join_error) => {
                    stage_errors.push(format!("table load task failed: {join_error}"))
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        if altered.load(Ordering::Relaxed) {
            self.persist_local_schema().await?;
        }

        Ok(stage_errors)
    }

    /// User-identity tables: schema sync per table, then one atomic driver
    /// load over both.
    pub async fn load_user_tables(&self) -> Result<Vec<String>, UploadError> {
        let schema = self.registry.upload_schema();
        if !schema.contains_table(IDENTIFIES_TABLE) {
            return Ok(Vec::new());
        }
        if !self.has_load_files(IDENTIFIES_TABLE).await? {
            return Ok(Vec::new());
        }

        let mut tables = vec![IDENTIFIES_TABLE];
        if schema.contains_table(USERS_TABLE) {
            tables.push(USERS_TABLE);
        }

        let mut altered = false;
        for table in &tables {
            match self.sync_table_schema(table).await {
                Ok(applied) => altered |= applied,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => return Ok(vec![format!("table {table}: {e}")]),
            }
        }
        if altered {
            self.persist_local_schema().await?;
        }

        for table in &tables {
            self.store
                .set_table_upload_status(self.upload_id, table, TableUploadStatus::Executing)
                .await?;
        }

        let results = self.manager.load_user_tables().await;

        let mut stage_errors = Vec::new();
        for table in &tables {
            match results.get(*table) {
                Some(Err(e)) => {
                    self.store
                        .set_table_upload_error(
                            self.upload_id,
                            table,
                            TableUploadStatus::ExportingDataFailed,
                            &e.to_string(),
                        )
                        .await?;
                    stage_errors.push(format!("table {table}: {e}"));
                }
                _ => {
                    self.store
                        .set_table_upload_status(
                            self.upload_id,
                            table,
                            TableUploadStatus::ExportedData,
                        )
                        .await?;
                    self.record_rows_exported(table).await?;
                }
            }
        }

        Ok(stage_errors)
    }

    pub(crate) async fn persist_local_schema(&self) -> Result<(), UploadError> {
        self.store
            .save_namespace_schema(
                &self.warehouse.source_id,
                &self.warehouse.destination_id,
                &self.warehouse.namespace,
                &self.registry.warehouse_schema(),
            )
            .await?;
        Ok(())
    }
}
