//! In-memory store
//!
//! Mirrors the observable semantics of the Postgres store for tests and
//! local development. All state lives behind one lock; seeding and
//! inspection helpers are public so scenario tests can arrange and assert
//! rows directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    plan_error_write, rfc3339_millis, ColumnUpdate, ColumnValue, StoreError, UploadStore,
};
use crate::config::RetryPolicy;
use crate::model::{
    LoadFile, PendingTableStatus, StagingFile, StagingFileStatus, TableUpload,
    TableUploadStatus, Upload,
};
use crate::schema::Schema;
use crate::state::ABORTED;

#[derive(Default)]
struct Inner {
    uploads: HashMap<i64, Upload>,
    table_uploads: BTreeMap<(i64, String), TableUpload>,
    staging_files: HashMap<i64, StagingFile>,
    load_files: Vec<LoadFile>,
    schemas: HashMap<(String, String), Schema>,
    next_table_upload_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_upload(&self, upload: Upload) {
        self.lock().uploads.insert(upload.id, upload);
    }

    pub fn insert_staging_files(&self, files: Vec<StagingFile>) {
        let mut inner = self.lock();
        for file in files {
            inner.staging_files.insert(file.id, file);
        }
    }

    pub fn insert_load_files(&self, files: Vec<LoadFile>) {
        self.lock().load_files.extend(files);
    }

    /// Snapshot of an upload row, for assertions.
    pub fn upload(&self, id: i64) -> Option<Upload> {
        self.lock().uploads.get(&id).cloned()
    }

    /// Snapshot of a staging-file row, for assertions.
    pub fn staging_file(&self, id: i64) -> Option<StagingFile> {
        self.lock().staging_files.get(&id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store lock poisoned")
    }

    fn apply_column(upload: &mut Upload, column: &str, value: &ColumnValue) -> Result<(), StoreError> {
        match (column, value) {
            ("status", ColumnValue::Text(v)) => upload.status = v.clone(),
            ("schema", ColumnValue::Json(v)) => {
                upload.schema = serde_json::from_value(v.clone())?;
            }
            ("start_load_file_id", ColumnValue::BigInt(v)) => {
                upload.start_load_file_id = Some(*v);
            }
            ("end_load_file_id", ColumnValue::BigInt(v)) => upload.end_load_file_id = Some(*v),
            ("last_exec_at", ColumnValue::Timestamp(v)) => upload.last_exec_at = Some(*v),
            ("metadata", ColumnValue::Json(v)) => upload.metadata = v.clone(),
            (other, _) => return Err(StoreError::UnsupportedColumn(other.to_string())),
        }
        Ok(())
    }

    fn upload_mut<'a>(
        inner: &'a mut Inner,
        id: i64,
    ) -> Result<&'a mut Upload, StoreError> {
        inner
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))
    }

    fn table_upload_mut<'a>(
        inner: &'a mut Inner,
        upload_id: i64,
        table: &str,
    ) -> Result<&'a mut TableUpload, StoreError> {
        inner
            .table_uploads
            .get_mut(&(upload_id, table.to_string()))
            .ok_or_else(|| {
                StoreError::NotFound(format!("table upload ({upload_id}, {table})"))
            })
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn get_upload(&self, id: i64) -> Result<Upload, StoreError> {
        self.upload(id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))
    }

    async fn set_upload_status(
        &self,
        id: i64,
        status: &str,
        extra: &[ColumnUpdate],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let upload = Self::upload_mut(&mut inner, id)?;
        let now = Utc::now();
        upload.status = status.to_string();
        upload.timings.push(status, now);
        upload.updated_at = now;
        for (column, value) in extra {
            Self::apply_column(upload, column, value)?;
        }
        Ok(())
    }

    async fn set_upload_columns(
        &self,
        id: i64,
        columns: &[ColumnUpdate],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let upload = Self::upload_mut(&mut inner, id)?;
        upload.updated_at = Utc::now();
        for (column, value) in columns {
            Self::apply_column(upload, column, value)?;
        }
        Ok(())
    }

    async fn set_upload_error(
        &self,
        id: i64,
        journal_key: &str,
        failed_status: &str,
        message: &str,
        policy: &RetryPolicy,
    ) -> Result<String, StoreError> {
        let mut inner = self.lock();
        let upload = Self::upload_mut(&mut inner, id)?;
        let now = Utc::now();

        let first_attempt_at = upload
            .timings
            .first()
            .map(|e| e.at)
            .or(upload.first_attempt_at);

        let outcome = plan_error_write(
            &mut upload.error,
            journal_key,
            failed_status,
            message,
            first_attempt_at,
            now,
            policy,
        );

        debug!(
            upload_id = id,
            stage = journal_key,
            attempt = outcome.attempts,
            status = %outcome.status,
            "Recorded upload failure"
        );

        upload.status = outcome.status.clone();
        upload.timings.push(outcome.status.clone(), now);
        if !upload.metadata.is_object() {
            upload.metadata = serde_json::json!({});
        }
        upload.metadata["next_retry_time"] =
            serde_json::json!(rfc3339_millis(outcome.next_retry_at));
        upload.attempts += 1;
        upload.first_attempt_at = upload.first_attempt_at.or(Some(now));
        upload.last_attempt_at = Some(now);
        upload.updated_at = now;

        Ok(outcome.status)
    }

    async fn get_first_attempt_time(
        &self,
        id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let upload = self.get_upload(id).await?;
        Ok(upload.timings.first().map(|e| e.at))
    }

    async fn create_table_uploads(
        &self,
        upload_id: i64,
        tables: &[String],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        for table in tables {
            let key = (upload_id, table.clone());
            if inner.table_uploads.contains_key(&key) {
                continue;
            }
            inner.next_table_upload_id += 1;
            let id = inner.next_table_upload_id;
            inner.table_uploads.insert(
                key,
                TableUpload {
                    id,
                    upload_id,
                    table_name: table.clone(),
                    status: TableUploadStatus::Waiting.as_str().to_string(),
                    error: None,
                    location: None,
                    total_events: None,
                    last_exec_time: None,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        Ok(())
    }

    async fn table_upload(
        &self,
        upload_id: i64,
        table: &str,
    ) -> Result<Option<TableUpload>, StoreError> {
        Ok(self
            .lock()
            .table_uploads
            .get(&(upload_id, table.to_string()))
            .cloned())
    }

    async fn table_uploads(&self, upload_id: i64) -> Result<Vec<TableUpload>, StoreError> {
        Ok(self
            .lock()
            .table_uploads
            .values()
            .filter(|tu| tu.upload_id == upload_id)
            .cloned()
            .collect())
    }

    async fn set_table_upload_status(
        &self,
        upload_id: i64,
        table: &str,
        status: TableUploadStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let tu = Self::table_upload_mut(&mut inner, upload_id, table)?;
        let now = Utc::now();
        tu.status = status.as_str().to_string();
        if status == TableUploadStatus::Executing {
            tu.last_exec_time = Some(now);
        }
        tu.updated_at = now;
        Ok(())
    }

    async fn set_table_upload_error(
        &self,
        upload_id: i64,
        table: &str,
        status: TableUploadStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let tu = Self::table_upload_mut(&mut inner, upload_id, table)?;
        tu.status = status.as_str().to_string();
        tu.error = Some(error.to_string());
        tu.updated_at = Utc::now();
        Ok(())
    }

    async fn set_table_upload_events(
        &self,
        upload_id: i64,
        table: &str,
        total_events: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let tu = Self::table_upload_mut(&mut inner, upload_id, table)?;
        tu.total_events = Some(total_events);
        tu.updated_at = Utc::now();
        Ok(())
    }

    async fn set_table_upload_location(
        &self,
        upload_id: i64,
        table: &str,
        location: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let tu = Self::table_upload_mut(&mut inner, upload_id, table)?;
        tu.location = Some(location.to_string());
        tu.updated_at = Utc::now();
        Ok(())
    }

    async fn pending_table_statuses(
        &self,
        upload_id: i64,
        destination_id: &str,
        namespace: &str,
        tables: &[String],
    ) -> Result<Vec<PendingTableStatus>, StoreError> {
        let inner = self.lock();
        let mut rows: Vec<PendingTableStatus> = inner
            .table_uploads
            .values()
            .filter(|tu| {
                let upload = match inner.uploads.get(&tu.upload_id) {
                    Some(u) => u,
                    None => return false,
                };
                upload.id <= upload_id
                    && upload.destination_id == destination_id
                    && upload.namespace == namespace
                    && upload.status != "exported_data"
                    && upload.status != ABORTED
                    && tables.contains(&tu.table_name)
            })
            .map(|tu| PendingTableStatus {
                upload_id: tu.upload_id,
                table_name: tu.table_name.clone(),
                status: tu.status.clone(),
            })
            .collect();
        rows.sort_by(|a, b| {
            (a.upload_id, &a.table_name).cmp(&(b.upload_id, &b.table_name))
        });
        Ok(rows)
    }

    async fn set_staging_file_statuses(
        &self,
        ids: &[i64],
        status: StagingFileStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for id in ids {
            if let Some(file) = inner.staging_files.get_mut(id) {
                file.status = status.as_str().to_string();
            }
        }
        Ok(())
    }

    async fn load_files_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        table: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<LoadFile>, StoreError> {
        let inner = self.lock();
        let mut files: Vec<LoadFile> = inner
            .load_files
            .iter()
            .filter(|lf| {
                lf.source_id == source_id
                    && lf.destination_id == destination_id
                    && lf.table_name == table
                    && lf.id >= start
                    && lf.id <= end
            })
            .cloned()
            .collect();
        files.sort_by_key(|lf| lf.id);
        Ok(files)
    }

    async fn count_load_files_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        table: &str,
        start: i64,
        end: i64,
    ) -> Result<i64, StoreError> {
        Ok(self
            .load_files_in_range(source_id, destination_id, table, start, end)
            .await?
            .len() as i64)
    }

    async fn namespace_schema(
        &self,
        destination_id: &str,
        namespace: &str,
    ) -> Result<Schema, StoreError> {
        Ok(self
            .lock()
            .schemas
            .get(&(destination_id.to_string(), namespace.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn save_namespace_schema(
        &self,
        _source_id: &str,
        destination_id: &str,
        namespace: &str,
        schema: &Schema,
    ) -> Result<(), StoreError> {
        self.lock().schemas.insert(
            (destination_id.to_string(), namespace.to_string()),
            schema.clone(),
        );
        Ok(())
    }
}
