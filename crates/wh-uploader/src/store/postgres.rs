//! PostgreSQL-backed store over the `wh_*` tables
//!
//! Every statement is parameterised; column names in dynamic updates come
//! from a fixed whitelist. The tables themselves are provisioned by the
//! service's deployment, not by this crate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tracing::warn;

use super::{
    plan_error_write, rfc3339_millis, ColumnUpdate, ColumnValue, StoreError, UploadStore,
};
use crate::config::RetryPolicy;
use crate::model::{
    LoadFile, PendingTableStatus, StagingFileStatus, TableUpload, TableUploadStatus, Upload,
};
use crate::schema::Schema;

/// Upload columns settable through the dynamic update paths.
const UPDATABLE_UPLOAD_COLUMNS: &[&str] = &[
    "status",
    "schema",
    "start_load_file_id",
    "end_load_file_id",
    "last_exec_at",
    "metadata",
];

const UPLOAD_COLUMNS: &str = "id, namespace, source_id, destination_id, destination_type, \
     start_staging_file_id, end_staging_file_id, start_load_file_id, end_load_file_id, \
     status, schema, error, timings, attempts, first_attempt_at, last_attempt_at, \
     last_exec_at, first_event_at, last_event_at, metadata, created_at, updated_at";

const TABLE_UPLOAD_COLUMNS: &str = "id, upload_id, table_name, status, error, location, \
     total_events, last_exec_time, created_at, updated_at";

pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    fn check_columns(columns: &[ColumnUpdate]) -> Result<(), StoreError> {
        for (column, _) in columns {
            if !UPDATABLE_UPLOAD_COLUMNS.contains(column) {
                return Err(StoreError::UnsupportedColumn((*column).to_string()));
            }
        }
        Ok(())
    }

    fn bind_value<'q>(
        query: Query<'q, Postgres, PgArguments>,
        value: &ColumnValue,
    ) -> Query<'q, Postgres, PgArguments> {
        match value {
            ColumnValue::BigInt(v) => query.bind(*v),
            ColumnValue::Text(v) => query.bind(v.clone()),
            ColumnValue::Timestamp(v) => query.bind(*v),
            ColumnValue::Json(v) => query.bind(v.clone()),
        }
    }
}

#[async_trait]
impl UploadStore for PgStore {
    async fn get_upload(&self, id: i64) -> Result<Upload, StoreError> {
        let sql = format!("SELECT {UPLOAD_COLUMNS} FROM wh_uploads WHERE id = $1");
        sqlx::query_as::<_, Upload>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))
    }

    async fn set_upload_status(
        &self,
        id: i64,
        status: &str,
        extra: &[ColumnUpdate],
    ) -> Result<(), StoreError> {
        Self::check_columns(extra)?;

        let now = Utc::now();
        let timing_entry =
            serde_json::json!([{ status: rfc3339_millis(now) }]);

        let mut sets = vec![
            "status = $2".to_string(),
            "timings = COALESCE(timings, '[]'::jsonb) || $3::jsonb".to_string(),
            "updated_at = $4".to_string(),
        ];
        for (i, (column, _)) in extra.iter().enumerate() {
            sets.push(format!("{column} = ${}", i + 5));
        }

        let sql = format!("UPDATE wh_uploads SET {} WHERE id = $1", sets.join(", "));
        let mut query = sqlx::query(&sql)
            .bind(id)
            .bind(status)
            .bind(timing_entry)
            .bind(now);
        for (_, value) in extra {
            query = Self::bind_value(query, value);
        }
        query.execute(&*self.pool).await?;
        Ok(())
    }

    async fn set_upload_columns(
        &self,
        id: i64,
        columns: &[ColumnUpdate],
    ) -> Result<(), StoreError> {
        Self::check_columns(columns)?;
        if columns.is_empty() {
            return Ok(());
        }

        let mut sets = vec!["updated_at = $2".to_string()];
        for (i, (column, _)) in columns.iter().enumerate() {
            sets.push(format!("{column} = ${}", i + 3));
        }

        let sql = format!("UPDATE wh_uploads SET {} WHERE id = $1", sets.join(", "));
        let mut query = sqlx::query(&sql).bind(id).bind(Utc::now());
        for (_, value) in columns {
            query = Self::bind_value(query, value);
        }
        query.execute(&*self.pool).await?;
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
        let mut upload = self.get_upload(id).await?;
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

        warn!(
            upload_id = id,
            stage = journal_key,
            attempt = outcome.attempts,
            status = %outcome.status,
            "Recorded upload failure"
        );

        upload.timings.push(outcome.status.clone(), now);

        let mut metadata = upload.metadata;
        if !metadata.is_object() {
            metadata = serde_json::json!({});
        }
        metadata["next_retry_time"] = serde_json::json!(rfc3339_millis(outcome.next_retry_at));

        sqlx::query(
            r#"
            UPDATE wh_uploads
            SET status = $2,
                error = $3,
                timings = $4,
                metadata = $5,
                attempts = $6,
                first_attempt_at = COALESCE(first_attempt_at, $7),
                last_attempt_at = $7,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&outcome.status)
        .bind(serde_json::to_value(&upload.error)?)
        .bind(serde_json::to_value(&upload.timings)?)
        .bind(metadata)
        .bind(upload.attempts + 1)
        .bind(now)
        .execute(&*self.pool)
        .await?;

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
        let now = Utc::now();
        for table in tables {
            sqlx::query(
                r#"
                INSERT INTO wh_table_uploads (upload_id, table_name, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $4)
                ON CONFLICT (upload_id, table_name) DO NOTHING
                "#,
            )
            .bind(upload_id)
            .bind(table)
            .bind(TableUploadStatus::Waiting.as_str())
            .bind(now)
            .execute(&*self.pool)
            .await?;
        }
        Ok(())
    }

    async fn table_upload(
        &self,
        upload_id: i64,
        table: &str,
    ) -> Result<Option<TableUpload>, StoreError> {
        let sql = format!(
            "SELECT {TABLE_UPLOAD_COLUMNS} FROM wh_table_uploads \
             WHERE upload_id = $1 AND table_name = $2"
        );
        Ok(sqlx::query_as::<_, TableUpload>(&sql)
            .bind(upload_id)
            .bind(table)
            .fetch_optional(&*self.pool)
            .await?)
    }

    async fn table_uploads(&self, upload_id: i64) -> Result<Vec<TableUpload>, StoreError> {
        let sql = format!(
            "SELECT {TABLE_UPLOAD_COLUMNS} FROM wh_table_uploads \
             WHERE upload_id = $1 ORDER BY table_name"
        );
        Ok(sqlx::query_as::<_, TableUpload>(&sql)
            .bind(upload_id)
            .fetch_all(&*self.pool)
            .await?)
    }

    async fn set_table_upload_status(
        &self,
        upload_id: i64,
        table: &str,
        status: TableUploadStatus,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let sql = if status == TableUploadStatus::Executing {
            "UPDATE wh_table_uploads SET status = $3, last_exec_time = $4, updated_at = $4 \
             WHERE upload_id = $1 AND table_name = $2"
        } else {
            "UPDATE wh_table_uploads SET status = $3, updated_at = $4 \
             WHERE upload_id = $1 AND table_name = $2"
        };
        sqlx::query(sql)
            .bind(upload_id)
            .bind(table)
            .bind(status.as_str())
            .bind(now)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn set_table_upload_error(
        &self,
        upload_id: i64,
        table: &str,
        status: TableUploadStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE wh_table_uploads SET status = $3, error = $4, updated_at = $5 \
             WHERE upload_id = $1 AND table_name = $2",
        )
        .bind(upload_id)
        .bind(table)
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn set_table_upload_events(
        &self,
        upload_id: i64,
        table: &str,
        total_events: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE wh_table_uploads SET total_events = $3, updated_at = $4 \
             WHERE upload_id = $1 AND table_name = $2",
        )
        .bind(upload_id)
        .bind(table)
        .bind(total_events)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn set_table_upload_location(
        &self,
        upload_id: i64,
        table: &str,
        location: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE wh_table_uploads SET location = $3, updated_at = $4 \
             WHERE upload_id = $1 AND table_name = $2",
        )
        .bind(upload_id)
        .bind(table)
        .bind(location)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn pending_table_statuses(
        &self,
        upload_id: i64,
        destination_id: &str,
        namespace: &str,
        tables: &[String],
    ) -> Result<Vec<PendingTableStatus>, StoreError> {
        Ok(sqlx::query_as::<_, PendingTableStatus>(
            r#"
            SELECT tu.upload_id, tu.table_name, tu.status
            FROM wh_table_uploads tu
            JOIN wh_uploads u ON u.id = tu.upload_id
            WHERE u.destination_id = $1
              AND u.namespace = $2
              AND u.id <= $3
              AND u.status NOT IN ('exported_data', 'aborted')
              AND tu.table_name = ANY($4)
            ORDER BY tu.upload_id, tu.table_name
            "#,
        )
        .bind(destination_id)
        .bind(namespace)
        .bind(upload_id)
        .bind(tables.to_vec())
        .fetch_all(&*self.pool)
        .await?)
    }

    async fn set_staging_file_statuses(
        &self,
        ids: &[i64],
        status: StagingFileStatus,
    ) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE wh_staging_files SET status = $1, updated_at = $2 WHERE id = ANY($3)",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(ids.to_vec())
        .execute(&*self.pool)
        .await?;
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
        Ok(sqlx::query_as::<_, LoadFile>(
            r#"
            SELECT id, staging_file_id, source_id, destination_id, table_name, location
            FROM wh_load_files
            WHERE source_id = $1
              AND destination_id = $2
              AND table_name = $3
              AND id BETWEEN $4 AND $5
            ORDER BY id
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .bind(table)
        .bind(start)
        .bind(end)
        .fetch_all(&*self.pool)
        .await?)
    }

    async fn count_load_files_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        table: &str,
        start: i64,
        end: i64,
    ) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM wh_load_files
            WHERE source_id = $1
              AND destination_id = $2
              AND table_name = $3
              AND id BETWEEN $4 AND $5
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .bind(table)
        .bind(start)
        .bind(end)
        .fetch_one(&*self.pool)
        .await?)
    }

    async fn namespace_schema(
        &self,
        destination_id: &str,
        namespace: &str,
    ) -> Result<Schema, StoreError> {
        let row: Option<sqlx::types::Json<Schema>> = sqlx::query_scalar(
            "SELECT schema FROM wh_schemas WHERE destination_id = $1 AND namespace = $2",
        )
        .bind(destination_id)
        .bind(namespace)
        .fetch_optional(&*self.pool)
        .await?;
        Ok(row.map(|j| j.0).unwrap_or_default())
    }

    async fn save_namespace_schema(
        &self,
        source_id: &str,
        destination_id: &str,
        namespace: &str,
        schema: &Schema,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO wh_schemas (source_id, destination_id, namespace, schema, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (destination_id, namespace)
            DO UPDATE SET schema = EXCLUDED.schema, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .bind(namespace)
        .bind(serde_json::to_value(schema)?)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }
}
