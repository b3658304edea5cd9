//! Destination driver contract
//!
//! The per-destination SQL and data movement live outside the core. The core
//! drives a [`WarehouseManager`] and hands it an [`Uploader`] callback for
//! schema and load-file lookups.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::UploadError;
use crate::schema::{ColumnType, Schema, TableSchema};

/// Destination type identifiers.
pub mod destination {
    pub const BIGQUERY: &str = "bigquery";
    pub const POSTGRES: &str = "postgres";
    pub const SNOWFLAKE: &str = "snowflake";
    pub const REDSHIFT: &str = "redshift";
    pub const CLICKHOUSE: &str = "clickhouse";
    pub const MSSQL: &str = "mssql";
    pub const DELTALAKE: &str = "deltalake";
}

/// Routing and connection descriptor for one (source, destination) pair.
#[derive(Debug, Clone)]
pub struct Warehouse {
    pub source_id: String,
    pub source_name: String,
    pub destination_id: String,
    pub destination_name: String,
    pub destination_type: String,
    pub namespace: String,
    pub destination_config: serde_json::Value,
}

/// Error returned by a destination driver.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Destination driver operations consumed by the core.
#[async_trait]
pub trait WarehouseManager: Send + Sync {
    async fn setup(
        &self,
        warehouse: &Warehouse,
        uploader: Arc<dyn Uploader>,
    ) -> Result<(), DriverError>;

    async fn cleanup(&self);

    async fn create_schema(&self) -> Result<(), DriverError>;

    async fn create_table(&self, name: &str, columns: &TableSchema) -> Result<(), DriverError>;

    async fn add_column(
        &self,
        table: &str,
        column: &str,
        column_type: ColumnType,
    ) -> Result<(), DriverError>;

    async fn alter_column(
        &self,
        table: &str,
        column: &str,
        column_type: ColumnType,
    ) -> Result<(), DriverError>;

    async fn load_table(&self, name: &str) -> Result<(), DriverError>;

    /// Loads `identifies` and `users` atomically; reports per-table results.
    async fn load_user_tables(&self) -> HashMap<String, Result<(), DriverError>>;

    async fn load_identity_merge_rules_table(&self) -> Result<(), DriverError>;

    async fn load_identity_mappings_table(&self) -> Result<(), DriverError>;

    async fn fetch_schema(&self) -> Result<Schema, DriverError>;
}

/// Callbacks the core provides to the driver.
#[async_trait]
pub trait Uploader: Send + Sync {
    fn schema_in_warehouse(&self) -> Schema;

    fn table_schema_in_warehouse(&self, table: &str) -> TableSchema;

    fn table_schema_in_upload(&self, table: &str) -> TableSchema;

    /// Locations of every load file of the upload for one table.
    async fn load_file_locations(&self, table: &str) -> Result<Vec<String>, UploadError>;

    /// Any one load-file location for the table; `NotFound` when none exist.
    async fn sample_load_file_location(&self, table: &str) -> Result<String, UploadError>;

    /// The representative location recorded on the per-table upload row.
    async fn single_load_file_location(&self, table: &str) -> Result<String, UploadError>;
}

/// External identity resolver invoked ahead of identity-table loading.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self) -> Result<(), DriverError>;

    async fn resolve_historic_identities(&self) -> Result<(), DriverError>;
}
