//! Identity-table loading
//!
//! Thin specialization of the table loader for the merge-rules and mappings
//! pair. The resolver that materializes their load files is an external
//! collaborator; it runs only when either table still lacks load files,
//! which each table reports independently through its recorded location.

use std::sync::Arc;

use tracing::info;

use crate::error::UploadError;
use crate::loader::TableLoader;
use crate::model::{
    TableUploadStatus, IDENTITY_MAPPINGS_TABLE, IDENTITY_MERGE_RULES_TABLE,
};
use crate::store::UploadStore;
use crate::warehouse::{IdentityResolver, WarehouseManager};

pub struct IdentityLoader {
    store: Arc<dyn UploadStore>,
    manager: Arc<dyn WarehouseManager>,
    resolver: Arc<dyn IdentityResolver>,
    loader: TableLoader,
    upload_id: i64,
}

impl IdentityLoader {
    pub fn new(
        store: Arc<dyn UploadStore>,
        manager: Arc<dyn WarehouseManager>,
        resolver: Arc<dyn IdentityResolver>,
        loader: TableLoader,
        upload_id: i64,
    ) -> Self {
        Self {
            store,
            manager,
            resolver,
            loader,
            upload_id,
        }
    }

    async fn load_files_generated(&self, table: &str) -> Result<bool, UploadError> {
        Ok(self
            .store
            .table_upload(self.upload_id, table)
            .await?
            .and_then(|tu| tu.location)
            .is_some())
    }

    /// Resolve identities when needed, then load both identity tables.
    /// Returns the collected stage errors.
    pub async fn load_identity_tables(
        &self,
        historic: bool,
    ) -> Result<Vec<String>, UploadError> {
        let merge_rules_generated =
            self.load_files_generated(IDENTITY_MERGE_RULES_TABLE).await?;
        let mappings_generated = self.load_files_generated(IDENTITY_MAPPINGS_TABLE).await?;

        if !(merge_rules_generated && mappings_generated) {
            info!(
                upload_id = self.upload_id,
                historic, "Running identity resolution"
            );
            let resolved = if historic {
                self.resolver.resolve_historic_identities().await
            } else {
                self.resolver.resolve().await
            };
            if let Err(e) = resolved {
                return Ok(vec![format!("identity resolution: {e}")]);
            }
        }

        let mut altered = false;
        let mut stage_errors = Vec::new();

        for table in [IDENTITY_MERGE_RULES_TABLE, IDENTITY_MAPPINGS_TABLE] {
            let already_loaded = self
                .store
                .table_upload(self.upload_id, table)
                .await?
                .map(|tu| tu.status == TableUploadStatus::ExportedData.as_str())
                .unwrap_or(false);
            if already_loaded {
                continue;
            }

            match self.loader.sync_table_schema(table).await {
                Ok(applied) => altered |= applied,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    stage_errors.push(format!("table {table}: {e}"));
                    continue;
                }
            }

            self.store
                .set_table_upload_status(self.upload_id, table, TableUploadStatus::Executing)
                .await?;

            let loaded = match table {
                IDENTITY_MERGE_RULES_TABLE => {
                    self.manager.load_identity_merge_rules_table().await
                }
                _ => self.manager.load_identity_mappings_table().await,
            };

            match loaded {
                Ok(()) => {
                    self.store
                        .set_table_upload_status(
                            self.upload_id,
                            table,
                            TableUploadStatus::ExportedData,
                        )
                        .await?;
                    self.loader.record_rows_exported(table).await?;
                }
                Err(e) => {
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
            }
        }

        if altered {
            self.loader.persist_local_schema().await?;
        }

        Ok(stage_errors)
    }
}
