//! Warehouse schema handling
//!
//! Three snapshots live here for the duration of one upload: the locally
//! cached schema, the schema observed live in the warehouse, and the schema
//! the current upload intends to load. Consolidation and diff computation
//! both work on these snapshots; per-table loaders merge applied diffs back
//! into the warehouse snapshot as they go.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::UploadError;
use crate::model::StagingFile;
use crate::store::UploadStore;
use crate::warehouse::{destination, Warehouse, WarehouseManager};

/// Column type as stored in upload and warehouse schemas.
///
/// The widening order is `int < float < numeric < string`; `text` absorbs
/// `string`; `boolean`, `datetime` and `json` only unify with themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Int,
    Float,
    Numeric,
    String,
    Text,
    Datetime,
    Json,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Numeric => "numeric",
            ColumnType::String => "string",
            ColumnType::Text => "text",
            ColumnType::Datetime => "datetime",
            ColumnType::Json => "json",
        }
    }

    /// Position in the widening order, for the types that take part in it.
    fn widen_rank(self) -> Option<u8> {
        match self {
            ColumnType::Int => Some(1),
            ColumnType::Float => Some(2),
            ColumnType::Numeric => Some(3),
            ColumnType::String => Some(4),
            _ => None,
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(ColumnType::Boolean),
            "int" => Ok(ColumnType::Int),
            "float" => Ok(ColumnType::Float),
            "numeric" => Ok(ColumnType::Numeric),
            "string" => Ok(ColumnType::String),
            "text" => Ok(ColumnType::Text),
            "datetime" => Ok(ColumnType::Datetime),
            "json" => Ok(ColumnType::Json),
            other => Err(format!("unknown column type: {other}")),
        }
    }
}

/// Columns of one table, keyed by column name.
pub type TableSchema = BTreeMap<String, ColumnType>;

/// Full schema: table name to column map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema(pub BTreeMap<String, TableSchema>);

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.0.get(name)
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn insert(&mut self, table: impl Into<String>, columns: TableSchema) {
        self.0.insert(table.into(), columns);
    }

    /// Case-insensitive table lookup, folding names per the provider rule.
    fn table_folded(&self, name: &str, destination_type: &str) -> Option<&TableSchema> {
        let wanted = to_provider_case(destination_type, name);
        self.0
            .iter()
            .find(|(t, _)| to_provider_case(destination_type, t) == wanted)
            .map(|(_, cols)| cols)
    }
}

/// Fold an identifier into the destination's canonical case.
pub fn to_provider_case(destination_type: &str, name: &str) -> String {
    match destination_type {
        destination::SNOWFLAKE => name.to_uppercase(),
        _ => name.to_lowercase(),
    }
}

/// Semantic schema equality: set equality of `(table, column, type)` triples
/// with names folded per the provider case rule.
pub fn schemas_equivalent(a: &Schema, b: &Schema, destination_type: &str) -> bool {
    let triples = |s: &Schema| -> std::collections::BTreeSet<(String, String, ColumnType)> {
        s.0.iter()
            .flat_map(|(table, cols)| {
                let table = to_provider_case(destination_type, table);
                cols.iter().map(move |(col, ty)| {
                    (
                        table.clone(),
                        to_provider_case(destination_type, col),
                        *ty,
                    )
                })
            })
            .collect()
    };
    triples(a) == triples(b)
}

/// Unify two staged types for the same column. Commutative.
fn merge_column_type(a: ColumnType, b: ColumnType) -> ColumnType {
    if a == b {
        return a;
    }
    if a == ColumnType::Text || b == ColumnType::Text {
        return ColumnType::Text;
    }
    if a == ColumnType::Boolean || b == ColumnType::Boolean {
        return ColumnType::Boolean;
    }
    match (a.widen_rank(), b.widen_rank()) {
        (Some(ra), Some(rb)) => {
            if ra >= rb {
                a
            } else {
                b
            }
        }
        // Irreconcilable pair (e.g. datetime vs json) degrades to string.
        _ => ColumnType::String,
    }
}

/// Additions, widenings and whole-table creation needed to reconcile one
/// table of the upload schema with the live warehouse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchemaDiff {
    pub exists: bool,
    pub table_to_be_created: bool,
    pub column_map: TableSchema,
    pub string_columns_to_be_altered_to_text: Vec<String>,
}

fn compute_diff(
    upload_columns: &TableSchema,
    warehouse_columns: Option<&TableSchema>,
    destination_type: &str,
) -> TableSchemaDiff {
    let mut diff = TableSchemaDiff::default();

    let warehouse_columns = match warehouse_columns {
        Some(cols) => cols,
        None => {
            diff.table_to_be_created = true;
            diff.column_map = upload_columns.clone();
            diff.exists = !upload_columns.is_empty();
            return diff;
        }
    };

    let folded: BTreeMap<String, ColumnType> = warehouse_columns
        .iter()
        .map(|(c, ty)| (to_provider_case(destination_type, c), *ty))
        .collect();

    for (column, ty) in upload_columns {
        match folded.get(&to_provider_case(destination_type, column)) {
            None => {
                diff.column_map.insert(column.clone(), *ty);
            }
            Some(ColumnType::String) if *ty == ColumnType::Text => {
                diff.string_columns_to_be_altered_to_text.push(column.clone());
            }
            Some(_) => {}
        }
    }

    diff.exists = diff.table_to_be_created
        || !diff.column_map.is_empty()
        || !diff.string_columns_to_be_altered_to_text.is_empty();
    diff
}

/// Schema snapshots for one upload job.
///
/// The warehouse snapshot is shared with concurrent per-table loaders, which
/// merge applied diffs back through [`SchemaRegistry::set_updated_table_schema`].
pub struct SchemaRegistry {
    destination_type: String,
    local: RwLock<Schema>,
    warehouse: RwLock<Schema>,
    upload: RwLock<Schema>,
}

impl SchemaRegistry {
    pub fn new(destination_type: impl Into<String>) -> Self {
        Self {
            destination_type: destination_type.into(),
            local: RwLock::new(Schema::new()),
            warehouse: RwLock::new(Schema::new()),
            upload: RwLock::new(Schema::new()),
        }
    }

    pub fn set_local_schema(&self, schema: Schema) {
        *self.local.write().expect("schema lock poisoned") = schema;
    }

    pub fn set_upload_schema(&self, schema: Schema) {
        *self.upload.write().expect("schema lock poisoned") = schema;
    }

    pub fn upload_schema(&self) -> Schema {
        self.upload.read().expect("schema lock poisoned").clone()
    }

    pub fn warehouse_schema(&self) -> Schema {
        self.warehouse.read().expect("schema lock poisoned").clone()
    }

    pub fn warehouse_schema_is_empty(&self) -> bool {
        self.warehouse.read().expect("schema lock poisoned").is_empty()
    }

    pub fn table_schema_in_upload(&self, table: &str) -> TableSchema {
        self.upload
            .read()
            .expect("schema lock poisoned")
            .table(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn table_schema_in_warehouse(&self, table: &str) -> TableSchema {
        self.warehouse
            .read()
            .expect("schema lock poisoned")
            .table_folded(table, &self.destination_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Fetch the live warehouse schema, compare with the local snapshot and
    /// persist the new snapshot when they differ. Returns whether the remote
    /// schema changed relative to the local copy.
    pub async fn sync_remote(
        &self,
        manager: &dyn WarehouseManager,
        store: &dyn UploadStore,
        warehouse: &Warehouse,
    ) -> Result<bool, UploadError> {
        let fetched = manager
            .fetch_schema()
            .await
            .map_err(|e| UploadError::FetchingRemoteSchema(e.to_string()))?;

        let changed = {
            let local = self.local.read().expect("schema lock poisoned");
            !schemas_equivalent(&local, &fetched, &self.destination_type)
        };

        if changed {
            debug!(
                destination_id = %warehouse.destination_id,
                namespace = %warehouse.namespace,
                "Remote schema differs from local snapshot"
            );
            store
                .save_namespace_schema(
                    &warehouse.source_id,
                    &warehouse.destination_id,
                    &warehouse.namespace,
                    &fetched,
                )
                .await?;
            *self.local.write().expect("schema lock poisoned") = fetched.clone();
        }

        *self.warehouse.write().expect("schema lock poisoned") = fetched;
        Ok(changed)
    }

    /// Union of the staging files' sampled schemas, with the live warehouse
    /// type taking precedence for columns the warehouse already has.
    /// Deterministic under any staging-file order.
    pub fn consolidate(&self, staging_files: &[StagingFile]) -> Schema {
        let mut merged = Schema::new();

        for file in staging_files {
            for (table, columns) in &file.schema.0 {
                let entry = merged.0.entry(table.clone()).or_default();
                for (column, ty) in columns {
                    entry
                        .entry(column.clone())
                        .and_modify(|existing| *existing = merge_column_type(*existing, *ty))
                        .or_insert(*ty);
                }
            }
        }

        let warehouse = self.warehouse.read().expect("schema lock poisoned");
        for (table, columns) in merged.0.iter_mut() {
            if let Some(live) = warehouse.table_folded(table, &self.destination_type) {
                let folded: BTreeMap<String, ColumnType> = live
                    .iter()
                    .map(|(c, ty)| (to_provider_case(&self.destination_type, c), *ty))
                    .collect();
                for (column, ty) in columns.iter_mut() {
                    if let Some(live_ty) =
                        folded.get(&to_provider_case(&self.destination_type, column))
                    {
                        *ty = *live_ty;
                    }
                }
            }
        }

        merged
    }

    /// Diff one table of the upload schema against the warehouse snapshot.
    pub fn diff(&self, table: &str) -> TableSchemaDiff {
        let upload_columns = self.table_schema_in_upload(table);
        let warehouse = self.warehouse.read().expect("schema lock poisoned");
        compute_diff(
            &upload_columns,
            warehouse.table_folded(table, &self.destination_type),
            &self.destination_type,
        )
    }

    /// Merge an applied diff back into the warehouse snapshot.
    pub fn set_updated_table_schema(&self, table: &str, columns: &TableSchema) {
        let mut warehouse = self.warehouse.write().expect("schema lock poisoned");
        let entry = warehouse.0.entry(table.to_string()).or_default();
        for (column, ty) in columns {
            entry.insert(column.clone(), *ty);
        }
    }
}
