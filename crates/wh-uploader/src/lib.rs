//! Upload orchestrator for the warehouse loading service
//!
//! Converts batches of staging files into warehouse load files and imports
//! them into destination tables, one crash-resumable [`job::UploadJob`] run
//! at a time:
//!
//! 1. consolidate the staging-file schemas with the known warehouse schema;
//! 2. record one row per target table;
//! 3. fan staging files out to worker processes over the notification bus;
//! 4. sync the remote warehouse schema;
//! 5. load identity tables, user tables, then everything else under the
//!    destination's parallelism cap;
//! 6. aggregate partial failures, persist retry state, complete or abort.
//!
//! The per-destination drivers, the notification bus, the identity resolver
//! and the upstream scheduler are external collaborators behind the traits
//! in [`warehouse`] and [`notifier`].

pub mod config;
pub mod error;
pub mod identity;
pub mod job;
pub mod load_files;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod notifier;
pub mod schema;
pub mod state;
pub mod store;
pub mod warehouse;

pub use config::UploaderConfig;
pub use error::UploadError;
pub use job::{UploadJob, UploadJobParams};
pub use schema::{ColumnType, Schema, SchemaRegistry};
pub use state::UploadStage;
pub use store::{MemoryStore, PgStore, UploadStore};
pub use warehouse::{Warehouse, WarehouseManager};
