//! Storage backends for drained and raw samples
//!
//! ## Design
//!
//! - **Trait-based**: `StorageBackend` is the only thing the pipeline sees
//! - **Async**: All operations are async for use from Tokio tasks
//! - **Shared**: One `Arc<dyn StorageBackend>` is handed to every task
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database with sqlx migrations
//! - **In-Memory**: No persistence, for tests or storage-less runs
//!
//! ## Usage
//!
//! ```no_run
//! use pve_telemetry::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./telemetry.db").await?;
//!     let pending = backend.query_pending().await?;
//!     println!("{} records waiting for delivery", pending.len());
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::StorageConfig;

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use schema::{RawRecord, RecordFilter, RecordRow, StoredRecord, SyncStatus};

/// Open the backend selected by the configuration
pub async fn open_backend(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::None => {
            info!("using in-memory storage (nothing is persisted)");
            Ok(Arc::new(memory::MemoryBackend::new()))
        }

        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => Ok(Arc::new(sqlite::SqliteBackend::new(path).await?)),

        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::ConnectionFailed(
            "built without the storage-sqlite feature".to_string(),
        )),
    }
}
