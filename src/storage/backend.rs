//! Storage backend trait definition
//!
//! The pipeline only needs a handful of operations from storage: bulk insert
//! for the buffer drain, the pending scan and status update for the outbox,
//! single inserts for raw ingest, and two reads (startup hydration and the
//! query surface). Schema setup belongs to the concrete backend.

use std::collections::HashMap;

use async_trait::async_trait;

use super::error::StorageResult;
use super::schema::{RawRecord, RecordFilter, RecordRow, StoredRecord};
use crate::{EntityId, Sample};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for persistent storage backends
///
/// Implementations must be `Send + Sync`; a single instance is shared by the
/// buffer drain (writer), the outbox publisher (reader/updater), the raw
/// ingest consumer and the read surface. There is no transaction spanning
/// those callers; each method is its own unit of work.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert a batch of records with status `pending`
    ///
    /// The batch is atomic: either every row is committed or none is.
    async fn insert_batch(&self, records: Vec<RecordRow>) -> StorageResult<()>;

    /// All records still waiting for delivery, oldest id first
    async fn query_pending(&self) -> StorageResult<Vec<StoredRecord>>;

    /// Move one record from `pending` to `delivered`
    ///
    /// Returns `false` if no pending record with that id exists (already
    /// delivered or unknown). Never moves a record back to `pending`.
    async fn mark_delivered(&self, id: i64) -> StorageResult<bool>;

    /// The newest stored sample of every guest, one row per guest
    async fn latest_per_entity(&self) -> StorageResult<Vec<(EntityId, Sample)>>;

    /// Stored records matching `filter`, newest first
    async fn query_records(&self, filter: RecordFilter) -> StorageResult<Vec<StoredRecord>>;

    /// Store one sample received on the raw ingest topic
    async fn insert_raw(&self, record: RawRecord) -> StorageResult<()>;

    /// The `limit` most recent raw records, newest first
    async fn query_raw(&self, limit: usize) -> StorageResult<Vec<RawRecord>>;

    /// Lightweight liveness probe
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
