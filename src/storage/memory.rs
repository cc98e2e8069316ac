//! In-memory storage backend (no persistence)
//!
//! Implements the full [`StorageBackend`] contract on top of two vectors.
//! Used when the configuration selects `"backend": "none"` and as the storage
//! double in tests.
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Linear scans**: Every query walks the whole table
//!
//! Faults can be injected (`fail_insert_batch_at`, `fail_mark_delivered`) to
//! exercise the pipeline's partial-failure paths.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{RawRecord, RecordFilter, RecordRow, StoredRecord, SyncStatus};
use crate::{EntityId, Sample};

#[derive(Default)]
struct Tables {
    records: Vec<StoredRecord>,
    raw: Vec<RawRecord>,
    next_id: i64,
    next_raw_id: i64,
    /// `insert_batch` calls left until one fails
    insert_failure_in: Option<usize>,
    /// Ids whose status update fails
    mark_failures: HashSet<i64>,
}

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in `records`, regardless of status
    pub async fn record_count(&self) -> usize {
        self.tables.read().await.records.len()
    }

    /// Let `successes` further `insert_batch` calls succeed, fail the next one
    pub async fn fail_insert_batch_at(&self, successes: usize) {
        self.tables.write().await.insert_failure_in = Some(successes);
    }

    /// Make `mark_delivered(id)` fail (or succeed again)
    pub async fn fail_mark_delivered(&self, id: i64, fail: bool) {
        let mut tables = self.tables.write().await;
        if fail {
            tables.mark_failures.insert(id);
        } else {
            tables.mark_failures.remove(&id);
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn insert_batch(&self, records: Vec<RecordRow>) -> StorageResult<()> {
        let mut tables = self.tables.write().await;

        match tables.insert_failure_in {
            Some(0) => {
                tables.insert_failure_in = None;
                return Err(StorageError::Unavailable("injected insert failure".to_string()));
            }
            Some(n) => tables.insert_failure_in = Some(n - 1),
            None => {}
        }

        for row in records {
            tables.next_id += 1;
            let id = tables.next_id;
            tables.records.push(StoredRecord {
                id,
                vmid: row.vmid,
                sample: row.sample,
                sync_status: SyncStatus::Pending,
                created_at: row.created_at,
            });
        }

        Ok(())
    }

    async fn query_pending(&self) -> StorageResult<Vec<StoredRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .records
            .iter()
            .filter(|r| r.sync_status == SyncStatus::Pending)
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, id: i64) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.mark_failures.contains(&id) {
            return Err(StorageError::Unavailable(format!(
                "injected status update failure for record {id}"
            )));
        }

        match tables
            .records
            .iter_mut()
            .find(|r| r.id == id && r.sync_status == SyncStatus::Pending)
        {
            Some(record) => {
                record.sync_status = SyncStatus::Delivered;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn latest_per_entity(&self) -> StorageResult<Vec<(EntityId, Sample)>> {
        let tables = self.tables.read().await;
        let mut latest: HashMap<EntityId, &Sample> = HashMap::new();

        for record in &tables.records {
            latest
                .entry(record.vmid)
                .and_modify(|current| {
                    if record.sample.time > current.time {
                        *current = &record.sample;
                    }
                })
                .or_insert(&record.sample);
        }

        Ok(latest
            .into_iter()
            .map(|(vmid, sample)| (vmid, sample.clone()))
            .collect())
    }

    async fn query_records(&self, filter: RecordFilter) -> StorageResult<Vec<StoredRecord>> {
        let tables = self.tables.read().await;

        let mut records: Vec<StoredRecord> = tables
            .records
            .iter()
            .filter(|r| filter.matches(r.vmid, r.sample.time))
            .cloned()
            .collect();

        records.sort_by(|a, b| b.sample.time.cmp(&a.sample.time).then(b.id.cmp(&a.id)));
        records.truncate(filter.limit.unwrap_or(usize::MAX));

        debug!("in-memory query returned {} records", records.len());
        Ok(records)
    }

    async fn insert_raw(&self, mut record: RawRecord) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables.next_raw_id += 1;
        record.id = tables.next_raw_id;
        tables.raw.push(record);
        Ok(())
    }

    async fn query_raw(&self, limit: usize) -> StorageResult<Vec<RawRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.raw.iter().rev().take(limit).cloned().collect())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let tables = self.tables.read().await;
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("records".to_string(), tables.records.len().to_string()),
                ("raw_records".to_string(), tables.raw.len().to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
