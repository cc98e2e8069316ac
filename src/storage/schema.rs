//! Row definitions for the two tables of the pipeline
//!
//! - `records`: samples drained from the write-ahead buffer, carrying the
//!   outbox delivery status
//! - `raw_records`: samples received on the raw ingest topic, stored verbatim
//!   together with the topic they arrived on
//!
//! Gauges are plain nullable columns so that range queries and the per-guest
//! "latest row" lookup at startup stay index-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BufferedRecord, EntityId, Sample};

/// Outbox delivery state of a stored record
///
/// Transitions only `Pending -> Delivered`, and only after the message bus
/// acknowledged the publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Delivered,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Delivered => "delivered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SyncStatus::Pending),
            "delivered" => Some(SyncStatus::Delivered),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record about to be inserted into `records`
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRow {
    pub vmid: EntityId,
    pub sample: Sample,
    pub created_at: DateTime<Utc>,
}

impl RecordRow {
    /// Convert a drained buffer line into a pending row
    pub fn from_buffered(record: BufferedRecord) -> Self {
        Self {
            vmid: record.vmid,
            sample: record.sample,
            created_at: Utc::now(),
        }
    }
}

/// A row of `records` as read back from storage
///
/// This is also the JSON payload the outbox publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    pub vmid: EntityId,

    #[serde(flatten)]
    pub sample: Sample,

    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
}

/// A row of `raw_records`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Assigned by storage; ignored on insert
    pub id: i64,
    pub vmid: EntityId,

    #[serde(flatten)]
    pub sample: Sample,

    /// Topic the sample was received on
    pub topic: String,
    pub created_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn from_message(record: BufferedRecord, topic: impl Into<String>) -> Self {
        Self {
            id: 0,
            vmid: record.vmid,
            sample: record.sample,
            topic: topic.into(),
            created_at: Utc::now(),
        }
    }
}

/// Filter for the stored-record read surface
///
/// All bounds are inclusive unix seconds; an empty `vmids` list matches every
/// guest. Results are ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub vmids: Vec<EntityId>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    /// Whether a record passes the filter (used by in-memory backends)
    pub fn matches(&self, vmid: EntityId, time: i64) -> bool {
        (self.vmids.is_empty() || self.vmids.contains(&vmid))
            && self.from.is_none_or(|from| time >= from)
            && self.to.is_none_or(|to| time <= to)
    }
}
