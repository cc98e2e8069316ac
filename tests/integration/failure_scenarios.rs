//! Partial-failure behaviour of the pipeline
//!
//! - A failed batch commit keeps the buffer intact
//! - A failed status update republishes instead of losing the record
//! - A failed fetch leaves only that guest stale
//! - A full notifier loses the buffer line but not the cache update
//! - Records appended while a drain runs survive it

use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use pve_telemetry::{
    BufferedRecord, EntityId, Sample,
    actors::{
        Manager, ManagerOptions, MetricsCollector, drain::drain_buffer, messages::EntryUpdate,
        publisher::publish_pending,
    },
    config::CollectorConfig,
    storage::{
        RawRecord, RecordFilter, RecordRow, StorageBackend, StorageResult, StoredRecord,
        backend::HealthStatus, memory::MemoryBackend,
    },
    wal::WriteAheadBuffer,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn buffer_with(dir: &tempfile::TempDir, count: i64) -> WriteAheadBuffer {
    let buffer = WriteAheadBuffer::new(dir.path().join("buffer.jsonl"));
    buffer.open().await.unwrap();
    for i in 0..count {
        buffer
            .append(&BufferedRecord::new(i % 7, online(i, 0.5)))
            .await
            .unwrap();
    }
    buffer
}

#[tokio::test]
async fn test_drain_truncates_only_after_every_batch_committed() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = buffer_with(&dir, 5001).await;
    let backend = MemoryBackend::new();
    let original = tokio::fs::read(buffer.path()).await.unwrap();

    backend.fail_insert_batch_at(1).await;
    let err = drain_buffer(&buffer, &backend, 3000).await.unwrap_err();
    assert!(format!("{err:#}").contains("failed to commit batch of 2001 records"));
    assert_eq!(tokio::fs::read(buffer.path()).await.unwrap(), original);

    let report = drain_buffer(&buffer, &backend, 3000).await.unwrap();
    assert_eq!((report.records, report.batches), (5001, 2));
    assert_eq!(backend.record_count().await, 3000 + 5001);
    assert!(tokio::fs::read(buffer.path()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_status_update_leads_to_duplicate_not_loss() {
    let backend = MemoryBackend::new();
    backend
        .insert_batch(
            (1..=42)
                .map(|i| RecordRow::from_buffered(BufferedRecord::new(i, online(i * 60, 0.1))))
                .collect(),
        )
        .await
        .unwrap();
    let bus = FakeBus::default();
    let cancel = CancellationToken::new();

    backend.fail_mark_delivered(42, true).await;
    let first = publish_pending(&backend, &bus, "out", &cancel).await.unwrap();
    assert_eq!((first.delivered, first.failed), (41, 1));
    assert_eq!(
        backend
            .query_pending()
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect::<Vec<_>>(),
        vec![42]
    );

    backend.fail_mark_delivered(42, false).await;
    publish_pending(&backend, &bus, "out", &cancel).await.unwrap();

    let copies_of_42 = bus.published().await.iter().filter(|r| r.id == 42).count();
    assert_eq!(copies_of_42, 2);
    assert!(backend.query_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unacknowledged_publish_is_never_marked() {
    let backend = MemoryBackend::new();
    backend
        .insert_batch(vec![RecordRow::from_buffered(BufferedRecord::new(
            1,
            online(60, 0.1),
        ))])
        .await
        .unwrap();
    let bus = FakeBus::default();
    bus.drop_acks_for(1).await;

    for _ in 0..3 {
        let report = publish_pending(&backend, &bus, "out", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.delivered, 0);
    }

    assert_eq!(backend.query_pending().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_fetch_leaves_prior_value() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"node": "pve1"}]})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/nodes/pve1/qemu"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/nodes/pve1/lxc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"data": [{"vmid": "1"}, {"vmid": "2"}, {"vmid": "3"}]}),
        ))
        .mount(&server)
        .await;
    for vmid in [1, 3] {
        Mock::given(method("GET"))
            .and(path(format!("/nodes/pve1/lxc/{vmid}/rrddata")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": [online(500, 0.9)]})),
            )
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/nodes/pve1/lxc/2/rrddata"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (_, manager) = memory_manager().await;
    manager.set_entry(2, online(100, 0.1)).await;

    let summary = MetricsCollector::new(pve_client(&server), CollectorConfig::default())
        .poll_once(&manager)
        .await;

    assert_eq!((summary.fetched, summary.failed), (2, 1));
    assert_eq!(manager.get_entry(1).await, Some(online(500, 0.9)));
    assert_eq!(manager.get_entry(3).await, Some(online(500, 0.9)));
    assert_eq!(manager.get_entry(2).await, Some(online(100, 0.1)));
}

#[tokio::test]
async fn test_unreachable_api_changes_nothing() {
    let (_, manager) = memory_manager().await;
    manager.set_entry(9, online(100, 0.1)).await;

    let client = pve_telemetry::proxmox::PveClient::with_base_url(
        "http://127.0.0.1:9",
        std::time::Duration::from_secs(1),
    )
    .unwrap();
    let summary = MetricsCollector::new(client, CollectorConfig::default())
        .poll_once(&manager)
        .await;

    assert_eq!(summary.fetched + summary.failed, 0);
    assert_eq!(manager.snapshot().await.len(), 1);
}

#[tokio::test]
async fn test_full_notifier_drops_event_keeps_cache() {
    let manager = Manager::new(
        Arc::new(MemoryBackend::new()),
        ManagerOptions {
            notifier_capacity: 2,
        },
    )
    .await
    .unwrap();
    let mut rx = manager.take_change_receiver().await.unwrap();

    assert_eq!(manager.set_entry(1, online(10, 0.1)).await, EntryUpdate::Applied);
    assert_eq!(manager.set_entry(2, online(10, 0.1)).await, EntryUpdate::Applied);
    assert_eq!(
        manager.set_entry(3, online(10, 0.7)).await,
        EntryUpdate::AppliedUnnotified
    );

    assert_eq!(manager.get_entry(3).await, Some(online(10, 0.7)));
    assert_eq!(rx.recv().await.unwrap().vmid, 1);
    assert_eq!(rx.recv().await.unwrap().vmid, 2);
    assert!(rx.try_recv().is_err());
}

/// Backend that appends to the buffer while the drain is committing
struct AppendingBackend {
    inner: MemoryBackend,
    buffer: Arc<WriteAheadBuffer>,
}

#[async_trait]
impl StorageBackend for AppendingBackend {
    async fn insert_batch(&self, records: Vec<RecordRow>) -> StorageResult<()> {
        self.buffer
            .append(&BufferedRecord::new(99, Sample::at(9_999)))
            .await?;
        self.inner.insert_batch(records).await
    }

    async fn query_pending(&self) -> StorageResult<Vec<StoredRecord>> {
        self.inner.query_pending().await
    }

    async fn mark_delivered(&self, id: i64) -> StorageResult<bool> {
        self.inner.mark_delivered(id).await
    }

    async fn latest_per_entity(&self) -> StorageResult<Vec<(EntityId, Sample)>> {
        self.inner.latest_per_entity().await
    }

    async fn query_records(&self, filter: RecordFilter) -> StorageResult<Vec<StoredRecord>> {
        self.inner.query_records(filter).await
    }

    async fn insert_raw(&self, record: RawRecord) -> StorageResult<()> {
        self.inner.insert_raw(record).await
    }

    async fn query_raw(&self, limit: usize) -> StorageResult<Vec<RawRecord>> {
        self.inner.query_raw(limit).await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        self.inner.health_check().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_records_appended_during_drain_survive() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Arc::new(buffer_with(&dir, 10).await);
    let backend = AppendingBackend {
        inner: MemoryBackend::new(),
        buffer: buffer.clone(),
    };

    // batch size 4 -> three commits, three mid-run appends
    let report = drain_buffer(&buffer, &backend, 4).await.unwrap();
    assert_eq!(report.records, 10);
    assert_eq!(report.batches, 3);
    assert!(report.carried_over > 0);

    let leftover = tokio::fs::read_to_string(buffer.path()).await.unwrap();
    let leftover: Vec<BufferedRecord> = leftover
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(leftover, vec![BufferedRecord::new(99, Sample::at(9_999)); 3]);

    // the next run picks them up
    let second = drain_buffer(&buffer, &backend.inner, 4).await.unwrap();
    assert_eq!(second.records, 3);
    assert_eq!(backend.inner.record_count().await, 13);
}
