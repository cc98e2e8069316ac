//! End-to-end flow: upstream API → cache → buffer → storage → bus

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use pve_telemetry::{
    actors::{
        BufferDrainTask, BufferWriterTask, MetricsCollector, OutboxPublisherTask,
        drain::drain_buffer, publisher::publish_pending,
    },
    config::{CollectorConfig, DrainConfig, MqttConfig, PublisherConfig},
    storage::{RecordFilter, StorageBackend, SyncStatus},
    wal::WriteAheadBuffer,
};
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

use crate::helpers::*;

async fn buffered_line_count(buffer: &WriteAheadBuffer) -> usize {
    tokio::fs::read_to_string(buffer.path())
        .await
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_sample_travels_from_api_to_bus() {
    let server = MockServer::start().await;
    mount_single_node(
        &server,
        &[
            MockGuest::new(100, vec![online(60, 0.1), online(120, 0.2)]),
            MockGuest::new(101, vec![online(60, 0.5), online(120, 0.6)]),
        ],
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let buffer = Arc::new(WriteAheadBuffer::new(dir.path().join("buffer.jsonl")));
    let (backend, manager) = memory_manager().await;

    manager
        .add_task(Box::new(BufferWriterTask::new(buffer.clone())))
        .await;
    manager.start_all().await;

    let collector = MetricsCollector::new(pve_client(&server), CollectorConfig::default());
    let summary = collector.poll_once(&manager).await;
    assert_eq!(summary.applied, 4);

    let buffered = eventually(Duration::from_secs(5), || {
        let buffer = buffer.clone();
        async move { buffered_line_count(&buffer).await == 4 }
    })
    .await;
    assert!(buffered);

    let report = drain_buffer(&buffer, backend.as_ref(), 3000).await.unwrap();
    assert_eq!(report.records, 4);
    assert_eq!(report.batches, 1);

    let bus = FakeBus::default();
    let cancel = CancellationToken::new();
    let published = publish_pending(backend.as_ref(), &bus, "pve/telemetry", &cancel)
        .await
        .unwrap();
    assert_eq!(published.delivered, 4);

    let mut sent: Vec<(i64, i64)> = bus
        .published()
        .await
        .iter()
        .map(|r| (r.vmid, r.sample.time))
        .collect();
    sent.sort();
    assert_eq!(sent, vec![(100, 60), (100, 120), (101, 60), (101, 120)]);

    let stored = backend.query_records(RecordFilter::default()).await.unwrap();
    assert!(stored.iter().all(|r| r.sync_status == SyncStatus::Delivered));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_running_tasks_deliver_everything() {
    let server = MockServer::start().await;
    mount_single_node(
        &server,
        &[
            MockGuest::new(200, vec![online(60, 0.1), online(120, 0.2)]),
            MockGuest::new(201, vec![online(60, 0.3)]),
        ],
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let buffer = Arc::new(WriteAheadBuffer::new(dir.path().join("buffer.jsonl")));
    let (backend, manager) = memory_manager().await;
    let bus = Arc::new(FakeBus::default());

    manager
        .add_task(Box::new(MetricsCollector::new(
            pve_client(&server),
            CollectorConfig {
                interval_secs: 3600,
                max_concurrent_fetches: 4,
            },
        )))
        .await;
    manager
        .add_task(Box::new(BufferWriterTask::new(buffer.clone())))
        .await;
    manager
        .add_task(Box::new(BufferDrainTask::new(
            buffer.clone(),
            DrainConfig {
                interval_secs: 1,
                batch_size: 2,
            },
        )))
        .await;
    manager
        .add_task(Box::new(
            OutboxPublisherTask::new(
                PublisherConfig {
                    enabled: true,
                    topic: "pve/out".to_string(),
                    interval_secs: 1,
                },
                MqttConfig::default(),
            )
            .with_bus(bus.clone()),
        ))
        .await;

    manager.start_all().await;

    let delivered = eventually(Duration::from_secs(10), || {
        let bus = bus.clone();
        async move { bus.published().await.len() == 3 }
    })
    .await;

    tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
        .await
        .unwrap();

    assert!(delivered, "all three samples should reach the bus");
    assert_eq!(bus.topics().await.into_iter().collect::<Vec<_>>(), vec!["pve/out".to_string()]);
    assert!(backend.query_pending().await.unwrap().is_empty());
    assert_eq!(manager.get_entry(200).await, Some(online(120, 0.2)));
}
