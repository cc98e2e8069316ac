//! Integration tests for SQLite persistence
//!
//! These tests verify that:
//! - Drained buffer records land in SQLite as pending rows
//! - Delivery status survives a reopen
//! - The cache is rebuilt from storage after a restart
//! - Raw ingest and the filtered read surface work on a real database

use std::sync::Arc;

use pretty_assertions::assert_eq;
use pve_telemetry::{
    BufferedRecord, Sample,
    actors::{drain::drain_buffer, publisher::publish_pending, subscriber::ingest_message},
    storage::{RecordFilter, RecordRow, StorageBackend, SyncStatus, sqlite::SqliteBackend},
    wal::WriteAheadBuffer,
};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

#[tokio::test]
async fn test_drained_records_persist_across_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("telemetry.db");

    let buffer = WriteAheadBuffer::new(dir.path().join("buffer.jsonl"));
    buffer.open().await.unwrap();
    for (vmid, time) in [(100, 60), (100, 120), (101, 60)] {
        buffer
            .append(&BufferedRecord::new(vmid, online(time, 0.25)))
            .await
            .unwrap();
    }

    {
        let backend = SqliteBackend::new(&db_path).await.unwrap();
        let report = drain_buffer(&buffer, &backend, 2).await.unwrap();
        assert_eq!((report.records, report.batches), (3, 2));
        backend.close().await.unwrap();
    }

    let backend = SqliteBackend::new(&db_path).await.unwrap();
    let pending = backend.query_pending().await.unwrap();

    assert_eq!(pending.len(), 3);
    assert!(pending.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(pending[0].vmid, 100);
    assert_eq!(pending[0].sample, online(60, 0.25));
    assert!(pending.iter().all(|r| r.sync_status == SyncStatus::Pending));
}

#[tokio::test]
async fn test_delivered_status_survives_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("telemetry.db");

    {
        let backend = SqliteBackend::new(&db_path).await.unwrap();
        backend
            .insert_batch(
                (1..=3)
                    .map(|i| {
                        RecordRow::from_buffered(BufferedRecord::new(
                            i,
                            online(i * 60, 0.1),
                        ))
                    })
                    .collect(),
            )
            .await
            .unwrap();

        let bus = FakeBus::default();
        bus.drop_acks_for(3).await;
        let report = publish_pending(&backend, &bus, "out", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!((report.delivered, report.failed), (2, 1));
        backend.close().await.unwrap();
    }

    let backend = SqliteBackend::new(&db_path).await.unwrap();
    let pending: Vec<i64> = backend
        .query_pending()
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(pending, vec![3]);

    assert!(!backend.mark_delivered(1).await.unwrap());
    assert!(backend.mark_delivered(3).await.unwrap());
    assert!(backend.query_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_manager_rebuilds_cache_after_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("telemetry.db");

    {
        let backend = SqliteBackend::new(&db_path).await.unwrap();
        let rows = [(100, 60), (100, 180), (100, 120), (101, 30)]
            .into_iter()
            .map(|(vmid, time)| {
                RecordRow::from_buffered(BufferedRecord::new(
                    vmid,
                    online(time, 0.5),
                ))
            })
            .collect();
        backend.insert_batch(rows).await.unwrap();
        backend.close().await.unwrap();
    }

    let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let manager = manager_on(backend).await;

    assert_eq!(manager.get_entry(100).await, Some(online(180, 0.5)));
    assert_eq!(manager.get_entry(101).await, Some(online(30, 0.5)));

    // hydrated values take part in the freshness rule
    assert!(!manager.set_entry(100, online(180, 0.9)).await.is_applied());
    assert!(manager.set_entry(100, online(240, 0.9)).await.is_applied());
}

#[tokio::test]
async fn test_query_records_filters_and_orders() {
    let dir = tempdir().unwrap();
    let backend = SqliteBackend::new(dir.path().join("telemetry.db"))
        .await
        .unwrap();

    let rows = (0..10)
        .map(|i| {
            RecordRow::from_buffered(BufferedRecord::new(
                100 + i % 2,
                Sample::at(i * 10),
            ))
        })
        .collect();
    backend.insert_batch(rows).await.unwrap();

    let records = backend
        .query_records(RecordFilter {
            vmids: vec![101],
            from: Some(20),
            to: Some(70),
            limit: None,
        })
        .await
        .unwrap();
    let times: Vec<i64> = records.iter().map(|r| r.sample.time).collect();
    assert_eq!(times, vec![70, 50, 30]);
    assert!(records.iter().all(|r| r.vmid == 101));

    let limited = backend
        .query_records(RecordFilter {
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        limited.iter().map(|r| r.sample.time).collect::<Vec<_>>(),
        vec![90, 80]
    );
}

#[tokio::test]
async fn test_raw_ingest_persists_topic() {
    let dir = tempdir().unwrap();
    let backend = SqliteBackend::new(dir.path().join("telemetry.db"))
        .await
        .unwrap();

    let payload = serde_json::to_vec(&BufferedRecord::new(7, online(99, 0.4))).unwrap();
    ingest_message(&backend, "pve/telemetry/raw", &payload)
        .await
        .unwrap();
    assert!(
        ingest_message(&backend, "pve/telemetry/raw", b"{\"oops\":")
            .await
            .is_err()
    );

    let raw = backend.query_raw(10).await.unwrap();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].vmid, 7);
    assert_eq!(raw[0].topic, "pve/telemetry/raw");
    assert_eq!(raw[0].sample, online(99, 0.4));

    // raw samples never enter the outbox
    assert!(backend.query_pending().await.unwrap().is_empty());
}
