//! Integration tests for the read-only HTTP surface
//!
//! These tests verify that:
//! - The server binds and answers on a random port
//! - `/api/v1/data` filters stored records and rejects bad queries
//! - `/api/v1/manager` mirrors the freshness cache
//! - `/api/v1/health` reports the cache size and storage state

use std::net::SocketAddr;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use pve_telemetry::{
    BufferedRecord,
    actors::Manager,
    api::{ApiState, DataResponse, HealthResponse, spawn_api_server},
    storage::{RecordRow, StorageBackend, memory::MemoryBackend},
};
use reqwest::StatusCode;
use serde_json::Value;

use crate::helpers::*;

async fn spawn_test_api() -> (SocketAddr, Arc<MemoryBackend>, Arc<Manager>) {
    let (backend, manager) = memory_manager().await;
    let addr = spawn_api_server(
        "127.0.0.1:0".parse().unwrap(),
        ApiState::new(manager.clone()),
    )
    .await
    .unwrap();
    (addr, backend, manager)
}

async fn seed(backend: &MemoryBackend) {
    let rows = [(100, 60), (100, 120), (101, 60), (101, 120), (102, 90)]
        .into_iter()
        .map(|(vmid, time)| RecordRow::from_buffered(BufferedRecord::new(vmid, online(time, 0.3))))
        .collect();
    backend.insert_batch(rows).await.unwrap();
}

#[tokio::test]
async fn test_data_endpoint_filters_records() {
    let (addr, backend, _) = spawn_test_api().await;
    seed(&backend).await;

    let response = reqwest::get(format!(
        "http://{addr}/api/v1/data?vmids=100,102&from=60&to=100"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let data: DataResponse = response.json().await.unwrap();
    let got: Vec<(i64, i64)> = data
        .items
        .iter()
        .map(|r| (r.vmid, r.sample.time))
        .collect();
    assert_eq!(got, vec![(102, 90), (100, 60)]);
}

#[tokio::test]
async fn test_data_endpoint_applies_limit() {
    let (addr, backend, _) = spawn_test_api().await;
    seed(&backend).await;

    let data: DataResponse = reqwest::get(format!("http://{addr}/api/v1/data?limit=2"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(data.items.len(), 2);
    assert!(data.items.iter().all(|r| r.sample.time == 120));
}

#[tokio::test]
async fn test_data_endpoint_rejects_inverted_range() {
    let (addr, _, _) = spawn_test_api().await;

    let response = reqwest::get(format!("http://{addr}/api/v1/data?from=200&to=100"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("from"));
}

#[tokio::test]
async fn test_manager_endpoint_mirrors_cache() {
    let (addr, _, manager) = spawn_test_api().await;
    manager.set_entry(100, online(60, 0.1)).await;
    manager.set_entry(100, online(120, 0.2)).await;
    manager.set_entry(101, online(30, 0.9)).await;

    let body: Value = reqwest::get(format!("http://{addr}/api/v1/manager"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body.as_object().unwrap().len(), 2);
    assert_eq!(body["100"]["time"], 120);
    assert_eq!(body["100"]["cpu"], 0.2);
    assert_eq!(body["101"]["maxmem"], 2048.0);
}

#[tokio::test]
async fn test_health_endpoint_counts_guests() {
    let (addr, _, manager) = spawn_test_api().await;
    manager.set_entry(1, online(10, 0.1)).await;
    manager.set_entry(2, online(10, 0.1)).await;

    let health: HealthResponse = reqwest::get(format!("http://{addr}/api/v1/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(health.status, "ok");
    assert_eq!(health.guests, 2);
    assert!(health.storage.healthy);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (addr, _, _) = spawn_test_api().await;

    let response = reqwest::get(format!("http://{addr}/api/v1/servers"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
