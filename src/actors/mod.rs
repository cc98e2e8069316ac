//! Task-based telemetry pipeline
//!
//! Every component is a [`Task`](task::Task) run by the [`Manager`](manager::Manager)
//! in its own tokio task. Tasks share nothing but the manager (cache and change
//! notifier), the write-ahead buffer and the storage backend.
//!
//! ## Architecture Overview
//!
//! ```text
//!   Proxmox API
//!       │ poll (fan-out / fan-in)
//!       ▼
//! ┌─────────────────┐  set_entry   ┌──────────────────────┐
//! │ MetricsCollector│ ───────────▶ │ Manager (cache)      │
//! └─────────────────┘              └──────────┬───────────┘
//!                                             │ change notifier (bounded, lossy)
//!                                             ▼
//!                                  ┌──────────────────────┐
//!                                  │ BufferWriterTask     │──▶ buffer.jsonl
//!                                  └──────────────────────┘        │
//!                                  ┌──────────────────────┐        │
//!                                  │ BufferDrainTask      │◀───────┘
//!                                  └──────────┬───────────┘
//!                                             │ insert_batch (pending)
//!                                             ▼
//!                                         records ──▶ OutboxPublisherTask ──▶ MQTT
//!
//!   MQTT ──▶ RawIngestTask ──▶ raw_records
//! ```
//!
//! ## Task Types
//!
//! - **MetricsCollector**: Polls the upstream API and applies fresh samples
//! - **BufferWriterTask**: Appends each accepted sample to the buffer file
//! - **BufferDrainTask**: Moves the buffer into storage in batches
//! - **OutboxPublisherTask**: Publishes pending records and marks them delivered
//! - **RawIngestTask**: Stores samples received on the raw topic

pub mod buffer;
pub mod collector;
pub mod drain;
pub mod manager;
pub mod messages;
pub mod publisher;
pub mod subscriber;
pub mod task;

pub use buffer::BufferWriterTask;
pub use collector::MetricsCollector;
pub use drain::BufferDrainTask;
pub use manager::{Manager, ManagerOptions};
pub use publisher::OutboxPublisherTask;
pub use subscriber::RawIngestTask;
pub use task::Task;
