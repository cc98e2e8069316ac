//! Task scheduler and owner of the freshness cache
//!
//! The manager holds the latest sample per guest, hands out the single change
//! notifier receiver, and runs every registered [`Task`] until shutdown.
//!
//! ```text
//! set_entry ──▶ [ cache (RwLock) ] ── accepted ──▶ notifier (bounded, lossy)
//!                                                      │
//!                                                      ▼
//!                                              buffer writer task
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::messages::{ChangeEvent, EntryUpdate};
use super::task::Task;
use crate::cache::FreshnessCache;
use crate::storage::StorageBackend;
use crate::{EntityId, Sample};

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Capacity of the change notifier
    pub notifier_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            notifier_capacity: 300,
        }
    }
}

pub struct Manager {
    cache: RwLock<FreshnessCache>,
    notifier: mpsc::Sender<ChangeEvent>,
    change_rx: Mutex<Option<mpsc::Receiver<ChangeEvent>>>,
    backend: Arc<dyn StorageBackend>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<Box<dyn Task>>>,
    running: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Manager {
    /// Create a manager whose cache is hydrated from storage
    ///
    /// Fails if the latest samples cannot be loaded.
    #[instrument(skip_all)]
    pub async fn new(
        backend: Arc<dyn StorageBackend>,
        options: ManagerOptions,
    ) -> anyhow::Result<Self> {
        let latest = backend
            .latest_per_entity()
            .await
            .context("failed to load latest samples from storage")?;

        let cache: FreshnessCache = latest.into_iter().collect();
        info!("hydrated cache with {} guests", cache.len());

        let (notifier, change_rx) = mpsc::channel(options.notifier_capacity.max(1));

        Ok(Self {
            cache: RwLock::new(cache),
            notifier,
            change_rx: Mutex::new(Some(change_rx)),
            backend,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
        })
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    /// Register a task; it starts with the next `start_all`
    pub async fn add_task(&self, task: Box<dyn Task>) {
        debug!("registered task {}", task.name());
        self.tasks.lock().await.push(task);
    }

    /// Set up every registered task and spawn its run loop
    pub async fn start_all(self: &Arc<Self>) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        let mut running = self.running.lock().await;

        for mut task in tasks {
            let name = task.name().to_string();
            let cancel = self.cancel.child_token();

            let handle = match task.setup(self.backend.clone(), self.clone()).await {
                Ok(()) => {
                    info!("starting task {name}");
                    tokio::spawn(task.run(cancel))
                }
                Err(e) => {
                    error!("task {name} could not be set up, idling until shutdown: {e:#}");
                    tokio::spawn(async move { cancel.cancelled().await })
                }
            };

            running.push((name, handle));
        }
    }

    /// Signal every task to stop
    pub fn stop_all(&self) {
        info!("stopping all tasks");
        self.cancel.cancel();
    }

    /// Wait until every started task returned
    pub async fn wait(&self) {
        let running = std::mem::take(&mut *self.running.lock().await);
        for (name, handle) in running {
            match handle.await {
                Ok(()) => debug!("task {name} stopped"),
                Err(e) => error!("task {name} terminated abnormally: {e}"),
            }
        }
    }

    pub async fn shutdown(&self) {
        self.stop_all();
        self.wait().await;
        info!("all tasks stopped");
    }

    pub async fn get_entry(&self, vmid: EntityId) -> Option<Sample> {
        self.cache.read().await.get(vmid).cloned()
    }

    /// Offer a sample to the cache and announce it if it was accepted
    ///
    /// The notifier is fed while the write lock is held, so change events of
    /// one guest are queued in acceptance order.
    pub async fn set_entry(&self, vmid: EntityId, sample: Sample) -> EntryUpdate {
        let mut cache = self.cache.write().await;
        if !cache.apply(vmid, sample.clone()) {
            return EntryUpdate::Stale;
        }

        match self.notifier.try_send(ChangeEvent::new(vmid, sample)) {
            Ok(()) => EntryUpdate::Applied,
            Err(TrySendError::Full(event)) => {
                warn!(
                    vmid,
                    time = event.sample.time,
                    "change notifier full, sample will not be buffered"
                );
                EntryUpdate::AppliedUnnotified
            }
            Err(TrySendError::Closed(_)) => {
                debug!(vmid, "no buffer writer listening");
                EntryUpdate::AppliedUnnotified
            }
        }
    }

    /// Copy of the whole cache
    pub async fn snapshot(&self) -> HashMap<EntityId, Sample> {
        self.cache.read().await.snapshot()
    }

    /// Hand out the notifier receiver; only the first caller gets it
    pub async fn take_change_receiver(&self) -> Option<mpsc::Receiver<ChangeEvent>> {
        self.change_rx.lock().await.take()
    }
}
