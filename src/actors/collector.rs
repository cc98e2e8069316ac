//! MetricsCollector - polls the Proxmox API and feeds the freshness cache
//!
//! ## Poll cycle
//!
//! ```text
//! list nodes ──▶ per node (concurrently)
//!                  └─▶ per category (qemu, then lxc)
//!                        ├─▶ list guests
//!                        ├─▶ fan out: one fetch task per guest (semaphore bounded)
//!                        ├─▶ fan in: mpsc closes when the last fetch drops its sender
//!                        └─▶ apply every online point through Manager::set_entry
//! ```
//!
//! Failures never escape a cycle: a failed node, category or guest is logged
//! and skipped, and its cache entries stay as they were.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::manager::Manager;
use super::messages::{EntryUpdate, PollSummary};
use super::task::Task;
use crate::config::CollectorConfig;
use crate::proxmox::{EntityKind, PveClient, PveResult};
use crate::storage::StorageBackend;
use crate::{EntityId, Sample};

type FetchResult = (EntityId, PveResult<Vec<Sample>>);

pub struct MetricsCollector {
    client: PveClient,
    config: CollectorConfig,
    manager: Option<Arc<Manager>>,
}

impl MetricsCollector {
    pub fn new(client: PveClient, config: CollectorConfig) -> Self {
        Self {
            client,
            config,
            manager: None,
        }
    }

    /// Run one full poll against the API and apply the results
    #[instrument(skip_all)]
    pub async fn poll_once(&self, manager: &Manager) -> PollSummary {
        let nodes = match self.client.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("failed to list nodes: {e}");
                return PollSummary::default();
            }
        };

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_fetches.max(1)));

        let summaries = join_all(
            nodes
                .iter()
                .map(|node| self.poll_node(manager, &node.node, permits.clone())),
        )
        .await;

        summaries
            .into_iter()
            .fold(PollSummary::default(), |mut total, summary| {
                total.merge(summary);
                total
            })
    }

    async fn poll_node(
        &self,
        manager: &Manager,
        node: &str,
        permits: Arc<Semaphore>,
    ) -> PollSummary {
        let mut summary = PollSummary::default();

        for kind in EntityKind::ALL {
            let guests = match self.client.list_entities(node, kind).await {
                Ok(guests) => guests,
                Err(e) => {
                    warn!("failed to list {kind} guests on {node}: {e}");
                    continue;
                }
            };
            trace!("{} {kind} guests on {node}", guests.len());

            let results = self
                .fetch_all(node, kind, guests.into_iter().map(|g| g.vmid), permits.clone())
                .await;

            summary.merge(apply_results(manager, node, kind, results).await);
        }

        summary
    }

    /// Fetch the series of every guest concurrently and collect the results
    async fn fetch_all(
        &self,
        node: &str,
        kind: EntityKind,
        vmids: impl Iterator<Item = EntityId>,
        permits: Arc<Semaphore>,
    ) -> Vec<FetchResult> {
        let vmids: Vec<EntityId> = vmids.collect();
        let (tx, mut rx) = mpsc::channel::<FetchResult>(vmids.len().max(1));

        for vmid in vmids {
            let tx = tx.clone();
            let client = self.client.clone();
            let node = node.to_string();
            let permits = permits.clone();

            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let result = client.fetch_series(&node, kind, vmid).await;
                let _ = tx.send((vmid, result)).await;
            });
        }
        drop(tx);

        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        results
    }
}

async fn apply_results(
    manager: &Manager,
    node: &str,
    kind: EntityKind,
    results: Vec<FetchResult>,
) -> PollSummary {
    let mut summary = PollSummary::default();

    for (vmid, result) in results {
        let series = match result {
            Ok(series) => series,
            Err(e) => {
                warn!("failed to fetch series of {kind} {vmid} on {node}: {e}");
                summary.failed += 1;
                continue;
            }
        };
        summary.fetched += 1;

        for sample in series.into_iter().filter(Sample::is_online) {
            match manager.set_entry(vmid, sample).await {
                EntryUpdate::Applied => summary.applied += 1,
                EntryUpdate::AppliedUnnotified => {
                    summary.applied += 1;
                    summary.unnotified += 1;
                }
                EntryUpdate::Stale => {}
            }
        }
    }

    summary
}

#[async_trait]
impl Task for MetricsCollector {
    fn name(&self) -> &str {
        "metrics-collector"
    }

    async fn setup(
        &mut self,
        _backend: Arc<dyn StorageBackend>,
        manager: Arc<Manager>,
    ) -> anyhow::Result<()> {
        self.manager = Some(manager);
        Ok(())
    }

    #[instrument(skip_all, name = "metrics_collector")]
    async fn run(self: Box<Self>, cancel: CancellationToken) {
        let Some(manager) = self.manager.clone() else {
            error!("collector started without setup");
            return;
        };

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    debug!("polling upstream API");
                    let summary = self.poll_once(&manager).await;
                    info!(
                        fetched = summary.fetched,
                        failed = summary.failed,
                        applied = summary.applied,
                        unnotified = summary.unnotified,
                        "poll finished"
                    );
                }
            }
        }

        debug!("collector stopped");
    }
}
