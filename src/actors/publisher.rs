//! OutboxPublisherTask - delivers pending stored records to the message bus
//!
//! Each cycle scans the `pending` records in id order. A record is marked
//! `delivered` only after the broker acknowledged its publish; if the status
//! update fails afterwards the record stays pending and goes out again next
//! cycle (at-least-once).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::manager::Manager;
use super::messages::PublishReport;
use super::task::Task;
use crate::bus::{BusPublisher, MqttBus};
use crate::config::{MqttConfig, PublisherConfig};
use crate::storage::StorageBackend;

/// Publish every pending record once
///
/// Stops early (with a partial report) when `cancel` fires between records.
#[instrument(skip_all, fields(topic = %topic))]
pub async fn publish_pending(
    backend: &dyn StorageBackend,
    bus: &dyn BusPublisher,
    topic: &str,
    cancel: &CancellationToken,
) -> Result<PublishReport> {
    let pending = backend
        .query_pending()
        .await
        .context("failed to query pending records")?;

    let mut report = PublishReport::default();
    if pending.is_empty() {
        return Ok(report);
    }
    trace!("{} pending records", pending.len());

    for record in pending {
        if cancel.is_cancelled() {
            debug!("publish cycle interrupted by shutdown");
            break;
        }

        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(e) => {
                error!(id = record.id, "failed to encode record: {e}");
                report.failed += 1;
                continue;
            }
        };

        if let Err(e) = bus.publish(topic, payload).await {
            warn!(id = record.id, "publish failed, record stays pending: {e:#}");
            report.failed += 1;
            continue;
        }

        match backend.mark_delivered(record.id).await {
            Ok(true) => report.delivered += 1,
            Ok(false) => debug!(id = record.id, "record was no longer pending"),
            Err(e) => {
                error!(
                    id = record.id,
                    "published but failed to mark delivered, will be republished: {e}"
                );
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

pub struct OutboxPublisherTask {
    config: PublisherConfig,
    mqtt: MqttConfig,
    bus: Option<Arc<dyn BusPublisher>>,
    backend: Option<Arc<dyn StorageBackend>>,
}

impl OutboxPublisherTask {
    pub fn new(config: PublisherConfig, mqtt: MqttConfig) -> Self {
        Self {
            config,
            mqtt,
            bus: None,
            backend: None,
        }
    }

    /// Use an existing bus connection instead of opening one in `setup`
    pub fn with_bus(mut self, bus: Arc<dyn BusPublisher>) -> Self {
        self.bus = Some(bus);
        self
    }
}

#[async_trait]
impl Task for OutboxPublisherTask {
    fn name(&self) -> &str {
        "outbox-publisher"
    }

    async fn setup(
        &mut self,
        backend: Arc<dyn StorageBackend>,
        _manager: Arc<Manager>,
    ) -> anyhow::Result<()> {
        if self.bus.is_none() {
            self.bus = Some(Arc::new(MqttBus::connect(&self.mqtt)));
        }
        self.backend = Some(backend);
        Ok(())
    }

    #[instrument(skip_all, name = "outbox_publisher")]
    async fn run(self: Box<Self>, cancel: CancellationToken) {
        let (Some(backend), Some(bus)) = (self.backend.clone(), self.bus.clone()) else {
            error!("outbox publisher started without setup");
            return;
        };

        info!("publishing pending records to {}", self.config.topic);

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if !bus.is_connected() {
                        debug!("broker not connected, skipping cycle");
                        continue;
                    }

                    let cycle =
                        publish_pending(backend.as_ref(), bus.as_ref(), &self.config.topic, &cancel)
                            .await;
                    match cycle {
                        Ok(report) if report.delivered > 0 || report.failed > 0 => info!(
                            delivered = report.delivered,
                            failed = report.failed,
                            "outbox cycle finished"
                        ),
                        Ok(_) => {}
                        Err(e) => error!("outbox cycle aborted: {e:#}"),
                    }
                }
            }
        }

        if let Err(e) = bus.disconnect().await {
            warn!("failed to disconnect publisher: {e:#}");
        }
        debug!("outbox publisher stopped");
    }
}
