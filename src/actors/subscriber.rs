//! RawIngestTask - stores samples arriving on the raw ingest topic
//!
//! Runs on its own broker connection and touches nothing but `raw_records`,
//! so a slow broker or database on this path never stalls the collector.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::{Sleep, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::manager::Manager;
use super::task::Task;
use crate::BufferedRecord;
use crate::bus::{BusEvent, BusSubscription, MqttSubscription};
use crate::config::{MqttConfig, SubscriberConfig};
use crate::storage::{RawRecord, StorageBackend};

/// Decode one message and store it as a raw record
pub async fn ingest_message(
    backend: &dyn StorageBackend,
    topic: &str,
    payload: &[u8],
) -> Result<()> {
    let record: BufferedRecord =
        serde_json::from_slice(payload).context("payload is not a sample record")?;

    trace!(vmid = record.vmid, time = record.sample.time, "ingesting raw sample");

    backend
        .insert_raw(RawRecord::from_message(record, topic))
        .await
        .context("failed to store raw record")
}

/// Keep `config.topic` subscribed and store whatever arrives on it
///
/// Subscribes after every (re)connect. A failed or rejected subscription is
/// retried after `config.retry_delay()`. On cancellation the subscription is
/// closed (unsubscribe, then disconnect) before returning.
pub async fn consume<S>(
    subscription: &mut S,
    backend: &dyn StorageBackend,
    config: &SubscriberConfig,
    cancel: &CancellationToken,
) where
    S: BusSubscription + ?Sized,
{
    let retry_delay = config.retry_delay();
    let mut resubscribe: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = retry_elapsed(&mut resubscribe) => {
                resubscribe = subscribe_or_retry(subscription, &config.topic, retry_delay).await;
            }

            event = subscription.next_event() => match event {
                BusEvent::Connected => {
                    info!("connected, subscribing");
                    resubscribe =
                        subscribe_or_retry(subscription, &config.topic, retry_delay).await;
                }
                BusEvent::Subscribed { accepted: true } => debug!("subscription accepted"),
                BusEvent::Subscribed { accepted: false } => {
                    warn!("broker rejected subscription, retrying in {retry_delay:?}");
                    resubscribe = Some(Box::pin(sleep(retry_delay)));
                }
                BusEvent::Message { topic, payload } => {
                    if let Err(e) = ingest_message(backend, &topic, &payload).await {
                        warn!("dropping message on {topic}: {e:#}");
                    }
                }
                BusEvent::ConnectionLost(reason) => warn!("consumer connection lost: {reason}"),
                BusEvent::Other => {}
            }
        }
    }

    subscription.close(&config.topic).await;
}

async fn subscribe_or_retry<S>(
    subscription: &mut S,
    topic: &str,
    retry_delay: Duration,
) -> Option<Pin<Box<Sleep>>>
where
    S: BusSubscription + ?Sized,
{
    match subscription.subscribe(topic).await {
        Ok(()) => None,
        Err(e) => {
            warn!("subscribe failed, retrying in {retry_delay:?}: {e:#}");
            Some(Box::pin(sleep(retry_delay)))
        }
    }
}

/// Resolves when the pending resubscribe delay is over; never without one
async fn retry_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(timer) => timer.await,
        None => std::future::pending().await,
    }
}

pub struct RawIngestTask {
    config: SubscriberConfig,
    mqtt: MqttConfig,
    backend: Option<Arc<dyn StorageBackend>>,
}

impl RawIngestTask {
    pub fn new(config: SubscriberConfig, mqtt: MqttConfig) -> Self {
        Self {
            config,
            mqtt,
            backend: None,
        }
    }
}

#[async_trait]
impl Task for RawIngestTask {
    fn name(&self) -> &str {
        "raw-ingest"
    }

    async fn setup(
        &mut self,
        backend: Arc<dyn StorageBackend>,
        _manager: Arc<Manager>,
    ) -> anyhow::Result<()> {
        self.backend = Some(backend);
        Ok(())
    }

    #[instrument(skip_all, name = "raw_ingest", fields(topic = %self.config.topic))]
    async fn run(self: Box<Self>, cancel: CancellationToken) {
        let Some(backend) = self.backend.clone() else {
            error!("raw ingest started without setup");
            return;
        };

        let mut subscription = MqttSubscription::new(&self.mqtt);
        consume(&mut subscription, backend.as_ref(), &self.config, &cancel).await;
        debug!("raw ingest stopped");
    }
}
