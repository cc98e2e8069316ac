//! MQTT plumbing for the outbox publisher and the raw ingest consumer
//!
//! rumqttc splits a connection into an `AsyncClient` (request side) and an
//! `EventLoop` that must be polled for anything to happen. The publisher polls
//! its event loop in a background driver task and learns about packet ids and
//! PUBACKs through a channel; the consumer polls its own event loop inline.
//!
//! PUBACK matching lives in `AckTracker`; the ingest loop only sees the
//! consumer through `BusSubscription`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::MqttConfig;
use crate::util;

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 64;

/// Sink for outbox messages
///
/// `publish` resolves `Ok` only once the broker acknowledged the message.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Whether the last connection attempt succeeded
    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<()>;
}

fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        util::client_id(&config.client_prefix),
        config.host.clone(),
        config.port,
    );
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

    if let Some(username) = &config.username {
        options.set_credentials(
            username.clone(),
            config.password.clone().unwrap_or_default(),
        );
    }

    options
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    /// Publish with this packet id went out on the wire
    Sent(u16),
    /// Broker acknowledged this packet id
    Acked(u16),
}

/// Packet id bookkeeping the publisher driver reports for an event
fn ack_event(event: &Event) -> Option<AckEvent> {
    match event {
        Event::Incoming(Packet::PubAck(ack)) => Some(AckEvent::Acked(ack.pkid)),
        Event::Outgoing(Outgoing::Publish(pkid)) => Some(AckEvent::Sent(*pkid)),
        _ => None,
    }
}

/// Pairs each publish with its own PUBACK
///
/// Only one publish is in flight at a time: the first `Sent` after the
/// request was enqueued carries its packet id, and only an `Acked` for that
/// id completes it. Stale acks of earlier, timed out publishes are skipped.
pub struct AckTracker {
    acks: Mutex<mpsc::UnboundedReceiver<AckEvent>>,
    timeout: Duration,
}

impl AckTracker {
    pub fn new(acks: mpsc::UnboundedReceiver<AckEvent>, timeout: Duration) -> Self {
        Self {
            acks: Mutex::new(acks),
            timeout,
        }
    }

    /// Run `enqueue` and wait until the broker acknowledged what it sent
    ///
    /// Returns the packet id of the acknowledged publish.
    pub async fn confirm<F>(&self, enqueue: F) -> Result<u16>
    where
        F: Future<Output = Result<()>> + Send,
    {
        let mut acks = self.acks.lock().await;
        while acks.try_recv().is_ok() {}

        enqueue.await?;

        let deadline = Instant::now() + self.timeout;
        let pkid = wait_for(&mut acks, deadline, |event| match event {
            AckEvent::Sent(pkid) => Some(pkid),
            AckEvent::Acked(_) => None,
        })
        .await?;

        wait_for(&mut acks, deadline, |event| match event {
            AckEvent::Acked(acked) if acked == pkid => Some(acked),
            _ => None,
        })
        .await
    }
}

/// QoS 1 publisher backed by rumqttc
pub struct MqttBus {
    client: AsyncClient,
    tracker: AckTracker,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    ack_timeout: Duration,
}

impl MqttBus {
    /// Create the client and start driving its connection
    ///
    /// Returns immediately; the driver keeps retrying the connection every
    /// `retry_delay_secs` until the broker answers.
    pub fn connect(config: &MqttConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let connected = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));

        let driver = tokio::spawn(drive_publisher(
            eventloop,
            ack_tx,
            connected.clone(),
            closing.clone(),
            config.retry_delay(),
        ));

        info!(
            "connecting publisher to mqtt://{}:{}",
            config.host, config.port
        );

        Self {
            client,
            tracker: AckTracker::new(ack_rx, config.ack_timeout()),
            connected,
            closing,
            driver: Mutex::new(Some(driver)),
            ack_timeout: config.ack_timeout(),
        }
    }
}

#[instrument(skip_all)]
async fn drive_publisher(
    mut eventloop: EventLoop,
    ack_tx: mpsc::UnboundedSender<AckEvent>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    retry_delay: Duration,
) {
    loop {
        let event = eventloop.poll().await;
        if let Some(ack) = event.as_ref().ok().and_then(ack_event) {
            let _ = ack_tx.send(ack);
            continue;
        }

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("publisher connected to broker");
                    connected.store(true, Ordering::SeqCst);
                } else {
                    warn!("broker refused publisher connection: {:?}", ack.code);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("publisher disconnect sent");
                break;
            }
            Ok(event) => trace!("mqtt event: {event:?}"),
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                error!("publisher connection error: {e}, retrying in {retry_delay:?}");
                tokio::time::sleep(retry_delay).await;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    debug!("publisher driver stopped");
}

/// Wait for the next ack event matching `want`, discarding everything else
async fn wait_for(
    acks: &mut mpsc::UnboundedReceiver<AckEvent>,
    deadline: Instant,
    mut want: impl FnMut(AckEvent) -> Option<u16>,
) -> Result<u16> {
    loop {
        match tokio::time::timeout_at(deadline, acks.recv()).await {
            Ok(Some(event)) => {
                if let Some(pkid) = want(event) {
                    return Ok(pkid);
                }
            }
            Ok(None) => bail!("publisher connection driver stopped"),
            Err(_) => bail!("timed out waiting for broker acknowledgement"),
        }
    }
}

#[async_trait]
impl BusPublisher for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            bail!("not connected to broker");
        }

        let enqueue = async {
            self.client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .context("failed to enqueue publish")
        };
        let pkid = self.tracker.confirm(enqueue).await?;

        trace!(pkid, topic, "publish acknowledged");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);

        if let Err(e) = self.client.disconnect().await {
            debug!("disconnect request not delivered: {e}");
        }

        if let Some(mut driver) = self.driver.lock().await.take() {
            if timeout(self.ack_timeout, &mut driver).await.is_err() {
                warn!("publisher driver did not stop in time, aborting it");
                driver.abort();
            }
        }

        info!("publisher disconnected");
        Ok(())
    }
}

/// What the consumer connection reports from one poll
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// (Re)connected; subscriptions have to be renewed
    Connected,

    /// Broker answered a SUBSCRIBE
    Subscribed { accepted: bool },

    /// A message arrived
    Message { topic: String, payload: Vec<u8> },

    /// Connection error; the poll already waited out the retry delay
    ConnectionLost(String),

    /// Anything else (pings, outgoing packets)
    Other,
}

/// Consumer side of the bus as seen by the raw ingest loop
#[async_trait]
pub trait BusSubscription: Send {
    /// Drive the connection until something of interest happens
    ///
    /// Must be cancel safe; it is raced against timers and cancellation.
    async fn next_event(&mut self) -> BusEvent;

    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Unsubscribe from `topic` and disconnect
    async fn close(&mut self, topic: &str);
}

/// Translate a successfully polled consumer event
fn consumer_event(event: Event) -> BusEvent {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
            BusEvent::Connected
        }
        Event::Incoming(Packet::ConnAck(ack)) => {
            warn!("broker refused consumer connection: {:?}", ack.code);
            BusEvent::Other
        }
        Event::Incoming(Packet::SubAck(ack)) => BusEvent::Subscribed {
            accepted: ack
                .return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
        },
        Event::Incoming(Packet::Publish(publish)) => BusEvent::Message {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
        },
        _ => BusEvent::Other,
    }
}

/// Consumer side connection, polled inline by its owner
pub struct MqttSubscription {
    client: AsyncClient,
    eventloop: EventLoop,
    retry_delay: Duration,
}

impl MqttSubscription {
    pub fn new(config: &MqttConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        info!(
            "connecting consumer to mqtt://{}:{}",
            config.host, config.port
        );
        Self {
            client,
            eventloop,
            retry_delay: config.retry_delay(),
        }
    }
}

#[async_trait]
impl BusSubscription for MqttSubscription {
    async fn next_event(&mut self) -> BusEvent {
        match self.eventloop.poll().await {
            Ok(event) => consumer_event(event),
            Err(e) => {
                let message = e.to_string();
                tokio::time::sleep(self.retry_delay).await;
                BusEvent::ConnectionLost(message)
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .context("failed to enqueue subscribe")
    }

    /// Unsubscribe, disconnect and flush both requests to the broker
    #[instrument(skip(self))]
    async fn close(&mut self, topic: &str) {
        if let Err(e) = self.client.unsubscribe(topic).await {
            debug!("unsubscribe not enqueued: {e}");
        }
        if let Err(e) = self.client.disconnect().await {
            debug!("disconnect not enqueued: {e}");
        }

        let limit = self.retry_delay;
        let eventloop = &mut self.eventloop;
        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if timeout(limit, flush).await.is_err() {
            warn!("consumer disconnect did not complete in time");
        }

        info!("consumer disconnected");
    }
}
