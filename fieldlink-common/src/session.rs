//! MQTT session management.
//!
//! [`BusConnector`] and [`BusSession`] are the seams the supervisors are
//! written against; [`MqttConnector`] / [`MqttSession`] implement them on top
//! of `rumqttc`.
//!
//! A connected [`MqttSession`] owns a background task driving the rumqttc
//! event loop. That task is the single delivery context for subscription
//! handlers and the place where publish acknowledgments are matched to the
//! callers waiting on them. Dropping a session without calling
//! [`BusSession::disconnect`] aborts the task and closes the socket without a
//! DISCONNECT packet, so the broker publishes the last will.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{LastWillConfig, MqttConfig, QosLevel};
use crate::error::{Error, Result};
use crate::telemetry::StatusRecord;
use crate::topic::matches_filter;

/// Callback invoked for every message matching a subscription.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Capacity of the rumqttc request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// A connected message-bus session.
#[async_trait]
pub trait BusSession: Send + Sync {
    /// Publish a payload and wait until the broker acknowledged it
    /// (PUBACK for QoS 1, PUBCOMP for QoS 2, socket write for QoS 0).
    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<()>;

    /// Subscribe to a filter; `handler` runs for each matching message.
    async fn subscribe(&self, filter: &str, qos: QosLevel, handler: MessageHandler) -> Result<()>;

    /// Disconnect cleanly, waiting at most `grace` for the broker.
    async fn disconnect(&self, grace: Duration);

    /// Resolves once the session is no longer usable.
    async fn closed(&self);

    fn is_closed(&self) -> bool;

    /// Publish a retained status record.
    async fn publish_status(&self, topic: &str, qos: QosLevel, status: StatusRecord) -> Result<()> {
        self.publish(topic, qos, true, status.to_json()?).await
    }
}

/// Factory for [`BusSession`]s.
#[async_trait]
pub trait BusConnector: Send + Sync {
    type Session: BusSession + 'static;

    /// Connect to the broker, arming `will` if given.
    async fn connect(
        &self,
        config: &MqttConfig,
        will: Option<LastWillConfig>,
    ) -> Result<Self::Session>;
}

/// Connects [`MqttSession`]s with rumqttc.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

#[async_trait]
impl BusConnector for MqttConnector {
    type Session = MqttSession;

    async fn connect(
        &self,
        config: &MqttConfig,
        will: Option<LastWillConfig>,
    ) -> Result<MqttSession> {
        MqttSession::connect(config, will).await
    }
}

struct PendingAck {
    qos: QosLevel,
    tx: oneshot::Sender<Result<()>>,
}

/// Matches outgoing publishes to the broker's acknowledgments.
///
/// Requests leave rumqttc in the order they were queued, so the n-th
/// `Outgoing::Publish` belongs to the n-th registered waiter.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<PendingAck>,
    inflight: HashMap<u16, oneshot::Sender<Result<()>>>,
}

impl AckTracker {
    fn register(&mut self, qos: QosLevel) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(PendingAck { qos, tx });
        rx
    }

    fn unregister_last(&mut self) {
        self.queued.pop_back();
    }

    fn sent(&mut self, pkid: u16) {
        let Some(pending) = self.queued.pop_front() else {
            return;
        };
        if pending.qos == QosLevel::AtMostOnce || pkid == 0 {
            let _ = pending.tx.send(Ok(()));
        } else {
            self.inflight.insert(pkid, pending.tx);
        }
    }

    fn acknowledged(&mut self, pkid: u16) {
        if let Some(tx) = self.inflight.remove(&pkid) {
            let _ = tx.send(Ok(()));
        }
    }

    fn fail_all(&mut self) {
        for pending in self.queued.drain(..) {
            let _ = pending.tx.send(Err(Error::SessionClosed));
        }
        for (_, tx) in self.inflight.drain() {
            let _ = tx.send(Err(Error::SessionClosed));
        }
    }
}

struct Subscription {
    filter: String,
    handler: MessageHandler,
}

/// A live rumqttc connection.
pub struct MqttSession {
    client: AsyncClient,
    broker: String,
    acks: Arc<Mutex<AckTracker>>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    publish_lock: tokio::sync::Mutex<()>,
    closed: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    ack_timeout: Duration,
}

impl std::fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSession")
            .field("broker", &self.broker)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl MqttSession {
    /// Connect to the broker and wait for CONNACK.
    pub async fn connect(config: &MqttConfig, will: Option<LastWillConfig>) -> Result<Self> {
        let (host, port) = config.broker_endpoint()?;
        let broker = format!("{}:{}", host, port);

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(config.clean_session);
        if let Some(will) = will {
            options.set_last_will(LastWill::new(
                will.topic,
                will.payload.into_bytes(),
                will.qos.into(),
                will.retain,
            ));
        }

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        tracing::info!(
            broker = %broker,
            client_id = %config.client_id,
            clean_session = config.clean_session,
            "Connecting to MQTT broker"
        );

        match tokio::time::timeout(config.connect_timeout(), wait_for_connack(&mut event_loop))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(Error::Connect { broker, message }),
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    broker,
                    timeout_ms: config.connect_timeout_ms,
                });
            }
        }

        tracing::info!(broker = %broker, "Connected to MQTT broker");

        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let subscriptions = Arc::new(RwLock::new(Vec::new()));
        let closed = CancellationToken::new();

        let driver = tokio::spawn(drive_event_loop(
            event_loop,
            broker.clone(),
            acks.clone(),
            subscriptions.clone(),
            closed.clone(),
        ));

        Ok(Self {
            client,
            broker,
            acks,
            subscriptions,
            publish_lock: tokio::sync::Mutex::new(()),
            closed,
            driver: Mutex::new(Some(driver)),
            ack_timeout: config.ack_timeout(),
        })
    }

    fn abort_driver(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

#[async_trait]
impl BusSession for MqttSession {
    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<()> {
        let ack = {
            let _guard = self.publish_lock.lock().await;
            if self.closed.is_cancelled() {
                return Err(Error::SessionClosed);
            }

            let ack = self.acks.lock().register(qos);
            if let Err(e) = self.client.publish(topic, qos.into(), retain, payload).await {
                self.acks.lock().unregister_last();
                return Err(Error::Publish {
                    topic: topic.to_string(),
                    message: e.to_string(),
                });
            }
            ack
        };

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => Err(Error::AckTimeout {
                topic: topic.to_string(),
                timeout_ms: self.ack_timeout.as_millis() as u64,
            }),
        }
    }

    async fn subscribe(&self, filter: &str, qos: QosLevel, handler: MessageHandler) -> Result<()> {
        self.subscriptions.write().push(Subscription {
            filter: filter.to_string(),
            handler,
        });

        self.client
            .subscribe(filter, qos.into())
            .await
            .map_err(|e| Error::Subscribe {
                filter: filter.to_string(),
                message: e.to_string(),
            })?;

        tracing::debug!(filter = %filter, qos = u8::from(qos), "Subscribed");
        Ok(())
    }

    async fn disconnect(&self, grace: Duration) {
        if !self.closed.is_cancelled() {
            match tokio::time::timeout(grace, self.client.disconnect()).await {
                Ok(Ok(())) => {
                    let _ = tokio::time::timeout(grace, self.closed.cancelled()).await;
                }
                Ok(Err(e)) => {
                    tracing::debug!(broker = %self.broker, error = %e, "Disconnect request failed");
                }
                Err(_) => {
                    tracing::debug!(broker = %self.broker, "Disconnect request timed out");
                }
            }
        }

        self.abort_driver();
        self.closed.cancel();
        self.acks.lock().fail_all();
        tracing::info!(broker = %self.broker, "Disconnected from MQTT broker");
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.abort_driver();
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> std::result::Result<(), String> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("broker refused connection: {:?}", ack.code))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    broker: String,
    acks: Arc<Mutex<AckTracker>>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    closed: CancellationToken,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let subscriptions = subscriptions.read();
                for subscription in subscriptions
                    .iter()
                    .filter(|s| matches_filter(&s.filter, &publish.topic))
                {
                    (subscription.handler)(&publish.topic, &publish.payload);
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.lock().acknowledged(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => acks.lock().acknowledged(comp.pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.lock().sent(pkid),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!(broker = %broker, "Broker sent disconnect");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!(broker = %broker, "Sent disconnect");
                break;
            }
            Ok(event) => {
                tracing::trace!(broker = %broker, ?event, "MQTT event");
            }
            Err(e) => {
                tracing::warn!(broker = %broker, error = %e, "MQTT connection lost");
                break;
            }
        }
    }

    acks.lock().fail_all();
    closed.cancel();
}
