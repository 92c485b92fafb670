//! In-memory message bus for tests.
//!
//! [`MemoryBroker`] implements just enough broker behaviour for supervisor and
//! subscriber tests: retained messages, filter-based delivery, last wills on
//! ungraceful drop, refused connects and failing publishes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{LastWillConfig, MqttConfig, QosLevel};
use crate::error::{Error, Result};
use crate::session::{BusConnector, BusSession, MessageHandler};
use crate::topic::matches_filter;

/// A message seen by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPublish {
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub retain: bool,
}

impl RecordedPublish {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// One call to [`BusConnector::connect`].
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub client_id: String,
    pub at: Instant,
    pub will: Option<LastWillConfig>,
    pub accepted: bool,
}

struct SessionSlot {
    id: u64,
    subscriptions: Vec<(String, MessageHandler)>,
    closed: CancellationToken,
}

#[derive(Default)]
struct BrokerState {
    published: Vec<RecordedPublish>,
    retained: HashMap<String, Vec<u8>>,
    sessions: Vec<SessionSlot>,
    attempts: Vec<ConnectAttempt>,
    refuse_connects: usize,
    fail_publishes: bool,
    next_id: u64,
}

/// Shared handle to an in-memory broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Refuse the next `count` connect attempts.
    pub fn refuse_next_connects(&self, count: usize) {
        self.state.lock().refuse_connects = count;
    }

    /// Make every publish fail (as if no acknowledgment arrived).
    pub fn set_fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    pub fn published(&self) -> Vec<RecordedPublish> {
        self.state.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<RecordedPublish> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Retained payload currently stored for `topic`.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().retained.get(topic).cloned()
    }

    pub fn connect_attempts(&self) -> Vec<ConnectAttempt> {
        self.state.lock().attempts.clone()
    }

    /// Number of sessions currently connected.
    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Publish from an external client.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        self.deliver(RecordedPublish {
            client_id: "external".to_string(),
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: QosLevel::AtMostOnce,
            retain: false,
        });
    }

    /// Drop every connection, as if the broker restarted.
    pub fn drop_connections(&self) {
        let sessions = std::mem::take(&mut self.state.lock().sessions);
        for slot in sessions {
            slot.closed.cancel();
        }
    }

    fn deliver(&self, message: RecordedPublish) {
        let handlers: Vec<MessageHandler> = {
            let mut state = self.state.lock();
            if message.retain {
                state
                    .retained
                    .insert(message.topic.clone(), message.payload.clone());
            }
            state.published.push(message.clone());
            state
                .sessions
                .iter()
                .flat_map(|s| s.subscriptions.iter())
                .filter(|(filter, _)| matches_filter(filter, &message.topic))
                .map(|(_, handler)| handler.clone())
                .collect()
        };

        for handler in handlers {
            handler(&message.topic, &message.payload);
        }
    }

    fn remove_session(&self, id: u64) {
        self.state.lock().sessions.retain(|s| s.id != id);
    }
}

/// [`BusConnector`] for a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl BusConnector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(
        &self,
        config: &MqttConfig,
        will: Option<LastWillConfig>,
    ) -> Result<MemorySession> {
        let mut state = self.broker.state.lock();
        let accepted = state.refuse_connects == 0;
        state.attempts.push(ConnectAttempt {
            client_id: config.client_id.clone(),
            at: Instant::now(),
            will: will.clone(),
            accepted,
        });

        if !accepted {
            state.refuse_connects -= 1;
            return Err(Error::Connect {
                broker: "memory".to_string(),
                message: "connection refused".to_string(),
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        let closed = CancellationToken::new();
        state.sessions.push(SessionSlot {
            id,
            subscriptions: Vec::new(),
            closed: closed.clone(),
        });

        Ok(MemorySession {
            id,
            client_id: config.client_id.clone(),
            broker: self.broker.clone(),
            will,
            closed,
            graceful: AtomicBool::new(false),
        })
    }
}

/// A session on a [`MemoryBroker`].
pub struct MemorySession {
    id: u64,
    client_id: String,
    broker: MemoryBroker,
    will: Option<LastWillConfig>,
    closed: CancellationToken,
    graceful: AtomicBool,
}

#[async_trait]
impl BusSession for MemorySession {
    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        if self.broker.state.lock().fail_publishes {
            return Err(Error::AckTimeout {
                topic: topic.to_string(),
                timeout_ms: 0,
            });
        }

        self.broker.deliver(RecordedPublish {
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: QosLevel, handler: MessageHandler) -> Result<()> {
        let mut state = self.broker.state.lock();
        match state.sessions.iter_mut().find(|s| s.id == self.id) {
            Some(slot) => {
                slot.subscriptions.push((filter.to_string(), handler));
                Ok(())
            }
            None => Err(Error::SessionClosed),
        }
    }

    async fn disconnect(&self, _grace: Duration) {
        self.graceful.store(true, Ordering::SeqCst);
        self.broker.remove_session(self.id);
        self.closed.cancel();
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.graceful.load(Ordering::SeqCst) {
            return;
        }
        self.broker.remove_session(self.id);
        self.closed.cancel();
        if let Some(will) = self.will.take() {
            self.broker.deliver(RecordedPublish {
                client_id: self.client_id.clone(),
                topic: will.topic,
                payload: will.payload.into_bytes(),
                qos: will.qos,
                retain: will.retain,
            });
        }
    }
}
