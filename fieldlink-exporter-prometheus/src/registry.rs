//! Topic-keyed gauge registry.
//!
//! Every topic seen on the bus becomes one gauge, created on first
//! observation and registered with the Prometheus registry under its
//! sanitized name. Entries are never evicted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::{debug, trace, warn};

use fieldlink_common::topic::TopicKind;
use fieldlink_common::{parse_topic, sanitize_topic};

type TopicGauge = Gauge<f64, AtomicU64>;

/// Shared handle to the registry.
pub type SharedRegistry = Arc<DynamicMetricRegistry>;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// First message on this topic; a gauge was registered.
    Created,
    /// Existing gauge updated.
    Updated,
    /// Topic has fewer than three segments.
    Malformed,
    /// Sanitized name is not a valid metric name or belongs to another topic.
    Rejected,
    /// Payload is not JSON.
    InvalidPayload,
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Messages received.
    pub received: u64,
    /// Gauges created.
    pub created: u64,
    /// Gauge updates on known topics.
    pub updated: u64,
    /// Messages dropped (malformed topic, bad payload or rejected name).
    pub dropped: u64,
}

#[derive(Default)]
struct Inner {
    registry: Registry,
    gauges: HashMap<String, TopicGauge>,
    /// Sanitized metric name -> topic that owns it.
    names: HashMap<String, String>,
    /// Topics already rejected, so the warning is logged once.
    rejected: HashSet<String>,
    stats: RegistryStats,
}

/// Map from topic to gauge, backed by a `prometheus_client` registry.
#[derive(Default)]
pub struct DynamicMetricRegistry {
    inner: Mutex<Inner>,
}

impl DynamicMetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one message.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> MessageOutcome {
        let parsed = match parse_topic(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping message on malformed topic");
                return self.drop_message(MessageOutcome::Malformed);
            }
        };

        let value = match extract_value(payload) {
            Some(value) => value,
            None => {
                warn!(topic = %topic, "Dropping non-JSON payload");
                return self.drop_message(MessageOutcome::InvalidPayload);
            }
        };

        let mut inner = self.inner.lock();
        inner.stats.received += 1;

        if let Some(gauge) = inner.gauges.get(topic) {
            gauge.set(value);
            inner.stats.updated += 1;
            trace!(topic = %topic, value, "Updated gauge");
            return MessageOutcome::Updated;
        }

        let name = sanitize_topic(topic);
        let reason = if !is_valid_metric_name(&name) {
            Some("invalid metric name")
        } else if inner.names.contains_key(&name) {
            Some("metric name already used by another topic")
        } else {
            None
        };

        if let Some(reason) = reason {
            if inner.rejected.insert(topic.to_string()) {
                warn!(topic = %topic, metric = %name, reason, "Rejecting topic");
            }
            inner.stats.dropped += 1;
            return MessageOutcome::Rejected;
        }

        let gauge = TopicGauge::default();
        // HELP is the raw topic; prometheus-client appends a trailing '.'.
        inner
            .registry
            .register(name.clone(), topic.to_string(), gauge.clone());
        gauge.set(value);

        inner.names.insert(name.clone(), topic.to_string());
        inner.gauges.insert(topic.to_string(), gauge);
        inner.stats.created += 1;

        match parsed.kind {
            TopicKind::Tag(tag) => {
                debug!(device = %parsed.device, tag = %tag, metric = %name, value, "Registered tag gauge")
            }
            TopicKind::Status => {
                debug!(device = %parsed.device, metric = %name, value, "Registered status gauge")
            }
            TopicKind::Other => debug!(topic = %topic, metric = %name, value, "Registered gauge"),
        }
        MessageOutcome::Created
    }

    fn drop_message(&self, outcome: MessageOutcome) -> MessageOutcome {
        let mut inner = self.inner.lock();
        inner.stats.received += 1;
        inner.stats.dropped += 1;
        outcome
    }

    /// Render every gauge in OpenMetrics text format.
    pub fn render(&self) -> String {
        let inner = self.inner.lock();
        let mut output = String::new();
        if let Err(e) = encode(&mut output, &inner.registry) {
            warn!(error = %e, "Failed to encode metrics");
        }
        output
    }

    /// Number of registered gauges.
    pub fn series_count(&self) -> usize {
        self.inner.lock().gauges.len()
    }

    /// Current gauge value for a topic.
    pub fn value(&self, topic: &str) -> Option<f64> {
        self.inner.lock().gauges.get(topic).map(|g| g.get())
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner.lock().stats.clone()
    }
}

/// Numeric `value` field of a JSON payload.
///
/// Booleans count as 1/0; a missing or non-numeric field reads as 0.
/// Returns `None` if the payload is not JSON at all.
fn extract_value(payload: &[u8]) -> Option<f64> {
    let json: serde_json::Value = serde_json::from_slice(payload).ok()?;

    let value = match json.get("value") {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::Bool(b)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    };

    Some(value)
}

/// `[a-zA-Z_:][a-zA-Z0-9_:]*`
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
