use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default MQTT broker port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// MQTT quality-of-service level.
///
/// Serialized as the integer level (`0`, `1` or `2`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub enum QosLevel {
    /// At most once (fire and forget).
    #[default]
    AtMostOnce,
    /// At least once (PUBACK).
    AtLeastOnce,
    /// Exactly once (PUBREC/PUBREL/PUBCOMP).
    ExactlyOnce,
}

impl TryFrom<i64> for QosLevel {
    type Error = String;

    fn try_from(level: i64) -> std::result::Result<Self, Self::Error> {
        match level {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("invalid QoS level {} (expected 0, 1 or 2)", other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Last-will message the broker publishes when the client disappears uncleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWillConfig {
    /// Topic the will is published on.
    pub topic: String,

    /// Will payload (UTF-8).
    pub payload: String,

    /// Will QoS.
    #[serde(default)]
    pub qos: QosLevel,

    /// Whether the broker retains the will.
    #[serde(default = "default_true")]
    pub retain: bool,
}

/// MQTT connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker address: `tcp://host:port`, `mqtt://host:port`, `host:port` or `host`.
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Client identifier. Must be unique per broker.
    #[serde(default, alias = "clientId")]
    pub client_id: String,

    /// Start a clean session on connect.
    #[serde(default = "default_true", alias = "cleanSession")]
    pub clean_session: bool,

    /// QoS used for publishes and subscriptions.
    #[serde(default)]
    pub qos: QosLevel,

    /// Shared telemetry topic. When unset each tag gets its own topic.
    #[serde(default)]
    pub topic: Option<String>,

    /// Keep-alive interval in seconds (minimum 5).
    #[serde(default = "default_keep_alive", alias = "keepAliveSecs")]
    pub keep_alive_secs: u64,

    /// Connect handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout", alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,

    /// Maximum wait for a publish acknowledgment in milliseconds.
    #[serde(default = "default_ack_timeout", alias = "ackTimeoutMs")]
    pub ack_timeout_ms: u64,

    /// Grace period for a clean disconnect in milliseconds.
    #[serde(default = "default_disconnect_grace", alias = "disconnectGraceMs")]
    pub disconnect_grace_ms: u64,

    /// Optional last-will override.
    #[serde(default, alias = "lastWill")]
    pub last_will: Option<LastWillConfig>,
}

fn default_addr() -> String {
    format!("tcp://127.0.0.1:{}", DEFAULT_MQTT_PORT)
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_ack_timeout() -> u64 {
    10_000
}

fn default_disconnect_grace() -> u64 {
    250
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            client_id: String::new(),
            clean_session: true,
            qos: QosLevel::default(),
            topic: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout(),
            ack_timeout_ms: default_ack_timeout(),
            disconnect_grace_ms: default_disconnect_grace(),
            last_will: None,
        }
    }
}

impl MqttConfig {
    /// Split `addr` into host and port.
    pub fn broker_endpoint(&self) -> Result<(String, u16)> {
        parse_broker_addr(&self.addr)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// Validate the MQTT settings.
    pub fn validate(&self) -> Result<()> {
        self.broker_endpoint()?;

        if self.client_id.trim().is_empty() {
            return Err(Error::Config("mqtt.client_id cannot be empty".to_string()));
        }
        if self.keep_alive_secs < 5 {
            return Err(Error::Config(format!(
                "mqtt.keep_alive_secs must be at least 5 (got {})",
                self.keep_alive_secs
            )));
        }
        if self.connect_timeout_ms == 0 || self.ack_timeout_ms == 0 {
            return Err(Error::Config(
                "mqtt connect and ack timeouts must be non-zero".to_string(),
            ));
        }
        if let Some(topic) = &self.topic {
            crate::topic::validate_topic_name(topic)?;
        }
        if let Some(will) = &self.last_will {
            crate::topic::validate_topic_name(&will.topic)?;
        }

        Ok(())
    }
}

/// Parse a broker address into host and port.
///
/// Accepts an optional `tcp://` or `mqtt://` scheme; the port defaults to 1883.
pub fn parse_broker_addr(addr: &str) -> Result<(String, u16)> {
    let trimmed = addr.trim();
    let without_scheme = match trimmed.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some((scheme, _)) => {
            return Err(Error::Config(format!(
                "Unsupported broker scheme '{}' in '{}'",
                scheme, addr
            )));
        }
        None => trimmed,
    };
    let without_scheme = without_scheme.trim_end_matches('/');

    if without_scheme.is_empty() {
        return Err(Error::Config(format!("Empty broker address '{}'", addr)));
    }

    match without_scheme.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|e| {
                Error::Config(format!("Invalid broker port in '{}': {}", addr, e))
            })?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(Error::Config(format!("Missing broker host in '{}'", addr))),
        None => Ok((without_scheme.to_string(), DEFAULT_MQTT_PORT)),
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Deserialize a whole number that must fit in `T`.
///
/// json5 converts every number with a saturating float cast, so narrow
/// integer fields go through this to reject out-of-range values.
///
/// ```
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Unit {
///     #[serde(deserialize_with = "fieldlink_common::config::bounded_int")]
///     id: u8,
/// }
///
/// assert!(json5::from_str::<Unit>("{ id: 247 }").is_ok());
/// assert!(json5::from_str::<Unit>("{ id: 256 }").is_err());
/// ```
pub fn bounded_int<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let raw = f64::deserialize(deserializer)?;
    if raw.fract() != 0.0 || raw < 0.0 || raw >= u64::MAX as f64 {
        return Err(D::Error::custom(format!(
            "{} is not a valid {}",
            raw,
            std::any::type_name::<T>()
        )));
    }

    T::try_from(raw as u64).map_err(|_| {
        D::Error::custom(format!(
            "{} is out of range for {}",
            raw,
            std::any::type_name::<T>()
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}
