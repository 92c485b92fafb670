//! Configuration for the Modbus bridge.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use fieldlink_bridge_framework::{BridgeConfig, BridgeError};
use fieldlink_common::config::bounded_int;
use fieldlink_common::{LoggingConfig, MqttConfig, TopicBuilder};

use crate::catalog::TagCatalog;
use crate::fieldbus::FieldbusEndpoint;

/// Complete bridge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModbusBridgeConfig {
    /// Modbus/TCP device settings
    pub modbus: FieldbusConfig,

    /// MQTT connection settings
    pub mqtt: MqttConfig,

    /// Tags polled in order
    pub tags: TagCatalog,

    /// Status publishing
    #[serde(default)]
    pub status: StatusConfig,

    /// Fixed delay between reconnect attempts in milliseconds
    #[serde(default = "default_retry_delay_ms", alias = "retryDelayMs")]
    pub retry_delay_ms: u64,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_retry_delay_ms() -> u64 {
    1000
}

/// What the poller does when a tag cannot be read or decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadErrorPolicy {
    /// Log and continue with the next tag.
    Skip,
    /// Stop polling and reconnect both sessions.
    #[default]
    Reconnect,
}

/// Modbus/TCP device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldbusConfig {
    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port", deserialize_with = "bounded_int")]
    pub port: u16,

    /// Modbus unit/slave ID
    #[serde(default = "default_device_id", alias = "deviceId", deserialize_with = "bounded_int")]
    pub device_id: u8,

    /// Sleep between tags in seconds
    #[serde(default = "default_interval_secs", alias = "intervalSec")]
    pub interval_secs: u64,

    /// Sleep between tags in milliseconds; overrides `interval_secs`
    #[serde(default, alias = "intervalMs")]
    pub interval_ms: Option<u64>,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_timeout_ms", alias = "timeoutMs")]
    pub timeout_ms: u64,

    #[serde(default, alias = "onReadError")]
    pub on_read_error: ReadErrorPolicy,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_device_id() -> u8 {
    1
}

fn default_interval_secs() -> u64 {
    1
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl FieldbusConfig {
    pub fn poll_interval(&self) -> Duration {
        match self.interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.interval_secs),
        }
    }

    pub fn endpoint(&self) -> FieldbusEndpoint {
        FieldbusEndpoint {
            host: self.host.clone(),
            port: self.port,
            device_id: self.device_id,
            call_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Status record publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Publish `{"value":1}` after every tag, not only on connect.
    #[serde(default = "default_every_tag", alias = "everyTag")]
    pub every_tag: bool,
}

fn default_every_tag() -> bool {
    true
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            every_tag: default_every_tag(),
        }
    }
}

impl ModbusBridgeConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn topics(&self) -> TopicBuilder {
        TopicBuilder::new(&self.mqtt.client_id)
    }

    /// Topic a tag's records are published to.
    ///
    /// Uses the shared `mqtt.topic` when set, `devs/<client_id>/tags/<tag>` otherwise.
    pub fn telemetry_topic(&self, tag_name: &str) -> String {
        match &self.mqtt.topic {
            Some(topic) => topic.clone(),
            None => self.topics().tag(tag_name),
        }
    }
}

impl BridgeConfig for ModbusBridgeConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> Result<(), BridgeError> {
        self.mqtt
            .validate()
            .map_err(|e| BridgeError::validation(e.to_string()))?;

        if self.modbus.host.trim().is_empty() {
            return Err(BridgeError::validation("modbus.host cannot be empty"));
        }
        if self.modbus.timeout_ms == 0 {
            return Err(BridgeError::validation("modbus.timeout_ms must be non-zero"));
        }
        if self.retry_delay_ms == 0 {
            return Err(BridgeError::validation("retry_delay_ms must be non-zero"));
        }

        Ok(())
    }
}
