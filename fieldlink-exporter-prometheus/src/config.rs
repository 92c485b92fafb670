//! Configuration for the Prometheus exporter.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fieldlink_bridge_framework::{BridgeConfig, BridgeError};
use fieldlink_common::{LoggingConfig, MqttConfig};

/// Complete exporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// MQTT connection settings.
    pub mqtt: MqttConfig,

    /// Topic filters to subscribe to.
    #[serde(default)]
    pub subscribe: SubscribeConfig,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Delay between broker reconnect attempts in seconds.
    #[serde(default = "default_reconnect_delay", alias = "reconnectDelaySecs")]
    pub reconnect_delay_secs: u64,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_reconnect_delay() -> u64 {
    5
}

/// Subscription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeConfig {
    /// MQTT topic filters (default: `["#"]`).
    #[serde(default = "default_filters")]
    pub filters: Vec<String>,
}

fn default_filters() -> Vec<String> {
    vec!["#".to_string()]
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            filters: default_filters(),
        }
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:2112").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_listen() -> String {
    "0.0.0.0:2112".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
        }
    }
}

impl PrometheusConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, BridgeError> {
        self.listen.parse().map_err(|_| {
            BridgeError::validation(format!("Invalid listen address: {}", self.listen))
        })
    }
}

impl ExporterConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Check an MQTT subscription filter: non-empty, `#` only as the last level,
/// wildcards only as whole levels.
fn validate_filter(filter: &str) -> Result<(), BridgeError> {
    if filter.is_empty() {
        return Err(BridgeError::validation("Topic filter cannot be empty"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let is_last = i + 1 == levels.len();
        let bad_multi = level.contains('#') && (*level != "#" || !is_last);
        let bad_single = level.contains('+') && *level != "+";
        if bad_multi || bad_single {
            return Err(BridgeError::validation(format!(
                "Invalid topic filter: {}",
                filter
            )));
        }
    }

    Ok(())
}

impl BridgeConfig for ExporterConfig {
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

        if self.subscribe.filters.is_empty() {
            return Err(BridgeError::validation(
                "At least one subscription filter required",
            ));
        }
        for filter in &self.subscribe.filters {
            validate_filter(filter)?;
        }

        self.prometheus.listen_addr()?;

        if !self.prometheus.path.starts_with('/') {
            return Err(BridgeError::validation("Metrics path must start with /"));
        }

        if self.reconnect_delay_secs == 0 {
            return Err(BridgeError::validation(
                "reconnect_delay_secs must be > 0",
            ));
        }

        Ok(())
    }
}
