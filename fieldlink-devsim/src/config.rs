//! Configuration for the device simulator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use fieldlink_bridge_framework::{BridgeConfig, BridgeError};
use fieldlink_common::config::bounded_int;
use fieldlink_common::{LoggingConfig, MqttConfig};
use mqtt_bridge_modbus::FieldbusConfig;

use crate::ramp::RampMode;

/// Complete simulator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DevsimConfig {
    /// Modbus/TCP device the ramps write to
    pub modbus: FieldbusConfig,

    /// MQTT connection settings; watchdogs derive their client ids from `client_id`
    pub mqtt: MqttConfig,

    /// Register ramp writers
    #[serde(default)]
    pub writers: Vec<WriterConfig>,

    /// Device liveness watchdogs
    #[serde(default)]
    pub watchdogs: Vec<WatchdogConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One holding register driven by a ramp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Holding register address
    #[serde(deserialize_with = "bounded_int")]
    pub address: u16,

    #[serde(default)]
    pub mode: RampMode,

    /// Ramp bound (default: 255)
    #[serde(default = "default_max", deserialize_with = "bounded_int")]
    pub max: u16,

    /// Delay between writes in milliseconds
    #[serde(default = "default_period_ms", alias = "periodMs")]
    pub period_ms: u64,

    /// Delay before reconnecting after a failure, in milliseconds
    #[serde(default = "default_restart_delay_ms", alias = "restartDelayMs")]
    pub restart_delay_ms: u64,
}

fn default_max() -> u16 {
    255
}

fn default_period_ms() -> u64 {
    1000
}

fn default_restart_delay_ms() -> u64 {
    1000
}

impl WriterConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Watches one device's tag topics and reports it offline when they go quiet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Device id, as used in `devs/<device>/...`
    pub device: String,

    /// Silence after which `{"value":0}` is published, in milliseconds
    #[serde(default = "default_silence_timeout_ms", alias = "silenceTimeoutMs")]
    pub silence_timeout_ms: u64,

    /// Delay before reconnecting to the broker, in milliseconds
    #[serde(default = "default_restart_delay_ms", alias = "reconnectDelayMs")]
    pub reconnect_delay_ms: u64,

    /// MQTT client id; defaults to `<mqtt.client_id>-watchdog-<device>`
    #[serde(default, alias = "clientId")]
    pub client_id: Option<String>,
}

fn default_silence_timeout_ms() -> u64 {
    2000
}

impl WatchdogConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// MQTT settings for this watchdog's own session.
    pub fn mqtt_config(&self, base: &MqttConfig) -> MqttConfig {
        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| format!("{}-watchdog-{}", base.client_id, self.device));

        MqttConfig {
            client_id,
            last_will: None,
            ..base.clone()
        }
    }
}

impl BridgeConfig for DevsimConfig {
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

        if self.writers.is_empty() && self.watchdogs.is_empty() {
            return Err(BridgeError::validation(
                "At least one writer or watchdog required",
            ));
        }

        if !self.writers.is_empty() && self.modbus.host.trim().is_empty() {
            return Err(BridgeError::validation("modbus.host cannot be empty"));
        }

        for writer in &self.writers {
            if writer.max < writer.mode.min_max() {
                return Err(BridgeError::validation(format!(
                    "writer at {}: max must be at least {} for a {} ramp",
                    writer.address,
                    writer.mode.min_max(),
                    writer.mode.as_str()
                )));
            }
            if writer.period_ms == 0 || writer.restart_delay_ms == 0 {
                return Err(BridgeError::validation(format!(
                    "writer at {}: period_ms and restart_delay_ms must be non-zero",
                    writer.address
                )));
            }
        }

        for watchdog in &self.watchdogs {
            let device = watchdog.device.as_str();
            if device.is_empty() || device.contains(['/', '+', '#']) {
                return Err(BridgeError::validation(format!(
                    "invalid watchdog device id '{}'",
                    device
                )));
            }
            if watchdog.silence_timeout_ms == 0 || watchdog.reconnect_delay_ms == 0 {
                return Err(BridgeError::validation(format!(
                    "watchdog {}: timeouts must be non-zero",
                    device
                )));
            }
        }

        Ok(())
    }
}
