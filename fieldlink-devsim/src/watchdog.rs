//! Device liveness watchdog.
//!
//! Subscribes to `devs/<device>/tags/+` and publishes a retained
//! `{"value":0}` on `devs/<device>/status` whenever the device has been
//! silent for the configured timeout. The timer re-arms after every
//! message and after every offline report, so a silent device is reported
//! once per timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldlink_common::{
    BusConnector, BusSession, MessageHandler, MqttConfig, StatusRecord, TopicBuilder,
    sleep_or_cancelled,
};

use crate::config::WatchdogConfig;

/// Why a watchdog session ended.
enum SessionEnd {
    Cancelled,
    Lost,
}

pub struct LivenessWatchdog<C> {
    connector: C,
    mqtt: MqttConfig,
    topics: TopicBuilder,
    silence_timeout: Duration,
    reconnect_delay: Duration,
}

impl<C: BusConnector> LivenessWatchdog<C> {
    pub fn new(connector: C, base: &MqttConfig, config: &WatchdogConfig) -> Self {
        Self {
            connector,
            mqtt: config.mqtt_config(base),
            topics: TopicBuilder::new(&config.device),
            silence_timeout: config.silence_timeout(),
            reconnect_delay: config.reconnect_delay(),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let device = self.topics.device().to_string();

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connector.connect(&self.mqtt, None) => result,
            };

            match connected {
                Ok(session) => {
                    info!(device = %device, client_id = %self.mqtt.client_id, "Watchdog connected");

                    let end = self.watch(&session, &cancel).await;
                    session.disconnect(self.mqtt.disconnect_grace()).await;
                    if let SessionEnd::Cancelled = end {
                        break;
                    }
                }
                Err(e) => {
                    warn!(device = %device, error = %e, "Watchdog connect failed");
                }
            }

            if !sleep_or_cancelled(self.reconnect_delay, &cancel).await {
                break;
            }
        }

        debug!(device = %device, "Watchdog stopped");
    }

    async fn watch(&self, session: &C::Session, cancel: &CancellationToken) -> SessionEnd {
        let (activity_tx, mut activity) = mpsc::unbounded_channel::<()>();
        let handler: MessageHandler = Arc::new(move |_topic: &str, _payload: &[u8]| {
            let _ = activity_tx.send(());
        });

        let filter = self.topics.tags_wildcard();
        if let Err(e) = session.subscribe(&filter, self.mqtt.qos, handler).await {
            warn!(filter = %filter, error = %e, "Watchdog subscribe failed");
            return SessionEnd::Lost;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                _ = session.closed() => {
                    warn!(device = %self.topics.device(), "Watchdog session lost");
                    return SessionEnd::Lost;
                }
                received = activity.recv() => {
                    if received.is_none() {
                        return SessionEnd::Lost;
                    }
                }
                _ = tokio::time::sleep(self.silence_timeout) => {
                    if let Err(e) = self.report_offline(session).await {
                        warn!(device = %self.topics.device(), error = %e, "Offline report failed");
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }

    async fn report_offline(&self, session: &C::Session) -> fieldlink_common::Result<()> {
        info!(
            device = %self.topics.device(),
            silence_ms = self.silence_timeout.as_millis() as u64,
            "Device silent, reporting offline"
        );
        session
            .publish_status(&self.topics.status(), self.mqtt.qos, StatusRecord::OFFLINE)
            .await
    }
}
