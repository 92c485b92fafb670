//! Bus subscriber feeding the metric registry.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldlink_common::{BusConnector, BusSession, MessageHandler, MqttConfig, sleep_or_cancelled};

use crate::config::ExporterConfig;
use crate::registry::SharedRegistry;

/// Keeps a broker session alive and dispatches every message to the registry.
pub struct TelemetrySubscriber<C> {
    connector: C,
    mqtt: MqttConfig,
    filters: Vec<String>,
    reconnect_delay: Duration,
    registry: SharedRegistry,
}

impl<C: BusConnector> TelemetrySubscriber<C> {
    pub fn new(connector: C, config: &ExporterConfig, registry: SharedRegistry) -> Self {
        Self {
            connector,
            mqtt: config.mqtt.clone(),
            filters: config.subscribe.filters.clone(),
            reconnect_delay: config.reconnect_delay(),
            registry,
        }
    }

    /// Connect, subscribe and dispatch until cancelled.
    ///
    /// Filters are subscribed again on every reconnect.
    pub async fn run(&self, cancel: CancellationToken) {
        let handler = self.handler();

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connector.connect(&self.mqtt, self.mqtt.last_will.clone()) => result,
            };

            match connected {
                Ok(session) => {
                    info!(broker = %self.mqtt.addr, client_id = %self.mqtt.client_id, "Connected to broker");

                    if let Err(e) = self.subscribe_all(&session, &handler).await {
                        warn!(error = %e, "Subscription failed");
                        session.disconnect(self.mqtt.disconnect_grace()).await;
                    } else {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                session.disconnect(self.mqtt.disconnect_grace()).await;
                                break;
                            }
                            _ = session.closed() => {
                                warn!(broker = %self.mqtt.addr, "Broker session lost");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        broker = %self.mqtt.addr,
                        error = %e,
                        retry_secs = self.reconnect_delay.as_secs(),
                        "Broker connect failed"
                    );
                }
            }

            if !sleep_or_cancelled(self.reconnect_delay, &cancel).await {
                break;
            }
        }

        let stats = self.registry.stats();
        info!(
            received = stats.received,
            created = stats.created,
            updated = stats.updated,
            dropped = stats.dropped,
            series = self.registry.series_count(),
            "Subscriber stopped"
        );
    }

    async fn subscribe_all(
        &self,
        session: &C::Session,
        handler: &MessageHandler,
    ) -> fieldlink_common::Result<()> {
        for filter in &self.filters {
            session
                .subscribe(filter, self.mqtt.qos, handler.clone())
                .await?;
            debug!(filter = %filter, "Subscribed");
        }
        Ok(())
    }

    fn handler(&self) -> MessageHandler {
        let registry = self.registry.clone();
        Arc::new(move |topic: &str, payload: &[u8]| {
            registry.on_message(topic, payload);
        })
    }
}
