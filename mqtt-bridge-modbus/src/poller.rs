//! Tag polling and telemetry publishing.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fieldlink_common::{BusSession, OutputRecord, QosLevel, StatusRecord, sleep_or_cancelled};

use crate::catalog::{Tag, TagCatalog};
use crate::config::{ModbusBridgeConfig, ReadErrorPolicy};
use crate::fieldbus::FieldbusSession;

/// Why [`TagPoller::poll_forever`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExit {
    /// The cancellation token fired.
    Cancelled,
    /// A tag could not be read or decoded under the `reconnect` policy.
    ReadFailed,
    /// A publish failed or was not acknowledged in time.
    PublishFailed,
}

enum TagOutcome {
    Published,
    Skipped,
    Stop(PollExit),
}

/// Reads every tag in catalog order, forever, and publishes the values.
pub struct TagPoller<'a> {
    config: &'a ModbusBridgeConfig,
    status_topic: String,
}

impl<'a> TagPoller<'a> {
    pub fn new(config: &'a ModbusBridgeConfig) -> Self {
        Self {
            config,
            status_topic: config.topics().status(),
        }
    }

    fn catalog(&self) -> &'a TagCatalog {
        &self.config.tags
    }

    fn qos(&self) -> QosLevel {
        self.config.mqtt.qos
    }

    fn interval(&self) -> Duration {
        self.config.modbus.poll_interval()
    }

    /// Poll until cancelled or until a failure requires reconnecting.
    ///
    /// Reads and publishes are strictly sequential. The poll interval is
    /// slept after every tag, including skipped ones.
    pub async fn poll_forever<F, B>(
        &self,
        fieldbus: &mut F,
        bus: &B,
        cancel: &CancellationToken,
    ) -> PollExit
    where
        F: FieldbusSession,
        B: BusSession,
    {
        let mut published: u64 = 0;

        loop {
            for tag in self.catalog() {
                if cancel.is_cancelled() {
                    return PollExit::Cancelled;
                }

                match self.poll_tag(tag, fieldbus, bus, cancel).await {
                    TagOutcome::Published => published += 1,
                    TagOutcome::Skipped => {}
                    TagOutcome::Stop(exit) => {
                        debug!(published, ?exit, "Polling stopped");
                        return exit;
                    }
                }

                if !sleep_or_cancelled(self.interval(), cancel).await {
                    return PollExit::Cancelled;
                }
            }
        }
    }

    async fn poll_tag<F, B>(
        &self,
        tag: &Tag,
        fieldbus: &mut F,
        bus: &B,
        cancel: &CancellationToken,
    ) -> TagOutcome
    where
        F: FieldbusSession,
        B: BusSession,
    {
        let read = tokio::select! {
            _ = cancel.cancelled() => return TagOutcome::Stop(PollExit::Cancelled),
            read = fieldbus.read_registers(tag.register_kind, tag.address, tag.quantity) => read,
        };

        let decoded = match read {
            Ok(bytes) => tag.decode(&bytes).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let value = match decoded {
            Ok(value) => value,
            Err(error) => {
                return match self.config.modbus.on_read_error {
                    ReadErrorPolicy::Skip => {
                        warn!(
                            source = %tag.source_name,
                            tag = %tag.tag_name,
                            address = tag.address,
                            error = %error,
                            "Failed to poll tag, skipping"
                        );
                        TagOutcome::Skipped
                    }
                    ReadErrorPolicy::Reconnect => {
                        warn!(
                            source = %tag.source_name,
                            tag = %tag.tag_name,
                            address = tag.address,
                            error = %error,
                            "Failed to poll tag, reconnecting"
                        );
                        TagOutcome::Stop(PollExit::ReadFailed)
                    }
                };
            }
        };

        let record = OutputRecord::new(&tag.source_name, &tag.tag_name, value);
        let payload = match record.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(tag = %tag.tag_name, error = %e, "Failed to encode record");
                return TagOutcome::Skipped;
            }
        };

        let topic = self.config.telemetry_topic(&tag.tag_name);
        let published = tokio::select! {
            _ = cancel.cancelled() => return TagOutcome::Stop(PollExit::Cancelled),
            result = bus.publish(&topic, self.qos(), false, payload) => result,
        };
        if let Err(e) = published {
            warn!(topic = %topic, error = %e, "Failed to publish tag value");
            return TagOutcome::Stop(PollExit::PublishFailed);
        }
        debug!(topic = %topic, value = %value, "Published");

        if self.config.status.every_tag {
            let status = tokio::select! {
                _ = cancel.cancelled() => return TagOutcome::Stop(PollExit::Cancelled),
                result = bus.publish_status(&self.status_topic, self.qos(), StatusRecord::ONLINE) => result,
            };
            if let Err(e) = status {
                warn!(topic = %self.status_topic, error = %e, "Failed to publish status");
                return TagOutcome::Stop(PollExit::PublishFailed);
            }
        }

        TagOutcome::Published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RegisterKind;
    use crate::testing::MockDevice;
    use fieldlink_bridge_framework::BridgeConfig;
    use fieldlink_common::testing::MemoryBroker;
    use fieldlink_common::{BusConnector, TagValue};
    use crate::fieldbus::FieldbusConnector;

    fn config(extra_modbus: &str, tags: &str) -> ModbusBridgeConfig {
        ModbusBridgeConfig::from_json5(&format!(
            r#"{{
                modbus: {{ host: "plc", interval_ms: 100 {} }},
                mqtt: {{ client_id: "dev1", qos: 1 }},
                tags: {},
            }}"#,
            extra_modbus, tags
        ))
        .unwrap()
    }

    const TWO_TAGS: &str = r#"[
        { source_name: "plc01", tag_name: "t1", address: 0, quantity: 2 },
        { source_name: "plc01", tag_name: "t2", address: 2, quantity: 1, value_type: "int16" },
    ]"#;

    async fn sessions(
        broker: &MemoryBroker,
        device: &MockDevice,
        config: &ModbusBridgeConfig,
    ) -> (
        fieldlink_common::testing::MemorySession,
        crate::testing::MockSession,
    ) {
        let bus = broker.connector().connect(&config.mqtt, None).await.unwrap();
        let fieldbus = device
            .connector()
            .connect(&config.modbus.endpoint())
            .await
            .unwrap();
        (bus, fieldbus)
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_decoded_value() {
        let config = config("", TWO_TAGS);
        let broker = MemoryBroker::new();
        let device = MockDevice::new();
        device.set_raw_response(RegisterKind::Input, 0, vec![0x00, 0x00, 0x00, 0x2A]);
        device.set_register(RegisterKind::Input, 2, 0xFFFF);

        let (bus, mut fieldbus) = sessions(&broker, &device, &config).await;
        let cancel = CancellationToken::new();
        let poller = TagPoller::new(&config);

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            stopper.cancel();
        });

        let exit = poller.poll_forever(&mut fieldbus, &bus, &cancel).await;
        assert_eq!(exit, PollExit::Cancelled);

        let t1 = broker.published_to("devs/dev1/tags/t1");
        assert_eq!(t1.len(), 1);
        let record: OutputRecord = serde_json::from_slice(&t1[0].payload).unwrap();
        assert_eq!(record.value, TagValue::Integer(42));
        assert_eq!(record.source_name, "plc01");
        assert_eq!(t1[0].qos, QosLevel::AtLeastOnce);
        assert!(!t1[0].retain);

        let t2 = broker.published_to("devs/dev1/tags/t2");
        assert_eq!(t2[0].json()["value"], -1);

        let status = broker.published_to("devs/dev1/status");
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|s| s.retain && s.json()["value"] == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_order_and_wrap() {
        let config = config("", TWO_TAGS);
        let broker = MemoryBroker::new();
        let device = MockDevice::new();
        let (bus, mut fieldbus) = sessions(&broker, &device, &config).await;
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(450)).await;
            stopper.cancel();
        });

        TagPoller::new(&config)
            .poll_forever(&mut fieldbus, &bus, &cancel)
            .await;

        let addresses: Vec<u16> = device.reads().iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0, 2, 0, 2, 0]);

        let reads = device.reads();
        for pair in reads.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_reconnect_policy() {
        let config = config("", TWO_TAGS);
        let broker = MemoryBroker::new();
        let device = MockDevice::new();
        device.fail_next_reads(1);
        let (bus, mut fieldbus) = sessions(&broker, &device, &config).await;

        let exit = TagPoller::new(&config)
            .poll_forever(&mut fieldbus, &bus, &CancellationToken::new())
            .await;

        assert_eq!(exit, PollExit::ReadFailed);
        assert!(broker.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_skip_policy() {
        let config = config(r#", on_read_error: "skip""#, TWO_TAGS);
        let broker = MemoryBroker::new();
        let device = MockDevice::new();
        device.fail_next_reads(1);
        let (bus, mut fieldbus) = sessions(&broker, &device, &config).await;
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            stopper.cancel();
        });

        let exit = TagPoller::new(&config)
            .poll_forever(&mut fieldbus, &bus, &cancel)
            .await;

        assert_eq!(exit, PollExit::Cancelled);
        assert!(broker.published_to("devs/dev1/tags/t1").is_empty());
        assert_eq!(broker.published_to("devs/dev1/tags/t2").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_handled_like_read_error() {
        let config = config("", TWO_TAGS);
        let broker = MemoryBroker::new();
        let device = MockDevice::new();
        device.set_raw_response(RegisterKind::Input, 0, vec![0, 0, 0, 0, 1]);
        let (bus, mut fieldbus) = sessions(&broker, &device, &config).await;

        let exit = TagPoller::new(&config)
            .poll_forever(&mut fieldbus, &bus, &CancellationToken::new())
            .await;

        assert_eq!(exit, PollExit::ReadFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_stops_polling() {
        let config = config("", TWO_TAGS);
        let broker = MemoryBroker::new();
        broker.set_fail_publishes(true);
        let device = MockDevice::new();
        let (bus, mut fieldbus) = sessions(&broker, &device, &config).await;

        let exit = TagPoller::new(&config)
            .poll_forever(&mut fieldbus, &bus, &CancellationToken::new())
            .await;

        assert_eq!(exit, PollExit::PublishFailed);
        assert_eq!(device.reads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_topic_without_status() {
        let config = ModbusBridgeConfig::from_json5(
            r#"{
                modbus: { host: "plc", interval_ms: 100 },
                mqtt: { client_id: "dev1", topic: "plant/line1/data" },
                tags: [{ source_name: "plc01", tag_name: "t1", address: 0 }],
                status: { every_tag: false },
            }"#,
        )
        .unwrap();
        let broker = MemoryBroker::new();
        let device = MockDevice::new();
        device.set_register(RegisterKind::Input, 1, 7);
        let (bus, mut fieldbus) = sessions(&broker, &device, &config).await;
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        TagPoller::new(&config)
            .poll_forever(&mut fieldbus, &bus, &cancel)
            .await;

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "plant/line1/data");
        assert_eq!(published[0].json()["tagNmae"], "t1");
        assert_eq!(published[0].json()["value"], 7);
    }
}
