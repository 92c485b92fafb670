//! Connection supervision.
//!
//! The supervisor owns one MQTT session and one Modbus session and keeps
//! them alive forever:
//!
//! ```text
//! Disconnected -> ConnectingBus -> ConnectingFieldbus -> Polling
//!       ^                |                  |               |
//!       +----------------+------------------+---------------+
//!                     (failure, fixed retry delay)
//! ```
//!
//! The bus is always connected first so that the last will is armed before
//! any polling starts.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldlink_common::{
    BusConnector, BusSession, LastWillConfig, StatusRecord, sleep_or_cancelled,
};

use crate::config::ModbusBridgeConfig;
use crate::fieldbus::{FieldbusConnector, FieldbusSession};
use crate::poller::{PollExit, TagPoller};

/// Supervisor life-cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    ConnectingBus,
    ConnectingFieldbus,
    Polling,
}

/// Why [`ConnectionSupervisor::run`] returned. Cancellation is the only exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Cancelled,
}

enum CycleEnd {
    Retry,
    Cancelled,
}

/// Keeps the bus and fieldbus sessions connected and runs the poller.
pub struct ConnectionSupervisor<B, F> {
    config: ModbusBridgeConfig,
    bus: B,
    fieldbus: F,
    state: watch::Sender<SupervisorState>,
}

impl<B, F> ConnectionSupervisor<B, F>
where
    B: BusConnector,
    F: FieldbusConnector,
{
    pub fn new(config: ModbusBridgeConfig, bus: B, fieldbus: F) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            config,
            bus,
            fieldbus,
            state,
        }
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Last will armed on every bus connection.
    ///
    /// Defaults to a retained `{"value":0}` on the device status topic.
    pub fn last_will(&self) -> LastWillConfig {
        self.config
            .mqtt
            .last_will
            .clone()
            .unwrap_or_else(|| LastWillConfig {
                topic: self.config.topics().status(),
                payload: StatusRecord::OFFLINE.payload_string(),
                qos: self.config.mqtt.qos,
                retain: true,
            })
    }

    fn set_state(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Supervisor state");
        }
    }

    /// Run until `cancel` fires.
    ///
    /// On cancellation a retained `{"value":0}` is published and the bus
    /// session is disconnected cleanly.
    pub async fn run(&self, cancel: CancellationToken) -> SupervisorExit {
        info!(
            client_id = %self.config.mqtt.client_id,
            device = %self.config.modbus.endpoint().addr(),
            tags = self.config.tags.len(),
            "Supervisor started"
        );

        let mut bus: Option<B::Session> = None;

        loop {
            if let CycleEnd::Cancelled = self.run_cycle(&mut bus, &cancel).await {
                break;
            }

            self.set_state(SupervisorState::Disconnected);
            if !sleep_or_cancelled(self.config.retry_delay(), &cancel).await {
                break;
            }
        }

        if let Some(session) = bus.take() {
            self.go_offline(session).await;
        }
        self.set_state(SupervisorState::Disconnected);
        info!(client_id = %self.config.mqtt.client_id, "Supervisor stopped");

        SupervisorExit::Cancelled
    }

    /// One connect-and-poll cycle. The bus session is left in `bus` so the
    /// next cycle can disconnect it before reconnecting.
    async fn run_cycle(
        &self,
        bus: &mut Option<B::Session>,
        cancel: &CancellationToken,
    ) -> CycleEnd {
        if cancel.is_cancelled() {
            return CycleEnd::Cancelled;
        }

        self.set_state(SupervisorState::Disconnected);
        if let Some(previous) = bus.take() {
            previous
                .disconnect(self.config.mqtt.disconnect_grace())
                .await;
        }

        self.set_state(SupervisorState::ConnectingBus);
        let connected = tokio::select! {
            _ = cancel.cancelled() => return CycleEnd::Cancelled,
            result = self.bus.connect(&self.config.mqtt, Some(self.last_will())) => result,
        };
        let session = match connected {
            Ok(session) => bus.insert(session),
            Err(e) => {
                warn!(error = %e, "Bus connection failed");
                return CycleEnd::Retry;
            }
        };

        self.set_state(SupervisorState::ConnectingFieldbus);
        let endpoint = self.config.modbus.endpoint();
        let connected = tokio::select! {
            _ = cancel.cancelled() => return CycleEnd::Cancelled,
            result = self.fieldbus.connect(&endpoint) => result,
        };
        let mut device = match connected {
            Ok(device) => device,
            Err(e) => {
                warn!(error = %e, "Fieldbus connection failed");
                self.mark_offline(&*session, cancel).await;
                return CycleEnd::Retry;
            }
        };

        self.set_state(SupervisorState::Polling);
        let status_topic = self.config.topics().status();
        let online = tokio::select! {
            _ = cancel.cancelled() => None,
            result = session.publish_status(&status_topic, self.config.mqtt.qos, StatusRecord::ONLINE) => Some(result),
        };

        let exit = match online {
            None => PollExit::Cancelled,
            Some(Ok(())) => {
                info!(topic = %status_topic, "Polling started");
                TagPoller::new(&self.config)
                    .poll_forever(&mut device, &*session, cancel)
                    .await
            }
            Some(Err(e)) => {
                warn!(error = %e, "Failed to publish online status");
                PollExit::PublishFailed
            }
        };

        device.close().await;

        match exit {
            PollExit::Cancelled => CycleEnd::Cancelled,
            PollExit::ReadFailed => {
                self.mark_offline(&*session, cancel).await;
                CycleEnd::Retry
            }
            PollExit::PublishFailed => CycleEnd::Retry,
        }
    }

    /// Best-effort retained `{"value":0}` while the bus is still up.
    async fn mark_offline(&self, session: &B::Session, cancel: &CancellationToken) {
        if session.is_closed() {
            return;
        }

        let status_topic = self.config.topics().status();
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = session.publish_status(&status_topic, self.config.mqtt.qos, StatusRecord::OFFLINE) => result,
        };
        if let Err(e) = result {
            debug!(error = %e, "Failed to publish offline status");
        }
    }

    /// Publish the final offline status and disconnect cleanly.
    async fn go_offline(&self, session: B::Session) {
        if !session.is_closed() {
            let status_topic = self.config.topics().status();
            let published = tokio::time::timeout(
                self.config.mqtt.ack_timeout(),
                session.publish_status(&status_topic, self.config.mqtt.qos, StatusRecord::OFFLINE),
            )
            .await;

            match published {
                Ok(Ok(())) => debug!(topic = %status_topic, "Published offline status"),
                Ok(Err(e)) => warn!(error = %e, "Failed to publish offline status"),
                Err(_) => warn!("Timed out publishing offline status"),
            }
        }

        session
            .disconnect(self.config.mqtt.disconnect_grace())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RegisterKind;
    use crate::fieldbus::{FieldbusEndpoint, FieldbusError};
    use crate::testing::MockDevice;
    use async_trait::async_trait;
    use fieldlink_bridge_framework::BridgeConfig;
    use fieldlink_common::testing::MemoryBroker;
    use fieldlink_common::{MqttConfig, OutputRecord, TagValue};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    type EventLog = Arc<Mutex<Vec<&'static str>>>;

    /// Wraps a connector and logs each connect attempt.
    struct Logged<C> {
        inner: C,
        label: &'static str,
        log: EventLog,
    }

    #[async_trait]
    impl<C: BusConnector> BusConnector for Logged<C> {
        type Session = C::Session;

        async fn connect(
            &self,
            config: &MqttConfig,
            will: Option<LastWillConfig>,
        ) -> fieldlink_common::Result<C::Session> {
            self.log.lock().push(self.label);
            self.inner.connect(config, will).await
        }
    }

    #[async_trait]
    impl<C: FieldbusConnector> FieldbusConnector for Logged<C> {
        type Session = C::Session;

        async fn connect(
            &self,
            endpoint: &FieldbusEndpoint,
        ) -> Result<C::Session, FieldbusError> {
            self.log.lock().push(self.label);
            self.inner.connect(endpoint).await
        }
    }

    fn config() -> ModbusBridgeConfig {
        ModbusBridgeConfig::from_json5(
            r#"{
                modbus: { host: "plc", interval_ms: 100 },
                mqtt: { client_id: "dev1", qos: 1 },
                tags: [{ source_name: "plc01", tag_name: "t1", address: 0, quantity: 2 }],
            }"#,
        )
        .unwrap()
    }

    async fn run_for<B, F>(supervisor: ConnectionSupervisor<B, F>, duration: Duration)
    where
        B: BusConnector + 'static,
        F: FieldbusConnector + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { supervisor.run(token).await });

        tokio::time::sleep(duration).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), SupervisorExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_connects_before_fieldbus_every_cycle() {
        let broker = MemoryBroker::new();
        let device = MockDevice::new();
        device.refuse_next_connects(3);
        let log: EventLog = Arc::default();

        let supervisor = ConnectionSupervisor::new(
            config(),
            Logged {
                inner: broker.connector(),
                label: "bus",
                log: log.clone(),
            },
            Logged {
                inner: device.connector(),
                label: "fieldbus",
                log: log.clone(),
            },
        );
        run_for(supervisor, Duration::from_millis(3500)).await;

        let log = log.lock().clone();
        assert_eq!(
            log,
            vec!["bus", "fieldbus", "bus", "fieldbus", "bus", "fieldbus", "bus", "fieldbus"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fieldbus_connect_retries_after_delay() {
        let broker = MemoryBroker::new();
        let device = MockDevice::new();
        device.refuse_next_connects(usize::MAX);

        let supervisor = ConnectionSupervisor::new(config(), broker.connector(), device.connector());
        run_for(supervisor, Duration::from_millis(5500)).await;

        assert!(device.reads().is_empty());
        assert!(broker.published_to("devs/dev1/tags/t1").is_empty());

        let attempts = device.connect_times();
        assert_eq!(attempts.len(), 6);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }

        // Each retry replaces the previous bus session.
        assert_eq!(broker.connect_attempts().len(), 6);
        assert_eq!(broker.live_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_connect_failure_skips_fieldbus() {
        let broker = MemoryBroker::new();
        broker.refuse_next_connects(2);
        let device = MockDevice::new();

        let supervisor = ConnectionSupervisor::new(config(), broker.connector(), device.connector());
        run_for(supervisor, Duration::from_millis(2500)).await;

        let attempts = broker.connect_attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(device.connect_times().len(), 1);
        assert!(attempts[2].at - attempts[1].at >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_publish_and_status() {
        let broker = MemoryBroker::new();
        let device = MockDevice::new();
        device.set_raw_response(RegisterKind::Input, 0, vec![0x00, 0x00, 0x00, 0x2A]);

        let supervisor = ConnectionSupervisor::new(config(), broker.connector(), device.connector());
        let mut states = supervisor.subscribe_state();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { supervisor.run(token).await });

        states
            .wait_for(|s| *s == SupervisorState::Polling)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            broker.retained("devs/dev1/status").unwrap(),
            br#"{"value":1}"#.to_vec()
        );
        let records = broker.published_to("devs/dev1/tags/t1");
        let record: OutputRecord = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(record.value, TagValue::Integer(42));
        assert_eq!(record.tag_name, "t1");

        let will = broker.connect_attempts()[0].will.clone().unwrap();
        assert_eq!(will.topic, "devs/dev1/status");
        assert_eq!(will.payload, r#"{"value":0}"#);
        assert!(will.retain);

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            broker.retained("devs/dev1/status").unwrap(),
            br#"{"value":0}"#.to_vec()
        );
        assert_eq!(broker.live_sessions(), 0);
        assert_eq!(device.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abrupt_exit_leaves_offline_status_via_will() {
        let broker = MemoryBroker::new();
        let device = MockDevice::new();

        let supervisor = ConnectionSupervisor::new(config(), broker.connector(), device.connector());
        let mut states = supervisor.subscribe_state();
        let handle = tokio::spawn(async move { supervisor.run(CancellationToken::new()).await });

        states
            .wait_for(|s| *s == SupervisorState::Polling)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let before = broker.published_to("devs/dev1/status");
        assert!(!before.is_empty());
        assert!(before.iter().all(|p| p.json() == serde_json::json!({"value": 1})));

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        // Only the broker-side will adds the offline record.
        let after = broker.published_to("devs/dev1/status");
        assert_eq!(after.len(), before.len() + 1);
        assert_eq!(after.last().unwrap().json(), serde_json::json!({"value": 0}));
        assert!(after.last().unwrap().retain);
        assert_eq!(
            broker.retained("devs/dev1/status").unwrap(),
            br#"{"value":0}"#.to_vec()
        );
        assert_eq!(broker.live_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_reconnects_both_sessions() {
        let broker = MemoryBroker::new();
        let device = MockDevice::new();
        device.fail_next_reads(1);

        let supervisor = ConnectionSupervisor::new(config(), broker.connector(), device.connector());
        run_for(supervisor, Duration::from_millis(1500)).await;

        assert_eq!(broker.connect_attempts().len(), 2);
        assert_eq!(device.connect_times().len(), 2);

        let statuses: Vec<i64> = broker
            .published_to("devs/dev1/status")
            .iter()
            .filter_map(|p| p.json()["value"].as_i64())
            .collect();
        // online, offline after the failed read, online again, ..., offline on shutdown
        assert_eq!(&statuses[..3], &[1, 0, 1]);
        assert_eq!(statuses.last(), Some(&0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_forces_reconnect() {
        let broker = MemoryBroker::new();
        broker.set_fail_publishes(true);
        let device = MockDevice::new();

        let supervisor = ConnectionSupervisor::new(config(), broker.connector(), device.connector());
        run_for(supervisor, Duration::from_millis(2500)).await;

        assert_eq!(broker.connect_attempts().len(), 3);
        assert!(device.reads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_will_override() {
        let mut config = config();
        config.mqtt.last_will = Some(LastWillConfig {
            topic: "plant/dev1/lost".to_string(),
            payload: "lost".to_string(),
            qos: fieldlink_common::QosLevel::ExactlyOnce,
            retain: false,
        });
        let supervisor =
            ConnectionSupervisor::new(config, MemoryBroker::new().connector(), MockDevice::new().connector());

        let will = supervisor.last_will();
        assert_eq!(will.topic, "plant/dev1/lost");
        assert!(!will.retain);
    }
}
