//! Integration tests for the Prometheus exporter.
//!
//! These tests verify the full flow from messages published on the bus
//! to gauges exposed via the HTTP /metrics endpoint.

use std::sync::Arc;
use std::time::Duration;

use fieldlink_bridge_framework::BridgeConfig;
use fieldlink_common::testing::MemoryBroker;
use fieldlink_common::{BusConnector, BusSession, OutputRecord, QosLevel, StatusRecord, TagValue};
use fieldlink_exporter_prometheus::{
    DynamicMetricRegistry, ExporterConfig, HttpServer, MessageOutcome, SharedRegistry,
    TelemetrySubscriber,
};
use tokio_util::sync::CancellationToken;

fn exporter_config() -> ExporterConfig {
    ExporterConfig::from_json5(
        r#"{
            mqtt: { client_id: "exporter", qos: 1 },
            prometheus: { listen: "127.0.0.1:0" },
            reconnect_delay_secs: 1,
        }"#,
    )
    .unwrap()
}

fn bridge_config(client_id: &str) -> fieldlink_common::MqttConfig {
    fieldlink_common::MqttConfig {
        client_id: client_id.to_string(),
        ..Default::default()
    }
}

/// Parse "name value" lines, skipping comments.
fn parse_sample(text: &str, name: &str) -> Option<f64> {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once(' '))
        .find(|(metric, _)| *metric == name)
        .and_then(|(_, value)| value.trim().parse().ok())
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met");
}

fn spawn_subscriber(
    broker: &MemoryBroker,
    registry: SharedRegistry,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let subscriber = TelemetrySubscriber::new(broker.connector(), &exporter_config(), registry);
    let cancel = cancel.clone();
    tokio::spawn(async move { subscriber.run(cancel).await })
}

#[tokio::test]
async fn test_full_flow_to_http_endpoint() {
    let broker = MemoryBroker::new();
    let registry: SharedRegistry = Arc::new(DynamicMetricRegistry::new());
    let cancel = CancellationToken::new();

    let subscriber = spawn_subscriber(&broker, registry.clone(), &cancel);
    wait_for(|| broker.live_sessions() == 1).await;

    // A bridge publishing one tag and its status.
    let bridge = broker
        .connector()
        .connect(&bridge_config("mydev1"), None)
        .await
        .unwrap();
    let record = OutputRecord::new("plc01", "t1", TagValue::Integer(42));
    bridge
        .publish(
            "devs/mydev1/tags/t1",
            QosLevel::AtLeastOnce,
            false,
            record.to_json().unwrap(),
        )
        .await
        .unwrap();
    bridge
        .publish_status("devs/mydev1/status", QosLevel::AtLeastOnce, StatusRecord::ONLINE)
        .await
        .unwrap();

    let config = exporter_config();
    let server = HttpServer::bind(
        registry.clone(),
        config.prometheus.listen_addr().unwrap(),
        config.prometheus.path.clone(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let server_handle = tokio::spawn(server.run(cancel.clone()));

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    assert_eq!(parse_sample(&body, "devs_mydev1_tags_t1"), Some(42.0));
    assert_eq!(parse_sample(&body, "devs_mydev1_status"), Some(1.0));

    let ready = client
        .get(format!("http://{}/ready", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);

    cancel.cancel();
    server_handle.await.unwrap().unwrap();
    subscriber.await.unwrap();
}

#[tokio::test]
async fn test_last_will_sets_status_gauge_to_zero() {
    let broker = MemoryBroker::new();
    let registry: SharedRegistry = Arc::new(DynamicMetricRegistry::new());
    let cancel = CancellationToken::new();

    let subscriber = spawn_subscriber(&broker, registry.clone(), &cancel);
    wait_for(|| broker.live_sessions() == 1).await;

    let will = fieldlink_common::LastWillConfig {
        topic: "devs/mydev1/status".to_string(),
        payload: StatusRecord::OFFLINE.payload_string(),
        qos: QosLevel::AtLeastOnce,
        retain: true,
    };
    let bridge = broker
        .connector()
        .connect(&bridge_config("mydev1"), Some(will))
        .await
        .unwrap();
    bridge
        .publish_status("devs/mydev1/status", QosLevel::AtLeastOnce, StatusRecord::ONLINE)
        .await
        .unwrap();
    assert_eq!(registry.value("devs/mydev1/status"), Some(1.0));

    // Ungraceful loss of the bridge.
    drop(bridge);

    assert_eq!(registry.value("devs/mydev1/status"), Some(0.0));
    assert!(registry.render().contains("devs_mydev1_status 0"));

    cancel.cancel();
    subscriber.await.unwrap();
}

#[tokio::test]
async fn test_float_and_multiple_devices() {
    let registry = DynamicMetricRegistry::new();

    let flow = OutputRecord::new("plc01", "flow", TagValue::Float(12.5));
    let level = OutputRecord::new("plc02", "level", TagValue::Integer(-3));

    registry.on_message("devs/dev-a/tags/flow", &flow.to_json().unwrap());
    registry.on_message("devs/dev.b/tags/level", &level.to_json().unwrap());

    let text = registry.render();
    assert_eq!(parse_sample(&text, "devs_dev_a_tags_flow"), Some(12.5));
    assert_eq!(parse_sample(&text, "devs_dev_b_tags_level"), Some(-3.0));
    assert_eq!(registry.series_count(), 2);
}

#[tokio::test]
async fn test_empty_registry_render() {
    let registry = DynamicMetricRegistry::new();
    let text = registry.render();

    assert_eq!(text.trim(), "# EOF");
}

#[tokio::test]
async fn test_concurrent_messages() {
    let registry: SharedRegistry = Arc::new(DynamicMetricRegistry::new());

    let mut handles = Vec::new();
    for device in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..50 {
                let topic = format!("devs/dev{}/tags/t{}", device, i % 5);
                let payload = format!(r#"{{"value":{}}}"#, i);
                let outcome = registry.on_message(&topic, payload.as_bytes());
                assert!(matches!(
                    outcome,
                    MessageOutcome::Created | MessageOutcome::Updated
                ));
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(registry.series_count(), 40);
    let stats = registry.stats();
    assert_eq!(stats.received, 400);
    assert_eq!(stats.created, 40);
    assert_eq!(stats.updated, 360);
}
