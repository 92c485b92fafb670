//! End-to-end tests against a real MQTT broker.
//!
//! These tests need a broker listening on `localhost:1883` (for example
//! `mosquitto -p 1883`) and are ignored by default:
//!
//! ```text
//! cargo test -p fieldlink-common --test mqtt_e2e -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use fieldlink_common::{
    BusConnector, BusSession, LastWillConfig, MqttConfig, MqttConnector, QosLevel, StatusRecord,
    TopicBuilder,
};
use tokio::sync::mpsc;

/// Generate a unique client id to avoid test interference.
fn unique_id(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}-{}", prefix, nanos)
}

fn local_config(client_id: &str) -> MqttConfig {
    MqttConfig {
        addr: "tcp://127.0.0.1:1883".to_string(),
        client_id: client_id.to_string(),
        qos: QosLevel::AtLeastOnce,
        keep_alive_secs: 5,
        ..Default::default()
    }
}

async fn next_payload(rx: &mut mpsc::UnboundedReceiver<(String, Vec<u8>)>) -> (String, Vec<u8>) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timeout waiting for message")
        .expect("Channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires an MQTT broker on localhost:1883"]
async fn test_publish_subscribe_roundtrip() {
    let device = unique_id("dev");
    let topics = TopicBuilder::new(&device);

    let subscriber = MqttConnector
        .connect(&local_config(&unique_id("sub")), None)
        .await
        .expect("Subscriber connect failed");

    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .subscribe(
            &topics.tags_wildcard(),
            QosLevel::AtLeastOnce,
            Arc::new(move |topic, payload| {
                let _ = tx.send((topic.to_string(), payload.to_vec()));
            }),
        )
        .await
        .expect("Subscribe failed");

    tokio::time::sleep(Duration::from_millis(200)).await;

    let publisher = MqttConnector
        .connect(&local_config(&device), None)
        .await
        .expect("Publisher connect failed");
    publisher
        .publish(
            &topics.tag("t1"),
            QosLevel::AtLeastOnce,
            false,
            br#"{"value":42}"#.to_vec(),
        )
        .await
        .expect("Publish not acknowledged");

    let (topic, payload) = next_payload(&mut rx).await;
    assert_eq!(topic, topics.tag("t1"));
    assert_eq!(payload, br#"{"value":42}"#);

    publisher.disconnect(Duration::from_millis(250)).await;
    subscriber.disconnect(Duration::from_millis(250)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires an MQTT broker on localhost:1883"]
async fn test_last_will_retained_after_ungraceful_drop() {
    let device = unique_id("dev");
    let topics = TopicBuilder::new(&device);
    let will = LastWillConfig {
        topic: topics.status(),
        payload: StatusRecord::OFFLINE.payload_string(),
        qos: QosLevel::AtLeastOnce,
        retain: true,
    };

    let bridge = MqttConnector
        .connect(&local_config(&device), Some(will))
        .await
        .expect("Connect failed");
    bridge
        .publish_status(&topics.status(), QosLevel::AtLeastOnce, StatusRecord::ONLINE)
        .await
        .expect("Status publish failed");

    // No DISCONNECT packet: the broker must fire the will.
    drop(bridge);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // A fresh subscriber receives the retained will.
    let observer = MqttConnector
        .connect(&local_config(&unique_id("obs")), None)
        .await
        .expect("Observer connect failed");
    let (tx, mut rx) = mpsc::unbounded_channel();
    observer
        .subscribe(
            &topics.status(),
            QosLevel::AtLeastOnce,
            Arc::new(move |topic, payload| {
                let _ = tx.send((topic.to_string(), payload.to_vec()));
            }),
        )
        .await
        .expect("Subscribe failed");

    let (_, payload) = next_payload(&mut rx).await;
    let status: StatusRecord = serde_json::from_slice(&payload).unwrap();
    assert_eq!(status, StatusRecord::OFFLINE);

    // Clear the retained message.
    observer
        .publish(&topics.status(), QosLevel::AtLeastOnce, true, Vec::new())
        .await
        .expect("Clear failed");
    observer.disconnect(Duration::from_millis(250)).await;
}
