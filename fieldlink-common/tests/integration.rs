//! Integration tests for fieldlink-common library.

use fieldlink_common::topic::TopicKind;
use fieldlink_common::{
    MqttConfig, OutputRecord, QosLevel, StatusRecord, TagValue, TopicBuilder, parse_config,
    parse_topic, sanitize_topic,
};

#[test]
fn test_record_topic_to_metric_name() {
    let topics = TopicBuilder::new("plc-01");
    let topic = topics.tag("flow.rate");

    let parsed = parse_topic(&topic).expect("Parse failed");
    assert_eq!(parsed.device, "plc-01");
    assert_eq!(parsed.kind, TopicKind::Tag("flow.rate".to_string()));

    assert_eq!(sanitize_topic(&topic), "devs_plc_01_tags_flow_rate");
}

#[test]
fn test_output_record_roundtrip_through_json() {
    let record = OutputRecord::new("plc01", "t1", 42u32);
    let bytes = record.to_json().expect("Encode failed");

    let decoded: OutputRecord = serde_json::from_slice(&bytes).expect("Decode failed");
    assert_eq!(decoded.source_name, "plc01");
    assert_eq!(decoded.tag_name, "t1");
    assert_eq!(decoded.value, TagValue::Integer(42));
    assert_eq!(decoded.timestamp, record.timestamp);
}

#[test]
fn test_status_record_parses_from_wire() {
    let status: StatusRecord = serde_json::from_str(r#"{"value":0}"#).unwrap();
    assert_eq!(status, StatusRecord::OFFLINE);
}

#[test]
fn test_full_mqtt_config_json5() {
    let config: MqttConfig = parse_config(
        r#"{
            // Broker
            addr: "mqtt://broker.plant.local",
            client_id: "line-3",
            qos: 2,
            keep_alive_secs: 10,
            last_will: {
                topic: "plant/line-3/offline",
                payload: "gone",
            },
        }"#,
    )
    .expect("Parse failed");

    assert_eq!(
        config.broker_endpoint().unwrap(),
        ("broker.plant.local".to_string(), 1883)
    );
    assert_eq!(config.qos, QosLevel::ExactlyOnce);
    let will = config.last_will.as_ref().unwrap();
    assert!(will.retain);
    assert_eq!(will.qos, QosLevel::AtMostOnce);
    config.validate().expect("Validation failed");
}

#[test]
fn test_wildcard_will_topic_rejected() {
    let config: MqttConfig = parse_config(
        r#"{ client_id: "x", last_will: { topic: "devs/+/status", payload: "0" } }"#,
    )
    .unwrap();
    assert!(config.validate().is_err());
}
