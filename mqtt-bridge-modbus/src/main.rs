//! MQTT bridge for Modbus/TCP devices.
//!
//! Polls one Modbus device and publishes tag values to an MQTT broker.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use fieldlink_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
use fieldlink_common::MqttConnector;
use mqtt_bridge_modbus::{ConnectionSupervisor, ModbusBridgeConfig, ModbusTcpConnector};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("modbus.json5");

    // Load configuration
    let config = ModbusBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // The supervisor needs time to publish the offline status and disconnect.
    let shutdown_timeout =
        config.mqtt.ack_timeout() + config.mqtt.disconnect_grace() + Duration::from_secs(1);

    let mut runner = BridgeRunner::new_with_args("mqtt-bridge-modbus", config.clone(), Some(&args))?
        .with_shutdown_timeout(shutdown_timeout);

    info!("Loaded configuration from {:?}", args.config);
    info!(
        broker = %config.mqtt.addr,
        device = %config.modbus.endpoint().addr(),
        tags = config.tags.len(),
        on_read_error = ?config.modbus.on_read_error,
        "Modbus bridge configured"
    );

    let supervisor = ConnectionSupervisor::new(config, MqttConnector, ModbusTcpConnector);
    let cancel = runner.cancel_token();
    runner.spawn("supervisor", async move {
        supervisor.run(cancel).await;
    });

    runner.run().await?;

    Ok(())
}
