//! Modbus ramp writers and MQTT liveness watchdogs for test benches.

use fieldlink_bridge_framework::run_bridge;
use fieldlink_common::MqttConnector;
use fieldlink_devsim::{DevsimConfig, LivenessWatchdog, RampWriter};
use mqtt_bridge_modbus::ModbusTcpConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_bridge::<DevsimConfig, _>("fieldlink-devsim", "devsim.json5", |runner| {
        let config = runner.config().clone();
        let endpoint = config.modbus.endpoint();

        for writer in config.writers {
            let name = format!("ramp-{}", writer.address);
            let writer = RampWriter::new(ModbusTcpConnector, endpoint.clone(), writer);
            let cancel = runner.cancel_token();
            runner.spawn(name, async move { writer.run(cancel).await });
        }

        for watchdog in &config.watchdogs {
            let name = format!("watchdog-{}", watchdog.device);
            let watchdog = LivenessWatchdog::new(MqttConnector, &config.mqtt, watchdog);
            let cancel = runner.cancel_token();
            runner.spawn(name, async move { watchdog.run(cancel).await });
        }

        Ok(())
    })
    .await
}
