//! Prometheus exporter for FieldLink telemetry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use fieldlink_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
use fieldlink_common::MqttConnector;
use fieldlink_exporter_prometheus::{
    DynamicMetricRegistry, ExporterConfig, HttpServer, TelemetrySubscriber,
};

/// Prometheus exporter for FieldLink telemetry.
#[derive(Parser, Debug)]
#[command(name = "fieldlink-exporter-prometheus")]
#[command(about = "Export MQTT device telemetry as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, default_value = "exporter.json5")]
    config: PathBuf,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ExporterConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if let Some(listen) = args.listen {
        config.prometheus.listen = listen;
        config.validate()?;
    }

    let listen_addr = config.prometheus.listen_addr()?;
    let metrics_path = config.prometheus.path.clone();
    let grace = config.mqtt.disconnect_grace();

    let bridge_args = BridgeArgs {
        config: args.config,
        log_level: args.log_level,
    };
    let mut runner = BridgeRunner::new_with_args(
        "fieldlink-exporter-prometheus",
        config,
        Some(&bridge_args),
    )?
    .with_shutdown_timeout(grace + Duration::from_secs(5));

    let registry = Arc::new(DynamicMetricRegistry::new());

    let server = HttpServer::bind(registry.clone(), listen_addr, metrics_path).await?;

    let subscriber = TelemetrySubscriber::new(MqttConnector, runner.config(), registry.clone());
    let cancel = runner.cancel_token();
    runner.spawn("subscriber", async move { subscriber.run(cancel).await });

    let cancel = runner.cancel_token();
    runner.spawn_with_error("http", server.run(cancel));

    runner.run().await?;

    let stats = registry.stats();
    info!(
        received = stats.received,
        created = stats.created,
        dropped = stats.dropped,
        series = registry.series_count(),
        "Final statistics"
    );

    Ok(())
}
