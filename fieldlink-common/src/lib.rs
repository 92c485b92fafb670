//! FieldLink Common Library
//!
//! This crate provides shared types and utilities for FieldLink bridges:
//!
//! - [`telemetry`] - Wire records published on the bus (`OutputRecord`, `StatusRecord`)
//! - [`config`] - MQTT and logging configuration, JSON5 loading
//! - [`session`] - MQTT session management and the bus traits
//! - [`topic`] - Topic builders, parsers and filter matching
//! - [`shutdown`] - Cancellation-aware sleeps and signal handling
//! - [`error`] - Error types
//! - `testing` - In-memory broker for tests (feature `testing`)

pub mod config;
pub mod error;
pub mod session;
pub mod shutdown;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod topic;

// Re-export commonly used types at the crate root
pub use config::{LastWillConfig, LogFormat, LoggingConfig, MqttConfig, QosLevel, parse_config};
pub use error::{Error, Result};
pub use session::{BusConnector, BusSession, MessageHandler, MqttConnector, MqttSession};
pub use shutdown::{shutdown_signal, sleep_or_cancelled};
pub use telemetry::{OutputRecord, StatusRecord, TagValue, current_timestamp_rfc3339};
pub use topic::{TopicBuilder, matches_filter, parse_topic, sanitize_topic};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG`, when set, takes precedence over `config.level`.
///
/// # Example
///
/// ```ignore
/// use fieldlink_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
