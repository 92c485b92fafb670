use thiserror::Error;

/// Common error type for FieldLink components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("MQTT connection to {broker} failed: {message}")]
    Connect { broker: String, message: String },

    #[error("MQTT connection to {broker} timed out after {timeout_ms}ms")]
    ConnectTimeout { broker: String, timeout_ms: u64 },

    #[error("Failed to publish to '{topic}': {message}")]
    Publish { topic: String, message: String },

    #[error("No acknowledgment for publish to '{topic}' within {timeout_ms}ms")]
    AckTimeout { topic: String, timeout_ms: u64 },

    #[error("Failed to subscribe to '{filter}': {message}")]
    Subscribe { filter: String, message: String },

    #[error("MQTT session closed")]
    SessionClosed,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid topic: {0}")]
    Topic(String),
}

/// Result type alias using FieldLink's Error.
pub type Result<T> = std::result::Result<T, Error>;
