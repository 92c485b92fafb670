use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A decoded tag value.
///
/// Integer types serialize as JSON integers, floats as JSON floats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Integer(i64),
    Float(f64),
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::Integer(v)
    }
}

impl From<u32> for TagValue {
    fn from(v: u32) -> Self {
        TagValue::Integer(i64::from(v))
    }
}

impl From<f32> for TagValue {
    fn from(v: f32) -> Self {
        TagValue::Float(f64::from(v))
    }
}

impl std::fmt::Display for TagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagValue::Integer(v) => write!(f, "{}", v),
            TagValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One polled tag value as published on the bus.
///
/// The `srcNmae`/`tagNmae` keys are what downstream consumers expect and
/// must not be corrected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    #[serde(rename = "srcNmae")]
    pub source_name: String,

    #[serde(rename = "tagNmae")]
    pub tag_name: String,

    pub value: TagValue,

    /// RFC-3339 timestamp taken when the record is built for publishing.
    pub timestamp: String,
}

impl OutputRecord {
    /// Create a record stamped with the current time.
    pub fn new(
        source_name: impl Into<String>,
        tag_name: impl Into<String>,
        value: impl Into<TagValue>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            tag_name: tag_name.into(),
            value: value.into(),
            timestamp: current_timestamp_rfc3339(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Liveness record: `1` while polling, `0` when the bridge is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub value: u8,
}

impl StatusRecord {
    pub const ONLINE: StatusRecord = StatusRecord { value: 1 };
    pub const OFFLINE: StatusRecord = StatusRecord { value: 0 };

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// JSON payload as a string, used for last-will messages.
    pub fn payload_string(&self) -> String {
        format!("{{\"value\":{}}}", self.value)
    }
}

/// Current wall-clock time as an RFC-3339 string with second precision.
pub fn current_timestamp_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
