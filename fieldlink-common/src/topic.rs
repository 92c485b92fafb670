//! Topic builders, parsers and filter matching.
//!
//! Device topics follow the pattern:
//!
//! ```text
//! devs/<client_id>/tags/<tag_name>   telemetry
//! devs/<client_id>/status            liveness
//! ```

use crate::error::{Error, Result};

/// Root segment for all device topics.
pub const TOPIC_ROOT: &str = "devs";

/// Minimum number of `/`-separated segments for a topic to be accepted by the exporter.
pub const MIN_TOPIC_SEGMENTS: usize = 3;

/// Builder for one device's topics.
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    root: String,
    device: String,
}

impl TopicBuilder {
    /// Create a builder for a device (usually the MQTT client id).
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            root: TOPIC_ROOT.to_string(),
            device: device.into(),
        }
    }

    /// Telemetry topic for a tag.
    ///
    /// ```
    /// use fieldlink_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("dev1");
    /// assert_eq!(topics.tag("t1"), "devs/dev1/tags/t1");
    /// ```
    pub fn tag(&self, tag_name: &str) -> String {
        format!("{}/{}/tags/{}", self.root, self.device, tag_name)
    }

    /// Liveness topic for the device.
    ///
    /// ```
    /// use fieldlink_common::topic::TopicBuilder;
    ///
    /// assert_eq!(TopicBuilder::new("dev1").status(), "devs/dev1/status");
    /// ```
    pub fn status(&self) -> String {
        format!("{}/{}/status", self.root, self.device)
    }

    /// Filter matching every tag topic of the device.
    pub fn tags_wildcard(&self) -> String {
        format!("{}/{}/tags/+", self.root, self.device)
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

/// Kind of device topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// `devs/<device>/tags/<tag>`
    Tag(String),
    /// `devs/<device>/status`
    Status,
    /// Any other topic with at least three segments.
    Other,
}

/// A topic split into its device-level parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub root: String,
    pub device: String,
    pub kind: TopicKind,
}

/// Parse a topic into its parts.
///
/// Topics with fewer than three segments are rejected.
pub fn parse_topic(topic: &str) -> Result<ParsedTopic> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < MIN_TOPIC_SEGMENTS {
        return Err(Error::Topic(format!(
            "'{}' has {} segment(s), expected at least {}",
            topic,
            parts.len(),
            MIN_TOPIC_SEGMENTS
        )));
    }

    let kind = match (parts[2], parts.len()) {
        ("status", 3) => TopicKind::Status,
        ("tags", 4) => TopicKind::Tag(parts[3].to_string()),
        _ => TopicKind::Other,
    };

    Ok(ParsedTopic {
        root: parts[0].to_string(),
        device: parts[1].to_string(),
        kind,
    })
}

/// Turn a topic into a metric name: `/`, space, `-` and `.` become `_`.
///
/// Idempotent: sanitizing an already sanitized name returns it unchanged.
pub fn sanitize_topic(topic: &str) -> String {
    topic
        .chars()
        .map(|c| match c {
            '/' | ' ' | '-' | '.' => '_',
            other => other,
        })
        .collect()
}

/// Check a topic name used for publishing (no wildcards, not empty).
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::Topic("topic cannot be empty".to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::Topic(format!(
            "'{}' contains wildcard characters",
            topic
        )));
    }
    Ok(())
}

/// Check whether a topic matches a subscription filter (`+` and `#` wildcards).
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    // Wildcards at the first level never match `$`-prefixed system topics.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
