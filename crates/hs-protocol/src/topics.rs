//! MQTT topic builders and publish-topic validation.
//!
//! Topic structure:
//! ```text
//! hello/{client_id}
//! ```

use thiserror::Error;

const PREFIX: &str = "hello";

/// Default publish topic of the reference sensor.
pub const DEFAULT_TOPIC: &str = "hello/sensor_01";

/// Maximum topic length allowed by the MQTT wire format (u16 length prefix).
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Reasons a topic cannot be used as a PUBLISH topic name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,

    #[error("topic contains wildcard character '{0}'")]
    Wildcard(char),

    #[error("topic contains a NUL character")]
    Nul,

    #[error("topic is {len} bytes, maximum is 65535")]
    TooLong { len: usize },
}

// ─── Topic builders ───

/// Hello topic for a given client: `hello/{client_id}`.
pub fn hello(client_id: &str) -> String {
    format!("{PREFIX}/{client_id}")
}

// ─── Validation ───

/// Check that `topic` is a valid MQTT topic *name* (not a filter).
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong { len: topic.len() });
    }
    if let Some(c) = topic.chars().find(|c| matches!(c, '+' | '#')) {
        return Err(TopicError::Wildcard(c));
    }
    if topic.contains('\0') {
        return Err(TopicError::Nul);
    }
    Ok(())
}
