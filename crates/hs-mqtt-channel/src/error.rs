//! MQTT channel error types.

use std::time::Duration;

use hs_protocol::TopicError;
use thiserror::Error;

use crate::queue::DropPolicy;

/// Errors that can occur while building, connecting or publishing.
#[derive(Debug, Error)]
pub enum MqttError {
    /// Certificate, key or CA material is missing or unparseable.
    #[error("credential error: {0}")]
    Credential(String),

    /// Credentials parse but cannot form a TLS client (e.g. cert/key mismatch).
    #[error("TLS configuration error: {0}")]
    TlsHandshakeConfig(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connect timed out after {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("broker rejected client authentication: {0}")]
    AuthFailure(String),

    /// Transport-level failure; the link is gone.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("not connected and offline queueing is disabled")]
    NotConnected,

    #[error("publish to '{topic}' not acknowledged within {timeout:?}")]
    PublishTimeout { topic: String, timeout: Duration },

    #[error("offline queue full (capacity {capacity}), dropped the {policy} message")]
    QueueFull { capacity: usize, policy: DropPolicy },

    #[error("invalid publish topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MqttError {
    /// Whether the error cannot be recovered by retrying.
    ///
    /// Only bad credential material and bad configuration are fatal;
    /// everything else is handled by reconnect or the offline queue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MqttError::Credential(_) | MqttError::TlsHandshakeConfig(_) | MqttError::Config(_)
        )
    }
}

/// Convenience alias for MQTT results.
pub type MqttResult<T> = Result<T, MqttError>;
