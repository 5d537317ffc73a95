use serde::{Deserialize, Serialize};

/// Hello-world payload published by a sensor on every tick.
///
/// Serialized as a single-field JSON object, e.g.
/// `{"message":"Hello from sensor_01"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub message: String,
}

impl HelloMessage {
    /// Greeting for the given MQTT client identifier.
    pub fn from_client(client_id: &str) -> Self {
        Self {
            message: format!("Hello from {client_id}"),
        }
    }

    /// UTF-8 JSON encoding used on the wire.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
