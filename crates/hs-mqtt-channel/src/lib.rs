//! MQTT/TLS publisher core for the hello-sensor device.
//!
//! - `tls` validates the device credentials and builds the rumqttc transport
//! - `ConnectionManager` owns the single broker session, reconnects with
//!   exponential backoff and drains the offline queue
//! - `OfflineQueue` buffers messages while disconnected
//! - `MockBroker` stands in for a real broker in tests

pub mod backoff;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod mock;
pub mod queue;
pub mod tls;

// Re-exports for convenience.
pub use backoff::{Backoff, BackoffPolicy};
pub use channel::{Connector, Link, RumqttConnector};
pub use config::{MqttConfig, QueueConfig};
pub use connection::{ConnectionManager, ConnectionState, ConnectionTiming, PublishOutcome};
pub use error::{MqttError, MqttResult};
pub use mock::{ConnectOutcome, MockBroker, MockConnector, PublishedMessage};
pub use queue::{DropPolicy, OfflineQueue, QueueCapacity, QueuedMessage};
pub use tls::{Credentials, TlsContext};
