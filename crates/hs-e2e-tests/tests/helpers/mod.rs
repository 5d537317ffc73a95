//! Shared test harness for E2E integration tests.
//!
//! Wires the sensor agent's publisher loop and the connection manager
//! (supervisor + drain) to a shared `MockBroker`, exercising real code
//! paths across all crate boundaries.

#![allow(dead_code)]

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hs_mqtt_channel::{
    ConnectionManager, ConnectionState, ConnectionTiming, MockBroker, OfflineQueue,
};
use hs_sensor_agent::config::AgentConfig;
use hs_sensor_agent::publisher::{self, PublishSchedule, TracingReporter};

/// End-to-end test harness: one sensor agent talking to a mock broker.
pub struct TestHarness {
    /// In-memory broker shared with the agent.
    pub broker: Arc<MockBroker>,
    /// Connection manager under test.
    pub manager: Arc<ConnectionManager>,
    /// Configuration the harness was built from.
    pub config: AgentConfig,
    /// Stops every spawned background task.
    pub cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TestHarness {
    /// Agent with default settings against a plaintext mock broker.
    pub fn new() -> Self {
        Self::with_config(plaintext_config())
    }

    /// Agent built from a TOML document (same layout as `agent.toml`).
    pub fn from_toml(toml: &str) -> Self {
        let config: AgentConfig = toml::from_str(toml).expect("harness config should parse");
        Self::with_config(config)
    }

    pub fn with_config(config: AgentConfig) -> Self {
        config.validate().expect("harness config should validate");
        let broker = MockBroker::new();
        let queue = OfflineQueue::new(
            config.offline_queue.capacity().unwrap(),
            config.offline_queue.offline_drop_policy,
        );
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(broker.connector()),
            ConnectionTiming::from_config(&config.mqtt).unwrap(),
            Arc::new(queue),
        ));

        Self {
            broker,
            manager,
            config,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Start the reconnect supervisor.
    pub fn spawn_supervisor(&mut self) {
        let manager = self.manager.clone();
        let cancel = self.cancel.clone();
        self.tasks
            .push(tokio::spawn(async move { manager.run(cancel).await }));
    }

    /// Start the offline queue drain at the configured rate.
    pub fn spawn_drain(&mut self) {
        let manager = self.manager.clone();
        let cancel = self.cancel.clone();
        let rate_hz = self.config.offline_queue.draining_frequency_hz;
        self.tasks.push(tokio::spawn(async move {
            manager
                .drain(rate_hz, cancel)
                .await
                .expect("drain rejected the configured rate");
        }));
    }

    /// Start the publisher loop; the handle yields the attempt count.
    pub fn spawn_publisher(&self) -> JoinHandle<u64> {
        let manager = self.manager.clone();
        let cancel = self.cancel.clone();
        let schedule = PublishSchedule::from_config(&self.config);
        tokio::spawn(async move {
            publisher::run(&manager, &schedule, &TracingReporter, cancel).await
        })
    }

    /// Wait until the manager reports `state`.
    pub async fn wait_for(&self, state: ConnectionState) {
        self.manager
            .watch_state()
            .wait_for(|s| *s == state)
            .await
            .expect("manager dropped");
    }

    /// Cancel background tasks, wait for them, then disconnect once.
    pub async fn shutdown(mut self) -> Arc<MockBroker> {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.await.expect("background task panicked");
        }
        self.manager.disconnect().await.unwrap();
        self.broker
    }
}

/// Default agent settings with TLS off so no credentials are needed.
pub fn plaintext_config() -> AgentConfig {
    let mut config = AgentConfig::new("broker.test");
    config.mqtt.use_tls = false;
    config
}

/// Payload bytes of every message the broker received, in arrival order.
pub fn payloads(broker: &MockBroker) -> Vec<String> {
    broker
        .published()
        .into_iter()
        .map(|m| String::from_utf8(m.payload).unwrap())
        .collect()
}
