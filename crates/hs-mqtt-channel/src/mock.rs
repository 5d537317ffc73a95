//! In-memory broker for testing without a real MQTT server.
//!
//! `MockBroker` records every accepted publish and every connection
//! attempt. Connection outcomes can be scripted, the live connection can
//! be dropped on demand, and acknowledgments can be delayed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::channel::{Connector, Link};
use crate::error::{MqttError, MqttResult};
use crate::queue::QueuedMessage;

/// A publish the broker accepted.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub received_at: Instant,
}

/// Result of one scripted connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    /// CONNACK refused: not authorized.
    AuthFailure,
    /// Network-level failure (connection refused, DNS, ...).
    Unreachable,
    /// Never completes; exercises the connect timeout.
    Hang,
}

#[derive(Default)]
struct BrokerState {
    published: Vec<PublishedMessage>,
    script: VecDeque<ConnectOutcome>,
    connect_attempts: Vec<Instant>,
    current: Option<(u64, watch::Sender<Option<String>>)>,
    links: u64,
    disconnects: usize,
    ack_delay: Option<Duration>,
}

/// Shared in-memory broker.
#[derive(Default)]
pub struct MockBroker {
    state: Mutex<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connector whose attempts are served by this broker.
    pub fn connector(self: &Arc<Self>) -> MockConnector {
        MockConnector {
            broker: self.clone(),
        }
    }

    /// Queue outcomes for the next connection attempts. Once the script
    /// runs out every attempt is accepted.
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.lock().script.extend(outcomes);
    }

    /// Delay acknowledgments (simulates a slow or stalled broker).
    pub fn set_ack_delay(&self, delay: Option<Duration>) {
        self.lock().ack_delay = delay;
    }

    /// Sever the live connection as a network failure would.
    pub fn drop_connection(&self) {
        if let Some((_, current)) = self.lock().current.take() {
            current.send_replace(Some("connection reset by peer".to_string()));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Get all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Get published messages for a specific topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Times at which connection attempts started.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.lock().connect_attempts.clone()
    }

    /// Number of client-initiated DISCONNECTs received.
    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    /// Clear recorded publishes.
    pub fn reset(&self) {
        self.lock().published.clear();
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }
}

/// [`Connector`] backed by a [`MockBroker`].
pub struct MockConnector {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> MqttResult<Arc<dyn Link>> {
        let outcome = {
            let mut state = self.broker.lock();
            state.connect_attempts.push(Instant::now());
            state.script.pop_front().unwrap_or(ConnectOutcome::Accept)
        };

        match outcome {
            ConnectOutcome::Accept => {}
            ConnectOutcome::AuthFailure => {
                return Err(MqttError::AuthFailure("NotAuthorized".into()));
            }
            ConnectOutcome::Unreachable => {
                return Err(MqttError::Connection("connection refused".into()));
            }
            ConnectOutcome::Hang => std::future::pending::<()>().await,
        }

        let (closed_tx, closed_rx) = watch::channel(None);
        let id = {
            let mut state = self.broker.lock();
            state.links += 1;
            state.current = Some((state.links, closed_tx.clone()));
            state.links
        };
        Ok(Arc::new(MockLink {
            broker: self.broker.clone(),
            id,
            closed_tx,
            closed_rx,
        }))
    }
}

struct MockLink {
    broker: Arc<MockBroker>,
    id: u64,
    closed_tx: watch::Sender<Option<String>>,
    closed_rx: watch::Receiver<Option<String>>,
}

impl MockLink {
    fn closed_reason(&self) -> Option<String> {
        self.closed_rx.borrow().clone()
    }
}

#[async_trait]
impl Link for MockLink {
    async fn publish(&self, message: &QueuedMessage) -> MqttResult<()> {
        if let Some(reason) = self.closed_reason() {
            return Err(MqttError::Connection(reason));
        }
        let delay = self.broker.lock().ack_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            if let Some(reason) = self.closed_reason() {
                return Err(MqttError::Connection(reason));
            }
        }
        self.broker.lock().published.push(PublishedMessage {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            qos: message.qos,
            received_at: Instant::now(),
        });
        Ok(())
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed_rx.clone();
        match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "broker gone".to_string(),
        }
    }

    async fn disconnect(&self) -> MqttResult<()> {
        if self.closed_reason().is_some() {
            return Ok(());
        }
        {
            let mut state = self.broker.lock();
            state.disconnects += 1;
            if state.current.as_ref().is_some_and(|(id, _)| *id == self.id) {
                state.current = None;
            }
        }
        self.closed_tx
            .send_replace(Some("client disconnect".to_string()));
        Ok(())
    }
}
