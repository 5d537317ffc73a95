//! Connection manager: explicit state machine for the broker session.
//!
//! ```text
//! Disconnected --connect()--> Connecting --handshake ok--> Connected
//! Connecting   --timeout / refused-------> Disconnected
//! Connected    --transport error---------> Disconnected  (supervisor reconnects)
//! ```
//!
//! The manager is the only writer of [`ConnectionState`]. Two activities
//! run next to the publisher: [`ConnectionManager::run`] (reconnect
//! supervisor with backoff) and [`ConnectionManager::drain`] (offline
//! queue drain at a bounded rate).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hs_protocol::{HelloMessage, topics};
use rumqttc::QoS;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::channel::{Connector, Link};
use crate::config::{self, MqttConfig};
use crate::error::{MqttError, MqttResult};
use crate::queue::{OfflineQueue, QueuedMessage};

/// Lifecycle of the single broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What happened to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Acknowledged by the broker.
    Sent,
    /// Stored in the offline queue for the drain activity.
    Queued,
}

/// Timing knobs taken from [`MqttConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTiming {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl ConnectionTiming {
    pub fn from_config(config: &MqttConfig) -> MqttResult<Self> {
        config.validate()?;
        Ok(Self {
            connect_timeout: config.connect_timeout(),
            operation_timeout: config.operation_timeout(),
            backoff: config.backoff_policy()?,
        })
    }
}

struct Session {
    link: Option<Arc<dyn Link>>,
    connected_at: Option<Instant>,
    backoff: Backoff,
}

/// Owns the transport connection lifecycle.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    timing: ConnectionTiming,
    queue: Arc<OfflineQueue>,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        timing: ConnectionTiming,
        queue: Arc<OfflineQueue>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            timing,
            queue,
            state,
            session: Mutex::new(Session {
                link: None,
                connected_at: None,
                backoff: Backoff::new(timing.backoff),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Read-only view of the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn timing(&self) -> &ConnectionTiming {
        &self.timing
    }

    /// Delay the supervisor would wait before the next reconnect attempt.
    pub fn next_backoff(&self) -> Duration {
        self.session().backoff.peek()
    }

    /// One connection attempt, bounded by the connect timeout.
    pub async fn connect(&self) -> MqttResult<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);

        let timeout = self.timing.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectTimeout { timeout }),
        };

        match result {
            Ok(link) => {
                {
                    let mut session = self.session();
                    session.link = Some(link);
                    session.connected_at = Some(Instant::now());
                }
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Publish a message.
    ///
    /// Sends right away when connected and nothing is waiting in the
    /// offline queue; otherwise the message joins the queue so ordering
    /// is preserved. A transport failure mid-send also queues the message.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
    ) -> MqttResult<PublishOutcome> {
        topics::validate_publish_topic(topic)?;
        let message = QueuedMessage::new(topic, payload, qos);

        let link = match self.current_link() {
            Some(link) if self.queue.is_empty() => link,
            _ => return self.enqueue(message),
        };

        match self.send(link.as_ref(), &message).await {
            Ok(()) => Ok(PublishOutcome::Sent),
            Err(MqttError::Connection(reason)) => {
                tracing::warn!(topic = %message.topic, reason = %reason, "publish failed, queueing");
                self.enqueue(message)
            }
            Err(e) => Err(e),
        }
    }

    /// Publish the sensor's hello payload.
    pub async fn publish_hello(
        &self,
        topic: &str,
        hello: &HelloMessage,
        qos: QoS,
    ) -> MqttResult<PublishOutcome> {
        let payload = hello
            .to_payload()
            .map_err(|e| MqttError::Serialization(e.to_string()))?;
        self.publish(topic, payload, qos).await
    }

    /// Publish any serializable value as a JSON payload.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        qos: QoS,
    ) -> MqttResult<PublishOutcome> {
        let payload =
            serde_json::to_vec(payload).map_err(|e| MqttError::Serialization(e.to_string()))?;
        self.publish(topic, payload, qos).await
    }

    /// Close the connection. Calling it again is a no-op.
    pub async fn disconnect(&self) -> MqttResult<()> {
        let link = {
            let mut session = self.session();
            session.connected_at = None;
            session.link.take()
        };
        let Some(link) = link else {
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        };
        self.set_state(ConnectionState::Disconnected);

        match tokio::time::timeout(self.timing.connect_timeout, link.disconnect()).await {
            Ok(result) => result?,
            Err(_) => tracing::warn!(
                timeout_secs = self.timing.connect_timeout.as_secs(),
                "disconnect timed out"
            ),
        }
        tracing::info!(queued = self.queue.len(), "disconnected from broker");
        Ok(())
    }

    /// Reconnect supervisor.
    ///
    /// Watches the live link; when it drops, waits out the backoff and
    /// reconnects. Runs until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            match self.current_link() {
                Some(link) => {
                    tokio::select! {
                        reason = link.closed() => self.on_link_lost(&link, &reason),
                        () = cancel.cancelled() => break,
                    }
                }
                None => {
                    let delay = self.session().backoff.next_delay();
                    tracing::info!(delay_secs = delay.as_secs_f64(), "reconnecting after backoff");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => break,
                    }
                    match self.connect().await {
                        Ok(()) => tracing::info!("reconnected to broker"),
                        Err(e) => tracing::warn!(error = %e, "reconnect attempt failed"),
                    }
                }
            }
        }
        tracing::debug!("connection supervisor stopped");
    }

    /// Drain the offline queue at `rate_hz` messages per second while
    /// connected. Pauses on disconnect; runs until `cancel` fires.
    ///
    /// Fails up front with [`MqttError::Config`] when `rate_hz` has no
    /// usable tick period.
    pub async fn drain(&self, rate_hz: f64, cancel: CancellationToken) -> MqttResult<()> {
        let period = config::drain_period(rate_hz)?;
        let mut state = self.watch_state();

        loop {
            tokio::select! {
                connected = wait_for_state(&mut state, |s| *s == ConnectionState::Connected) => {
                    if !connected {
                        break;
                    }
                }
                () = cancel.cancelled() => break,
            }

            if self.queue.is_empty() {
                tokio::select! {
                    () = self.queue.notified() => {}
                    _ = state.changed() => {}
                    () = cancel.cancelled() => break,
                }
                continue;
            }

            tracing::info!(queued = self.queue.len(), rate_hz, "draining offline queue");
            if !self.drain_while_connected(period, &cancel).await {
                break;
            }

            if self.state() == ConnectionState::Connected && !self.queue.is_empty() {
                // Send failed on a link the supervisor has not retired yet.
                tokio::select! {
                    _ = wait_for_state(&mut state, |s| *s != ConnectionState::Connected) => {}
                    () = tokio::time::sleep(self.timing.operation_timeout) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
        tracing::debug!(queued = self.queue.len(), "drain stopped");
        Ok(())
    }

    /// Returns `false` when cancelled.
    async fn drain_while_connected(&self, period: Duration, cancel: &CancellationToken) -> bool {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel.cancelled() => return false,
            }

            let Some(link) = self.current_link() else {
                tracing::info!(remaining = self.queue.len(), "connection lost, drain paused");
                return true;
            };
            let Some(message) = self.queue.pop() else {
                return true;
            };

            match self.send(link.as_ref(), &message).await {
                Ok(()) => tracing::debug!(topic = %message.topic, "drained queued message"),
                Err(e @ MqttError::PublishTimeout { .. }) => {
                    tracing::warn!(error = %e, "dropping queued message after timeout");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "drain send failed, message requeued");
                    self.queue.requeue_front(message);
                    return true;
                }
            }
        }
    }

    async fn send(&self, link: &dyn Link, message: &QueuedMessage) -> MqttResult<()> {
        let timeout = self.timing.operation_timeout;
        match tokio::time::timeout(timeout, link.publish(message)).await {
            Ok(result) => result,
            Err(_) => Err(MqttError::PublishTimeout {
                topic: message.topic.clone(),
                timeout,
            }),
        }
    }

    fn enqueue(&self, message: QueuedMessage) -> MqttResult<PublishOutcome> {
        let topic = message.topic.clone();
        self.queue.enqueue(message)?;
        tracing::debug!(topic = %topic, queued = self.queue.len(), "message queued offline");
        Ok(PublishOutcome::Queued)
    }

    fn on_link_lost(&self, link: &Arc<dyn Link>, reason: &str) {
        {
            let mut session = self.session();
            let is_current = session
                .link
                .as_ref()
                .is_some_and(|current| same_link(current, link));
            if !is_current {
                return;
            }
            session.link = None;
            if let Some(connected_at) = session.connected_at.take() {
                let connected_for = connected_at.elapsed();
                if session.backoff.record_session(connected_for) {
                    tracing::debug!(
                        connected_secs = connected_for.as_secs(),
                        "connection was stable, backoff reset"
                    );
                }
            }
        }
        tracing::warn!(reason = %reason, "connection lost");
        self.set_state(ConnectionState::Disconnected);
    }

    fn current_link(&self) -> Option<Arc<dyn Link>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.session().link.clone()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::info!(from = ?*current, to = ?next, "connection state changed");
            *current = next;
            true
        });
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `false` once the manager is gone.
async fn wait_for_state(
    state: &mut watch::Receiver<ConnectionState>,
    condition: impl FnMut(&ConnectionState) -> bool,
) -> bool {
    state.wait_for(condition).await.is_ok()
}

fn same_link(a: &Arc<dyn Link>, b: &Arc<dyn Link>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
