//! Transport seam between the connection manager and the broker.
//!
//! A [`Connector`] performs one TLS + MQTT CONNECT handshake and yields a
//! [`Link`]. `RumqttConnector` implements both over `rumqttc`; the mock
//! module provides an in-memory broker for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, Transport,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::error::{MqttError, MqttResult};
use crate::queue::QueuedMessage;
use crate::tls;

/// Capacity of the request channel between `AsyncClient` and `EventLoop`.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

// ── Transport traits ──────────────────────────────────────────

/// An established broker session.
#[async_trait]
pub trait Link: Send + Sync {
    /// Send a message and wait until the broker side acknowledges it.
    ///
    /// QoS 0 completes once written to the socket. Returns
    /// [`MqttError::Connection`] when the link is gone.
    async fn publish(&self, message: &QueuedMessage) -> MqttResult<()>;

    /// Resolves with a reason once the link has dropped.
    async fn closed(&self) -> String;

    /// Send DISCONNECT and wait for the session to wind down.
    async fn disconnect(&self) -> MqttResult<()>;
}

/// Factory for links; one call is one connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> MqttResult<Arc<dyn Link>>;
}

// ── RumqttConnector ───────────────────────────────────────────

/// Connector for AWS IoT Core (or any MQTT 3.1.1 broker) via `rumqttc`.
///
/// Every attempt builds a fresh `AsyncClient`/`EventLoop` pair; once
/// CONNACK arrives the event loop is driven by a background pump task
/// owned by the returned link.
pub struct RumqttConnector {
    options: MqttOptions,
    connect_timeout: Duration,
}

impl RumqttConnector {
    /// Connector with TLS (production mode). Validates the credentials.
    pub fn new(config: &MqttConfig) -> MqttResult<Self> {
        let transport = tls::load_tls_transport(config)?;
        Ok(Self::with_transport(config, transport))
    }

    /// Connector for local development (no TLS).
    pub fn new_plaintext(config: &MqttConfig) -> Self {
        Self::with_transport(config, tls::plaintext_transport())
    }

    pub fn with_transport(config: &MqttConfig, transport: Transport) -> Self {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs.into()));
        options.set_clean_session(true);
        options.set_transport(transport);
        Self {
            options,
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Fresh client/event loop pair. rumqttc bounds the TCP + TLS + CONNACK
    /// handshake with its own timer (5 s unless set), so it gets ours.
    fn event_loop(&self) -> (AsyncClient, EventLoop) {
        let (client, mut eventloop) =
            AsyncClient::new(self.options.clone(), REQUEST_CHANNEL_CAPACITY);
        eventloop
            .network_options
            .set_connection_timeout(self.connect_timeout.as_secs());
        (client, eventloop)
    }
}

#[async_trait]
impl Connector for RumqttConnector {
    async fn connect(&self) -> MqttResult<Arc<dyn Link>> {
        let (client, mut eventloop) = self.event_loop();

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    tracing::debug!(session_present = ack.session_present, "CONNACK received");
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(map_connect_error(e, self.connect_timeout)),
            }
        }

        let acks = Arc::new(AckTracker::default());
        let (closed_tx, closed_rx) = watch::channel(None);
        let pump = tokio::spawn(pump(eventloop, acks.clone(), closed_tx));

        Ok(Arc::new(RumqttLink {
            client,
            acks,
            closed: closed_rx,
            publish_order: tokio::sync::Mutex::new(()),
            pump: Mutex::new(Some(pump)),
        }))
    }
}

fn map_connect_error(error: ConnectionError, connect_timeout: Duration) -> MqttError {
    match error {
        ConnectionError::NetworkTimeout => MqttError::ConnectTimeout {
            timeout: connect_timeout,
        },
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => MqttError::AuthFailure(format!("{code:?}")),
        ConnectionError::Tls(e) => MqttError::AuthFailure(format!("TLS handshake failed: {e}")),
        other => MqttError::Connection(other.to_string()),
    }
}

/// Drive the event loop for an established session, resolving publish
/// acknowledgments until the connection ends.
async fn pump(
    mut eventloop: EventLoop,
    acks: Arc<AckTracker>,
    closed: watch::Sender<Option<String>>,
) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.on_outgoing(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.on_ack(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => acks.on_ack(comp.pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break "client disconnect".to_string(),
            Ok(Event::Incoming(Packet::Disconnect)) => break "broker disconnect".to_string(),
            Ok(_) => {}
            Err(e) => break e.to_string(),
        }
    };
    tracing::debug!(reason = %reason, "MQTT event loop stopped");
    acks.fail_all(&reason);
    closed.send_replace(Some(reason));
}

// ── RumqttLink ────────────────────────────────────────────────

struct RumqttLink {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    closed: watch::Receiver<Option<String>>,
    /// Keeps ack registration in the same order as requests reach the event loop.
    publish_order: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Link for RumqttLink {
    async fn publish(&self, message: &QueuedMessage) -> MqttResult<()> {
        let ack = {
            let _order = self.publish_order.lock().await;
            // Registered before the request is queued so the pump can never
            // see the outgoing packet first. Dropping `pending` before
            // `sent()` (error or cancelled future) withdraws the entry.
            let (pending, ack) = self.acks.register(message.qos)?;
            self.client
                .publish(&message.topic, message.qos, false, message.payload.clone())
                .await
                .map_err(|e| MqttError::Connection(e.to_string()))?;
            pending.sent();
            ack
        };
        ack.await
            .unwrap_or_else(|_| Err(MqttError::Connection("event loop stopped".into())))
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "event loop stopped".to_string(),
        }
    }

    async fn disconnect(&self) -> MqttResult<()> {
        if self.closed.borrow().is_none() {
            if let Err(e) = self.client.disconnect().await {
                tracing::debug!(error = %e, "disconnect request not delivered");
            }
            self.closed().await;
        }
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        Ok(())
    }
}

impl Drop for RumqttLink {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

// ── Ack tracking ──────────────────────────────────────────────

type AckSender = oneshot::Sender<MqttResult<()>>;

/// Matches rumqttc events to waiting publishers.
///
/// Requests leave the client in order, so each `Outgoing::Publish`
/// belongs to the oldest unsent registration. QoS 0 completes there;
/// QoS 1/2 wait for `PubAck`/`PubComp` with the assigned packet id.
#[derive(Default)]
struct AckTracker {
    state: Mutex<AckState>,
}

#[derive(Default)]
struct AckState {
    unsent: VecDeque<(u64, QoS, AckSender)>,
    inflight: HashMap<u16, AckSender>,
    next_id: u64,
    closed: Option<String>,
}

/// An ack registration whose request may not have reached the client yet.
#[must_use]
struct PendingSend<'a> {
    acks: &'a AckTracker,
    id: u64,
    sent: bool,
}

impl PendingSend<'_> {
    /// The request is queued; keep the registration.
    fn sent(mut self) {
        self.sent = true;
    }
}

impl Drop for PendingSend<'_> {
    fn drop(&mut self) {
        if !self.sent {
            self.acks.withdraw(self.id);
        }
    }
}

impl AckTracker {
    fn register(
        &self,
        qos: QoS,
    ) -> MqttResult<(PendingSend<'_>, oneshot::Receiver<MqttResult<()>>)> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.closed {
            return Err(MqttError::Connection(reason.clone()));
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = oneshot::channel();
        state.unsent.push_back((id, qos, tx));
        let pending = PendingSend {
            acks: self,
            id,
            sent: false,
        };
        Ok((pending, rx))
    }

    fn withdraw(&self, id: u64) {
        lock(&self.state).unsent.retain(|(entry, _, _)| *entry != id);
    }

    fn on_outgoing(&self, pkid: u16) {
        let mut state = lock(&self.state);
        let Some((_, qos, tx)) = state.unsent.pop_front() else {
            return;
        };
        if qos == QoS::AtMostOnce {
            let _ = tx.send(Ok(()));
        } else {
            state.inflight.insert(pkid, tx);
        }
    }

    fn on_ack(&self, pkid: u16) {
        if let Some(tx) = lock(&self.state).inflight.remove(&pkid) {
            let _ = tx.send(Ok(()));
        }
    }

    fn fail_all(&self, reason: &str) {
        let mut state = lock(&self.state);
        state.closed = Some(reason.to_string());
        let mut waiters: Vec<AckSender> = state.unsent.drain(..).map(|(_, _, tx)| tx).collect();
        waiters.extend(state.inflight.drain().map(|(_, tx)| tx));
        for tx in waiters {
            let _ = tx.send(Err(MqttError::Connection(reason.to_string())));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
