//! Hello-sensor agent: publishes a hello message to AWS IoT Core.
//!
//! Wires the TLS credentials, the connection manager (reconnect supervisor
//! and offline queue drain) and the publisher loop into a single binary.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hs_mqtt_channel::{
    ConnectionManager, ConnectionTiming, Connector, OfflineQueue, RumqttConnector,
};
use hs_sensor_agent::config::Cli;
use hs_sensor_agent::publisher::{self, PublishSchedule, TracingReporter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "hs-sensor-agent starting"
    );

    // ── Load config ─────────────────────────────────────────────
    let config = cli.into_config().context("invalid configuration")?;
    tracing::info!(
        endpoint = %config.mqtt.broker_host,
        port = config.mqtt.broker_port,
        client_id = %config.mqtt.client_id,
        topic = %config.topic,
        "config loaded"
    );

    // ── MQTT connection ─────────────────────────────────────────
    let connector: Arc<dyn Connector> = if config.mqtt.use_tls {
        Arc::new(RumqttConnector::new(&config.mqtt).context("failed to load TLS credentials")?)
    } else {
        tracing::info!("MQTT plaintext mode (no TLS)");
        Arc::new(RumqttConnector::new_plaintext(&config.mqtt))
    };

    let queue = Arc::new(OfflineQueue::new(
        config.offline_queue.capacity()?,
        config.offline_queue.offline_drop_policy,
    ));
    let manager = Arc::new(ConnectionManager::new(
        connector,
        ConnectionTiming::from_config(&config.mqtt)?,
        queue,
    ));

    match manager.connect().await {
        Ok(()) => tracing::info!("connected to broker"),
        Err(e) => tracing::warn!(error = %e, "initial connect failed, retrying in background"),
    }

    // ── Start background tasks ──────────────────────────────────
    let cancel = CancellationToken::new();

    let supervisor = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move { manager.run(cancel).await }
    });

    let drain = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        let rate_hz = config.offline_queue.draining_frequency_hz;
        async move { manager.drain(rate_hz, cancel).await }
    });

    let publisher = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        let schedule = PublishSchedule::from_config(&config);
        async move { publisher::run(&manager, &schedule, &TracingReporter, cancel).await }
    });

    tracing::info!("hs-sensor-agent ready");

    // Graceful shutdown on SIGINT
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    cancel.cancel();
    let attempts = publisher.await.context("publisher task panicked")?;
    supervisor.await.context("connection supervisor panicked")?;
    if let Err(e) = drain.await.context("drain task panicked")? {
        tracing::warn!(error = %e, "offline queue drain stopped");
    }

    if let Err(e) = manager.disconnect().await {
        tracing::warn!(error = %e, "disconnect failed");
    }

    tracing::info!(
        attempts,
        queued = manager.queue().len(),
        "hs-sensor-agent stopped"
    );
    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
