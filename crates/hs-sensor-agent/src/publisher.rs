//! Periodic hello publisher.
//!
//! Publishes `{"message": "Hello from <client_id>"}` at a fixed interval
//! so the cloud side knows the sensor is alive. The first message goes
//! out immediately.

use std::time::Duration;

use rumqttc::QoS;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use hs_mqtt_channel::{ConnectionManager, MqttError, MqttResult, PublishOutcome};
use hs_protocol::HelloMessage;

use crate::config::AgentConfig;

/// Receives the outcome of every publish attempt.
pub trait PublishReporter: Send + Sync {
    fn report(&self, topic: &str, message: &HelloMessage, result: &MqttResult<PublishOutcome>);
}

/// Reports publish outcomes as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl PublishReporter for TracingReporter {
    fn report(&self, topic: &str, message: &HelloMessage, result: &MqttResult<PublishOutcome>) {
        match result {
            Ok(PublishOutcome::Sent) => {
                tracing::info!(topic, message = %message.message, "published message");
            }
            Ok(PublishOutcome::Queued) => {
                tracing::info!(topic, message = %message.message, "broker unreachable, message queued");
            }
            Err(e @ MqttError::QueueFull { .. }) => {
                tracing::warn!(topic, error = %e, "offline queue overflow");
            }
            Err(e) => tracing::warn!(topic, error = %e, "failed to publish message"),
        }
    }
}

/// What to publish and how often.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishSchedule {
    pub topic: String,
    pub client_id: String,
    pub interval: Duration,
    pub qos: QoS,
}

impl PublishSchedule {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            client_id: config.mqtt.client_id.clone(),
            interval: config.publish_interval(),
            qos: QoS::AtMostOnce,
        }
    }
}

/// Run the publish loop until `cancel` fires.
///
/// A publish that is already in progress when `cancel` fires is allowed
/// to finish (it is bounded by the operation timeout). Returns the
/// number of publish attempts made.
pub async fn run(
    manager: &ConnectionManager,
    schedule: &PublishSchedule,
    reporter: &dyn PublishReporter,
    cancel: CancellationToken,
) -> u64 {
    let mut ticker = time::interval(schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let message = HelloMessage::from_client(&schedule.client_id);
    let mut attempts = 0;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = manager
            .publish_hello(&schedule.topic, &message, schedule.qos)
            .await;
        reporter.report(&schedule.topic, &message, &result);
        attempts += 1;

        if let Err(e) = result
            && e.is_fatal()
        {
            tracing::error!(error = %e, "publisher stopping on fatal error");
            break;
        }
    }

    tracing::info!(attempts, "publisher stopped");
    attempts
}
