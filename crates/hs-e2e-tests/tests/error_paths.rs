//! E2E tests for error paths: queue overflow, credential and config failures.

mod helpers;

use std::path::PathBuf;
use std::time::Duration;

use rumqttc::QoS;

use helpers::{TestHarness, payloads};
use hs_mqtt_channel::{DropPolicy, MqttConfig, MqttError, PublishOutcome, RumqttConnector};

fn fixture(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../hs-mqtt-channel/tests/fixtures")
        .join(name)
        .display()
        .to_string()
}

fn bounded(policy: &str) -> TestHarness {
    TestHarness::from_toml(&format!(
        r#"
[mqtt]
broker_host = "broker.test"
use_tls = false

[offline_queue]
offline_queue_size = 3
offline_drop_policy = "{policy}"
"#
    ))
}

async fn publish(h: &TestHarness, payload: &str) -> Result<PublishOutcome, MqttError> {
    h.manager
        .publish("hello/sensor_01", payload.as_bytes().to_vec(), QoS::AtMostOnce)
        .await
}

/// Overflowing a drop-oldest queue evicts the oldest message and the
/// survivors are delivered in order.
#[tokio::test(start_paused = true)]
async fn e2e_drop_oldest_evicts_head() {
    let mut h = bounded("drop_oldest");
    for payload in ["m1", "m2", "m3"] {
        publish(&h, payload).await.unwrap();
    }
    let err = publish(&h, "m4").await.unwrap_err();
    assert!(matches!(
        err,
        MqttError::QueueFull {
            capacity: 3,
            policy: DropPolicy::DropOldest
        }
    ));

    h.spawn_drain();
    h.manager.connect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(payloads(&h.broker), ["m2", "m3", "m4"]);

    h.shutdown().await;
}

/// A drop-newest queue rejects the new message and keeps its contents.
#[tokio::test(start_paused = true)]
async fn e2e_drop_newest_rejects_incoming() {
    let mut h = bounded("drop_newest");
    for payload in ["m1", "m2", "m3"] {
        publish(&h, payload).await.unwrap();
    }
    let err = publish(&h, "m4").await.unwrap_err();
    assert!(matches!(
        err,
        MqttError::QueueFull {
            policy: DropPolicy::DropNewest,
            ..
        }
    ));
    assert!(!err.is_fatal());

    h.spawn_drain();
    h.manager.connect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(payloads(&h.broker), ["m1", "m2", "m3"]);

    h.shutdown().await;
}

/// With queueing disabled an offline publish fails instead of buffering.
#[tokio::test(start_paused = true)]
async fn e2e_disabled_queue_reports_not_connected() {
    let h = TestHarness::from_toml(
        r#"
[mqtt]
broker_host = "broker.test"
use_tls = false

[offline_queue]
offline_queue_size = 0
"#,
    );
    assert!(matches!(
        publish(&h, "m1").await,
        Err(MqttError::NotConnected)
    ));

    h.manager.connect().await.unwrap();
    assert_eq!(publish(&h, "m2").await.unwrap(), PublishOutcome::Sent);
    h.shutdown().await;
}

fn tls_config() -> MqttConfig {
    let mut config = MqttConfig::new("a1b2c3-ats.iot.us-east-1.amazonaws.com");
    config.client_cert_path = fixture("device.pem");
    config.client_key_path = fixture("device.key");
    config.ca_cert_path = fixture("root-ca.pem");
    config
}

#[test]
fn e2e_valid_credentials_build_connector() {
    assert!(RumqttConnector::new(&tls_config()).is_ok());
}

#[test]
fn e2e_missing_credential_is_fatal() {
    let mut config = tls_config();
    config.ca_cert_path = "/nonexistent/AmazonRootCA1.pem".into();
    let err = RumqttConnector::new(&config).err().unwrap();
    assert!(matches!(err, MqttError::Credential(_)));
    assert!(err.is_fatal());
}

#[test]
fn e2e_mismatched_key_is_fatal() {
    let mut config = tls_config();
    config.client_key_path = fixture("other.key");
    let err = RumqttConnector::new(&config).err().unwrap();
    assert!(matches!(err, MqttError::TlsHandshakeConfig(_)));
    assert!(err.is_fatal());
}

#[test]
fn e2e_invalid_backoff_config_is_rejected() {
    let config: hs_sensor_agent::config::AgentConfig = toml::from_str(
        r#"
[mqtt]
broker_host = "broker.test"
use_tls = false
reconnect_min_backoff_secs = 40
reconnect_max_backoff_secs = 32
"#,
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    let err = err.downcast::<MqttError>().unwrap();
    assert!(matches!(err, MqttError::Config(_)));
    assert!(err.is_fatal());
}
