use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::error::{MqttError, MqttResult};
use crate::queue::{DropPolicy, QueueCapacity};

/// MQTT connection configuration, loadable from TOML or environment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MqttConfig {
    /// MQTT broker hostname (e.g., AWS IoT endpoint).
    pub broker_host: String,
    /// MQTT broker port (default 8883 for TLS).
    #[serde(default = "default_port")]
    pub broker_port: u16,
    /// MQTT client ID (should be unique per device).
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Enable TLS (mTLS). When false, connects plaintext (local dev).
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    /// Path to device X.509 certificate (PEM).
    #[serde(default)]
    pub client_cert_path: String,
    /// Path to device private key (PEM).
    #[serde(default)]
    pub client_key_path: String,
    /// Path to CA certificate (e.g., AmazonRootCA1.pem).
    #[serde(default)]
    pub ca_cert_path: String,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// First reconnect delay.
    #[serde(default = "default_min_backoff")]
    pub reconnect_min_backoff_secs: u64,
    /// Upper bound for the reconnect delay.
    #[serde(default = "default_max_backoff")]
    pub reconnect_max_backoff_secs: u64,
    /// Connected time after which the reconnect delay resets to the minimum.
    #[serde(default = "default_stable_threshold")]
    pub backoff_stable_threshold_secs: u64,
    /// Bound on CONNECT (TLS + CONNACK) and on DISCONNECT.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Bound on waiting for a publish acknowledgment.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

fn default_use_tls() -> bool {
    true
}

fn default_port() -> u16 {
    8883
}

fn default_client_id() -> String {
    "sensor_01".to_string()
}

fn default_keepalive() -> u16 {
    30
}

fn default_min_backoff() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    32
}

fn default_stable_threshold() -> u64 {
    20
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_operation_timeout() -> u64 {
    5
}

impl MqttConfig {
    /// Config for `broker_host` with every other field at its default.
    pub fn new(broker_host: impl Into<String>) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port: default_port(),
            client_id: default_client_id(),
            use_tls: default_use_tls(),
            client_cert_path: String::new(),
            client_key_path: String::new(),
            ca_cert_path: String::new(),
            keepalive_secs: default_keepalive(),
            reconnect_min_backoff_secs: default_min_backoff(),
            reconnect_max_backoff_secs: default_max_backoff(),
            backoff_stable_threshold_secs: default_stable_threshold(),
            connect_timeout_secs: default_connect_timeout(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn backoff_policy(&self) -> MqttResult<BackoffPolicy> {
        BackoffPolicy::from_secs(
            self.reconnect_min_backoff_secs,
            self.reconnect_max_backoff_secs,
            self.backoff_stable_threshold_secs,
        )
    }

    /// Check the invariants the connection manager relies on.
    pub fn validate(&self) -> MqttResult<()> {
        if self.broker_host.trim().is_empty() {
            return Err(MqttError::Config("broker_host must not be empty".into()));
        }
        if self.client_id.is_empty() {
            return Err(MqttError::Config("client_id must not be empty".into()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(MqttError::Config(
                "connect_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.operation_timeout_secs == 0 {
            return Err(MqttError::Config(
                "operation_timeout_secs must be greater than zero".into(),
            ));
        }
        self.backoff_policy()?;
        if self.use_tls {
            for (name, value) in [
                ("client_cert_path", &self.client_cert_path),
                ("client_key_path", &self.client_key_path),
                ("ca_cert_path", &self.ca_cert_path),
            ] {
                if value.is_empty() {
                    return Err(MqttError::Config(format!("{name} is required when use_tls = true")));
                }
            }
        }
        Ok(())
    }
}

/// Offline queue and drain settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueConfig {
    /// `-1` infinite, `0` disabled, `N > 0` bounded.
    #[serde(default = "default_queue_size")]
    pub offline_queue_size: i64,
    #[serde(default)]
    pub offline_drop_policy: DropPolicy,
    /// Messages per second republished after a reconnect.
    #[serde(default = "default_draining_frequency")]
    pub draining_frequency_hz: f64,
}

fn default_queue_size() -> i64 {
    -1
}

fn default_draining_frequency() -> f64 {
    2.0
}

impl QueueConfig {
    pub fn capacity(&self) -> MqttResult<QueueCapacity> {
        QueueCapacity::from_size(self.offline_queue_size)
    }

    /// Time between two drained messages.
    pub fn drain_period(&self) -> MqttResult<Duration> {
        drain_period(self.draining_frequency_hz)
    }

    pub fn validate(&self) -> MqttResult<()> {
        self.capacity()?;
        self.drain_period()?;
        Ok(())
    }
}

/// Convert a drain rate in messages per second into a tick period.
///
/// The period must be representable as a non-zero [`Duration`], which
/// rules out zero, negative, non-finite, and absurdly small or large rates.
pub fn drain_period(rate_hz: f64) -> MqttResult<Duration> {
    let invalid = || {
        MqttError::Config(format!(
            "draining_frequency_hz must be a positive number with a representable period, got {rate_hz}"
        ))
    };
    if !rate_hz.is_finite() || rate_hz <= 0.0 {
        return Err(invalid());
    }
    match Duration::try_from_secs_f64(1.0 / rate_hz) {
        Ok(period) if !period.is_zero() => Ok(period),
        _ => Err(invalid()),
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            offline_queue_size: default_queue_size(),
            offline_drop_policy: DropPolicy::default(),
            draining_frequency_hz: default_draining_frequency(),
        }
    }
}
