//! Sensor agent configuration, loadable from TOML and overridable from the
//! command line or environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use serde::Deserialize;

use hs_mqtt_channel::{MqttConfig, QueueConfig};
use hs_protocol::topics;

/// Top-level configuration for the sensor agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentConfig {
    /// MQTT connection settings.
    pub mqtt: MqttConfig,
    /// Offline queue and drain settings. Optional, defaults to infinite.
    #[serde(default)]
    pub offline_queue: QueueConfig,
    /// Topic the hello message is published to.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Publish interval in seconds.
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,
}

fn default_topic() -> String {
    topics::DEFAULT_TOPIC.to_string()
}

fn default_publish_interval() -> u64 {
    5
}

impl AgentConfig {
    /// Config for `broker_host` with every other field at its default.
    pub fn new(broker_host: impl Into<String>) -> Self {
        Self {
            mqtt: MqttConfig::new(broker_host),
            offline_queue: QueueConfig::default(),
            topic: default_topic(),
            publish_interval_secs: default_publish_interval(),
        }
    }

    /// Load config from a TOML file path.
    ///
    /// Relative credential paths are resolved against the directory that
    /// holds the file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
        if let Some(dir) = path.parent() {
            config.resolve_credential_paths(dir);
        }
        Ok(config)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.mqtt.validate()?;
        self.offline_queue.validate()?;
        if self.publish_interval_secs == 0 {
            bail!("publish_interval_secs must be greater than zero");
        }
        topics::validate_publish_topic(&self.topic)
            .with_context(|| format!("invalid publish topic '{}'", self.topic))?;
        Ok(())
    }

    fn resolve_credential_paths(&mut self, base: &Path) {
        for path in [
            &mut self.mqtt.client_cert_path,
            &mut self.mqtt.client_key_path,
            &mut self.mqtt.ca_cert_path,
        ] {
            if !path.is_empty() && Path::new(path.as_str()).is_relative() {
                *path = base.join(path.as_str()).display().to_string();
            }
        }
    }
}

/// Publish a hello message to AWS IoT Core over mutual TLS.
#[derive(Debug, Parser)]
#[command(name = "hs-sensor-agent", version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Device certificate (PEM)
    #[arg(long, env = "HS_CERT", value_name = "PATH")]
    pub cert: Option<String>,

    /// Device private key (PEM)
    #[arg(long, env = "HS_KEY", value_name = "PATH")]
    pub key: Option<String>,

    /// Root CA certificate (PEM)
    #[arg(long, env = "HS_ROOT_CA", value_name = "PATH")]
    pub root_ca: Option<String>,

    /// Broker endpoint, e.g. a1b2c3-ats.iot.us-east-1.amazonaws.com
    #[arg(long, env = "HS_ENDPOINT", value_name = "HOST")]
    pub endpoint: Option<String>,

    /// Broker port [default: 8883]
    #[arg(long, env = "HS_PORT")]
    pub port: Option<u16>,

    /// Topic to publish to [default: hello/sensor_01]
    #[arg(long, env = "HS_TOPIC")]
    pub topic: Option<String>,

    /// MQTT client identifier [default: sensor_01]
    #[arg(long, env = "HS_CLIENT_ID", value_name = "ID")]
    pub client_id: Option<String>,

    /// Seconds between publishes [default: 5]
    #[arg(long, env = "HS_INTERVAL_SECS", value_name = "SECS")]
    pub interval: Option<u64>,

    /// Connect over plain TCP (local brokers only)
    #[arg(long)]
    pub plaintext: bool,

    /// Emit JSON log lines
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Merge the config file (if any) with command-line overrides and
    /// validate the result.
    pub fn into_config(self) -> anyhow::Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_file(path)?,
            None => {
                let Some(endpoint) = &self.endpoint else {
                    bail!("--endpoint (or HS_ENDPOINT) is required when no --config file is given");
                };
                AgentConfig::new(endpoint.clone())
            }
        };

        if let Some(endpoint) = self.endpoint {
            config.mqtt.broker_host = endpoint;
        }
        if let Some(port) = self.port {
            config.mqtt.broker_port = port;
        }
        if let Some(client_id) = self.client_id {
            config.mqtt.client_id = client_id;
        }
        if let Some(cert) = self.cert {
            config.mqtt.client_cert_path = cert;
        }
        if let Some(key) = self.key {
            config.mqtt.client_key_path = key;
        }
        if let Some(root_ca) = self.root_ca {
            config.mqtt.ca_cert_path = root_ca;
        }
        if let Some(topic) = self.topic {
            config.topic = topic;
        }
        if let Some(interval) = self.interval {
            config.publish_interval_secs = interval;
        }
        if self.plaintext {
            config.mqtt.use_tls = false;
        }

        config.validate()?;
        Ok(config)
    }
}
