//! Settings file and environment loading
//!
//! ```toml
//! [mqtt]
//! address = "mqtt.example.org"
//! port = 8883
//! username = "meshdev"
//!
//! [reconnect]
//! initial_delay = "1s"
//! max_delay = "1m"
//!
//! [consumer]
//! poll_interval = "5s"
//! channels = ["LongFast"]
//! ```
//!
//! The broker password is read from `MQTT_PASSWORD` rather than the file.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

use mesh_bridge::{BridgeConfig, MqttConfig, ReconnectConfig};

/// Environment variable holding the broker password
pub const PASSWORD_ENV: &str = "MQTT_PASSWORD";

/// Everything the node reads at startup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Broker connection
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Reconnection after startup
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Queue consumer
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

/// How the node drains the bridge queue
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSettings {
    /// Time between drains
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,

    /// Mesh channels to emit; empty emits every channel
    #[serde(default)]
    pub channels: Vec<String>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            channels: Vec::new(),
        }
    }
}

impl ConsumerSettings {
    /// Whether messages heard on `channel_id` should be emitted
    pub fn wants(&self, channel_id: &str) -> bool {
        self.channels.is_empty() || self.channels.iter().any(|c| c == channel_id)
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

impl Settings {
    /// Load from `path`, or start from defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(settings.with_env(|key| std::env::var(key).ok()))
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply environment overrides read through `lookup`
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(password) = lookup(PASSWORD_ENV).filter(|p| !p.is_empty()) {
            self.mqtt.password = Some(password);
        }
        self
    }

    /// Reject values the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.consumer.poll_interval.is_zero() {
            bail!("consumer.poll_interval must be greater than zero");
        }
        self.bridge_config().validate()?;
        Ok(())
    }

    /// Bridge configuration for the library
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            mqtt: self.mqtt.clone(),
            reconnect: self.reconnect.clone(),
        }
    }
}
