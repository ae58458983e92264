//! Configuration types for the mesh bridge
//!
//! This module provides configuration structures for the broker connection
//! and reconnection behavior. Loading these from a file is the caller's job;
//! the bridge only consumes the parsed values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MeshBridgeError, Result};
use crate::logutil::redact;

/// Topic root used by the Meshtastic MQTT uplink for protobuf envelopes
pub const DEFAULT_TOPIC: &str = "msh/2/c/#";

/// Default MQTT-over-TLS port
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Default client identifier presented to the broker
pub const DEFAULT_CLIENT_ID: &str = "mesh-bridge";

/// Default keep-alive interval
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Default time allowed for the broker to answer CONNECT
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10000;

/// Default capacity of the client request channel
pub const DEFAULT_REQUEST_CAPACITY: usize = 64;

/// Main configuration for the mesh bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Broker connection settings
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Reconnection settings for connection loss after startup
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl BridgeConfig {
    /// Check the configuration for values the bridge cannot work with
    pub fn validate(&self) -> Result<()> {
        self.mqtt.validate()?;
        self.reconnect.validate()
    }
}

/// Broker connection settings
#[derive(Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or IP address
    #[serde(default)]
    pub address: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for password authentication (anonymous when absent)
    #[serde(default)]
    pub username: Option<String>,

    /// Password for password authentication
    #[serde(default)]
    pub password: Option<String>,

    /// MQTT client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Topic filter to subscribe to
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Wrap the session in TLS (rustls, native root certificates)
    #[serde(default = "default_tls")]
    pub tls: bool,

    /// Keep-alive interval
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,

    /// Time allowed for the CONNECT/CONNACK exchange
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Capacity of the client request channel
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

fn default_port() -> u16 {
    DEFAULT_TLS_PORT
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_tls() -> bool {
    true
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS)
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)
}

fn default_request_capacity() -> usize {
    DEFAULT_REQUEST_CAPACITY
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: DEFAULT_TLS_PORT,
            username: None,
            password: None,
            client_id: default_client_id(),
            topic: default_topic(),
            tls: true,
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_deref().map(redact))
            .field("client_id", &self.client_id)
            .field("topic", &self.topic)
            .field("tls", &self.tls)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_capacity", &self.request_capacity)
            .finish()
    }
}

impl MqttConfig {
    /// `host:port` string for logging and errors
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Username and password, only when both are present
    ///
    /// A username without a password (or the reverse) connects anonymously.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    /// Check the broker settings
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(MeshBridgeError::MissingConfig("mqtt.address".to_string()));
        }
        if self.port == 0 {
            return Err(MeshBridgeError::InvalidConfig(
                "mqtt.port must be non-zero".to_string(),
            ));
        }
        if self.topic.trim().is_empty() {
            return Err(MeshBridgeError::MissingConfig("mqtt.topic".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(MeshBridgeError::MissingConfig("mqtt.client_id".to_string()));
        }
        // rumqttc rejects keep-alive intervals under one second
        if self.keep_alive < Duration::from_secs(1) {
            return Err(MeshBridgeError::InvalidConfig(
                "mqtt.keep_alive must be at least 1s".to_string(),
            ));
        }
        if self.request_capacity == 0 {
            return Err(MeshBridgeError::InvalidConfig(
                "mqtt.request_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reconnection behavior after the bridge has started
///
/// Construction never retries: a broker that cannot be reached at connect time
/// is reported to the caller. These settings only apply when an established
/// session drops while the network loop is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    #[serde(default = "default_auto_reconnect")]
    pub enabled: bool,

    /// Initial delay before first reconnection attempt
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Maximum number of consecutive reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 0, // Infinite
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based), doubling up to `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows(&self, attempts: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempts < self.max_attempts)
    }

    fn validate(&self) -> Result<()> {
        if self.enabled && self.initial_delay > self.max_delay {
            return Err(MeshBridgeError::InvalidConfig(
                "reconnect.initial_delay exceeds reconnect.max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set broker address and port
    pub fn broker(mut self, address: impl Into<String>, port: u16) -> Self {
        self.config.mqtt.address = address.into();
        self.config.mqtt.port = port;
        self
    }

    /// Set username and password
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.mqtt.username = Some(username.into());
        self.config.mqtt.password = Some(password.into());
        self
    }

    /// Set the MQTT client identifier
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.mqtt.client_id = client_id.into();
        self
    }

    /// Set the subscription topic filter
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.mqtt.topic = topic.into();
        self
    }

    /// Enable or disable TLS
    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.mqtt.tls = enabled;
        self
    }

    /// Set the CONNECT/CONNACK timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.mqtt.connect_timeout = timeout;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Set reconnect backoff bounds
    pub fn reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.config.reconnect.initial_delay = initial;
        self.config.reconnect.max_delay = max;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.mqtt.port, DEFAULT_TLS_PORT);
        assert_eq!(config.mqtt.topic, "msh/2/c/#");
        assert!(config.mqtt.tls);
        assert!(config.reconnect.enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = BridgeConfigBuilder::new()
            .broker("mqtt.example.org", 1883)
            .credentials("meshdev", "large4cats")
            .tls(false)
            .auto_reconnect(false)
            .build();

        assert_eq!(config.mqtt.endpoint(), "mqtt.example.org:1883");
        assert_eq!(config.mqtt.credentials(), Some(("meshdev", "large4cats")));
        assert!(!config.mqtt.tls);
        assert!(!config.reconnect.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_address_rejected() {
        let config = BridgeConfig::default();
        let err = config.validate().unwrap_err();
        assert_eq!(err.error_code(), "MISSING_CONFIG");
    }

    #[test]
    fn test_partial_credentials_are_anonymous() {
        let mut config = MqttConfig::default();
        config.username = Some("meshdev".to_string());
        assert_eq!(config.credentials(), None);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = BridgeConfigBuilder::new()
            .broker("mqtt.example.org", 8883)
            .credentials("meshdev", "supersecretpassword")
            .build();

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("supersecretpassword"));
        assert!(rendered.contains("meshdev"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let reconnect = ReconnectConfig {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 3,
        };
        assert_eq!(reconnect.backoff(1), Duration::from_secs(1));
        assert_eq!(reconnect.backoff(2), Duration::from_secs(2));
        assert_eq!(reconnect.backoff(3), Duration::from_secs(4));
        assert_eq!(reconnect.backoff(8), Duration::from_secs(10));
        assert!(reconnect.allows(2));
        assert!(!reconnect.allows(3));
    }

    #[test]
    fn test_durations_deserialize_from_humantime() {
        let json = r#"{
            "mqtt": { "address": "broker.local", "keep_alive": "30s", "connect_timeout": "2s" },
            "reconnect": { "initial_delay": "500ms", "max_delay": "1m" }
        }"#;
        let config: BridgeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mqtt.keep_alive, Duration::from_secs(30));
        assert_eq!(config.mqtt.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(500));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(60));
        assert_eq!(config.mqtt.port, DEFAULT_TLS_PORT);
    }
}
