//! Transport implementations for receiving mesh envelopes
//!
//! - [`mqtt::MqttTransport`] - MQTT over TLS to a Meshtastic uplink broker
//! - [`crate::test_utils::MockTransport`] - channel-fed transport for tests
//!
//! A transport yields a lazy sequence of raw deliveries. The bridge drives it
//! from its network loop and never looks at the bytes itself; decoding is
//! left to [`crate::decoder`].

pub mod mqtt;

pub use mqtt::MqttTransport;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// One message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload (a protobuf `ServiceEnvelope`)
    pub payload: Bytes,
}

impl Delivery {
    /// Create a delivery
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Trait for broker transports
///
/// This trait abstracts over the MQTT client so the bridge loop can be
/// exercised without a live broker. Implementations only need to be `Send`:
/// the network loop owns its transport exclusively.
#[async_trait]
pub trait MeshTransport: Send {
    /// Establish the session
    async fn connect(&mut self) -> Result<()>;

    /// Register interest in a topic filter
    ///
    /// Subscribing to a topic that is already subscribed is a no-op.
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Wait for the next delivery
    ///
    /// Returns `None` when the sequence has ended and no more deliveries will
    /// arrive. Returns `Err` on connection/read errors; calling again after an
    /// error attempts to re-establish the session.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>>;

    /// Close the session
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;
}

/// Connection state for transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
    /// Connection lost, may reconnect
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}
