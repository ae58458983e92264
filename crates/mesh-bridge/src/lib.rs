//! Meshtastic MQTT bridge core
//!
//! This crate connects to a Meshtastic MQTT uplink broker, decodes the
//! protobuf envelopes gateways publish there, and turns mesh text traffic into
//! a queue of chat-ready messages. Each message is stamped with everything the
//! bridge has learned about its sender from earlier identity, position and
//! telemetry packets.
//!
//! # Architecture
//!
//! The bridge operates in four layers:
//!
//! 1. **Transport** - MQTT session to the broker ([`MqttTransport`])
//! 2. **Decoding** - `ServiceEnvelope` to typed payloads ([`decoder`])
//! 3. **State** - per-node metadata ([`NodeMetadataCache`]) and the outgoing
//!    text queue ([`MessageQueue`])
//! 4. **Lifecycle** - background network loop with start/stop ([`MeshBridge`])
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use mesh_bridge::{BridgeConfigBuilder, MeshBridge, MqttTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfigBuilder::new()
//!         .broker("mqtt.example.org", 8883)
//!         .credentials("meshdev", "large4cats")
//!         .build();
//!
//!     let transport = MqttTransport::new(config.mqtt.clone());
//!     let bridge = MeshBridge::connect(transport, config).await?;
//!     bridge.start().await?;
//!
//!     loop {
//!         tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!         for message in bridge.drain_all() {
//!             println!("[{}] {}: {}", message.channel_id(), message.metadata().uid, message.body());
//!         }
//!     }
//! }
//! ```
//!
//! # Message Flow
//!
//! 1. A gateway hears a LoRa packet and publishes it under `msh/2/c/...`
//! 2. The transport yields the raw payload to the network loop
//! 3. [`decode_envelope`] picks the payload apart by port number
//! 4. Position, node info and telemetry are merged into the cache
//! 5. Text is queued with a snapshot of the sender's cached metadata
//! 6. The consumer calls [`MeshBridge::drain_all`]
//!
//! Encrypted packets and ports other than text, position, node info and
//! telemetry are skipped.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod logutil;
pub mod proto;

// Bridge components
pub mod cache;
pub mod decoder;
pub mod queue;
pub mod transport;

// Lifecycle
pub mod bridge;

// Testing utilities
pub mod test_utils;

// Re-exports for convenience
pub use config::{BridgeConfig, BridgeConfigBuilder, MqttConfig, ReconnectConfig};
pub use error::{MeshBridgeError, Result};
pub use transport::{ConnectionState, Delivery, MeshTransport, MqttTransport};

pub use cache::{CacheStats, NodeId, NodeMetadata, NodeMetadataCache};
pub use decoder::{decode_envelope, DecodedEnvelope, DispatchOutcome, Dispatcher};
pub use queue::{IncomingTextMessage, MessageQueue};

pub use bridge::{BridgeStats, MeshBridge};

pub use test_utils::{EnvelopeBuilder, MockFeed, MockTransport, TestFixture};

// Protocol constants re-exports
pub use config::{DEFAULT_CLIENT_ID, DEFAULT_TLS_PORT, DEFAULT_TOPIC};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_TOPIC, "msh/2/c/#");
        assert_eq!(DEFAULT_TLS_PORT, 8883);
    }
}
