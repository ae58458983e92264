//! Test utilities for exercising the bridge without a broker
//!
//! This module provides:
//!
//! - [`EnvelopeBuilder`] - encodes `ServiceEnvelope` payloads the way a
//!   gateway would publish them
//! - [`MockTransport`] / [`MockFeed`] - a channel-fed transport; the feed
//!   half pushes deliveries, errors and end-of-stream into a running bridge
//! - [`TestFixture`] - a bridge connected over a mock transport
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_bridge::test_utils::{EnvelopeBuilder, TestFixture};
//!
//! let fixture = TestFixture::connected().await?;
//! fixture.bridge.start().await?;
//!
//! let node = EnvelopeBuilder::new(123, "LongFast");
//! fixture.feed.deliver(node.text("hello", 1005));
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bridge::MeshBridge;
use crate::cache::NodeId;
use crate::config::{BridgeConfig, BridgeConfigBuilder};
use crate::error::{MeshBridgeError, Result};
use crate::proto::{
    mesh_packet::PayloadVariant, telemetry, Data, DeviceMetrics, EnvironmentMetrics, MeshPacket,
    PortNum, Position, ServiceEnvelope, Telemetry, User,
};
use crate::transport::{Delivery, MeshTransport};

/// Destination address for broadcast packets
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Gateway id stamped on generated envelopes
pub const TEST_GATEWAY_ID: &str = "!deadbeef";

/// Receive time used for packets whose builder call takes no time argument
pub const TEST_RX_TIME: u32 = 1_700_000_000;

/// Encodes gateway envelopes from a single sender on a single channel
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    from: u32,
    channel_id: String,
}

impl EnvelopeBuilder {
    /// Builder for packets sent by node `from`, heard on `channel_id`
    pub fn new(from: u32, channel_id: impl Into<String>) -> Self {
        Self {
            from,
            channel_id: channel_id.into(),
        }
    }

    /// An envelope with no packet in it
    pub fn empty(channel_id: &str) -> Vec<u8> {
        ServiceEnvelope {
            packet: None,
            channel_id: channel_id.to_string(),
            gateway_id: TEST_GATEWAY_ID.to_string(),
        }
        .encode_to_vec()
    }

    /// Topic a gateway would publish these envelopes on
    pub fn topic(&self) -> String {
        format!("msh/2/c/{}/{}", self.channel_id, TEST_GATEWAY_ID)
    }

    /// Text message received at `rx_time` (0 means unset)
    pub fn text(&self, body: &str, rx_time: u32) -> Vec<u8> {
        self.data(
            PortNum::TextMessageApp as i32,
            body.as_bytes().to_vec(),
            rx_time,
        )
    }

    /// Position report with 1e-7 scaled coordinates
    pub fn position(&self, latitude_i: i32, longitude_i: i32, altitude: i32, time: u32) -> Vec<u8> {
        let position = Position {
            latitude_i: Some(latitude_i),
            longitude_i: Some(longitude_i),
            altitude: Some(altitude),
            time,
            ..Default::default()
        };
        self.data(PortNum::PositionApp as i32, position.encode_to_vec(), time)
    }

    /// Node identity announcement
    pub fn node_info(&self, long_name: &str, short_name: &str, hw_model: i32) -> Vec<u8> {
        let user = User {
            id: NodeId(self.from).user_id(),
            long_name: long_name.to_string(),
            short_name: short_name.to_string(),
            hw_model,
            ..Default::default()
        };
        self.data(PortNum::NodeinfoApp as i32, user.encode_to_vec(), TEST_RX_TIME)
    }

    /// Device metrics telemetry
    pub fn telemetry(&self, battery: u32) -> Vec<u8> {
        let metrics = Telemetry {
            time: TEST_RX_TIME,
            variant: Some(telemetry::Variant::DeviceMetrics(DeviceMetrics {
                battery_level: Some(battery),
                ..Default::default()
            })),
        };
        self.data(PortNum::TelemetryApp as i32, metrics.encode_to_vec(), TEST_RX_TIME)
    }

    /// Environment telemetry, which carries no battery level
    pub fn environment(&self, temperature: f32) -> Vec<u8> {
        let metrics = Telemetry {
            time: TEST_RX_TIME,
            variant: Some(telemetry::Variant::EnvironmentMetrics(EnvironmentMetrics {
                temperature: Some(temperature),
                ..Default::default()
            })),
        };
        self.data(PortNum::TelemetryApp as i32, metrics.encode_to_vec(), TEST_RX_TIME)
    }

    /// Decoded packet with an arbitrary port number and payload
    pub fn raw(&self, portnum: i32, payload: Vec<u8>) -> Vec<u8> {
        self.data(portnum, payload, TEST_RX_TIME)
    }

    /// Packet the gateway could not decrypt
    pub fn encrypted(&self, ciphertext: Vec<u8>) -> Vec<u8> {
        self.envelope(PayloadVariant::Encrypted(ciphertext), TEST_RX_TIME)
    }

    fn data(&self, portnum: i32, payload: Vec<u8>, rx_time: u32) -> Vec<u8> {
        self.envelope(
            PayloadVariant::Decoded(Data {
                portnum,
                payload,
                ..Default::default()
            }),
            rx_time,
        )
    }

    fn envelope(&self, variant: PayloadVariant, rx_time: u32) -> Vec<u8> {
        ServiceEnvelope {
            packet: Some(MeshPacket {
                from: self.from,
                to: BROADCAST_ADDR,
                rx_time,
                hop_limit: 3,
                hop_start: 3,
                payload_variant: Some(variant),
                ..Default::default()
            }),
            channel_id: self.channel_id.clone(),
            gateway_id: TEST_GATEWAY_ID.to_string(),
        }
        .encode_to_vec()
    }
}

/// What the mock transport yields next
#[derive(Debug)]
enum MockEvent {
    Deliver(Delivery),
    Fail(String),
    End,
}

/// Shared counters and switches between a mock transport and its feed
#[derive(Debug, Default)]
struct MockShared {
    fail_connect: AtomicBool,
    connects: AtomicU32,
    disconnects: AtomicU32,
    subscriptions: Mutex<Vec<String>>,
}

/// Sending half of a [`MockTransport`]
///
/// Cloneable; when every feed is dropped the transport reports end of stream.
#[derive(Debug, Clone)]
pub struct MockFeed {
    tx: mpsc::UnboundedSender<MockEvent>,
    shared: Arc<MockShared>,
}

impl MockFeed {
    /// Push a payload on the default test topic
    pub fn deliver(&self, payload: Vec<u8>) {
        self.deliver_on("msh/2/c/LongFast/!deadbeef", payload);
    }

    /// Push a payload on a specific topic
    pub fn deliver_on(&self, topic: &str, payload: Vec<u8>) {
        let _ = self.tx.send(MockEvent::Deliver(Delivery::new(topic, payload)));
    }

    /// Make the next read fail with a transport error
    pub fn fail(&self, reason: &str) {
        let _ = self.tx.send(MockEvent::Fail(reason.to_string()));
    }

    /// End the delivery stream
    pub fn end(&self) {
        let _ = self.tx.send(MockEvent::End);
    }

    /// Make `connect` fail from now on
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.fail_connect.store(refuse, Ordering::SeqCst);
    }

    /// Number of successful `connect` calls
    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls
    pub fn disconnect_count(&self) -> u32 {
        self.shared.disconnects.load(Ordering::SeqCst)
    }

    /// Topic filters the transport has subscribed to
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions.lock().clone()
    }
}

/// Channel-fed transport for tests
#[derive(Debug)]
pub struct MockTransport {
    rx: mpsc::UnboundedReceiver<MockEvent>,
    shared: Arc<MockShared>,
    connected: bool,
}

impl MockTransport {
    /// Create a transport and the feed that drives it
    pub fn new() -> (Self, MockFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared::default());
        let transport = Self {
            rx,
            shared: shared.clone(),
            connected: false,
        };
        (transport, MockFeed { tx, shared })
    }

    /// Create a transport whose `connect` always fails
    pub fn refusing() -> (Self, MockFeed) {
        let (transport, feed) = Self::new();
        feed.refuse_connections(true);
        (transport, feed)
    }
}

#[async_trait]
impl MeshTransport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(MeshBridgeError::ConnectionRefused(
                "NotAuthorized".to_string(),
            ));
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        if !self.connected {
            return Err(MeshBridgeError::NotConnected);
        }
        let mut subscriptions = self.shared.subscriptions.lock();
        if !subscriptions.iter().any(|t| t == topic) {
            subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        if !self.connected {
            return Err(MeshBridgeError::NotConnected);
        }
        match self.rx.recv().await {
            Some(MockEvent::Deliver(delivery)) => Ok(Some(delivery)),
            Some(MockEvent::Fail(reason)) => {
                debug!(reason = %reason, "Mock transport failing read");
                Err(MeshBridgeError::Transport(reason))
            }
            Some(MockEvent::End) | None => Ok(None),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn name(&self) -> &str {
        "MockTransport"
    }
}

/// Bridge configuration with fast reconnect timings for tests
pub fn test_config() -> BridgeConfig {
    BridgeConfigBuilder::new()
        .broker("localhost", 1883)
        .tls(false)
        .reconnect_delays(Duration::from_millis(10), Duration::from_millis(50))
        .build()
}

/// Test fixture with a bridge connected over a mock transport
pub struct TestFixture {
    /// Bridge under test
    pub bridge: MeshBridge<MockTransport>,
    /// Feed driving the bridge's transport
    pub feed: MockFeed,
}

impl TestFixture {
    /// Connect a bridge using [`test_config`]
    pub async fn connected() -> Result<Self> {
        Self::with_config(test_config()).await
    }

    /// Connect a bridge using the given configuration
    pub async fn with_config(config: BridgeConfig) -> Result<Self> {
        let (transport, feed) = MockTransport::new();
        let bridge = MeshBridge::connect(transport, config).await?;
        Ok(Self { bridge, feed })
    }

    /// Wait until the queue holds `count` messages or `timeout` passes
    pub async fn wait_for_queued(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.bridge.queue().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.bridge.queue().len() >= count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_builder_sets_sender_and_channel() {
        let bytes = EnvelopeBuilder::new(0x1234, "LongFast").text("hi", 42);
        let envelope = ServiceEnvelope::decode(bytes.as_slice()).unwrap();
        assert_eq!(envelope.channel_id, "LongFast");
        let packet = envelope.packet.unwrap();
        assert_eq!(packet.from, 0x1234);
        assert_eq!(packet.rx_time, 42);
        match packet.payload_variant {
            Some(PayloadVariant::Decoded(data)) => {
                assert_eq!(data.portnum, PortNum::TextMessageApp as i32);
                assert_eq!(data.payload, b"hi");
            }
            other => panic!("Unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_node_info_uses_user_id_form() {
        let bytes = EnvelopeBuilder::new(123, "LongFast").node_info("Alice", "ALC", 9);
        let envelope = ServiceEnvelope::decode(bytes.as_slice()).unwrap();
        let Some(PayloadVariant::Decoded(data)) = envelope.packet.unwrap().payload_variant else {
            panic!("Expected decoded payload");
        };
        let user = User::decode(data.payload.as_slice()).unwrap();
        assert_eq!(user.id, "!0000007b");
    }

    #[test]
    fn test_builder_topic() {
        let builder = EnvelopeBuilder::new(1, "MediumSlow");
        assert_eq!(builder.topic(), "msh/2/c/MediumSlow/!deadbeef");
    }

    #[tokio::test]
    async fn test_mock_transport_connect_and_read() {
        let (mut transport, feed) = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect().await.unwrap();
        transport.subscribe("msh/2/c/#").await.unwrap();
        transport.subscribe("msh/2/c/#").await.unwrap();
        assert_eq!(feed.subscriptions(), vec!["msh/2/c/#".to_string()]);

        feed.deliver(vec![1, 2, 3]);
        let delivery = transport.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.payload.as_ref(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_mock_transport_failure_then_recovery() {
        let (mut transport, feed) = MockTransport::new();
        transport.connect().await.unwrap();

        feed.fail("link down");
        feed.deliver(vec![9]);

        assert!(transport.next_delivery().await.is_err());
        assert!(transport.next_delivery().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mock_transport_end_of_stream() {
        let (mut transport, feed) = MockTransport::new();
        transport.connect().await.unwrap();

        feed.end();
        assert!(transport.next_delivery().await.unwrap().is_none());

        drop(feed);
        assert!(transport.next_delivery().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_transport_refusing() {
        let (mut transport, feed) = MockTransport::refusing();
        let err = transport.connect().await.unwrap_err();
        assert_eq!(err.error_code(), "CONNECTION_REFUSED");
        assert_eq!(feed.connect_count(), 0);
    }
}
