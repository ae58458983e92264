//! Envelope decoding and dispatch
//!
//! Turning a raw MQTT payload into bridge state happens in two steps:
//!
//! 1. [`decode_envelope`] is a pure function from bytes to an optional
//!    [`DecodedEnvelope`]. It parses the outer `ServiceEnvelope`, selects a
//!    decode path by the inner packet's port number, and parses the
//!    port-specific payload.
//! 2. [`Dispatcher::dispatch`] applies a decoded envelope: text messages are
//!    stamped with a metadata snapshot and queued, everything else is merged
//!    into the node metadata cache.
//!
//! # Port table
//!
//! | Port | Decoded as | Effect |
//! |------|------------|--------|
//! | `TEXT_MESSAGE_APP` (1) | [`DecodedEnvelope::Text`] | enqueue |
//! | `POSITION_APP` (3) | [`DecodedEnvelope::Position`] | cache merge |
//! | `NODEINFO_APP` (4) | [`DecodedEnvelope::NodeInfo`] | cache merge |
//! | `TELEMETRY_APP` (67) | [`DecodedEnvelope::Telemetry`] | cache merge |
//! | anything else | `None` | nothing |
//!
//! Packets the gateway could not decrypt carry no port number and are
//! treated like an unrecognized port.

use chrono::Utc;
use prost::Message;
use tracing::{debug, trace};

use crate::cache::{NodeId, NodeMetadata, NodeMetadataCache};
use crate::error::Result;
use crate::logutil::escape_log;
use crate::proto::{self, mesh_packet::PayloadVariant, PortNum, ServiceEnvelope};
use crate::queue::{IncomingTextMessage, MessageQueue};

/// Scale factor from `latitude_i`/`longitude_i` to decimal degrees
pub const COORDINATE_SCALE: f64 = 1e-7;

/// A text message payload
#[derive(Debug, Clone, PartialEq)]
pub struct TextPayload {
    /// Message text
    pub body: String,
    /// Receive time, epoch seconds
    pub timestamp: i64,
    /// Mesh channel name from the envelope
    pub channel_id: String,
}

/// A position payload, already converted to display units
#[derive(Debug, Clone, PartialEq)]
pub struct PositionPayload {
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Altitude in whole meters
    pub altitude: i32,
    /// Time of the fix, epoch seconds
    pub time: u32,
}

impl PositionPayload {
    /// Altitude rendered as `"<meters>m"`
    pub fn altitude_label(&self) -> String {
        format!("{}m", self.altitude)
    }
}

/// A node identity payload
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfoPayload {
    /// Long display name
    pub long_name: String,
    /// Short display name
    pub short_name: String,
    /// Node's own `!%08x` id string
    pub internal_id: String,
    /// Hardware model number
    pub hardware: i32,
}

/// A device telemetry payload
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPayload {
    /// Battery level percent
    pub battery: u32,
}

/// One envelope decoded along one of the four recognized paths
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEnvelope {
    /// Text message
    Text {
        /// Sending node
        from: NodeId,
        /// Decoded text
        payload: TextPayload,
    },
    /// Position report
    Position {
        /// Sending node
        from: NodeId,
        /// Decoded position
        payload: PositionPayload,
    },
    /// Node identity
    NodeInfo {
        /// Sending node
        from: NodeId,
        /// Decoded identity
        payload: NodeInfoPayload,
    },
    /// Device telemetry
    Telemetry {
        /// Sending node
        from: NodeId,
        /// Decoded telemetry
        payload: TelemetryPayload,
    },
}

impl DecodedEnvelope {
    /// Node that sent the packet
    pub fn sender(&self) -> NodeId {
        match self {
            DecodedEnvelope::Text { from, .. }
            | DecodedEnvelope::Position { from, .. }
            | DecodedEnvelope::NodeInfo { from, .. }
            | DecodedEnvelope::Telemetry { from, .. } => *from,
        }
    }

    /// Port this envelope was decoded from
    pub fn port(&self) -> PortNum {
        match self {
            DecodedEnvelope::Text { .. } => PortNum::TextMessageApp,
            DecodedEnvelope::Position { .. } => PortNum::PositionApp,
            DecodedEnvelope::NodeInfo { .. } => PortNum::NodeinfoApp,
            DecodedEnvelope::Telemetry { .. } => PortNum::TelemetryApp,
        }
    }
}

/// Decode one MQTT payload
///
/// Returns `Ok(None)` for envelopes that are well formed but not for us:
/// envelopes without a packet, encrypted packets, unrecognized ports, and
/// telemetry without device metrics.
pub fn decode_envelope(bytes: &[u8]) -> Result<Option<DecodedEnvelope>> {
    let envelope = ServiceEnvelope::decode(bytes)?;
    let Some(packet) = envelope.packet else {
        trace!(channel = %envelope.channel_id, "Skipping envelope without packet");
        return Ok(None);
    };
    let from = NodeId(packet.from);

    let data = match packet.payload_variant {
        Some(PayloadVariant::Decoded(data)) => data,
        Some(PayloadVariant::Encrypted(_)) | None => {
            trace!(from = %from, channel = %envelope.channel_id, "Skipping encrypted packet");
            return Ok(None);
        }
    };

    let port = match PortNum::try_from(data.portnum) {
        Ok(port) => port,
        Err(_) => {
            trace!(from = %from, port = data.portnum, "Skipping unknown port number");
            return Ok(None);
        }
    };

    match port {
        PortNum::TextMessageApp => {
            let body = String::from_utf8(data.payload)?;
            Ok(Some(DecodedEnvelope::Text {
                from,
                payload: TextPayload {
                    body,
                    timestamp: receive_time(packet.rx_time),
                    channel_id: envelope.channel_id,
                },
            }))
        }
        PortNum::PositionApp => {
            let position = proto::Position::decode(data.payload.as_slice())?;
            Ok(Some(DecodedEnvelope::Position {
                from,
                payload: PositionPayload {
                    latitude: scale_coordinate(position.latitude_i.unwrap_or_default()),
                    longitude: scale_coordinate(position.longitude_i.unwrap_or_default()),
                    altitude: position.altitude.unwrap_or_default(),
                    time: position.time,
                },
            }))
        }
        PortNum::NodeinfoApp => {
            let user = proto::User::decode(data.payload.as_slice())?;
            Ok(Some(DecodedEnvelope::NodeInfo {
                from,
                payload: NodeInfoPayload {
                    long_name: user.long_name,
                    short_name: user.short_name,
                    internal_id: user.id,
                    hardware: user.hw_model,
                },
            }))
        }
        PortNum::TelemetryApp => {
            let telemetry = proto::Telemetry::decode(data.payload.as_slice())?;
            match telemetry.variant {
                Some(proto::telemetry::Variant::DeviceMetrics(metrics)) => {
                    Ok(Some(DecodedEnvelope::Telemetry {
                        from,
                        payload: TelemetryPayload {
                            battery: metrics.battery_level.unwrap_or_default(),
                        },
                    }))
                }
                _ => {
                    trace!(from = %from, "Skipping telemetry without device metrics");
                    Ok(None)
                }
            }
        }
        _ => {
            trace!(from = %from, port = ?port, "Port not bridged");
            Ok(None)
        }
    }
}

/// Convert a 1e-7 scaled integer coordinate to decimal degrees
pub fn scale_coordinate(value: i32) -> f64 {
    value as f64 * COORDINATE_SCALE
}

/// Gateway receive time, or now when the gateway left it unset
fn receive_time(rx_time: u32) -> i64 {
    if rx_time == 0 {
        Utc::now().timestamp()
    } else {
        i64::from(rx_time)
    }
}

/// What dispatching one delivery did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A text message was queued
    Queued,
    /// The sender's metadata was updated
    MetadataUpdated,
    /// Nothing to do for this envelope
    Ignored,
}

/// Applies decoded envelopes to the cache and queue
#[derive(Debug, Clone)]
pub struct Dispatcher {
    cache: NodeMetadataCache,
    queue: MessageQueue,
}

impl Dispatcher {
    /// Create a dispatcher writing to `cache` and `queue`
    pub fn new(cache: NodeMetadataCache, queue: MessageQueue) -> Self {
        Self { cache, queue }
    }

    /// Decode and dispatch one raw delivery
    pub fn handle_delivery(&self, bytes: &[u8]) -> Result<DispatchOutcome> {
        match decode_envelope(bytes)? {
            Some(envelope) => Ok(self.dispatch(envelope)),
            None => Ok(DispatchOutcome::Ignored),
        }
    }

    /// Apply one decoded envelope
    pub fn dispatch(&self, envelope: DecodedEnvelope) -> DispatchOutcome {
        match envelope {
            DecodedEnvelope::Text { from, payload } => {
                let metadata = self.cache.snapshot_or_default(from);
                debug!(
                    from = %from,
                    channel = %payload.channel_id,
                    text = %escape_log(&payload.body),
                    "Queueing text message"
                );
                self.queue.enqueue(IncomingTextMessage::new(
                    metadata,
                    payload.body,
                    payload.timestamp,
                    payload.channel_id,
                ));
                DispatchOutcome::Queued
            }
            DecodedEnvelope::Position { from, payload } => {
                debug!(
                    from = %from,
                    latitude = payload.latitude,
                    longitude = payload.longitude,
                    "Position update"
                );
                self.cache.accumulate(
                    from,
                    NodeMetadata {
                        latitude: Some(payload.latitude),
                        longitude: Some(payload.longitude),
                        altitude: Some(payload.altitude_label()),
                        pos_at_time: Some(payload.time),
                        ..NodeMetadata::new(from)
                    },
                );
                DispatchOutcome::MetadataUpdated
            }
            DecodedEnvelope::NodeInfo { from, payload } => {
                debug!(
                    from = %from,
                    long_name = %escape_log(&payload.long_name),
                    "Node info update"
                );
                self.cache.accumulate(
                    from,
                    NodeMetadata {
                        long_name: Some(payload.long_name),
                        short_name: Some(payload.short_name),
                        internal_id: Some(payload.internal_id),
                        hardware: Some(payload.hardware),
                        ..NodeMetadata::new(from)
                    },
                );
                DispatchOutcome::MetadataUpdated
            }
            DecodedEnvelope::Telemetry { from, payload } => {
                debug!(from = %from, battery = payload.battery, "Telemetry update");
                self.cache.accumulate(
                    from,
                    NodeMetadata {
                        battery: Some(payload.battery),
                        ..NodeMetadata::new(from)
                    },
                );
                DispatchOutcome::MetadataUpdated
            }
        }
    }

    /// Cache this dispatcher writes to
    pub fn cache(&self) -> &NodeMetadataCache {
        &self.cache
    }

    /// Queue this dispatcher writes to
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::EnvelopeBuilder;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(NodeMetadataCache::new(), MessageQueue::new())
    }

    #[test]
    fn test_decode_text() {
        let bytes = EnvelopeBuilder::new(123, "LongFast").text("hello", 1005);
        let decoded = decode_envelope(&bytes).unwrap().unwrap();

        assert_eq!(decoded.sender(), NodeId(123));
        assert_eq!(decoded.port(), PortNum::TextMessageApp);
        match decoded {
            DecodedEnvelope::Text { payload, .. } => {
                assert_eq!(payload.body, "hello");
                assert_eq!(payload.timestamp, 1005);
                assert_eq!(payload.channel_id, "LongFast");
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_position_scaling() {
        let bytes =
            EnvelopeBuilder::new(123, "LongFast").position(400000000, -1050000000, 1600, 1000);
        match decode_envelope(&bytes).unwrap().unwrap() {
            DecodedEnvelope::Position { payload, .. } => {
                assert!((payload.latitude - 40.0).abs() < 1e-6);
                assert!((payload.longitude + 105.0).abs() < 1e-6);
                assert_eq!(payload.altitude_label(), "1600m");
                assert_eq!(payload.time, 1000);
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_node_info() {
        let bytes = EnvelopeBuilder::new(0x7b, "LongFast").node_info("Alice", "ALC", 9);
        match decode_envelope(&bytes).unwrap().unwrap() {
            DecodedEnvelope::NodeInfo { payload, .. } => {
                assert_eq!(payload.long_name, "Alice");
                assert_eq!(payload.short_name, "ALC");
                assert_eq!(payload.internal_id, "!0000007b");
                assert_eq!(payload.hardware, 9);
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_telemetry() {
        let bytes = EnvelopeBuilder::new(5, "LongFast").telemetry(76);
        match decode_envelope(&bytes).unwrap().unwrap() {
            DecodedEnvelope::Telemetry { payload, .. } => assert_eq!(payload.battery, 76),
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_envelope_is_decode_error() {
        let err = decode_envelope(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_envelope_without_packet_is_ignored() {
        let bytes = EnvelopeBuilder::empty("LongFast");
        assert!(decode_envelope(&bytes).unwrap().is_none());
    }

    #[test]
    fn test_unknown_port_is_ignored() {
        let bytes = EnvelopeBuilder::new(1, "LongFast").raw(PortNum::RoutingApp as i32, vec![1]);
        assert!(decode_envelope(&bytes).unwrap().is_none());

        let bytes = EnvelopeBuilder::new(1, "LongFast").raw(4242, vec![1]);
        assert!(decode_envelope(&bytes).unwrap().is_none());
    }

    #[test]
    fn test_encrypted_packet_is_ignored() {
        let bytes = EnvelopeBuilder::new(1, "LongFast").encrypted(vec![0xde, 0xad]);
        assert!(decode_envelope(&bytes).unwrap().is_none());
    }

    #[test]
    fn test_invalid_utf8_text_is_error() {
        let bytes = EnvelopeBuilder::new(1, "LongFast")
            .raw(PortNum::TextMessageApp as i32, vec![0xc3, 0x28]);
        let err = decode_envelope(&bytes).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_UTF8");
    }

    #[test]
    fn test_zero_rx_time_uses_current_time() {
        let before = Utc::now().timestamp();
        let bytes = EnvelopeBuilder::new(1, "LongFast").text("late", 0);
        match decode_envelope(&bytes).unwrap().unwrap() {
            DecodedEnvelope::Text { payload, .. } => assert!(payload.timestamp >= before),
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_text_for_unseen_node_carries_uid_only() {
        let dispatcher = dispatcher();
        let bytes = EnvelopeBuilder::new(77, "LongFast").text("first", 10);

        assert_eq!(
            dispatcher.handle_delivery(&bytes).unwrap(),
            DispatchOutcome::Queued
        );
        let drained = dispatcher.queue().drain_all();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].metadata().is_bare());
        assert_eq!(drained[0].metadata().uid, NodeId(77));
        // Text never creates a cache entry
        assert!(dispatcher.cache().is_empty());
    }

    #[test]
    fn test_dispatch_metadata_updates_merge_in_order() {
        let dispatcher = dispatcher();
        let builder = EnvelopeBuilder::new(9, "LongFast");

        for bytes in [
            builder.node_info("Old Name", "OLD", 4),
            builder.telemetry(50),
            builder.node_info("New Name", "NEW", 4),
            builder.telemetry(49),
        ] {
            assert_eq!(
                dispatcher.handle_delivery(&bytes).unwrap(),
                DispatchOutcome::MetadataUpdated
            );
        }
        dispatcher
            .handle_delivery(&builder.text("status", 20))
            .unwrap();

        let message = dispatcher.queue().drain_all().remove(0);
        let metadata = message.metadata();
        assert_eq!(metadata.long_name.as_deref(), Some("New Name"));
        assert_eq!(metadata.short_name.as_deref(), Some("NEW"));
        assert_eq!(metadata.battery, Some(49));
        assert_eq!(metadata.hardware, Some(4));
    }

    #[test]
    fn test_dispatch_ignored_port_changes_nothing() {
        let dispatcher = dispatcher();
        let bytes = EnvelopeBuilder::new(1, "LongFast").raw(PortNum::WaypointApp as i32, vec![]);

        assert_eq!(
            dispatcher.handle_delivery(&bytes).unwrap(),
            DispatchOutcome::Ignored
        );
        assert!(dispatcher.cache().is_empty());
        assert!(dispatcher.queue().is_empty());
    }
}
