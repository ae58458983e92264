//! Meshtastic protobuf wire types
//!
//! The subset of `mqtt.proto`, `mesh.proto`, `telemetry.proto` and
//! `portnums.proto` the bridge reads, declared with prost derives. Field
//! numbers and scalar encodings match the upstream definitions so envelopes
//! published by real gateways decode unchanged; fields not declared here are
//! skipped by prost.

/// Outer wrapper published by a gateway on `msh/2/c/<channel>/<gateway>`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceEnvelope {
    /// The radio packet
    #[prost(message, optional, tag = "1")]
    pub packet: ::core::option::Option<MeshPacket>,
    /// Channel name, e.g. `LongFast`
    #[prost(string, tag = "2")]
    pub channel_id: ::prost::alloc::string::String,
    /// Gateway node id in `!%08x` form
    #[prost(string, tag = "3")]
    pub gateway_id: ::prost::alloc::string::String,
}

/// A packet as seen on the mesh
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MeshPacket {
    /// Sending node number
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    /// Destination node number (`0xFFFFFFFF` for broadcast)
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    /// Channel index or hash
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    /// Packet id
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    /// Receive time at the gateway, epoch seconds
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    /// Receive SNR
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    /// Remaining hops
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    /// Sender requested an ack
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    /// Receive RSSI
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    /// Packet arrived at the gateway over MQTT rather than radio
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    /// Hop limit the packet started with
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
    /// Decoded or still-encrypted payload
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: ::core::option::Option<mesh_packet::PayloadVariant>,
}

/// Nested types for [`MeshPacket`]
pub mod mesh_packet {
    /// Payload carried by a [`MeshPacket`](super::MeshPacket)
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        /// Payload the gateway could decrypt
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        /// Payload the gateway forwarded without decrypting
        #[prost(bytes = "vec", tag = "5")]
        Encrypted(::prost::alloc::vec::Vec<u8>),
    }
}

/// Port-tagged application payload
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    /// Application port, see [`PortNum`]
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    /// Application payload
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    /// Sender wants a response
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    /// Final destination for relayed packets
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    /// Original sender for relayed packets
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    /// Id of the request this answers
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    /// Id of the message this replies to
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    /// Payload is an emoji reaction
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
}

/// GPS position report
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Position {
    /// Latitude in 1e-7 degrees
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: ::core::option::Option<i32>,
    /// Longitude in 1e-7 degrees
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: ::core::option::Option<i32>,
    /// Altitude above MSL in meters
    #[prost(int32, optional, tag = "3")]
    pub altitude: ::core::option::Option<i32>,
    /// Time of the fix, epoch seconds
    #[prost(fixed32, tag = "4")]
    pub time: u32,
    /// GPS timestamp, epoch seconds
    #[prost(fixed32, tag = "7")]
    pub timestamp: u32,
    /// Altitude above the ellipsoid in meters
    #[prost(sint32, optional, tag = "9")]
    pub altitude_hae: ::core::option::Option<i32>,
    /// Satellites in view
    #[prost(uint32, tag = "19")]
    pub sats_in_view: u32,
    /// Bits of precision kept in lat/lon
    #[prost(uint32, tag = "23")]
    pub precision_bits: u32,
}

/// Node identity broadcast on the NODEINFO port
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    /// Node id in `!%08x` form
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    /// Long display name
    #[prost(string, tag = "2")]
    pub long_name: ::prost::alloc::string::String,
    /// Up to four character short name
    #[prost(string, tag = "3")]
    pub short_name: ::prost::alloc::string::String,
    /// Deprecated MAC address
    #[prost(bytes = "vec", tag = "4")]
    pub macaddr: ::prost::alloc::vec::Vec<u8>,
    /// `HardwareModel` enum number
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    /// Licensed amateur radio operator
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    /// `Config.DeviceConfig.Role` enum number
    #[prost(int32, tag = "7")]
    pub role: i32,
}

/// Telemetry report
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Telemetry {
    /// Sample time, epoch seconds
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    /// Which metrics this report carries
    #[prost(oneof = "telemetry::Variant", tags = "2, 3")]
    pub variant: ::core::option::Option<telemetry::Variant>,
}

/// Nested types for [`Telemetry`]
pub mod telemetry {
    /// Metrics carried by a [`Telemetry`](super::Telemetry) report
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        /// Device health
        #[prost(message, tag = "2")]
        DeviceMetrics(super::DeviceMetrics),
        /// Environment sensors
        #[prost(message, tag = "3")]
        EnvironmentMetrics(super::EnvironmentMetrics),
    }
}

/// Device health metrics
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceMetrics {
    /// Battery level percent (0-100, 101 means powered)
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: ::core::option::Option<u32>,
    /// Battery voltage
    #[prost(float, optional, tag = "2")]
    pub voltage: ::core::option::Option<f32>,
    /// Channel utilization percent
    #[prost(float, optional, tag = "3")]
    pub channel_utilization: ::core::option::Option<f32>,
    /// Transmit airtime percent
    #[prost(float, optional, tag = "4")]
    pub air_util_tx: ::core::option::Option<f32>,
    /// Seconds since boot
    #[prost(uint32, optional, tag = "5")]
    pub uptime_seconds: ::core::option::Option<u32>,
}

/// Environment sensor metrics
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvironmentMetrics {
    /// Temperature in Celsius
    #[prost(float, optional, tag = "1")]
    pub temperature: ::core::option::Option<f32>,
    /// Relative humidity percent
    #[prost(float, optional, tag = "2")]
    pub relative_humidity: ::core::option::Option<f32>,
    /// Barometric pressure in hPa
    #[prost(float, optional, tag = "3")]
    pub barometric_pressure: ::core::option::Option<f32>,
}

/// Application port numbers from `portnums.proto`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    /// Unset or unknown
    UnknownApp = 0,
    /// UTF-8 text
    TextMessageApp = 1,
    /// GPIO control
    RemoteHardwareApp = 2,
    /// [`Position`] report
    PositionApp = 3,
    /// [`User`] identity
    NodeinfoApp = 4,
    /// Routing control
    RoutingApp = 5,
    /// Admin messages
    AdminApp = 6,
    /// Unishox2-compressed text
    TextMessageCompressedApp = 7,
    /// Waypoints
    WaypointApp = 8,
    /// Codec2 audio
    AudioApp = 9,
    /// Detection sensor
    DetectionSensorApp = 10,
    /// Ping replies
    ReplyApp = 32,
    /// IP tunnel
    IpTunnelApp = 33,
    /// People counter
    PaxcounterApp = 34,
    /// Serial module
    SerialApp = 64,
    /// Store and forward
    StoreForwardApp = 65,
    /// Range test
    RangeTestApp = 66,
    /// [`Telemetry`] report
    TelemetryApp = 67,
    /// Zero-GPS positioning
    ZpsApp = 68,
    /// Simulator
    SimulatorApp = 69,
    /// Traceroute
    TracerouteApp = 70,
    /// Neighbor info
    NeighborinfoApp = 71,
    /// ATAK plugin
    AtakPlugin = 72,
    /// Map report
    MapReportApp = 73,
    /// First private application port
    PrivateApp = 256,
    /// ATAK forwarder
    AtakForwarder = 257,
    /// Highest port number
    Max = 511,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_portnum_conversion() {
        assert_eq!(PortNum::try_from(1).unwrap(), PortNum::TextMessageApp);
        assert_eq!(PortNum::try_from(67).unwrap(), PortNum::TelemetryApp);
        assert!(PortNum::try_from(1000).is_err());
    }

    #[test]
    fn test_position_wire_compatibility() {
        // latitude_i = 1, sfixed32 (wire type 5): tag byte 0x0D
        let pos = Position {
            latitude_i: Some(400000000),
            ..Default::default()
        };
        let bytes = pos.encode_to_vec();
        assert_eq!(bytes[0], 0x0D);
        assert_eq!(&bytes[1..5], &400000000i32.to_le_bytes());
    }

    #[test]
    fn test_envelope_decodes_encrypted_variant() {
        let envelope = ServiceEnvelope {
            packet: Some(MeshPacket {
                from: 42,
                payload_variant: Some(mesh_packet::PayloadVariant::Encrypted(vec![1, 2, 3])),
                ..Default::default()
            }),
            channel_id: "LongFast".to_string(),
            gateway_id: "!0000002a".to_string(),
        };
        let decoded = ServiceEnvelope::decode(envelope.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, envelope);
    }
}
