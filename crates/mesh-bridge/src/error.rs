//! Error types for mesh bridge operations
//!
//! One error enum covers the broker connection, envelope decoding and
//! configuration. Decode errors are per-delivery and never fatal to the
//! network loop; connection errors at construction time are.

use thiserror::Error;

/// Main error type for mesh bridge operations
#[derive(Error, Debug)]
pub enum MeshBridgeError {
    // ===== Connection Errors =====
    /// Broker could not be reached or the TLS handshake failed
    #[error("Failed to connect to broker {address}: {reason}")]
    ConnectionFailed {
        /// Broker address and port
        address: String,
        /// Failure reason
        reason: String,
    },

    /// Broker answered the CONNECT with a non-success return code
    #[error("Broker refused connection: {0}")]
    ConnectionRefused(String),

    /// No CONNACK within the connect timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Connection lost while reading deliveries
    #[error("Transport error: {0}")]
    Transport(String),

    /// Subscribe request could not be queued
    #[error("Subscribe to {topic} failed: {reason}")]
    SubscribeFailed {
        /// Topic filter
        topic: String,
        /// Failure reason
        reason: String,
    },

    /// Operation requires a connected transport
    #[error("Transport is not connected")]
    NotConnected,

    // ===== Protocol Errors =====
    /// Protobuf decode error
    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(String),

    /// Envelope decoded but is structurally unusable
    #[error("Invalid packet format: {0}")]
    InvalidPacket(String),

    /// Text payload is not valid UTF-8
    #[error("Text payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ===== General Errors =====
    /// Network loop task panicked or was aborted
    #[error("Bridge task failed: {0}")]
    TaskFailed(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshBridgeError {
    /// Check if this error is recoverable by reconnecting
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            MeshBridgeError::ConnectionTimeout { .. }
                | MeshBridgeError::Transport(_)
                | MeshBridgeError::NotConnected
        )
    }

    /// Check if this is a protocol error (bad data from the broker)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            MeshBridgeError::ProtobufDecode(_)
                | MeshBridgeError::InvalidPacket(_)
                | MeshBridgeError::InvalidUtf8(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            MeshBridgeError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            MeshBridgeError::ConnectionRefused(_) => "CONNECTION_REFUSED",
            MeshBridgeError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            MeshBridgeError::Transport(_) => "TRANSPORT_ERROR",
            MeshBridgeError::SubscribeFailed { .. } => "SUBSCRIBE_FAILED",
            MeshBridgeError::NotConnected => "NOT_CONNECTED",
            MeshBridgeError::ProtobufDecode(_) => "PROTOBUF_DECODE",
            MeshBridgeError::InvalidPacket(_) => "INVALID_PACKET",
            MeshBridgeError::InvalidUtf8(_) => "INVALID_UTF8",
            MeshBridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            MeshBridgeError::MissingConfig(_) => "MISSING_CONFIG",
            MeshBridgeError::TaskFailed(_) => "TASK_FAILED",
            MeshBridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for mesh bridge operations
pub type Result<T> = std::result::Result<T, MeshBridgeError>;

// Conversion from prost decode error
impl From<prost::DecodeError> for MeshBridgeError {
    fn from(err: prost::DecodeError) -> Self {
        MeshBridgeError::ProtobufDecode(err.to_string())
    }
}

// Conversion from rumqttc connection error (event loop failures)
impl From<rumqttc::ConnectionError> for MeshBridgeError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        MeshBridgeError::Transport(err.to_string())
    }
}

// Conversion from rumqttc client error (request channel failures)
impl From<rumqttc::ClientError> for MeshBridgeError {
    fn from(err: rumqttc::ClientError) -> Self {
        MeshBridgeError::Transport(err.to_string())
    }
}

// Conversion from tokio join error
impl From<tokio::task::JoinError> for MeshBridgeError {
    fn from(err: tokio::task::JoinError) -> Self {
        MeshBridgeError::TaskFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = MeshBridgeError::ConnectionRefused("bad credentials".to_string());
        assert_eq!(err.error_code(), "CONNECTION_REFUSED");
        assert_eq!(MeshBridgeError::NotConnected.error_code(), "NOT_CONNECTED");
    }

    #[test]
    fn test_is_retriable() {
        assert!(MeshBridgeError::Transport("reset".to_string()).is_retriable());
        assert!(MeshBridgeError::ConnectionTimeout { duration_ms: 5000 }.is_retriable());
        assert!(!MeshBridgeError::ProtobufDecode("bad".to_string()).is_retriable());
    }

    #[test]
    fn test_is_protocol_error() {
        assert!(MeshBridgeError::ProtobufDecode("test".to_string()).is_protocol_error());
        assert!(MeshBridgeError::InvalidPacket("no packet".to_string()).is_protocol_error());
        assert!(!MeshBridgeError::NotConnected.is_protocol_error());
    }

    #[test]
    fn test_utf8_conversion() {
        let bad = String::from_utf8(vec![0xff, 0xfe]).unwrap_err();
        let err: MeshBridgeError = bad.into();
        assert_eq!(err.error_code(), "INVALID_UTF8");
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_connection_failed_display() {
        let err = MeshBridgeError::ConnectionFailed {
            address: "mqtt.example.org:8883".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("mqtt.example.org:8883"));
        assert!(err.to_string().contains("connection refused"));
    }
}
