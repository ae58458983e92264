//! MQTT transport for Meshtastic uplink brokers
//!
//! Gateways publish every packet they hear as a protobuf `ServiceEnvelope`
//! under `msh/2/c/<channel>/<gateway id>`. This transport holds one rumqttc
//! session, subscribes to the configured filter and hands each PUBLISH
//! payload to the caller unchanged.
//!
//! # Connection handling
//!
//! [`MqttTransport::connect`] drives the event loop until the broker answers
//! with CONNACK and fails if it does not within `connect_timeout`. After that,
//! rumqttc re-dials on the next poll following a connection error; this
//! transport re-issues its subscriptions whenever a new CONNACK arrives.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, Transport,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{ConnectionState, Delivery, MeshTransport};
use crate::config::MqttConfig;
use crate::error::{MeshBridgeError, Result};

/// How long `disconnect` waits for the DISCONNECT packet to go out
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// rumqttc-backed transport
pub struct MqttTransport {
    config: MqttConfig,
    name: String,
    state: ConnectionState,
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
    subscriptions: Vec<String>,
    /// Publishes that arrived while waiting for a SUBACK
    buffered: VecDeque<Delivery>,
}

impl MqttTransport {
    /// Create a transport for the given broker settings
    pub fn new(config: MqttConfig) -> Self {
        let name = format!("mqtt://{}", config.endpoint());
        Self {
            config,
            name,
            state: ConnectionState::Disconnected,
            client: None,
            eventloop: None,
            subscriptions: Vec::new(),
            buffered: VecDeque::new(),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Topic filters subscribed so far
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.address.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);

        match self.config.credentials() {
            Some((username, password)) => {
                debug!(username = %username, "Using password authentication");
                options.set_credentials(username, password);
            }
            None => info!("No MQTT credentials configured, connecting anonymously"),
        }

        if self.config.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    fn timeout_error(&self) -> MeshBridgeError {
        MeshBridgeError::ConnectionTimeout {
            duration_ms: self.config.connect_timeout.as_millis() as u64,
        }
    }
}

fn connect_error(endpoint: &str, err: ConnectionError) -> MeshBridgeError {
    match err {
        ConnectionError::ConnectionRefused(code) => {
            MeshBridgeError::ConnectionRefused(format!("{:?}", code))
        }
        other => MeshBridgeError::ConnectionFailed {
            address: endpoint.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Queue SUBSCRIBE requests without waiting on the event loop
fn request_subscriptions(client: &AsyncClient, topics: &[String]) -> Result<()> {
    for topic in topics {
        client
            .try_subscribe(topic.clone(), QoS::AtMostOnce)
            .map_err(|e| MeshBridgeError::SubscribeFailed {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

#[async_trait]
impl MeshTransport for MqttTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        info!(
            broker = %self.config.endpoint(),
            tls = self.config.tls,
            client_id = %self.config.client_id,
            "Connecting to MQTT broker"
        );

        let (client, mut eventloop) = AsyncClient::new(self.options(), self.config.request_capacity);
        let endpoint = self.config.endpoint();

        let handshake = tokio::time::timeout(self.config.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(MeshBridgeError::ConnectionRefused(format!("{:?}", ack.code)))
                        };
                    }
                    Ok(event) => trace!(?event, "Event before CONNACK"),
                    Err(e) => return Err(connect_error(&endpoint, e)),
                }
            }
        })
        .await;

        match handshake {
            Ok(Ok(())) => {
                info!(broker = %endpoint, "Connected to MQTT broker");
                self.client = Some(client);
                self.eventloop = Some(eventloop);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(broker = %endpoint, error = %e, "Failed to connect to MQTT broker");
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
            Err(_) => {
                warn!(broker = %endpoint, "Timed out waiting for CONNACK");
                self.state = ConnectionState::Disconnected;
                Err(self.timeout_error())
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        if self.subscriptions.iter().any(|t| t == topic) {
            trace!(topic = %topic, "Already subscribed");
            return Ok(());
        }
        let (Some(client), Some(eventloop)) = (self.client.as_ref(), self.eventloop.as_mut())
        else {
            return Err(MeshBridgeError::NotConnected);
        };

        let topics = [topic.to_string()];
        request_subscriptions(client, &topics)?;

        let buffered = &mut self.buffered;
        let suback = tokio::time::timeout(self.config.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::SubAck(ack))) => return Ok(ack),
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        buffered.push_back(Delivery::new(publish.topic, publish.payload));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(MeshBridgeError::from(e)),
                }
            }
        })
        .await;

        let ack = match suback {
            Ok(result) => result?,
            Err(_) => return Err(self.timeout_error()),
        };
        if ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            return Err(MeshBridgeError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "broker rejected subscription".to_string(),
            });
        }

        info!(topic = %topic, "Subscribed");
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        if let Some(delivery) = self.buffered.pop_front() {
            return Ok(Some(delivery));
        }
        let (Some(client), Some(eventloop)) = (self.client.as_ref(), self.eventloop.as_mut())
        else {
            return Ok(None);
        };

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    trace!(topic = %publish.topic, bytes = publish.payload.len(), "PUBLISH received");
                    return Ok(Some(Delivery::new(publish.topic, publish.payload)));
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(code = ?ack.code, "Reconnected to MQTT broker, resubscribing");
                    self.state = ConnectionState::Connected;
                    request_subscriptions(client, &self.subscriptions)?;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker sent DISCONNECT");
                    self.state = ConnectionState::Reconnecting;
                }
                Ok(event) => trace!(?event, "MQTT event"),
                Err(e) => {
                    self.state = ConnectionState::Reconnecting;
                    return Err(e.into());
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let (Some(client), Some(mut eventloop)) = (self.client.take(), self.eventloop.take()) {
            if client.try_disconnect().is_ok() {
                // Flush the DISCONNECT packet; errors here just mean the
                // session is already gone
                let _ = tokio::time::timeout(DISCONNECT_GRACE, async {
                    loop {
                        match eventloop.poll().await {
                            Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                })
                .await;
            }
            info!(broker = %self.config.endpoint(), "Disconnected from MQTT broker");
        }
        self.subscriptions.clear();
        self.buffered.clear();
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfigBuilder;

    fn unreachable_config() -> MqttConfig {
        // Port 1 on loopback has no listener
        BridgeConfigBuilder::new()
            .broker("127.0.0.1", 1)
            .tls(false)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .mqtt
    }

    #[test]
    fn test_new_transport_is_disconnected() {
        let transport = MqttTransport::new(unreachable_config());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!transport.is_connected());
        assert_eq!(transport.name(), "mqtt://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        let mut transport = MqttTransport::new(unreachable_config());
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(
            err,
            MeshBridgeError::ConnectionFailed { .. } | MeshBridgeError::ConnectionTimeout { .. }
        ));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let mut transport = MqttTransport::new(unreachable_config());
        let err = transport.subscribe("msh/2/c/#").await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_CONNECTED");
    }

    #[tokio::test]
    async fn test_next_delivery_without_session_ends_sequence() {
        let mut transport = MqttTransport::new(unreachable_config());
        assert!(transport.next_delivery().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_when_never_connected() {
        let mut transport = MqttTransport::new(unreachable_config());
        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
