//! MeshBridge - lifecycle and network loop
//!
//! The bridge owns a connected transport, a node metadata cache and an
//! outgoing message queue. Once started, a background task pulls deliveries
//! from the transport and hands them to the [`Dispatcher`]; the consumer
//! drains queued text messages whenever it likes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         MeshBridge                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────┐    ┌──────────────┐    ┌───────────────┐    │
//! │  │ Transport   │───►│ Network loop │───►│ MessageQueue  │───►│ drain_all()
//! │  │ (MQTT)      │    │  Dispatcher  │    └───────────────┘    │
//! │  └─────────────┘    │              │    ┌───────────────┐    │
//! │                     │              │◄──►│ MetadataCache │    │
//! │                     └──────────────┘    └───────────────┘    │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! [`MeshBridge::connect`] validates the configuration, connects and
//! subscribes. Any failure there is returned to the caller; nothing is
//! retried. [`MeshBridge::start`] and [`MeshBridge::stop`] may then be called
//! any number of times. The transport is handed back by the loop task when it
//! exits, so a stopped bridge can be started again.
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_bridge::{BridgeConfigBuilder, MeshBridge, MqttTransport};
//!
//! let config = BridgeConfigBuilder::new()
//!     .broker("mqtt.meshtastic.org", 8883)
//!     .build();
//! let bridge = MeshBridge::connect(MqttTransport::new(config.mqtt.clone()), config).await?;
//! bridge.start().await?;
//!
//! for message in bridge.drain_all() {
//!     println!("{}: {}", message.metadata().uid, message.body());
//! }
//! bridge.stop().await?;
//! ```

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::cache::NodeMetadataCache;
use crate::config::{BridgeConfig, ReconnectConfig};
use crate::decoder::{DispatchOutcome, Dispatcher};
use crate::error::{MeshBridgeError, Result};
use crate::queue::{IncomingTextMessage, MessageQueue};
use crate::transport::{Delivery, MeshTransport};

/// Bridge statistics
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    /// Deliveries received from the transport
    pub deliveries: u64,
    /// Text messages queued
    pub text_messages: u64,
    /// Position, node info and telemetry updates merged into the cache
    pub metadata_updates: u64,
    /// Well-formed envelopes with nothing to bridge
    pub ignored: u64,
    /// Deliveries dropped because they failed to decode
    pub decode_errors: u64,
    /// Read errors reported by the transport
    pub transport_errors: u64,
    /// Sessions recovered after a transport error
    pub reconnects: u64,
}

/// Where the network loop currently is
enum LoopState<T> {
    /// Not running; the bridge holds the transport
    Idle(T),
    /// Running; the task hands the transport back when it exits
    Running {
        shutdown: Option<oneshot::Sender<()>>,
        task: JoinHandle<T>,
    },
    /// The loop task panicked and took the transport with it
    Lost,
}

/// Bridge between a Meshtastic MQTT uplink and a chat consumer
pub struct MeshBridge<T: MeshTransport + 'static> {
    config: BridgeConfig,
    dispatcher: Dispatcher,
    state: Mutex<LoopState<T>>,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<BridgeStats>>,
    name: String,
}

impl<T: MeshTransport + 'static> MeshBridge<T> {
    /// Connect `transport` and subscribe to the configured topic
    ///
    /// Fails if the configuration is invalid, the broker cannot be reached or
    /// rejects the session, or the subscription is refused. The returned
    /// bridge is connected but not yet consuming.
    pub async fn connect(mut transport: T, config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        info!(transport = %transport.name(), "Connecting mesh bridge");
        transport.connect().await?;
        transport.subscribe(&config.mqtt.topic).await?;
        info!(
            transport = %transport.name(),
            topic = %config.mqtt.topic,
            "Mesh bridge connected"
        );

        Ok(Self::from_parts(
            transport,
            config,
            NodeMetadataCache::new(),
            MessageQueue::new(),
        ))
    }

    /// Build a bridge around an already connected transport
    pub fn from_parts(
        transport: T,
        config: BridgeConfig,
        cache: NodeMetadataCache,
        queue: MessageQueue,
    ) -> Self {
        let name = transport.name().to_string();
        Self {
            config,
            dispatcher: Dispatcher::new(cache, queue),
            state: Mutex::new(LoopState::Idle(transport)),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(BridgeStats::default())),
            name,
        }
    }

    /// Start consuming deliveries in a background task
    ///
    /// Calling this while the loop is running does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        let transport = match std::mem::replace(&mut *state, LoopState::Lost) {
            LoopState::Idle(transport) => transport,
            LoopState::Running { shutdown, task } if !task.is_finished() => {
                trace!("Network loop already running");
                *state = LoopState::Running { shutdown, task };
                return Ok(());
            }
            LoopState::Running { task, .. } => {
                // The loop ended on its own; reclaim the transport
                match task.await {
                    Ok(transport) => transport,
                    Err(e) => {
                        error!(error = %e, "Network loop task failed");
                        return Err(e.into());
                    }
                }
            }
            LoopState::Lost => {
                return Err(MeshBridgeError::TaskFailed(
                    "transport lost with a failed network loop".to_string(),
                ));
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(run_loop(
            transport,
            self.dispatcher.clone(),
            self.config.reconnect.clone(),
            self.stats.clone(),
            self.running.clone(),
            shutdown_rx,
        ));
        *state = LoopState::Running {
            shutdown: Some(shutdown_tx),
            task,
        };

        info!(transport = %self.name, "Mesh bridge started");
        Ok(())
    }

    /// Stop the background task and wait for it to exit
    ///
    /// Messages already queued stay available to [`MeshBridge::drain_all`].
    /// Calling this while stopped does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        match std::mem::replace(&mut *state, LoopState::Lost) {
            LoopState::Running { shutdown, task } => {
                if let Some(shutdown) = shutdown {
                    let _ = shutdown.send(());
                }
                match task.await {
                    Ok(transport) => {
                        *state = LoopState::Idle(transport);
                        info!(transport = %self.name, "Mesh bridge stopped");
                        Ok(())
                    }
                    Err(e) => {
                        self.running.store(false, Ordering::SeqCst);
                        error!(error = %e, "Network loop task failed");
                        Err(e.into())
                    }
                }
            }
            idle @ LoopState::Idle(_) => {
                trace!("Mesh bridge already stopped");
                *state = idle;
                Ok(())
            }
            LoopState::Lost => Ok(()),
        }
    }

    /// Stop the loop and close the transport session
    pub async fn shutdown(self) -> Result<()> {
        self.stop().await?;
        let mut state = self.state.lock().await;
        if let LoopState::Idle(transport) = &mut *state {
            transport.disconnect().await?;
        }
        Ok(())
    }

    /// Whether the network loop is consuming deliveries
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Remove and return every queued text message, oldest first
    pub fn drain_all(&self) -> Vec<IncomingTextMessage> {
        self.dispatcher.queue().drain_all()
    }

    /// Outgoing message queue
    pub fn queue(&self) -> &MessageQueue {
        self.dispatcher.queue()
    }

    /// Node metadata cache
    pub fn cache(&self) -> &NodeMetadataCache {
        self.dispatcher.cache()
    }

    /// Get bridge statistics
    pub fn stats(&self) -> BridgeStats {
        self.stats.read().clone()
    }

    /// Bridge configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Transport name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T: MeshTransport + 'static> Drop for MeshBridge<T> {
    fn drop(&mut self) {
        if let LoopState::Running { shutdown, .. } = self.state.get_mut() {
            if let Some(shutdown) = shutdown.take() {
                let _ = shutdown.send(());
            }
        }
    }
}

/// Network loop: pull deliveries until shut down or the stream ends
///
/// Returns the transport so the bridge can restart later.
async fn run_loop<T: MeshTransport>(
    mut transport: T,
    dispatcher: Dispatcher,
    reconnect: ReconnectConfig,
    stats: Arc<RwLock<BridgeStats>>,
    running: Arc<AtomicBool>,
    mut shutdown: oneshot::Receiver<()>,
) -> T {
    debug!(transport = %transport.name(), "Network loop running");
    let mut attempts: u32 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!("Network loop shutdown requested");
                break;
            }
            next = transport.next_delivery() => next,
        };

        match next {
            Ok(Some(delivery)) => {
                if attempts > 0 {
                    info!(attempts, "Transport recovered");
                    stats.write().reconnects += 1;
                    attempts = 0;
                }
                handle_delivery(&dispatcher, &stats, &delivery);
            }
            Ok(None) => {
                info!(transport = %transport.name(), "Delivery stream ended");
                break;
            }
            Err(e) => {
                stats.write().transport_errors += 1;
                if !reconnect.allows(attempts) {
                    error!(error = %e, attempts, "Transport failed, giving up");
                    break;
                }
                attempts += 1;
                let delay = reconnect.backoff(attempts);
                warn!(
                    error = %e,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transport error, retrying"
                );
                tokio::select! {
                    biased;
                    _ = &mut shutdown => {
                        debug!("Network loop shutdown requested during backoff");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!(transport = %transport.name(), "Network loop exited");
    transport
}

/// Dispatch one delivery; failures are logged and counted, never fatal
fn handle_delivery(dispatcher: &Dispatcher, stats: &RwLock<BridgeStats>, delivery: &Delivery) {
    trace!(topic = %delivery.topic, bytes = delivery.payload.len(), "Delivery");
    let outcome = dispatcher.handle_delivery(&delivery.payload);

    let mut stats = stats.write();
    stats.deliveries += 1;
    match outcome {
        Ok(DispatchOutcome::Queued) => stats.text_messages += 1,
        Ok(DispatchOutcome::MetadataUpdated) => stats.metadata_updates += 1,
        Ok(DispatchOutcome::Ignored) => stats.ignored += 1,
        Err(e) => {
            stats.decode_errors += 1;
            warn!(topic = %delivery.topic, error = %e, "Dropping undecodable delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeId;
    use crate::config::BridgeConfigBuilder;
    use crate::test_utils::{test_config, EnvelopeBuilder, MockTransport, TestFixture};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_connect_subscribes_to_topic() {
        let fixture = TestFixture::connected().await.unwrap();
        assert_eq!(fixture.feed.connect_count(), 1);
        assert_eq!(fixture.feed.subscriptions(), vec!["msh/2/c/#".to_string()]);
        assert!(!fixture.bridge.is_running());
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let (transport, _feed) = MockTransport::refusing();
        let result = MeshBridge::connect(transport, test_config()).await;
        assert!(matches!(
            result,
            Err(MeshBridgeError::ConnectionRefused(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let (transport, feed) = MockTransport::new();
        let config = BridgeConfigBuilder::new().broker("", 1883).build();
        let result = MeshBridge::connect(transport, config).await;
        assert!(matches!(result, Err(MeshBridgeError::MissingConfig(_))));
        assert_eq!(feed.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let fixture = TestFixture::connected().await.unwrap();
        fixture.bridge.start().await.unwrap();
        fixture.bridge.start().await.unwrap();
        assert!(fixture.bridge.is_running());

        fixture.feed.deliver(EnvelopeBuilder::new(1, "LongFast").text("once", 10));
        assert!(fixture.wait_for_queued(1, WAIT).await);
        assert_eq!(fixture.bridge.drain_all().len(), 1);

        fixture.bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fixture = TestFixture::connected().await.unwrap();
        fixture.bridge.stop().await.unwrap();

        fixture.bridge.start().await.unwrap();
        fixture.bridge.stop().await.unwrap();
        fixture.bridge.stop().await.unwrap();
        assert!(!fixture.bridge.is_running());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let fixture = TestFixture::connected().await.unwrap();
        let node = EnvelopeBuilder::new(2, "LongFast");

        fixture.bridge.start().await.unwrap();
        fixture.feed.deliver(node.text("before", 10));
        assert!(fixture.wait_for_queued(1, WAIT).await);
        fixture.bridge.stop().await.unwrap();

        // Delivered while stopped; consumed after restart
        fixture.feed.deliver(node.text("after", 11));
        fixture.bridge.start().await.unwrap();
        assert!(fixture.wait_for_queued(2, WAIT).await);

        let bodies: Vec<String> = fixture
            .bridge
            .drain_all()
            .iter()
            .map(|m| m.body().to_string())
            .collect();
        assert_eq!(bodies, vec!["before", "after"]);
        fixture.bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_decode_errors_are_not_fatal() {
        let fixture = TestFixture::connected().await.unwrap();
        fixture.bridge.start().await.unwrap();

        fixture.feed.deliver(vec![0xff, 0xff, 0xff]);
        fixture.feed.deliver(EnvelopeBuilder::empty("LongFast"));
        fixture.feed.deliver(EnvelopeBuilder::new(3, "LongFast").text("still here", 12));

        assert!(fixture.wait_for_queued(1, WAIT).await);
        let stats = fixture.bridge.stats();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.text_messages, 1);
        assert_eq!(stats.deliveries, 3);
        assert!(fixture.bridge.is_running());
        fixture.bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_error_is_retried() {
        let fixture = TestFixture::connected().await.unwrap();
        fixture.bridge.start().await.unwrap();

        fixture.feed.fail("connection reset");
        fixture.feed.deliver(EnvelopeBuilder::new(4, "LongFast").text("recovered", 13));

        assert!(fixture.wait_for_queued(1, WAIT).await);
        let stats = fixture.bridge.stats();
        assert_eq!(stats.transport_errors, 1);
        assert_eq!(stats.reconnects, 1);
        fixture.bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_error_without_reconnect_stops_loop() {
        let config = BridgeConfigBuilder::new()
            .broker("localhost", 1883)
            .auto_reconnect(false)
            .build();
        let fixture = TestFixture::with_config(config).await.unwrap();
        fixture.bridge.start().await.unwrap();

        fixture.feed.fail("connection reset");
        let bridge = &fixture.bridge;
        assert!(wait_until(|| !bridge.is_running()).await);

        // Stopping after the loop exited on its own still succeeds
        fixture.bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_of_stream_keeps_queued_messages() {
        let fixture = TestFixture::connected().await.unwrap();
        fixture.bridge.start().await.unwrap();

        fixture.feed.deliver(EnvelopeBuilder::new(5, "LongFast").text("last", 14));
        fixture.feed.end();

        let bridge = &fixture.bridge;
        assert!(wait_until(|| !bridge.is_running()).await);
        assert_eq!(fixture.bridge.drain_all().len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_updates_counted() {
        let fixture = TestFixture::connected().await.unwrap();
        fixture.bridge.start().await.unwrap();

        let node = EnvelopeBuilder::new(6, "LongFast");
        fixture.feed.deliver(node.telemetry(90));
        fixture.feed.deliver(node.environment(21.5));

        let bridge = &fixture.bridge;
        assert!(wait_until(|| bridge.stats().deliveries == 2).await);
        let stats = fixture.bridge.stats();
        assert_eq!(stats.metadata_updates, 1);
        assert_eq!(stats.ignored, 1);
        assert_eq!(fixture.bridge.cache().snapshot(NodeId(6)).unwrap().battery, Some(90));
        fixture.bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_transport() {
        let fixture = TestFixture::connected().await.unwrap();
        fixture.bridge.start().await.unwrap();
        assert_eq!(fixture.feed.disconnect_count(), 0);

        fixture.bridge.shutdown().await.unwrap();
        assert_eq!(fixture.feed.disconnect_count(), 1);
    }
}
