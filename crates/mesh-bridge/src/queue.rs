//! Outgoing text message queue
//!
//! The network loop enqueues fully formed text messages; a consumer drains
//! them in batches. Draining never blocks and never partially drains: every
//! message queued before the call is returned, in enqueue order, exactly once.
//!
//! Consumers may poll on a timer or await [`MessageQueue::notified`] to wake
//! on the next enqueue. Both see the same drain semantics.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::cache::NodeMetadata;

/// A text message from the mesh, stamped with its sender's metadata
///
/// Created once at decode time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingTextMessage {
    metadata: NodeMetadata,
    body: String,
    timestamp: i64,
    channel_id: String,
}

impl IncomingTextMessage {
    /// Create a message
    pub fn new(
        metadata: NodeMetadata,
        body: impl Into<String>,
        timestamp: i64,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            metadata,
            body: body.into(),
            timestamp,
            channel_id: channel_id.into(),
        }
    }

    /// Sender metadata snapshot taken when the message was decoded
    pub fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    /// Message text
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Receive time, epoch seconds
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Mesh channel name the message was heard on
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

/// FIFO buffer between the network loop and the consumer
///
/// Cloning is cheap and yields a handle onto the same queue.
#[derive(Debug, Clone, Default)]
pub struct MessageQueue {
    pending: Arc<Mutex<VecDeque<IncomingTextMessage>>>,
    notify: Arc<Notify>,
    total_enqueued: Arc<AtomicU64>,
}

impl MessageQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the tail
    pub fn enqueue(&self, message: IncomingTextMessage) {
        self.pending.lock().push_back(message);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Remove and return every pending message in enqueue order
    pub fn drain_all(&self) -> Vec<IncomingTextMessage> {
        let drained = std::mem::take(&mut *self.pending.lock());
        drained.into()
    }

    /// Wait until a message has been enqueued
    ///
    /// An enqueue with nobody waiting leaves a single stored wake-up, so the
    /// next call returns immediately. Intended for one waiting consumer.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Number of pending messages
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages enqueued over the queue's lifetime
    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued.load(Ordering::Relaxed)
    }
}
