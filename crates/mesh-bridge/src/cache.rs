//! Node metadata cache
//!
//! Every non-text packet a node sends (identity, position, telemetry) carries
//! a few facts about it. The cache accumulates those facts per node so that a
//! text message can be stamped with everything known about its sender at the
//! moment it arrived.
//!
//! # Merge semantics
//!
//! Merging never removes a field. Each field present in an update replaces
//! the stored value wholesale; fields absent from the update are left alone.
//! A node that has never been seen has no entry, and its default snapshot is
//! `{uid}` only.
//!
//! Entries live for the process lifetime. There is no TTL, size bound or
//! eviction.

use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Radio node number, the key for all cache and message operations
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Meshtastic user id form, e.g. `!0000007b`
    pub fn user_id(&self) -> String {
        format!("!{:08x}", self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accumulated facts about one node
///
/// Also used as the update type for [`NodeMetadataCache::accumulate`], where
/// `None` means "not part of this update".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeMetadata {
    /// Node number as a decimal string
    pub uid: NodeId,
    /// Long display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    /// Short display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    /// Node's own `!%08x` id string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_id: Option<String>,
    /// Hardware model number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<i32>,
    /// Battery level percent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<u32>,
    /// Latitude in decimal degrees
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    /// Longitude in decimal degrees
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// Altitude as whole meters with a trailing `m`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<String>,
    /// Time of the last position fix, epoch seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos_at_time: Option<u32>,
}

impl NodeMetadata {
    /// Metadata carrying only the node id
    pub fn new(uid: NodeId) -> Self {
        Self {
            uid,
            long_name: None,
            short_name: None,
            internal_id: None,
            hardware: None,
            battery: None,
            latitude: None,
            longitude: None,
            altitude: None,
            pos_at_time: None,
        }
    }

    /// Overwrite every field present in `update`
    pub fn merge(&mut self, update: NodeMetadata) {
        self.uid = update.uid;
        overwrite(&mut self.long_name, update.long_name);
        overwrite(&mut self.short_name, update.short_name);
        overwrite(&mut self.internal_id, update.internal_id);
        overwrite(&mut self.hardware, update.hardware);
        overwrite(&mut self.battery, update.battery);
        overwrite(&mut self.latitude, update.latitude);
        overwrite(&mut self.longitude, update.longitude);
        overwrite(&mut self.altitude, update.altitude);
        overwrite(&mut self.pos_at_time, update.pos_at_time);
    }

    /// Whether only the `uid` is known
    pub fn is_bare(&self) -> bool {
        *self == NodeMetadata::new(self.uid)
    }
}

fn overwrite<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Distinct nodes seen
    pub nodes: usize,
    /// Updates merged
    pub updates: u64,
    /// Snapshots taken
    pub snapshots: u64,
}

/// Per-node metadata store, shared between the network loop and readers
///
/// Cloning is cheap and yields a handle onto the same entries.
#[derive(Debug, Clone, Default)]
pub struct NodeMetadataCache {
    entries: Arc<RwLock<HashMap<NodeId, NodeMetadata>>>,
    stats: Arc<RwLock<CacheStats>>,
}

impl NodeMetadataCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `update` into the entry for `node`, creating it when unseen
    ///
    /// The read-modify-write happens under a single write lock.
    pub fn accumulate(&self, node: NodeId, update: NodeMetadata) {
        let mut entries = self.entries.write();
        entries
            .entry(node)
            .or_insert_with(|| NodeMetadata::new(node))
            .merge(update);
        let nodes = entries.len();
        drop(entries);

        let mut stats = self.stats.write();
        stats.updates += 1;
        stats.nodes = nodes;
        trace!(node = %node, "Node metadata merged");
    }

    /// Current metadata for `node`, or `None` when it has never been seen
    pub fn snapshot(&self, node: NodeId) -> Option<NodeMetadata> {
        let snapshot = self.entries.read().get(&node).cloned();
        self.stats.write().snapshots += 1;
        snapshot
    }

    /// Current metadata for `node`, or the `{uid}`-only default when unseen
    pub fn snapshot_or_default(&self, node: NodeId) -> NodeMetadata {
        self.snapshot(node)
            .unwrap_or_else(|| NodeMetadata::new(node))
    }

    /// Whether `node` has an entry
    pub fn contains(&self, node: NodeId) -> bool {
        self.entries.read().contains_key(&node)
    }

    /// Ids of every node seen so far, ascending
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.entries.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of nodes seen
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no node has been seen
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}
