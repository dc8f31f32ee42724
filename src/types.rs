/// Common types used throughout quartz-kv.
///
/// This module defines the data structures shared by the storage engine,
/// both replication modes, and the wire protocol: vector clocks, peer
/// endpoints, and the tagged operation records that flow through the WAL
/// and between nodes.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Identifier for a node in the cluster, assigned at startup.
pub type NodeId = u64;

/// Sentinel value marking a logical deletion in leaderless mode.
///
/// Conflict resolution needs a value carrier, so deletes are expressed as a
/// write of this sentinel rather than a removal. Single and leader modes
/// remove the entry outright instead.
pub const TOMBSTONE: &str = "__DELETED__";

/// Vector clock for causal ordering in distributed mode.
///
/// Each node maintains a monotonic counter; the vector summarises the
/// causal history a replica has observed. Missing entries read as 0.
/// Serialized transparently as the bare `node_id → counter` map, which is
/// also the on-disk and wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    /// Node ID -> logical timestamp mapping
    pub clocks: HashMap<NodeId, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock.
    pub fn new() -> Self {
        Self {
            clocks: HashMap::new(),
        }
    }

    /// Increment the counter for a specific node.
    pub fn tick(&mut self, node_id: NodeId) {
        *self.clocks.entry(node_id).or_insert(0) += 1;
    }

    /// Merge another clock into this one, taking the element-wise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, counter) in &other.clocks {
            let entry = self.clocks.entry(*node_id).or_insert(0);
            *entry = (*entry).max(*counter);
        }
    }

    /// Causal receive: merge another clock, then tick our own entry.
    pub fn observe(&mut self, other: &VectorClock, node_id: NodeId) {
        self.merge(other);
        self.tick(node_id);
    }

    /// Get the counter for a node (0 if absent).
    pub fn get(&self, node_id: NodeId) -> u64 {
        self.clocks.get(&node_id).copied().unwrap_or(0)
    }

    /// Compare two vector clocks.
    ///
    /// Returns:
    /// - `Some(Ordering::Less)` if self happened before other
    /// - `Some(Ordering::Greater)` if self happened after other
    /// - `Some(Ordering::Equal)` if they are identical
    /// - `None` if they are concurrent
    pub fn compare(&self, other: &VectorClock) -> Option<std::cmp::Ordering> {
        let all_nodes: std::collections::HashSet<_> =
            self.clocks.keys().chain(other.clocks.keys()).collect();

        let mut has_less = false;
        let mut has_greater = false;

        for node_id in all_nodes {
            let self_val = self.get(*node_id);
            let other_val = other.get(*node_id);

            match self_val.cmp(&other_val) {
                std::cmp::Ordering::Less => has_less = true,
                std::cmp::Ordering::Greater => has_greater = true,
                std::cmp::Ordering::Equal => {}
            }
        }

        match (has_less, has_greater) {
            (true, true) => None, // Concurrent
            (true, false) => Some(std::cmp::Ordering::Less),
            (false, true) => Some(std::cmp::Ordering::Greater),
            (false, false) => Some(std::cmp::Ordering::Equal),
        }
    }

    /// Check if this clock strictly dominates (happened after) another.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), Some(std::cmp::Ordering::Greater))
    }

    /// Check if clocks are concurrent (neither dominates).
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other).is_none()
    }
}

/// Network address of a node, as `host:port`.
///
/// Peers are addressed by endpoint only; there is no peer object graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL for HTTP requests to this endpoint.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid endpoint '{s}': expected host:port"))?;
        if host.is_empty() {
            return Err(format!("invalid endpoint '{s}': empty host"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid endpoint '{s}': bad port"))?;
        Ok(Self::new(host, port))
    }
}

/// A key-value pair, as carried by bulk operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    /// The key.
    pub key: String,
    /// The value.
    pub value: String,
}

/// A single entry in the write-ahead log.
///
/// One JSON object per line; each line is independently parseable so a
/// torn trailing record from a crash mid-write can be skipped on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalEntry {
    /// Store a value under a key.
    Set {
        /// The key.
        key: String,
        /// The value.
        value: String,
    },
    /// Remove a key.
    Delete {
        /// The key.
        key: String,
    },
}

/// A client mutation as replicated verbatim from leader to followers.
///
/// Unlike [`WalEntry`] this keeps bulk writes as one record, so a follower
/// applies them with the same single-snapshot batching the leader used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Store a value under a key.
    Set {
        /// The key.
        key: String,
        /// The value.
        value: String,
    },
    /// Remove a key.
    Delete {
        /// The key.
        key: String,
    },
    /// Store several pairs in order.
    BulkSet {
        /// The pairs, applied in order.
        items: Vec<KvPair>,
    },
}
