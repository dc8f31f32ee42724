/// Node configuration shared by all three operating modes.
use crate::types::{Endpoint, NodeId};
use std::path::PathBuf;

/// Default port for a quartz-kv node.
pub const DEFAULT_PORT: u16 = 7400;

/// Startup parameters for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id (meaningful in replicated modes).
    pub node_id: NodeId,
    /// Endpoint to bind and to advertise to peers.
    pub bind: Endpoint,
    /// The other nodes of the cluster.
    pub peers: Vec<Endpoint>,
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Debug mode: arms the snapshot fault-injection path.
    pub debug: bool,
    /// Replicas per key in leaderless mode (including the coordinator).
    pub replication_factor: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            bind: Endpoint::new("127.0.0.1", DEFAULT_PORT),
            peers: Vec::new(),
            data_dir: PathBuf::from("data"),
            debug: false,
            replication_factor: crate::quorum::DEFAULT_REPLICATION_FACTOR,
        }
    }
}

impl NodeConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node id.
    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    /// Set the bind endpoint.
    pub fn bind(mut self, bind: Endpoint) -> Self {
        self.bind = bind;
        self
    }

    /// Set the peer list.
    pub fn peers(mut self, peers: Vec<Endpoint>) -> Self {
        self.peers = peers;
        self
    }

    /// Set the base data directory.
    pub fn data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Enable debug mode.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the replication factor (leaderless mode).
    pub fn replication_factor(mut self, rf: usize) -> Self {
        self.replication_factor = rf;
        self
    }

    /// Data directory for this node in a replicated cluster: nodes on a
    /// shared filesystem each get `<base>_node_<id>`.
    pub fn replicated_data_dir(&self) -> PathBuf {
        let base = self.data_dir.to_string_lossy();
        PathBuf::from(format!("{base}_node_{}", self.node_id))
    }
}
