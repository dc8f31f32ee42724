/// Operation dispatch: the contract shared by all three node modes.
///
/// The transport layer turns each inbound request into a [`Request`] and
/// hands it to whichever node implementation is configured. Single, leader
/// and leaderless nodes are variants behind one [`NodeHandle`] contract,
/// not an inheritance tree; the transport neither knows nor cares which
/// mode it is serving.
use crate::error::{KvError, KvResult};
use crate::index::IndexedStore;
use crate::types::{Endpoint, KvPair, NodeId, Operation, VectorClock};
use async_trait::async_trait;
use std::collections::HashMap;

/// A logical request, decoupled from the transport that carried it.
#[derive(Debug, Clone)]
pub enum Request {
    /// Read a key.
    Get {
        /// The key.
        key: String,
    },
    /// Store a value.
    Set {
        /// The key.
        key: String,
        /// The value.
        value: String,
        /// Arm debug-mode snapshot fault injection.
        simulate_failure: bool,
    },
    /// Remove a key.
    Delete {
        /// The key.
        key: String,
        /// Arm debug-mode snapshot fault injection.
        simulate_failure: bool,
    },
    /// Store several pairs in order.
    BulkSet {
        /// The pairs.
        items: Vec<KvPair>,
        /// Arm debug-mode snapshot fault injection.
        simulate_failure: bool,
    },
    /// Election vote request (leader mode).
    Vote {
        /// Candidate's term.
        term: u64,
        /// Candidate's node id.
        candidate_id: NodeId,
    },
    /// Leader liveness announcement (leader mode).
    Heartbeat {
        /// Leader's term.
        term: u64,
        /// Leader's node id.
        leader_id: NodeId,
        /// Where clients should be redirected.
        leader_endpoint: Endpoint,
    },
    /// Leader → follower log apply (leader mode).
    ReplicateApply {
        /// The operation to apply verbatim.
        op: Operation,
    },
    /// Peer-to-peer replicated write (leaderless mode).
    ReplicateSet {
        /// The key.
        key: String,
        /// The value.
        value: String,
        /// Clock of the originating write.
        clock: VectorClock,
    },
    /// Local-only read at a peer (leaderless mode).
    ReplicateGet {
        /// The key.
        key: String,
    },
    /// Periodic clock exchange (leaderless mode).
    Gossip {
        /// Sender's node id.
        node_id: NodeId,
        /// Sender's vector clock.
        clock: VectorClock,
        /// Sender's per-key clocks.
        value_clocks: HashMap<String, VectorClock>,
    },
    /// Liveness check.
    Ping,
}

/// The result of a dispatched request.
#[derive(Debug, Clone)]
pub enum Response {
    /// A value read by the client path. Leaderless reads carry the
    /// winning clock.
    Value {
        /// The key.
        key: String,
        /// The value.
        value: String,
        /// Winning clock, leaderless mode only.
        clock: Option<VectorClock>,
    },
    /// Outcome of a write (`success = false` means a quorum miss whose
    /// local effects were still applied).
    Ok {
        /// Whether the operation succeeded.
        success: bool,
    },
    /// Number of pairs applied by a bulk write.
    Count {
        /// The count.
        count: usize,
    },
    /// Vote decision, carrying the voter's (possibly updated) term.
    Vote {
        /// Whether the vote was granted.
        granted: bool,
        /// The voter's current term.
        term: u64,
    },
    /// This node is a follower; the client should retry at the leader.
    Redirect {
        /// Absolute URL at the leader.
        location: String,
    },
    /// A raw stored record returned to a reading peer.
    PeerValue {
        /// The stored value (possibly the tombstone sentinel).
        value: String,
        /// The stored per-key clock.
        clock: VectorClock,
    },
    /// Plain acknowledgement.
    Ack,
}

/// The operation entry point every node mode implements.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    /// Execute one logical request against this node.
    async fn dispatch(&self, request: Request) -> KvResult<Response>;
}

/// Single-node mode: the storage engine plus its index decorators, no
/// replication surface.
pub struct SingleNode {
    indexed: IndexedStore,
}

impl SingleNode {
    /// Wrap an indexed store as a dispatchable node.
    pub fn new(indexed: IndexedStore) -> Self {
        Self { indexed }
    }

    /// Access to the index decorators for the search routes.
    pub fn indexed(&self) -> &IndexedStore {
        &self.indexed
    }
}

#[async_trait]
impl NodeHandle for SingleNode {
    async fn dispatch(&self, request: Request) -> KvResult<Response> {
        match request {
            Request::Get { key } => match self.indexed.get(&key) {
                Some(value) => Ok(Response::Value {
                    key,
                    value,
                    clock: None,
                }),
                None => Err(KvError::KeyNotFound { key }),
            },
            Request::Set {
                key,
                value,
                simulate_failure,
            } => {
                self.indexed.set(&key, &value, simulate_failure)?;
                Ok(Response::Ok { success: true })
            }
            Request::Delete {
                key,
                simulate_failure,
            } => {
                let deleted = self.indexed.delete(&key, simulate_failure)?;
                Ok(Response::Ok { success: deleted })
            }
            Request::BulkSet {
                items,
                simulate_failure,
            } => {
                let pairs: Vec<(String, String)> = items
                    .into_iter()
                    .map(|pair| (pair.key, pair.value))
                    .collect();
                let count = self.indexed.bulk_set(&pairs, simulate_failure)?;
                Ok(Response::Count { count })
            }
            Request::Ping => Ok(Response::Ack),
            _ => Err(KvError::BadRequest(
                "replication is not enabled on this node".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KvStore;
    use tempfile::TempDir;

    fn single_node(dir: &TempDir) -> SingleNode {
        let store = KvStore::open(dir.path(), false).unwrap();
        SingleNode::new(IndexedStore::new(store))
    }

    #[tokio::test]
    async fn test_single_node_round_trip() {
        let dir = TempDir::new().unwrap();
        let node = single_node(&dir);

        let response = node
            .dispatch(Request::Set {
                key: "k".to_string(),
                value: "v".to_string(),
                simulate_failure: false,
            })
            .await
            .unwrap();
        assert!(matches!(response, Response::Ok { success: true }));

        let response = node
            .dispatch(Request::Get {
                key: "k".to_string(),
            })
            .await
            .unwrap();
        match response {
            Response::Value { value, clock, .. } => {
                assert_eq!(value, "v");
                assert!(clock.is_none());
            }
            other => panic!("expected Value, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_node_missing_key_and_delete() {
        let dir = TempDir::new().unwrap();
        let node = single_node(&dir);

        let err = node
            .dispatch(Request::Get {
                key: "nope".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::KeyNotFound { .. }));

        let response = node
            .dispatch(Request::Delete {
                key: "nope".to_string(),
                simulate_failure: false,
            })
            .await
            .unwrap();
        assert!(matches!(response, Response::Ok { success: false }));
    }

    #[tokio::test]
    async fn test_single_node_rejects_replication_requests() {
        let dir = TempDir::new().unwrap();
        let node = single_node(&dir);

        let err = node
            .dispatch(Request::Vote {
                term: 1,
                candidate_id: 2,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::BadRequest(_)));
    }
}
