/// Leaderless replication: replica sets, quorum writes and reads, gossip.
///
/// Every node accepts writes. A key's replica set is the `RF` consecutive
/// nodes (wrap-around) starting at `crc32(key) mod N` over the canonical
/// node list `[self] ++ peers`, so all nodes agree on placement without
/// coordination. Writes tick the local vector clock, apply locally, then
/// fan out clock-tagged copies; they succeed when a majority of the
/// replica set acknowledged. Reads collect the replica copies and keep the
/// one whose clock strictly dominates.
///
/// Conflicts between concurrent writes are resolved latest-applied-wins at
/// each replica; replicas can therefore diverge under pure concurrency
/// until a later write covers the same key. Gossip exchanges clocks every
/// two seconds but carries no values.
use crate::dispatch::{NodeHandle, Request, Response};
use crate::error::{KvError, KvResult};
use crate::peer::{GossipBody, PeerClient};
use crate::store::{persist_json, KvStore};
use crate::types::{Endpoint, NodeId, VectorClock, TOMBSTONE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;

/// Default number of replicas per key (including the coordinating node).
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

/// Clock state file name inside the data directory.
const CLOCKS_FILE: &str = "clocks.json";

/// How often each node gossips its clocks to every peer.
const GOSSIP_INTERVAL: Duration = Duration::from_secs(2);

/// Persisted clock state: the node's own vector clock plus the clock
/// recorded for each key's current replica copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ClockState {
    vector_clock: VectorClock,
    value_clocks: HashMap<String, VectorClock>,
}

/// A node participating in leaderless replication.
pub struct QuorumNode {
    node_id: NodeId,
    endpoint: Endpoint,
    peers: Vec<Endpoint>,
    replication_factor: usize,
    store: Arc<KvStore>,
    client: PeerClient,
    clocks_path: PathBuf,
    state: Mutex<ClockState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl QuorumNode {
    /// Create a node, reloading persisted clocks from the store's data
    /// directory. Call [`QuorumNode::start`] to run the gossip loop.
    pub fn new(
        node_id: NodeId,
        endpoint: Endpoint,
        peers: Vec<Endpoint>,
        store: KvStore,
        replication_factor: usize,
    ) -> Self {
        let clocks_path = store.data_dir().join(CLOCKS_FILE);
        let state = load_clocks(&clocks_path);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            node_id,
            endpoint,
            peers,
            replication_factor,
            store: Arc::new(store),
            client: PeerClient::new(),
            clocks_path,
            state: Mutex::new(state),
            shutdown_tx,
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The underlying storage engine.
    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Acks required for a quorum: `⌊RF/2⌋ + 1`.
    fn quorum_size(&self) -> usize {
        self.replication_factor / 2 + 1
    }

    /// Spawn the gossip loop. The receiver is an owned `Arc` so the loop
    /// can keep the node alive.
    pub fn start(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(GOSSIP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.gossip_round().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Stop the gossip loop and persist the clocks a final time.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let state = self.state.lock().await;
        if let Err(e) = persist_json(&self.clocks_path, &*state) {
            tracing::warn!(node = self.node_id, "failed to persist clocks on stop: {e}");
        }
    }

    /// The replica set for a key: `RF` consecutive nodes, wrap-around,
    /// starting at the key's hash slot over `[self] ++ peers`.
    fn replica_set(&self, key: &str) -> Vec<Endpoint> {
        let mut all: Vec<Endpoint> = Vec::with_capacity(self.peers.len() + 1);
        all.push(self.endpoint.clone());
        all.extend(self.peers.iter().cloned());

        let start = crc32fast::hash(key.as_bytes()) as usize % all.len();
        (0..self.replication_factor.min(all.len()))
            .map(|i| all[(start + i) % all.len()].clone())
            .collect()
    }

    /// Quorum write: tick the clock, apply locally, persist clocks, fan
    /// out to the other replicas. Returns whether a majority acknowledged;
    /// on a miss the local write stays applied (convergence is left to
    /// gossip and later writes).
    async fn set(&self, key: &str, value: &str, simulate_failure: bool) -> KvResult<bool> {
        let mut state = self.state.lock().await;

        state.vector_clock.tick(self.node_id);
        let clock = state.vector_clock.clone();

        self.store.set(key, value, simulate_failure)?;
        state.value_clocks.insert(key.to_string(), clock.clone());
        persist_json(&self.clocks_path, &*state)?;

        let mut acks = 1usize; // ourselves
        for replica in self.replica_set(key) {
            if replica == self.endpoint {
                continue;
            }
            match self.client.replicate_set(&replica, key, value, &clock).await {
                Ok(_) => acks += 1,
                Err(e) => {
                    tracing::debug!(node = self.node_id, %replica, "replica write failed: {e}");
                }
            }
        }

        let required = self.quorum_size();
        if acks < required {
            tracing::warn!(
                node = self.node_id,
                key,
                acks,
                required,
                "write quorum not met, local state kept"
            );
        }
        Ok(acks >= required)
    }

    /// Quorum read: local copy plus the other replicas' copies. Fails
    /// unless at least read-quorum replicas answered; among the copies the
    /// accumulator is replaced only by a strictly dominating clock.
    async fn get(&self, key: &str) -> KvResult<(String, VectorClock)> {
        let (local_value, local_clock) = {
            let state = self.state.lock().await;
            (
                self.store.get(key),
                state.value_clocks.get(key).cloned().unwrap_or_default(),
            )
        };

        let mut responses = 1usize; // our own replica answered
        let mut copies: Vec<(String, VectorClock)> = Vec::new();
        if let Some(value) = local_value {
            copies.push((value, local_clock));
        }

        for replica in self.replica_set(key) {
            if replica == self.endpoint {
                continue;
            }
            match self.client.replicate_get(&replica, key).await {
                Ok(Some(reply)) => {
                    responses += 1;
                    copies.push((reply.value, reply.clock));
                }
                Ok(None) => responses += 1,
                Err(e) => {
                    tracing::debug!(node = self.node_id, %replica, "replica read failed: {e}");
                }
            }
        }

        let required = self.quorum_size();
        if responses < required {
            return Err(KvError::QuorumUnmet {
                acks: responses,
                required,
            });
        }

        let mut copies = copies.into_iter();
        let Some(mut winner) = copies.next() else {
            return Err(KvError::KeyNotFound {
                key: key.to_string(),
            });
        };
        for candidate in copies {
            if candidate.1.dominates(&winner.1) {
                winner = candidate;
            }
        }
        Ok(winner)
    }

    /// Accept or reject a replicated write.
    ///
    /// The incoming clock is folded into our own either way. The write is
    /// rejected only when it is strictly older than the stored copy;
    /// concurrent writes are accepted, so the latest applied wins at each
    /// replica. An accepted write never lowers the stored per-key clock.
    async fn replicate_set(&self, key: &str, value: &str, clock: VectorClock) -> KvResult<bool> {
        let mut state = self.state.lock().await;

        state.vector_clock.observe(&clock, self.node_id);

        let stale = state
            .value_clocks
            .get(key)
            .is_some_and(|local| clock.compare(local) == Some(std::cmp::Ordering::Less));
        if stale {
            tracing::debug!(node = self.node_id, key, "rejecting stale replicated write");
            persist_json(&self.clocks_path, &*state)?;
            return Ok(false);
        }

        self.store.set(key, value, false)?;
        state.value_clocks.insert(key.to_string(), clock);
        persist_json(&self.clocks_path, &*state)?;
        Ok(true)
    }

    /// Local-only read served to a peer: the raw stored value and clock,
    /// tombstone included.
    async fn replicate_get(&self, key: &str) -> Option<(String, VectorClock)> {
        let state = self.state.lock().await;
        let value = self.store.get(key)?;
        let clock = state.value_clocks.get(key).cloned().unwrap_or_default();
        Some((value, clock))
    }

    /// Fold a gossiping peer's clock into our own. Values are not fetched;
    /// keys the peer is ahead on are only noted at trace level.
    async fn handle_gossip(
        &self,
        from: NodeId,
        clock: VectorClock,
        value_clocks: HashMap<String, VectorClock>,
    ) {
        let mut state = self.state.lock().await;
        state.vector_clock.observe(&clock, self.node_id);

        let stale_keys = value_clocks
            .iter()
            .filter(|(key, peer_clock)| {
                state
                    .value_clocks
                    .get(*key)
                    .map_or(true, |local| peer_clock.dominates(local))
            })
            .count();
        if stale_keys > 0 {
            tracing::trace!(
                node = self.node_id,
                from,
                stale_keys,
                "gossip shows peer ahead on some keys"
            );
        }
    }

    /// One gossip tick: send our clocks to every peer, best effort.
    async fn gossip_round(&self) {
        let body = {
            let state = self.state.lock().await;
            GossipBody {
                node_id: self.node_id,
                clock: state.vector_clock.clone(),
                value_clocks: state.value_clocks.clone(),
            }
        };

        for peer in &self.peers {
            if let Err(e) = self.client.gossip(peer, &body).await {
                tracing::debug!(node = self.node_id, %peer, "gossip failed: {e}");
            }
        }
    }
}

#[async_trait]
impl NodeHandle for QuorumNode {
    async fn dispatch(&self, request: Request) -> KvResult<Response> {
        match request {
            Request::Get { key } => {
                let (value, clock) = self.get(&key).await?;
                if value == TOMBSTONE {
                    return Err(KvError::KeyNotFound { key });
                }
                Ok(Response::Value {
                    key,
                    value,
                    clock: Some(clock),
                })
            }
            Request::Set {
                key,
                value,
                simulate_failure,
            } => {
                let success = self.set(&key, &value, simulate_failure).await?;
                Ok(Response::Ok { success })
            }
            // Deletion is a tombstone write; the carrier value lets
            // conflict resolution order it against other writes.
            Request::Delete {
                key,
                simulate_failure,
            } => {
                let success = self.set(&key, TOMBSTONE, simulate_failure).await?;
                Ok(Response::Ok { success })
            }
            Request::BulkSet {
                items,
                simulate_failure,
            } => {
                let mut count = 0usize;
                for pair in &items {
                    if self.set(&pair.key, &pair.value, simulate_failure).await? {
                        count += 1;
                    }
                }
                Ok(Response::Count { count })
            }
            Request::ReplicateSet { key, value, clock } => {
                let accepted = self.replicate_set(&key, &value, clock).await?;
                Ok(Response::Ok { success: accepted })
            }
            Request::ReplicateGet { key } => match self.replicate_get(&key).await {
                Some((value, clock)) => Ok(Response::PeerValue { value, clock }),
                None => Err(KvError::KeyNotFound { key }),
            },
            Request::Gossip {
                node_id,
                clock,
                value_clocks,
            } => {
                self.handle_gossip(node_id, clock, value_clocks).await;
                Ok(Response::Ack)
            }
            Request::Ping => Ok(Response::Ack),
            Request::Vote { .. } | Request::Heartbeat { .. } | Request::ReplicateApply { .. } => {
                Err(KvError::BadRequest(
                    "leader replication is not enabled on this node".to_string(),
                ))
            }
        }
    }
}

/// Read the clock file; missing or corrupt state starts fresh.
fn load_clocks(path: &Path) -> ClockState {
    let Ok(bytes) = fs::read(path) else {
        return ClockState::default();
    };
    match serde_json::from_slice(&bytes) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!("clock file unreadable, starting fresh: {e}");
            ClockState::default()
        }
    }
}
