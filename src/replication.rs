/// Leader-based replication: election, heartbeats, follower apply.
///
/// One node at a time is leader; it alone executes client operations and
/// fans each applied operation out to every peer, best effort. Followers
/// answer client requests with a redirect to the leader they last heard
/// from. Leadership is won by majority vote under a monotonically
/// increasing term; a follower that stops hearing heartbeats pings the
/// leader and, if that fails too, starts a new election.
///
/// Replication here is deliberately best-effort: a follower that misses a
/// fan-out stays behind until it happens to receive a later operation.
/// There is no quorum and no resend on this path.
use crate::dispatch::{NodeHandle, Request, Response};
use crate::error::{KvError, KvResult};
use crate::peer::PeerClient;
use crate::store::KvStore;
use crate::types::{Endpoint, NodeId, Operation};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;

/// How often a leader announces itself.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// How often a follower re-examines leader liveness.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Leader silence tolerated before a follower considers failover.
const LEADER_SILENCE_TIMEOUT: Duration = Duration::from_secs(2);

/// Jittered pause before retrying an election that found no leader.
/// Per-node jitter breaks the symmetry of simultaneous cold starts.
fn election_retry_timeout() -> Duration {
    Duration::from_millis(500 + rand::thread_rng().gen_range(0..1000))
}

/// Role of a node in leader mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts writes, sends heartbeats.
    Leader,
    /// Redirects clients, watches for leader silence.
    Follower,
}

/// Volatile election state, guarded by the node lock.
struct ElectionState {
    term: u64,
    voted_for: Option<NodeId>,
    role: Role,
    known_leader: Option<Endpoint>,
    last_heartbeat: Instant,
    retry_timeout: Duration,
}

/// A node participating in leader-based replication.
pub struct LeaderNode {
    node_id: NodeId,
    endpoint: Endpoint,
    peers: Vec<Endpoint>,
    store: Arc<KvStore>,
    client: PeerClient,
    state: Mutex<ElectionState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl LeaderNode {
    /// Create a node. It starts as a follower with no known leader; call
    /// [`LeaderNode::start`] to elect and run the background loops.
    pub fn new(node_id: NodeId, endpoint: Endpoint, peers: Vec<Endpoint>, store: KvStore) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            node_id,
            endpoint,
            peers,
            store: Arc::new(store),
            client: PeerClient::new(),
            state: Mutex::new(ElectionState {
                term: 0,
                voted_for: None,
                role: Role::Follower,
                known_leader: None,
                last_heartbeat: Instant::now(),
                retry_timeout: election_retry_timeout(),
            }),
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

    /// Current role.
    pub async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    /// Current term.
    pub async fn term(&self) -> u64 {
        self.state.lock().await.term
    }

    /// Run an initial election and spawn the heartbeat and health loops.
    /// The receiver is an owned `Arc` so the loops can keep the node alive.
    pub async fn start(self: Arc<Self>) {
        self.start_election().await;

        let node = Arc::clone(&self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => node.heartbeat_round().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let node = self;
        let mut shutdown_rx = node.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(HEALTH_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => node.health_round().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Stop the background loops. The store stays usable for a final
    /// checkpoint.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run one election: bump the term, vote for self, request votes from
    /// every peer, and take leadership on a cluster majority.
    ///
    /// The node lock is held across the vote fan-out so term updates and
    /// vote bookkeeping stay serialised with inbound vote requests.
    pub async fn start_election(&self) {
        let mut state = self.state.lock().await;
        state.term += 1;
        state.voted_for = Some(self.node_id);
        state.role = Role::Follower;
        let term = state.term;

        tracing::debug!(node = self.node_id, term, "starting election");

        let mut votes = 1usize; // our own
        for peer in &self.peers {
            match self.client.request_vote(peer, term, self.node_id).await {
                Ok(reply) => {
                    if reply.term > state.term {
                        // A peer has moved on; abandon this candidacy.
                        state.term = reply.term;
                        state.voted_for = None;
                        state.last_heartbeat = Instant::now();
                        state.retry_timeout = election_retry_timeout();
                        tracing::debug!(
                            node = self.node_id,
                            peer_term = reply.term,
                            "abandoning election, higher term seen"
                        );
                        return;
                    }
                    if reply.vote_granted {
                        votes += 1;
                    }
                }
                Err(e) => tracing::debug!(node = self.node_id, %peer, "vote request failed: {e}"),
            }
        }

        let cluster_size = self.peers.len() + 1;
        let majority = cluster_size / 2 + 1;
        if votes >= majority {
            state.role = Role::Leader;
            state.known_leader = Some(self.endpoint.clone());
            tracing::info!(
                node = self.node_id,
                term,
                votes,
                "won election, becoming leader"
            );
        } else {
            // A failed candidate knows no leader; a live one re-announces
            // within a heartbeat interval, well before the jittered retry.
            state.known_leader = None;
            state.last_heartbeat = Instant::now();
            state.retry_timeout = election_retry_timeout();
            tracing::info!(
                node = self.node_id,
                term,
                votes,
                majority,
                "election failed, remaining follower"
            );
        }
    }

    /// One heartbeat tick: a leader announces itself to every peer.
    async fn heartbeat_round(&self) {
        let term = {
            let state = self.state.lock().await;
            if state.role != Role::Leader {
                return;
            }
            state.term
        };

        for peer in &self.peers {
            if let Err(e) = self
                .client
                .send_heartbeat(peer, term, self.node_id, self.endpoint.clone())
                .await
            {
                tracing::debug!(node = self.node_id, %peer, "heartbeat failed: {e}");
            }
        }
    }

    /// One health tick: a follower checks whether its leader went silent
    /// and, if so (or if it never learned of one), runs an election.
    async fn health_round(&self) {
        let (known_leader, silence, retry_timeout) = {
            let state = self.state.lock().await;
            if state.role == Role::Leader {
                return;
            }
            (
                state.known_leader.clone(),
                state.last_heartbeat.elapsed(),
                state.retry_timeout,
            )
        };

        match known_leader {
            Some(leader) if silence > LEADER_SILENCE_TIMEOUT => {
                if self.client.ping(&leader).await.is_ok() {
                    // Leader is alive, only its heartbeats are not reaching us.
                    self.state.lock().await.last_heartbeat = Instant::now();
                } else {
                    tracing::info!(node = self.node_id, %leader, "leader silent and unreachable");
                    self.start_election().await;
                }
            }
            None if silence > retry_timeout => {
                self.start_election().await;
            }
            _ => {}
        }
    }

    /// Decide an inbound vote request. Grants at most one vote per term.
    async fn handle_vote(&self, term: u64, candidate_id: NodeId) -> (bool, u64) {
        let mut state = self.state.lock().await;

        let granted = if term > state.term {
            state.term = term;
            state.voted_for = Some(candidate_id);
            state.role = Role::Follower;
            state.known_leader = None;
            true
        } else if term == state.term && state.voted_for.is_none() {
            state.voted_for = Some(candidate_id);
            true
        } else {
            false
        };

        if granted {
            // Granting a vote restarts the silence clock so we do not run
            // a competing election while the candidate is finishing.
            state.last_heartbeat = Instant::now();
            tracing::debug!(node = self.node_id, term, candidate_id, "vote granted");
        }
        (granted, state.term)
    }

    /// Record an inbound heartbeat.
    async fn handle_heartbeat(&self, term: u64, leader_id: NodeId, leader_endpoint: Endpoint) {
        let mut state = self.state.lock().await;

        if state.role == Role::Leader {
            if term > state.term {
                tracing::info!(
                    node = self.node_id,
                    term,
                    leader_id,
                    "higher-term heartbeat, stepping down"
                );
                state.term = term;
                state.voted_for = None;
                state.role = Role::Follower;
                state.known_leader = Some(leader_endpoint);
                state.last_heartbeat = Instant::now();
            }
            return;
        }

        if term >= state.term {
            if term > state.term {
                state.voted_for = None;
            }
            state.term = term;
            state.known_leader = Some(leader_endpoint);
            state.last_heartbeat = Instant::now();
        }
    }

    /// Apply a replicated operation verbatim, in arrival order.
    fn apply_operation(&self, op: Operation) -> KvResult<()> {
        match op {
            Operation::Set { key, value } => self.store.set(&key, &value, false),
            Operation::Delete { key } => self.store.delete(&key, false).map(|_| ()),
            Operation::BulkSet { items } => {
                let pairs: Vec<(String, String)> = items
                    .into_iter()
                    .map(|pair| (pair.key, pair.value))
                    .collect();
                self.store.bulk_set(&pairs, false).map(|_| ())
            }
        }
    }

    /// Fan an applied operation out to every peer, best effort.
    async fn replicate_to_followers(&self, op: &Operation) {
        for peer in &self.peers {
            if let Err(e) = self.client.replicate_apply(peer, op).await {
                tracing::debug!(node = self.node_id, %peer, "replication dropped: {e}");
            }
        }
    }

    /// If we are not leader, the redirect (or `no_primary`) the client
    /// should get for the given path; `None` means we are leader.
    async fn check_leadership(&self, path_and_query: &str) -> Option<KvResult<Response>> {
        let state = self.state.lock().await;
        if state.role == Role::Leader {
            return None;
        }
        Some(match &state.known_leader {
            Some(leader) => Ok(Response::Redirect {
                location: format!("{}{}", leader.base_url(), path_and_query),
            }),
            None => Err(KvError::NoPrimary),
        })
    }
}

#[async_trait]
impl NodeHandle for LeaderNode {
    async fn dispatch(&self, request: Request) -> KvResult<Response> {
        match request {
            Request::Get { key } => {
                if let Some(outcome) = self.check_leadership(&format!("/get?key={key}")).await {
                    return outcome;
                }
                match self.store.get(&key) {
                    Some(value) => Ok(Response::Value {
                        key,
                        value,
                        clock: None,
                    }),
                    None => Err(KvError::KeyNotFound { key }),
                }
            }
            Request::Set {
                key,
                value,
                simulate_failure,
            } => {
                if let Some(outcome) = self.check_leadership("/set").await {
                    return outcome;
                }
                self.store.set(&key, &value, simulate_failure)?;
                self.replicate_to_followers(&Operation::Set { key, value }).await;
                Ok(Response::Ok { success: true })
            }
            Request::Delete {
                key,
                simulate_failure,
            } => {
                if let Some(outcome) = self.check_leadership("/delete").await {
                    return outcome;
                }
                let deleted = self.store.delete(&key, simulate_failure)?;
                if deleted {
                    self.replicate_to_followers(&Operation::Delete { key }).await;
                }
                Ok(Response::Ok { success: deleted })
            }
            Request::BulkSet {
                items,
                simulate_failure,
            } => {
                if let Some(outcome) = self.check_leadership("/bulk_set").await {
                    return outcome;
                }
                let pairs: Vec<(String, String)> = items
                    .iter()
                    .map(|pair| (pair.key.clone(), pair.value.clone()))
                    .collect();
                let count = self.store.bulk_set(&pairs, simulate_failure)?;
                self.replicate_to_followers(&Operation::BulkSet { items }).await;
                Ok(Response::Count { count })
            }
            Request::Vote { term, candidate_id } => {
                let (granted, term) = self.handle_vote(term, candidate_id).await;
                Ok(Response::Vote { granted, term })
            }
            Request::Heartbeat {
                term,
                leader_id,
                leader_endpoint,
            } => {
                self.handle_heartbeat(term, leader_id, leader_endpoint).await;
                Ok(Response::Ack)
            }
            Request::ReplicateApply { op } => {
                self.apply_operation(op)?;
                Ok(Response::Ack)
            }
            Request::Ping => Ok(Response::Ack),
            Request::ReplicateSet { .. } | Request::ReplicateGet { .. } | Request::Gossip { .. } => {
                Err(KvError::BadRequest(
                    "leaderless replication is not enabled on this node".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn isolated_node(dir: &TempDir, node_id: NodeId) -> LeaderNode {
        let store = KvStore::open(dir.path(), false).unwrap();
        LeaderNode::new(
            node_id,
            Endpoint::new("127.0.0.1", 7400 + node_id as u16),
            Vec::new(),
            store,
        )
    }

    #[tokio::test]
    async fn test_single_node_cluster_elects_itself() {
        let dir = TempDir::new().unwrap();
        let node = Arc::new(isolated_node(&dir, 1));

        node.clone().start().await;
        assert_eq!(node.role().await, Role::Leader);
        assert_eq!(node.term().await, 1);
        node.stop();
    }

    #[tokio::test]
    async fn test_vote_granted_once_per_term() {
        let dir = TempDir::new().unwrap();
        let node = isolated_node(&dir, 1);

        // Higher term: grant and adopt.
        let (granted, term) = node.handle_vote(5, 2).await;
        assert!(granted);
        assert_eq!(term, 5);

        // Same term, already voted: deny.
        let (granted, term) = node.handle_vote(5, 3).await;
        assert!(!granted);
        assert_eq!(term, 5);

        // Stale term: deny.
        let (granted, _) = node.handle_vote(4, 3).await;
        assert!(!granted);
    }

    #[tokio::test]
    async fn test_heartbeat_adopts_term_and_leader() {
        let dir = TempDir::new().unwrap();
        let node = isolated_node(&dir, 1);
        let leader_endpoint = Endpoint::new("127.0.0.1", 7490);

        node.handle_heartbeat(3, 9, leader_endpoint.clone()).await;

        let state = node.state.lock().await;
        assert_eq!(state.term, 3);
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.known_leader, Some(leader_endpoint));
    }

    #[tokio::test]
    async fn test_leader_steps_down_on_higher_term_heartbeat() {
        let dir = TempDir::new().unwrap();
        let node = Arc::new(isolated_node(&dir, 1));
        node.clone().start().await;
        assert_eq!(node.role().await, Role::Leader);

        // Equal-term heartbeat is ignored by a leader.
        node.handle_heartbeat(1, 2, Endpoint::new("127.0.0.1", 7491)).await;
        assert_eq!(node.role().await, Role::Leader);

        node.handle_heartbeat(2, 2, Endpoint::new("127.0.0.1", 7491)).await;
        assert_eq!(node.role().await, Role::Follower);
        assert_eq!(node.term().await, 2);
        node.stop();
    }

    #[tokio::test]
    async fn test_follower_redirects_writes() {
        let dir = TempDir::new().unwrap();
        let node = isolated_node(&dir, 1);

        // No known leader: no_primary.
        let err = node
            .dispatch(Request::Set {
                key: "k".to_string(),
                value: "v".to_string(),
                simulate_failure: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::NoPrimary));

        // Known leader: redirect with absolute URL.
        node.handle_heartbeat(1, 2, Endpoint::new("127.0.0.1", 7492)).await;
        let response = node
            .dispatch(Request::Get {
                key: "k".to_string(),
            })
            .await
            .unwrap();
        match response {
            Response::Redirect { location } => {
                assert_eq!(location, "http://127.0.0.1:7492/get?key=k");
            }
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replicate_apply_runs_operations_verbatim() {
        let dir = TempDir::new().unwrap();
        let node = isolated_node(&dir, 1);

        node.dispatch(Request::ReplicateApply {
            op: Operation::BulkSet {
                items: vec![
                    crate::types::KvPair {
                        key: "a".to_string(),
                        value: "1".to_string(),
                    },
                    crate::types::KvPair {
                        key: "b".to_string(),
                        value: "2".to_string(),
                    },
                ],
            },
        })
        .await
        .unwrap();
        node.dispatch(Request::ReplicateApply {
            op: Operation::Delete {
                key: "a".to_string(),
            },
        })
        .await
        .unwrap();

        assert_eq!(node.store().get("a"), None);
        assert_eq!(node.store().get("b"), Some("2".to_string()));
    }
}
