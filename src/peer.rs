/// Outbound peer calls and the wire bodies they share with the HTTP layer.
///
/// Every node-to-node interaction goes through [`PeerClient`]: votes,
/// heartbeats, pings, leader log fan-out, leaderless replication and
/// gossip. Each call carries its own timeout (500 ms on the election
/// plane, 1 s on the data plane) and a timeout counts as a failure: no
/// ack, no vote. Callers decide whether that failure is swallowed
/// (best-effort paths) or folded into an ack count (quorum paths).
use crate::error::{KvError, KvResult};
use crate::types::{Endpoint, NodeId, Operation, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Timeout for votes, pings and heartbeats.
const ELECTION_PLANE_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for replication and gossip.
const DATA_PLANE_TIMEOUT: Duration = Duration::from_secs(1);

/// Body of a vote request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteBody {
    /// Candidate's term.
    pub term: u64,
    /// Candidate's node id.
    pub candidate_id: NodeId,
}

/// Reply to a vote request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReply {
    /// Whether the vote was granted.
    pub vote_granted: bool,
    /// The voter's current term.
    pub term: u64,
}

/// Body of a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatBody {
    /// Leader's term.
    pub term: u64,
    /// Leader's node id.
    pub leader_id: NodeId,
    /// Endpoint clients should be redirected to.
    pub leader_endpoint: Endpoint,
}

/// Body of a leaderless replicated write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateSetBody {
    /// The key.
    pub key: String,
    /// The value.
    pub value: String,
    /// Clock of the originating write.
    pub clock: VectorClock,
}

/// Reply to a leaderless replicated write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateSetReply {
    /// Whether the receiver applied the write.
    pub accepted: bool,
}

/// Reply to a peer-local read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateGetReply {
    /// The stored value (possibly the tombstone sentinel).
    pub value: String,
    /// The stored per-key clock.
    pub clock: VectorClock,
}

/// Body of a gossip round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipBody {
    /// Sender's node id.
    pub node_id: NodeId,
    /// Sender's vector clock.
    pub clock: VectorClock,
    /// Sender's per-key clocks.
    pub value_clocks: HashMap<String, VectorClock>,
}

/// HTTP client for node-to-node calls.
pub struct PeerClient {
    client: reqwest::Client,
}

impl PeerClient {
    /// Create a new peer client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Request a vote from a peer.
    pub async fn request_vote(
        &self,
        peer: &Endpoint,
        term: u64,
        candidate_id: NodeId,
    ) -> KvResult<VoteReply> {
        let url = format!("{}/vote", peer.base_url());
        let body = VoteBody { term, candidate_id };
        let response = self
            .client
            .post(&url)
            .timeout(ELECTION_PLANE_TIMEOUT)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unreachable_peer(peer, e))?;

        response.json().await.map_err(|e| unreachable_peer(peer, e))
    }

    /// Announce leadership to a peer.
    pub async fn send_heartbeat(
        &self,
        peer: &Endpoint,
        term: u64,
        leader_id: NodeId,
        leader_endpoint: Endpoint,
    ) -> KvResult<()> {
        let url = format!("{}/heartbeat", peer.base_url());
        let body = HeartbeatBody {
            term,
            leader_id,
            leader_endpoint,
        };
        self.client
            .post(&url)
            .timeout(ELECTION_PLANE_TIMEOUT)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unreachable_peer(peer, e))?;
        Ok(())
    }

    /// Liveness check.
    pub async fn ping(&self, peer: &Endpoint) -> KvResult<()> {
        let url = format!("{}/ping", peer.base_url());
        self.client
            .get(&url)
            .timeout(ELECTION_PLANE_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unreachable_peer(peer, e))?;
        Ok(())
    }

    /// Ship one operation to a follower (leader mode).
    pub async fn replicate_apply(&self, peer: &Endpoint, op: &Operation) -> KvResult<()> {
        let url = format!("{}/replicate", peer.base_url());
        self.client
            .post(&url)
            .timeout(DATA_PLANE_TIMEOUT)
            .json(op)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unreachable_peer(peer, e))?;
        Ok(())
    }

    /// Ship one clock-tagged write to a replica (leaderless mode).
    pub async fn replicate_set(
        &self,
        peer: &Endpoint,
        key: &str,
        value: &str,
        clock: &VectorClock,
    ) -> KvResult<bool> {
        let url = format!("{}/replicate_set", peer.base_url());
        let body = ReplicateSetBody {
            key: key.to_string(),
            value: value.to_string(),
            clock: clock.clone(),
        };
        let response = self
            .client
            .post(&url)
            .timeout(DATA_PLANE_TIMEOUT)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unreachable_peer(peer, e))?;

        let reply: ReplicateSetReply =
            response.json().await.map_err(|e| unreachable_peer(peer, e))?;
        Ok(reply.accepted)
    }

    /// Read a replica's local copy of a key (leaderless mode).
    ///
    /// `Ok(None)` means the peer answered and has no record; an
    /// unreachable peer is an error so quorum counting can tell the two
    /// apart.
    pub async fn replicate_get(
        &self,
        peer: &Endpoint,
        key: &str,
    ) -> KvResult<Option<ReplicateGetReply>> {
        let url = format!("{}/replicate_get", peer.base_url());
        let response = self
            .client
            .get(&url)
            .timeout(DATA_PLANE_TIMEOUT)
            .query(&[("key", key)])
            .send()
            .await
            .map_err(|e| unreachable_peer(peer, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| unreachable_peer(peer, e))?;
        let reply: ReplicateGetReply =
            response.json().await.map_err(|e| unreachable_peer(peer, e))?;
        Ok(Some(reply))
    }

    /// Send one gossip round to a peer (leaderless mode).
    pub async fn gossip(&self, peer: &Endpoint, body: &GossipBody) -> KvResult<()> {
        let url = format!("{}/gossip", peer.base_url());
        self.client
            .post(&url)
            .timeout(DATA_PLANE_TIMEOUT)
            .json(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unreachable_peer(peer, e))?;
        Ok(())
    }
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new()
    }
}

fn unreachable_peer(peer: &Endpoint, error: reqwest::Error) -> KvError {
    KvError::PeerUnreachable(format!("{peer}: {error}"))
}
