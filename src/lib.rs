//! # quartz-kv
//!
//! A replicated, persistent key-value store accessed over JSON-over-HTTP.
//!
//! Clients issue Set, Get, Delete and BulkSet against any node of a cluster
//! and receive durable, causally-consistent results despite node crashes
//! and process kills. Three operating modes share one storage engine:
//!
//! - **Single**: one durable node, plus full-text and similarity indexes.
//! - **Leader**: majority-vote election, term-tagged heartbeats, follower
//!   redirects, best-effort operation fan-out.
//! - **Leaderless**: per-key replica sets by consistent hashing, quorum
//!   writes and reads, vector-clock conflict resolution, background gossip.
//!
//! ## Durability
//!
//! Every mutation is appended to a write-ahead log and force-synced before
//! it is acknowledged; a full-map snapshot follows. Recovery replays the
//! WAL on top of the snapshot, tolerating a torn trailing record, so the
//! recovered map always equals the acknowledged history.
//!
//! ## Quick start
//!
//! ```ignore
//! use quartz_kv::{ApiServer, IndexedStore, KvStore, SingleNode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = KvStore::open("data", false)?;
//!     let node = Arc::new(SingleNode::new(IndexedStore::new(store)));
//!     let server = ApiServer::bind("127.0.0.1:7400", quartz_kv::http::single_router(node)).await?;
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **HTTP transport** (`http`): axum routes, one per logical request.
//! 2. **Dispatcher** (`dispatch`): the `NodeHandle` contract the three
//!    mode nodes implement.
//! 3. **Replication** (`replication`, `quorum`): leader and leaderless
//!    coordination over the shared engine.
//! 4. **Storage engine** (`store`): WAL + snapshot + in-memory map.

// Storage engine and decorators
pub mod index;
pub mod store;

// Shared types and errors
pub mod error;
pub mod types;

// Operation dispatch
pub mod dispatch;

// Replication modes
pub mod quorum;
pub mod replication;

// Transport
pub mod http;
pub mod peer;

// Configuration
pub mod config;

pub use config::NodeConfig;
pub use dispatch::{NodeHandle, Request, Response, SingleNode};
pub use error::{KvError, KvResult};
pub use http::ApiServer;
pub use index::{EmbeddingIndex, FullTextIndex, IndexedStore};
pub use quorum::QuorumNode;
pub use replication::{LeaderNode, Role};
pub use store::KvStore;
pub use types::{Endpoint, KvPair, NodeId, Operation, VectorClock, WalEntry, TOMBSTONE};
