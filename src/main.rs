/// quartzkv - replicated, durable key-value store.
///
/// One binary, three modes:
///
///   quartzkv single --bind 127.0.0.1:7400 --data-dir data
///   quartzkv leader --node-id 1 --bind 127.0.0.1:7401 \
///       --peer 127.0.0.1:7402 --peer 127.0.0.1:7403
///   quartzkv leaderless --node-id 1 --bind 127.0.0.1:7401 \
///       --peer 127.0.0.1:7402 --peer 127.0.0.1:7403 --replication-factor 3
///
/// SIGINT checkpoints the store (snapshot + WAL truncate) and exits 0.
use anyhow::Result;
use clap::{Parser, Subcommand};
use quartz_kv::config::DEFAULT_PORT;
use quartz_kv::quorum::DEFAULT_REPLICATION_FACTOR;
use quartz_kv::{
    http, ApiServer, Endpoint, IndexedStore, KvStore, LeaderNode, NodeConfig, NodeId, QuorumNode,
    SingleNode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quartzkv", version, about = "Replicated, durable key-value store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single durable node with search indexes.
    Single {
        /// Endpoint to listen on.
        #[arg(long, default_value_t = Endpoint::new("127.0.0.1", DEFAULT_PORT))]
        bind: Endpoint,
        /// Data directory.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Arm the snapshot fault-injection path.
        #[arg(long)]
        debug: bool,
    },
    /// Run one node of a leader-replicated cluster.
    Leader {
        /// This node's id.
        #[arg(long)]
        node_id: NodeId,
        /// Endpoint to listen on and advertise to peers.
        #[arg(long, default_value_t = Endpoint::new("127.0.0.1", DEFAULT_PORT))]
        bind: Endpoint,
        /// A peer endpoint; repeat once per peer.
        #[arg(long = "peer")]
        peers: Vec<Endpoint>,
        /// Base data directory (`_node_<id>` is appended).
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Arm the snapshot fault-injection path.
        #[arg(long)]
        debug: bool,
    },
    /// Run one node of a leaderless cluster.
    Leaderless {
        /// This node's id.
        #[arg(long)]
        node_id: NodeId,
        /// Endpoint to listen on and advertise to peers.
        #[arg(long, default_value_t = Endpoint::new("127.0.0.1", DEFAULT_PORT))]
        bind: Endpoint,
        /// A peer endpoint; repeat once per peer.
        #[arg(long = "peer")]
        peers: Vec<Endpoint>,
        /// Base data directory (`_node_<id>` is appended).
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Arm the snapshot fault-injection path.
        #[arg(long)]
        debug: bool,
        /// Replicas per key, including the coordinating node.
        #[arg(long, default_value_t = DEFAULT_REPLICATION_FACTOR)]
        replication_factor: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Single {
            bind,
            data_dir,
            debug,
        } => run_single(bind, data_dir, debug).await,
        Command::Leader {
            node_id,
            bind,
            peers,
            data_dir,
            debug,
        } => {
            let config = NodeConfig::new()
                .node_id(node_id)
                .bind(bind)
                .peers(peers)
                .data_dir(data_dir)
                .debug(debug);
            run_leader(config).await
        }
        Command::Leaderless {
            node_id,
            bind,
            peers,
            data_dir,
            debug,
            replication_factor,
        } => {
            let config = NodeConfig::new()
                .node_id(node_id)
                .bind(bind)
                .peers(peers)
                .data_dir(data_dir)
                .debug(debug)
                .replication_factor(replication_factor);
            run_leaderless(config).await
        }
    }
}

async fn run_single(bind: Endpoint, data_dir: PathBuf, debug: bool) -> Result<()> {
    let store = KvStore::open(&data_dir, debug)?;
    let node = Arc::new(SingleNode::new(IndexedStore::new(store)));

    let server = ApiServer::bind(
        (bind.host.as_str(), bind.port),
        http::single_router(node.clone()),
    )
    .await?;
    tracing::info!("single node listening on {}", server.local_addr()?);

    server.serve_with_shutdown(shutdown_signal()).await?;

    node.indexed().store().checkpoint()?;
    tracing::info!("checkpoint written, shutting down");
    Ok(())
}

async fn run_leader(config: NodeConfig) -> Result<()> {
    let store = KvStore::open(config.replicated_data_dir(), config.debug)?;
    let node = Arc::new(LeaderNode::new(
        config.node_id,
        config.bind.clone(),
        config.peers.clone(),
        store,
    ));

    // Bind before electing so peers can reach our vote route; their
    // requests queue in the accept backlog until we start serving.
    let server = ApiServer::bind(
        (config.bind.host.as_str(), config.bind.port),
        http::router(node.clone()),
    )
    .await?;
    tracing::info!(
        node = config.node_id,
        "leader-mode node listening on {}",
        server.local_addr()?
    );

    node.clone().start().await;
    server.serve_with_shutdown(shutdown_signal()).await?;

    node.stop();
    node.store().checkpoint()?;
    tracing::info!(node = config.node_id, "checkpoint written, shutting down");
    Ok(())
}

async fn run_leaderless(config: NodeConfig) -> Result<()> {
    let store = KvStore::open(config.replicated_data_dir(), config.debug)?;
    let node = Arc::new(QuorumNode::new(
        config.node_id,
        config.bind.clone(),
        config.peers.clone(),
        store,
        config.replication_factor,
    ));

    let server = ApiServer::bind(
        (config.bind.host.as_str(), config.bind.port),
        http::router(node.clone()),
    )
    .await?;
    tracing::info!(
        node = config.node_id,
        "leaderless node listening on {}",
        server.local_addr()?
    );

    node.clone().start();
    server.serve_with_shutdown(shutdown_signal()).await?;

    node.stop().await;
    node.store().checkpoint()?;
    tracing::info!(node = config.node_id, "checkpoint written, shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for interrupt: {e}");
        return;
    }
    tracing::info!("interrupt received, draining");
}
