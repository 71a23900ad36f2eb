// Conclave node binary entry point.
//
// Parses the cluster configuration, wires the shared config store and the
// in-process fabric for the node, and runs until interrupted. Multi-process
// deployments share a directory-backed config store; the arbiter channel
// listens on the member's arbiter port.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use conclave_core::{ClusterConfig, MemberAddr};
use conclave_node::{DirConfigStore, FaultInjector, LocalArbiterHub, Node, TcpArbiter};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "conclave-node")]
struct Args {
    /// This node's id (1-based, dense).
    #[arg(long)]
    node_id: u32,

    /// Comma-separated member list like
    /// `1@host:5432:5433:5434,2@host:6432:6433:6434`.
    #[arg(long)]
    members: String,

    /// Directory backing the shared config store.
    #[arg(long, env = "CONCLAVE_STORE_DIR", default_value = ".conclave-store")]
    store_dir: String,

    /// Heartbeat publication cadence (ms).
    #[arg(long, env = "CONCLAVE_HEARTBEAT_SEND_MS", default_value_t = 200)]
    heartbeat_send_ms: u64,

    /// Heartbeat silence threshold (ms).
    #[arg(long, env = "CONCLAVE_HEARTBEAT_RECV_MS", default_value_t = 1000)]
    heartbeat_recv_ms: u64,

    /// Debounce window for node status flips (ms).
    #[arg(long, env = "CONCLAVE_NODE_DISABLE_DELAY_MS", default_value_t = 2000)]
    node_disable_delay_ms: u64,

    /// Minimum per-transaction PREPARE timeout (ms).
    #[arg(long, env = "CONCLAVE_MIN_2PC_TIMEOUT_MS", default_value_t = 2000)]
    min_2pc_timeout_ms: u64,

    /// Percentage of a transaction's own prepare latency used as its
    /// PREPARE timeout.
    #[arg(long, env = "CONCLAVE_PREPARE_RATIO", default_value_t = 200)]
    prepare_ratio: u64,

    /// Catch-up lag under which the donor locks the cluster.
    #[arg(long, env = "CONCLAVE_MIN_RECOVERY_LAG", default_value_t = 10_000)]
    min_recovery_lag: u64,

    /// Lag above which a recovery slot is dropped.
    #[arg(long, env = "CONCLAVE_MAX_RECOVERY_LAG", default_value_t = 10_000_000)]
    max_recovery_lag: u64,

    /// Vacuum horizon slack (ms).
    #[arg(long, env = "CONCLAVE_VACUUM_DELAY_MS", default_value_t = 1000)]
    vacuum_delay_ms: u64,

    /// Apply worker pool size.
    #[arg(long, env = "CONCLAVE_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Deadlock detector cadence and threshold (ms).
    #[arg(long, env = "CONCLAVE_DEADLOCK_TIMEOUT_MS", default_value_t = 2000)]
    deadlock_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let members = args
        .members
        .split(',')
        .map(MemberAddr::parse)
        .collect::<anyhow::Result<Vec<_>>>()
        .context("parse --members")?;
    anyhow::ensure!(
        members.iter().any(|m| m.node_id == args.node_id),
        "--node-id {} is not in --members",
        args.node_id
    );

    let mut cfg = ClusterConfig::new(args.node_id, members.clone());
    cfg.heartbeat_send_timeout = Duration::from_millis(args.heartbeat_send_ms);
    cfg.heartbeat_recv_timeout = Duration::from_millis(args.heartbeat_recv_ms);
    cfg.node_disable_delay = Duration::from_millis(args.node_disable_delay_ms);
    cfg.min_2pc_timeout = Duration::from_millis(args.min_2pc_timeout_ms);
    cfg.prepare_ratio = args.prepare_ratio;
    cfg.min_recovery_lag = args.min_recovery_lag;
    cfg.max_recovery_lag = args.max_recovery_lag;
    cfg.vacuum_delay = Duration::from_millis(args.vacuum_delay_ms);
    cfg.worker_pool_size = args.workers;
    cfg.deadlock_timeout = Duration::from_millis(args.deadlock_timeout_ms);

    let store = DirConfigStore::open(&args.store_dir).context("open config store")?;
    let faults = FaultInjector::new();
    let hub = LocalArbiterHub::new(faults.clone());

    // The arbiter channel runs over TCP between processes; the logical
    // replication transport is supplied by the embedding host.
    let me = args.node_id;
    let listen = members
        .iter()
        .find(|m| m.node_id == me)
        .map(|m| m.arbiter_addr())
        .expect("own member entry");
    let peer_addrs: HashMap<u32, String> = members
        .iter()
        .filter(|m| m.node_id != me)
        .map(|m| (m.node_id, m.arbiter_addr()))
        .collect();
    tracing::info!(node = me, %listen, peers = peer_addrs.len(), "starting conclave node");

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let transport = TcpArbiter::new(me, peer_addrs);
    tokio::spawn(async move {
        if let Err(err) = TcpArbiter::serve(listen, inbox_tx).await {
            tracing::error!(error = %err, "arbiter server failed");
        }
    });

    let node = Node::with_arbiter_transport(cfg, hub, faults, store, transport, inbox_rx);
    node.start();
    node.finish_boot();
    let state = node.get_cluster_state();
    tracing::info!(status = %state.status, nodes = state.all_nodes, "node is up");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!(node = me, "shutting down");
    node.stop();
    Ok(())
}
