//! Cluster configuration and per-node operational tuning.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::{NodeId, MAX_NODES};

/// Connection endpoints of one cluster member.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberAddr {
    pub node_id: NodeId,
    pub host: String,
    /// Port of the host engine / client surface.
    pub port: u16,
    /// Port of the direct arbiter socket (votes, heartbeats).
    pub arbiter_port: u16,
    /// Port of the shared config store endpoint.
    pub store_port: u16,
}

impl MemberAddr {
    /// Parse a member string of the form `id@host:port:arbiter:store`.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (id, rest) = s
            .split_once('@')
            .with_context(|| format!("member string missing '@': {s}"))?;
        let node_id: NodeId = id
            .parse()
            .with_context(|| format!("invalid node id in member string: {s}"))?;
        let parts: Vec<&str> = rest.split(':').collect();
        anyhow::ensure!(
            parts.len() == 4,
            "member string must be id@host:port:arbiter:store, got: {s}"
        );
        Ok(Self {
            node_id,
            host: parts[0].to_string(),
            port: parts[1].parse().context("invalid port")?,
            arbiter_port: parts[2].parse().context("invalid arbiter port")?,
            store_port: parts[3].parse().context("invalid store port")?,
        })
    }

    pub fn arbiter_addr(&self) -> String {
        format!("{}:{}", self.host, self.arbiter_port)
    }
}

/// Per-node configuration and operational tuning.
///
/// The `*_timeout` knobs guard against slow/failed peers; the recovery lag
/// thresholds shape the catch-up handshake. All durations default to values
/// suitable for LAN clusters and are overridden wholesale by tests.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub members: Vec<MemberAddr>,
    /// Fixed upper bound on cluster size; `add_node` flips an enable bit
    /// within this bound and never grows it.
    pub max_nodes: usize,

    /// Cadence of heartbeat publication.
    pub heartbeat_send_timeout: Duration,
    /// Silence threshold after which the watchdog marks a peer unreachable.
    pub heartbeat_recv_timeout: Duration,
    /// Minimum spacing between status flips for one node (debounce).
    pub node_disable_delay: Duration,
    /// Lower bound for the per-transaction PREPARE timeout.
    pub min_2pc_timeout: Duration,
    /// Percentage applied to a transaction's own prepare latency when
    /// computing its PREPARE timeout.
    pub prepare_ratio: u64,
    /// Replication lag below which a recovering node is "almost caught up"
    /// and the donor starts blocking new local commits.
    pub min_recovery_lag: u64,
    /// Replication lag above which the donor drops the recovery slot.
    pub max_recovery_lag: u64,
    /// Slack subtracted from the cluster-wide oldest snapshot before any
    /// transaction state is garbage collected.
    pub vacuum_delay: Duration,
    /// Run registry GC every this many started transactions.
    pub gc_period: u64,
    /// Number of concurrently applying worker tasks.
    pub worker_pool_size: usize,
    /// Cadence of the distributed deadlock detector; also the saturation
    /// threshold treated as an implicit deadlock.
    pub deadlock_timeout: Duration,
}

impl ClusterConfig {
    pub fn new(node_id: NodeId, members: Vec<MemberAddr>) -> Self {
        let max_nodes = members.len().clamp(1, MAX_NODES);
        Self {
            node_id,
            members,
            max_nodes,
            heartbeat_send_timeout: Duration::from_millis(200),
            heartbeat_recv_timeout: Duration::from_millis(1000),
            node_disable_delay: Duration::from_millis(2000),
            min_2pc_timeout: Duration::from_millis(2000),
            prepare_ratio: 200,
            min_recovery_lag: 10_000,
            max_recovery_lag: 10_000_000,
            vacuum_delay: Duration::from_secs(1),
            gc_period: 100,
            worker_pool_size: 4,
            deadlock_timeout: Duration::from_millis(2000),
        }
    }

    /// Synthesize a config for an in-process cluster of `n` nodes.
    pub fn in_process(node_id: NodeId, n: usize) -> Self {
        let members = (1..=n as NodeId)
            .map(|id| MemberAddr {
                node_id: id,
                host: "127.0.0.1".to_string(),
                port: 0,
                arbiter_port: 0,
                store_port: 0,
            })
            .collect();
        Self::new(node_id, members)
    }

    pub fn node_count(&self) -> usize {
        self.members.len()
    }

    pub fn member(&self, node: NodeId) -> Option<&MemberAddr> {
        self.members.iter().find(|m| m.node_id == node)
    }
}
