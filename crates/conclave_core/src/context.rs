//! Explicitly constructed node context shared by every component.
//!
//! There are no hidden globals: the context owns the clock, the transaction
//! state table and the cluster-wide shared state, each behind its own lock.
//! Lock order is `shared` before `registry`; neither lock is ever held
//! across an await point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Notify;

use crate::clock::CsnClock;
use crate::config::ClusterConfig;
use crate::registry::TxnRegistry;
use crate::types::{ClusterStatus, Csn, Lsn, NodeId, NodeMask, Xid, INVALID_CSN};

/// Runtime record kept for every peer slot.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    /// Connectivity mask the peer last reported (bit i = "peer cannot reach
    /// node i+1").
    pub connectivity_mask: u64,
    /// Local receive time of the peer's last heartbeat, microseconds.
    /// Zero defuses the watchdog until the first heartbeat arrives.
    pub last_heartbeat: u64,
    /// Last local status flip for this peer, for flap debouncing.
    pub last_status_change: u64,
    /// Oldest snapshot the peer still references.
    pub oldest_snapshot: Csn,
    /// Peer's clock position from heartbeat gossip.
    pub last_csn: Csn,
    /// Remote LSN this node confirmed durable (slot position when this node
    /// feeds the peer).
    pub flush_position: Lsn,
    /// Position the peer restarts its stream from.
    pub restart_lsn: Lsn,
    /// Whether our receiver from this peer is attached.
    pub receiver_connected: bool,
    /// Whether our sender towards this peer is attached.
    pub sender_connected: bool,
}

impl Default for NodeRecord {
    fn default() -> Self {
        Self {
            connectivity_mask: 0,
            last_heartbeat: 0,
            last_status_change: 0,
            oldest_snapshot: INVALID_CSN,
            last_csn: INVALID_CSN,
            flush_position: 0,
            restart_lsn: 0,
            receiver_connected: false,
            sender_connected: false,
        }
    }
}

/// Cluster-wide mutable state of one node.
#[derive(Debug)]
pub struct SharedState {
    pub status: ClusterStatus,
    /// Nodes configured (enabled bits live within `max_nodes`).
    pub all_nodes: usize,
    pub live_nodes: usize,
    /// Nodes currently excluded from voting.
    pub disabled_mask: NodeMask,
    /// Own connectivity view: bit i = "I cannot reach node i+1".
    pub connectivity_mask: NodeMask,
    /// Nodes we should re-establish channels to.
    pub reconnect_mask: NodeMask,
    /// Recovering nodes whose donors are in the almost-caught-up phase.
    pub node_locker_mask: NodeMask,
    /// Donor senders currently blocking new local commits.
    pub sender_locker_mask: NodeMask,
    pub lockers: usize,
    /// Receivers currently attached (drives connected -> online).
    pub receivers_connected: usize,
    /// Cluster-wide vacuum horizon.
    pub oldest_xid: Xid,
    pub active_transactions: u64,
    /// Incremented on every membership/status change; commit waits watch it.
    pub config_changes: u64,
    /// Donor node while this node recovers.
    pub recovery_slot: Option<NodeId>,
    pub recovery_count: u64,
    pub last_status_update: u64,
    /// Testing hook: next 2PC phase to fail (0 = off).
    pub inject_2pc_error: u8,
    pub nodes: Vec<NodeRecord>,
}

impl SharedState {
    fn new(n: usize) -> Self {
        Self {
            status: ClusterStatus::Initializing,
            all_nodes: n,
            live_nodes: n,
            disabled_mask: NodeMask::empty(),
            connectivity_mask: NodeMask::empty(),
            reconnect_mask: NodeMask::empty(),
            node_locker_mask: NodeMask::empty(),
            sender_locker_mask: NodeMask::empty(),
            lockers: 0,
            receivers_connected: 0,
            oldest_xid: 0,
            active_transactions: 0,
            config_changes: 0,
            recovery_slot: None,
            recovery_count: 0,
            last_status_update: 0,
            inject_2pc_error: 0,
            nodes: (0..n).map(|_| NodeRecord::default()).collect(),
        }
    }

    pub fn quorum(&self) -> usize {
        self.all_nodes / 2 + 1
    }

    pub fn record(&self, node: NodeId) -> &NodeRecord {
        &self.nodes[(node - 1) as usize]
    }

    pub fn record_mut(&mut self, node: NodeId) -> &mut NodeRecord {
        &mut self.nodes[(node - 1) as usize]
    }

    /// Nodes currently allowed to vote, excluding `me`.
    pub fn enabled_peers(&self, me: NodeId) -> NodeMask {
        let mut mask = self.disabled_mask.invert(self.all_nodes);
        mask.clear(me);
        mask
    }
}

/// The per-node context threaded through every component.
pub struct NodeContext {
    pub cfg: ClusterConfig,
    pub clock: CsnClock,
    pub registry: RwLock<TxnRegistry>,
    pub shared: RwLock<SharedState>,
    /// Woken when `config_changes` advances.
    pub config_change: Notify,
    /// Woken when the cluster recovery lock clears.
    pub cluster_unlock: Notify,
    next_xid: AtomicU64,
}

impl NodeContext {
    pub fn new(cfg: ClusterConfig) -> Arc<Self> {
        let n = cfg.node_count();
        Arc::new(Self {
            cfg,
            clock: CsnClock::new(),
            registry: RwLock::new(TxnRegistry::new()),
            shared: RwLock::new(SharedState::new(n)),
            config_change: Notify::new(),
            cluster_unlock: Notify::new(),
            next_xid: AtomicU64::new(1),
        })
    }

    pub fn my_id(&self) -> NodeId {
        self.cfg.node_id
    }

    pub fn alloc_xid(&self) -> Xid {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// Next XID that would be allocated; an upper bound on every live XID.
    pub fn current_xid(&self) -> Xid {
        self.next_xid.load(Ordering::Relaxed)
    }

    pub fn shared(&self) -> RwLockReadGuard<'_, SharedState> {
        self.shared.read().unwrap()
    }

    pub fn shared_mut(&self) -> RwLockWriteGuard<'_, SharedState> {
        self.shared.write().unwrap()
    }

    pub fn registry(&self) -> RwLockReadGuard<'_, TxnRegistry> {
        self.registry.read().unwrap()
    }

    pub fn registry_mut(&self) -> RwLockWriteGuard<'_, TxnRegistry> {
        self.registry.write().unwrap()
    }

    pub fn status(&self) -> ClusterStatus {
        self.shared().status
    }

    /// Switch the cluster mode, logging the edge.
    pub fn switch_status(&self, st: &mut SharedState, to: ClusterStatus) {
        if st.status != to {
            tracing::info!(node = self.my_id(), from = %st.status, to = %to, "switch cluster mode");
            st.status = to;
        }
    }

    /// Bump the configuration epoch and wake commit waiters.
    pub fn bump_config_changes(&self, st: &mut SharedState) {
        st.config_changes += 1;
        self.config_change.notify_waiters();
    }
}
