//! Arbiter / failure detector.
//!
//! Every node publishes a heartbeat on the arbiter channel and its
//! connectivity mask to the shared config store. The watchdog marks silent
//! peers unreachable; whenever a connectivity view changes, every node
//! recomputes the agreed live set as the maximum clique of the mutual
//! connectivity graph and disables the nodes outside it. Clique membership
//! never silently re-inserts a previously disabled node: only recovery
//! completion does.

use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;

use crate::clique::{build_adjacency, find_max_clique, find_max_clique_with};
use crate::context::{NodeContext, SharedState};
use crate::coordinator::Coordinator;
use crate::messages::ArbiterMessage;
use crate::recovery::RecoveryController;
use crate::types::{
    node_mask_key, ArbiterTransport, ClusterStatus, ConfigStore, Csn, NodeId, NodeMask,
};

pub struct Arbiter {
    ctx: Arc<NodeContext>,
    transport: Arc<dyn ArbiterTransport>,
    store: Arc<dyn ConfigStore>,
    coordinator: Arc<Coordinator>,
    recovery: Arc<RecoveryController>,
}

impl Arbiter {
    pub fn new(
        ctx: Arc<NodeContext>,
        transport: Arc<dyn ArbiterTransport>,
        store: Arc<dyn ConfigStore>,
        coordinator: Arc<Coordinator>,
        recovery: Arc<RecoveryController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            transport,
            store,
            coordinator,
            recovery,
        })
    }

    /// Periodic heartbeat publication: a beacon to every peer on the arbiter
    /// channel plus the connectivity mask in the config store.
    pub async fn run_heartbeat(
        self: Arc<Self>,
        oldest_snapshot: impl Fn() -> Csn + Send + 'static,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.ctx.cfg.heartbeat_send_timeout);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            self.send_heartbeats(oldest_snapshot()).await;
        }
    }

    async fn send_heartbeats(&self, oldest_snapshot: Csn) {
        let me = self.ctx.my_id();
        let (connectivity, all_nodes) = {
            let shared = self.ctx.shared();
            (shared.connectivity_mask, shared.all_nodes)
        };
        if let Err(err) = self
            .store
            .put(&node_mask_key(me), &connectivity.raw().to_be_bytes())
        {
            tracing::warn!(node = me, error = %err, "mask publication failed");
        }
        let msg = ArbiterMessage::Heartbeat {
            node: me,
            time: self.ctx.clock.now(),
            connectivity: connectivity.raw(),
            last_csn: self.ctx.clock.last_csn(),
            oldest_snapshot,
        };
        let mut futs = FuturesUnordered::new();
        for node in 1..=all_nodes as NodeId {
            if node == me {
                continue;
            }
            let transport = self.transport.clone();
            let msg = msg.clone();
            futs.push(async move { transport.send(node, msg).await });
        }
        while let Some(res) = futs.next().await {
            // Unreachable peers are the watchdog's business.
            let _ = res;
        }
    }

    /// Periodic heartbeat check: a peer silent past `heartbeat_recv_timeout`
    /// is marked unreachable.
    pub async fn run_watchdog(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ctx.cfg.heartbeat_send_timeout);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            self.watchdog_tick();
        }
    }

    pub fn watchdog_tick(&self) {
        let me = self.ctx.my_id();
        let now = self.ctx.clock.now();
        let timeout_us =
            self.ctx.cfg.heartbeat_recv_timeout.as_micros().min(u128::from(u64::MAX)) as u64;
        let stale: Vec<NodeId> = {
            let shared = self.ctx.shared();
            (1..=shared.all_nodes as NodeId)
                .filter(|&node| {
                    node != me && !shared.disabled_mask.contains(node) && {
                        let record = shared.record(node);
                        record.last_heartbeat != 0
                            && now > record.last_heartbeat + timeout_us
                    }
                })
                .collect()
        };
        for node in stale {
            tracing::warn!(node = me, peer = node, "heartbeat missing, marking unreachable");
            self.on_node_disconnect(node);
        }
    }

    /// Heartbeat receipt: refresh the peer record, ratchet the clock, and
    /// re-establish connectivity if we had marked the peer unreachable.
    pub fn on_heartbeat(
        &self,
        node: NodeId,
        connectivity: u64,
        last_csn: Csn,
        oldest_snapshot: Csn,
    ) {
        self.ctx.clock.sync(last_csn);
        let reconnected = {
            let mut shared = self.ctx.shared_mut();
            if (node as usize) > shared.all_nodes {
                return;
            }
            let now = self.ctx.clock.now();
            let record = shared.record_mut(node);
            record.last_heartbeat = now;
            record.connectivity_mask = connectivity;
            record.last_csn = last_csn;
            if oldest_snapshot != 0 {
                record.oldest_snapshot = oldest_snapshot;
            }
            shared.connectivity_mask.contains(node)
        };
        if reconnected {
            self.on_node_connect(node);
        }
    }

    /// A peer became reachable again.
    pub fn on_node_connect(&self, node: NodeId) {
        {
            let mut shared = self.ctx.shared_mut();
            shared.connectivity_mask.clear(node);
            shared.reconnect_mask.clear(node);
        }
        tracing::info!(node = self.ctx.my_id(), peer = node, "reconnect node");
        self.publish_connectivity();
        self.refresh_cluster_status();
    }

    /// A peer became unreachable. Debounced by `node_disable_delay` to
    /// prevent status blinking on intermittent links.
    pub fn on_node_disconnect(&self, node: NodeId) {
        let delay_us =
            self.ctx.cfg.node_disable_delay.as_micros().min(u128::from(u64::MAX)) as u64;
        {
            let mut shared = self.ctx.shared_mut();
            if shared.disabled_mask.contains(node) {
                return;
            }
            let now = self.ctx.clock.now();
            if shared.record(node).last_status_change + delay_us > now {
                return;
            }
            shared.connectivity_mask.set(node);
            shared.reconnect_mask.set(node);
        }
        self.publish_connectivity();
        self.refresh_cluster_status();
    }

    fn publish_connectivity(&self) {
        let me = self.ctx.my_id();
        let mask = self.ctx.shared().connectivity_mask;
        if let Err(err) = self.store.put(&node_mask_key(me), &mask.raw().to_be_bytes()) {
            tracing::warn!(node = me, error = %err, "mask publication failed");
        }
    }

    /// Read every node's published connectivity mask. A missing blob
    /// contributes no claims of its own; mutual-reachability symmetrization
    /// still removes edges our own row vetoes.
    fn build_connectivity_matrix(&self) -> Vec<u64> {
        let (me, all_nodes, own) = {
            let shared = self.ctx.shared();
            (self.ctx.my_id(), shared.all_nodes, shared.connectivity_mask)
        };
        let mut reported = vec![0u64; all_nodes];
        for node in 1..=all_nodes as NodeId {
            if node == me {
                reported[(node - 1) as usize] = own.raw();
                continue;
            }
            match self.store.get(&node_mask_key(node)) {
                Ok(Some(blob)) if blob.len() == 8 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&blob);
                    reported[(node - 1) as usize] = u64::from_be_bytes(raw);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(node = me, peer = node, error = %err, "mask read failed");
                }
            }
        }
        reported
    }

    /// Recompute the agreed live set from the connectivity graph.
    pub fn refresh_cluster_status(&self) {
        let me = self.ctx.my_id();

        // Losing majority is decided on our own reachability first: a node
        // that can see less than a quorum refuses new distributed commits
        // whatever the rest of the cluster agrees on.
        {
            let mut shared = self.ctx.shared_mut();
            let reachable = shared.all_nodes - shared.connectivity_mask.count();
            if reachable < shared.quorum() {
                tracing::warn!(
                    node = me,
                    reachable,
                    "reachable nodes below quorum"
                );
                self.ctx.switch_status(&mut shared, ClusterStatus::InMinority);
                self.ctx.bump_config_changes(&mut shared);
                return;
            }
            if shared.status == ClusterStatus::InMinority {
                // Majority regained.
                self.check_quorum(&mut shared);
            }
        }

        let reported = self.build_connectivity_matrix();
        let n = reported.len();
        let adjacency = build_adjacency(&reported, n);
        let (mut clique_raw, mut clique_size) = find_max_clique(&adjacency, n);
        if clique_raw & (1u64 << (me - 1)) == 0 {
            let (own_raw, own_size) = find_max_clique_with(&adjacency, n, (me - 1) as usize);
            if own_size >= clique_size {
                clique_raw = own_raw;
                clique_size = own_size;
            }
        }
        let clique = NodeMask::from_raw(clique_raw);
        let quorum = n / 2 + 1;

        if clique_size < quorum {
            tracing::warn!(node = me, clique = %clique, "clique has no quorum");
            let mut shared = self.ctx.shared_mut();
            self.ctx.switch_status(&mut shared, ClusterStatus::InMinority);
            self.ctx.bump_config_changes(&mut shared);
            return;
        }

        let (own_disabled, status, changed) = {
            let mut shared = self.ctx.shared_mut();
            // Nodes outside the clique get disabled; nodes inside it that
            // were disabled earlier stay disabled until recovery completes.
            let newly_disabled = clique
                .invert(n)
                .difference(shared.disabled_mask);
            for node in newly_disabled.iter() {
                self.disable_node(&mut shared, node);
            }
            if !newly_disabled.is_empty() {
                tracing::warn!(
                    node = me,
                    clique = %clique,
                    disabled = %shared.disabled_mask,
                    "cluster view changed"
                );
                self.check_quorum(&mut shared);
            }
            (
                shared.disabled_mask.contains(me),
                shared.status,
                !newly_disabled.is_empty(),
            )
        };

        if own_disabled {
            // We were excluded from the cluster.
            if status == ClusterStatus::Online {
                let mut shared = self.ctx.shared_mut();
                self.ctx.switch_status(&mut shared, ClusterStatus::Offline);
            } else if status == ClusterStatus::Offline {
                self.recovery.start_recovery();
            }
        }
        if changed {
            // Membership changed under in-flight votes: wake and abort them.
            self.coordinator.abort_active_voting();
        }
    }

    /// Disable a node in the shared state (debounce bookkeeping included).
    pub fn disable_node(&self, shared: &mut SharedState, node: NodeId) {
        if shared.disabled_mask.contains(node) {
            return;
        }
        shared.disabled_mask.set(node);
        let now = self.ctx.clock.now();
        let record = shared.record_mut(node);
        record.last_status_change = now;
        record.last_heartbeat = 0;
        if record.receiver_connected {
            record.receiver_connected = false;
            shared.receivers_connected = shared.receivers_connected.saturating_sub(1);
        }
        if node != self.ctx.my_id() {
            shared.live_nodes = shared.live_nodes.saturating_sub(1);
        }
        tracing::warn!(node = self.ctx.my_id(), peer = node, "disable node");
    }

    /// Re-check majority and flip between online and in-minority.
    pub fn check_quorum(&self, shared: &mut SharedState) {
        self.ctx.bump_config_changes(shared);
        let reachable = shared.all_nodes - shared.connectivity_mask.count();
        if shared.live_nodes < shared.quorum() {
            if shared.status == ClusterStatus::Online {
                tracing::warn!(
                    node = self.ctx.my_id(),
                    disabled = %shared.disabled_mask,
                    "node is in minority"
                );
                self.ctx.switch_status(shared, ClusterStatus::InMinority);
            }
        } else if shared.status == ClusterStatus::InMinority && reachable >= shared.quorum() {
            self.ctx.switch_status(shared, ClusterStatus::Online);
        }
    }

    /// A replication receiver from `node` (re)connected. Enables a pending
    /// node, and completes the connected -> online transition once every
    /// receiver is attached.
    pub fn on_receiver_started(&self, node: NodeId) {
        let mut shared = self.ctx.shared_mut();
        if shared.record(node).receiver_connected {
            return;
        }
        shared.record_mut(node).receiver_connected = true;
        if shared.disabled_mask.contains(node) {
            shared.disabled_mask.clear(node);
            shared.live_nodes += 1;
            let now = self.ctx.clock.now();
            shared.record_mut(node).last_status_change = now;
            shared.record_mut(node).last_heartbeat = 0;
            tracing::warn!(node = self.ctx.my_id(), peer = node, "enable node");
            self.check_quorum(&mut shared);
        }
        shared.receivers_connected += 1;
        if shared.receivers_connected >= shared.live_nodes.saturating_sub(1)
            && shared.status == ClusterStatus::Connected
        {
            let reachable = shared.all_nodes - shared.connectivity_mask.count();
            let target = if shared.live_nodes >= shared.quorum() && reachable >= shared.quorum()
            {
                ClusterStatus::Online
            } else {
                ClusterStatus::InMinority
            };
            self.ctx.switch_status(&mut shared, target);
            self.ctx.bump_config_changes(&mut shared);
        }
    }

    /// Non-recoverable local error: log and step out of service; peers will
    /// disable this node via the watchdog.
    pub fn out_of_service(&self, reason: &str) {
        tracing::error!(node = self.ctx.my_id(), reason, "non-recoverable error");
        let mut shared = self.ctx.shared_mut();
        self.ctx.switch_status(&mut shared, ClusterStatus::OutOfService);
        self.ctx.bump_config_changes(&mut shared);
    }
}
