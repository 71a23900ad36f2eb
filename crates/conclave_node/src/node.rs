//! Node runtime: wires the commit core to the host engine, the replication
//! links and the background tasks, and exposes the session and
//! administrative surfaces.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use conclave_core::deadlock::{find_cycle, pick_local_victim, LockGraph};
use conclave_core::coordinator::PreparedOutcome;
use conclave_core::{
    lock_graph_key, Arbiter, ArbiterMessage, ClusterConfig, ClusterStatus, CommitError,
    CommitKind, Coordinator, Csn, CurrentTxn, Gtid, Lsn, MemberAddr, NodeContext, NodeId,
    RecoveryController, ReplFrame, TupleData, VisibilityService, Xid, XidStatus, INVALID_CSN,
    MEMBERS_KEY,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::configstore::MemoryConfigStore;
use crate::engine::MemoryEngine;
use crate::locks::LockTable;
use crate::replication::{encode_entry, entry_shippable, CommitInfo, LogEntry, ReplLog, StreamBatch};
use crate::transport::{FaultInjector, LocalArbiter, LocalArbiterHub};

/// Transaction isolation level requested by a session. Distributed
/// transactions run under snapshot isolation; everything else is rejected
/// at BEGIN.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "read committed",
            IsolationLevel::RepeatableRead => "repeatable read",
            IsolationLevel::Serializable => "serializable",
        }
    }
}

/// Snapshot of the cluster-wide state for `get_cluster_state`.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterStateInfo {
    pub node_id: NodeId,
    pub status: String,
    pub disabled_mask: u64,
    pub connectivity_mask: u64,
    pub live_nodes: usize,
    pub all_nodes: usize,
    pub last_csn: Csn,
    pub oldest_xid: Xid,
    pub config_changes: u64,
    pub active_transactions: u64,
    pub recovery_slot: Option<NodeId>,
}

/// Per-peer state for `get_nodes_state`.
#[derive(Clone, Debug, Serialize)]
pub struct NodeStateInfo {
    pub node_id: NodeId,
    pub disabled: bool,
    pub receiver_connected: bool,
    pub last_heartbeat: u64,
    pub oldest_snapshot: Csn,
    pub flush_position: Lsn,
}

pub struct Node {
    pub(crate) ctx: Arc<NodeContext>,
    coordinator: Arc<Coordinator>,
    arbiter: Arc<Arbiter>,
    recovery: Arc<RecoveryController>,
    visibility: VisibilityService,
    engine: Arc<MemoryEngine>,
    locks: Arc<LockTable>,
    log: Arc<ReplLog>,
    store: Arc<dyn conclave_core::ConfigStore>,
    hub: Arc<LocalArbiterHub>,
    faults: Arc<FaultInjector>,
    members: RwLock<Vec<MemberAddr>>,
    peers: RwLock<HashMap<NodeId, Weak<Node>>>,
    apply_tx: Mutex<HashMap<NodeId, mpsc::UnboundedSender<StreamBatch>>>,
    origin_progress: RwLock<HashMap<NodeId, Lsn>>,
    apply_permits: Arc<Semaphore>,
    dropped_slots: RwLock<HashSet<NodeId>>,
    /// Recovering peers that claimed this node as their donor.
    recovery_sessions: RwLock<HashSet<NodeId>>,
    external_inbox: Mutex<Option<mpsc::UnboundedReceiver<(NodeId, ArbiterMessage)>>>,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    gc_ticks: AtomicU64,
}

impl Node {
    pub fn new(
        cfg: ClusterConfig,
        hub: Arc<LocalArbiterHub>,
        faults: Arc<FaultInjector>,
        store: Arc<MemoryConfigStore>,
    ) -> Arc<Self> {
        Self::with_store(cfg, hub, faults, store)
    }

    /// Node wired to the in-process arbiter hub.
    pub fn with_store(
        cfg: ClusterConfig,
        hub: Arc<LocalArbiterHub>,
        faults: Arc<FaultInjector>,
        store: Arc<dyn conclave_core::ConfigStore>,
    ) -> Arc<Self> {
        let transport = LocalArbiter::new(hub.clone(), cfg.node_id);
        Self::build(cfg, hub, faults, store, transport, None)
    }

    /// Node with an externally provided arbiter channel (e.g. TCP): `inbox`
    /// receives the frames a companion server task decoded.
    pub fn with_arbiter_transport(
        cfg: ClusterConfig,
        hub: Arc<LocalArbiterHub>,
        faults: Arc<FaultInjector>,
        store: Arc<dyn conclave_core::ConfigStore>,
        transport: Arc<dyn conclave_core::ArbiterTransport>,
        inbox: mpsc::UnboundedReceiver<(NodeId, ArbiterMessage)>,
    ) -> Arc<Self> {
        Self::build(cfg, hub, faults, store, transport, Some(inbox))
    }

    fn build(
        cfg: ClusterConfig,
        hub: Arc<LocalArbiterHub>,
        faults: Arc<FaultInjector>,
        store: Arc<dyn conclave_core::ConfigStore>,
        transport: Arc<dyn conclave_core::ArbiterTransport>,
        inbox: Option<mpsc::UnboundedReceiver<(NodeId, ArbiterMessage)>>,
    ) -> Arc<Self> {
        let members = cfg.members.clone();
        let workers = cfg.worker_pool_size.max(1);
        let ctx = NodeContext::new(cfg);
        let coordinator = Coordinator::new(ctx.clone(), transport.clone());
        let recovery = RecoveryController::new(ctx.clone());
        let arbiter = Arbiter::new(
            ctx.clone(),
            transport,
            store.clone(),
            coordinator.clone(),
            recovery.clone(),
        );
        let visibility = VisibilityService::new(ctx.clone());
        Arc::new(Self {
            ctx,
            coordinator,
            arbiter,
            recovery,
            visibility,
            engine: MemoryEngine::new(),
            locks: LockTable::new(),
            log: Arc::new(ReplLog::new()),
            store,
            hub,
            faults,
            members: RwLock::new(members),
            peers: RwLock::new(HashMap::new()),
            apply_tx: Mutex::new(HashMap::new()),
            origin_progress: RwLock::new(HashMap::new()),
            apply_permits: Arc::new(Semaphore::new(workers)),
            dropped_slots: RwLock::new(HashSet::new()),
            recovery_sessions: RwLock::new(HashSet::new()),
            external_inbox: Mutex::new(inbox),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            gc_ticks: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> NodeId {
        self.ctx.my_id()
    }

    pub fn status(&self) -> ClusterStatus {
        self.ctx.status()
    }

    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        let me = self.id();
        self.members
            .read()
            .unwrap()
            .iter()
            .map(|m| m.node_id)
            .filter(|id| *id != me)
            .collect()
    }

    fn peer_link(&self, node: NodeId) -> Option<Arc<Node>> {
        self.peers.read().unwrap().get(&node)?.upgrade()
    }

    /// Wire the in-process replication links.
    pub fn link_peers(&self, nodes: &[Arc<Node>]) {
        let mut peers = self.peers.write().unwrap();
        for node in nodes {
            if node.id() != self.id() {
                peers.insert(node.id(), Arc::downgrade(node));
            }
        }
    }

    /// Spawn the background tasks of this node.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);

        let inbox = match self.external_inbox.lock().unwrap().take() {
            Some(inbox) => {
                // Keep the hub registration for incarnation tracking even
                // when frames arrive over an external channel.
                let _ = self.hub.register(self.id());
                inbox
            }
            None => self.hub.register(self.id()),
        };
        let mut tasks = self.tasks.lock().unwrap();

        tasks.push(tokio::spawn(
            self.clone().run_dispatch(inbox, shutdown_rx.clone()),
        ));
        let vis = self.visibility.clone();
        tasks.push(tokio::spawn(self.arbiter.clone().run_heartbeat(
            move || vis.local_oldest_snapshot(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(
            self.arbiter.clone().run_watchdog(shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(
            self.clone().run_deadlock_detector(shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(self.clone().run_gc_loop(shutdown_rx.clone())));
        tasks.push(tokio::spawn(
            self.clone().run_slot_police(shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(
            self.clone().run_recovery_bootstrap(shutdown_rx.clone()),
        ));

        let mut queues = self.apply_tx.lock().unwrap();
        for peer in self.peer_ids() {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(peer, tx);
            tasks.push(tokio::spawn(
                self.clone().run_applier(peer, rx, shutdown_rx.clone()),
            ));
            tasks.push(tokio::spawn(
                self.clone().run_sender(peer, shutdown_rx.clone()),
            ));
        }
    }

    /// Declare boot complete: receivers are attached, the node goes online.
    pub fn finish_boot(&self) {
        {
            let mut shared = self.ctx.shared_mut();
            self.ctx.switch_status(&mut shared, ClusterStatus::Connected);
        }
        for peer in self.peer_ids() {
            self.arbiter.on_receiver_started(peer);
        }
        let mut shared = self.ctx.shared_mut();
        if shared.live_nodes <= 1 && shared.status == ClusterStatus::Connected {
            self.ctx.switch_status(&mut shared, ClusterStatus::Online);
        }
    }

    /// Stop every background task; the node keeps its state and can be
    /// restarted into recovery.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        self.hub.unregister(self.id());
        let mut tasks = self.tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
        self.apply_tx.lock().unwrap().clear();
    }

    /// Restart after a stop: the node re-joins through recovery.
    pub fn restart(self: &Arc<Self>) {
        {
            let mut shared = self.ctx.shared_mut();
            shared.node_locker_mask = Default::default();
            shared.sender_locker_mask = Default::default();
            shared.lockers = 0;
            shared.receivers_connected = 0;
            for record in shared.nodes.iter_mut() {
                record.last_heartbeat = 0;
                record.receiver_connected = false;
            }
        }
        // In-memory row locks do not survive a crash.
        self.locks.reset();
        self.recovery.start_recovery();
        self.start();
    }

    // ----- message dispatch -----

    async fn run_dispatch(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<(NodeId, ArbiterMessage)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let msg = tokio::select! {
                m = inbox.recv() => m,
                _ = shutdown.changed() => return,
            };
            let Some((_from, msg)) = msg else { return };
            match msg {
                ArbiterMessage::Heartbeat {
                    node,
                    time: _,
                    connectivity,
                    last_csn,
                    oldest_snapshot,
                } => {
                    self.arbiter
                        .on_heartbeat(node, connectivity, last_csn, oldest_snapshot);
                }
                ArbiterMessage::Prepare { gid, gtid, csn } => {
                    self.coordinator.handle_prepare_request(&gid, gtid, csn).await;
                }
                ArbiterMessage::Ready { gid, node, csn } => {
                    self.coordinator.handle_ready(&gid, node, csn);
                }
                ArbiterMessage::Aborted { gid, node } => {
                    self.coordinator.handle_aborted(&gid, node);
                }
                ArbiterMessage::Commit { gid, csn } => {
                    self.finalize_commit(&gid, csn);
                }
                ArbiterMessage::Abort { gid } => {
                    self.finalize_abort(&gid);
                }
            }
        }
    }

    fn finalize_commit(&self, gid: &str, csn: Csn) {
        if let Some(xid) = self.coordinator.commit_prepared(gid, csn) {
            self.engine.mark_committed(xid);
            self.locks.release_all(xid);
        }
    }

    fn finalize_abort(&self, gid: &str) {
        if let Some(xid) = self.coordinator.abort_prepared(gid) {
            self.engine.rollback_xid(xid);
            self.locks.release_all(xid);
        }
    }

    // ----- replication: sender side -----

    async fn run_sender(self: Arc<Self>, peer: NodeId, mut shutdown: watch::Receiver<bool>) {
        let mut pos: Lsn = self.ctx.shared().record(peer).flush_position;
        let mut seen_incarnation = 0u64;
        let idle = self.ctx.cfg.heartbeat_send_timeout;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let reachable = self.hub.is_registered(peer)
                && !self.faults.is_blocked(self.id(), peer)
                && !self.dropped_slots.read().unwrap().contains(&peer)
                && self.peer_link(peer).is_some();
            if !reachable {
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown.changed() => return,
                }
                continue;
            }
            // A restarted peer gets the stream replayed from its acked
            // position.
            let incarnation = self.hub.incarnation(peer);
            if incarnation != seen_incarnation {
                seen_incarnation = incarnation;
                pos = self.ctx.shared().record(peer).flush_position;
            }

            let recovery_mode = self.ctx.shared().disabled_mask.contains(peer);
            let donor_session = self.recovery_sessions.read().unwrap().contains(&peer);
            if recovery_mode && !donor_session {
                // A disabled peer that has not claimed us as its donor gets
                // nothing; its own donor feeds it a linear history.
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown.changed() => return,
                }
                continue;
            }
            let entries = self.log.read_from(pos);
            if entries.is_empty() {
                if recovery_mode
                    && self.recovery.recovery_caught_up(peer, pos, self.log.end_lsn())
                {
                    self.recovery_sessions.write().unwrap().remove(&peer);
                    // Quiet donor: nothing left to stream, signal catch-up
                    // with an empty keepalive batch.
                    if let Some(link) = self.peer_link(peer) {
                        let _ = link.deliver(StreamBatch {
                            sender: self.id(),
                            sender_lsn: pos,
                            origin: self.id(),
                            origin_end_lsn: 0,
                            frames: Vec::new(),
                            caught_up: true,
                        });
                    }
                }
                let wakeup = self.log.appended.notified();
                tokio::select! {
                    _ = wakeup => {}
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown.changed() => return,
                }
                continue;
            }

            for entry in entries {
                if *shutdown.borrow() {
                    return;
                }
                if !recovery_mode && entry.origin != self.id() {
                    pos = entry.end_lsn;
                    continue;
                }
                if recovery_mode && entry.origin == peer {
                    // The recoverer keeps its own history; never echo it.
                    pos = entry.end_lsn;
                    continue;
                }
                if !entry_shippable(&entry, recovery_mode) {
                    pos = entry.end_lsn;
                    continue;
                }
                let caught_up = recovery_mode
                    && self
                        .recovery
                        .recovery_caught_up(peer, entry.end_lsn, self.log.end_lsn());
                if caught_up {
                    self.recovery_sessions.write().unwrap().remove(&peer);
                }
                let batch = StreamBatch {
                    sender: self.id(),
                    sender_lsn: entry.end_lsn,
                    origin: entry.origin,
                    origin_end_lsn: entry.origin_end_lsn,
                    frames: encode_entry(&entry, caught_up),
                    caught_up,
                };
                let Some(link) = self.peer_link(peer) else { break };
                match link.deliver(batch) {
                    Ok(()) => pos = entry.end_lsn,
                    Err(err) => {
                        tracing::debug!(
                            node = self.id(),
                            peer,
                            error = %err,
                            "replication delivery failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Receiver-side entry point: enqueue a batch for the per-stream
    /// applier.
    pub fn deliver(&self, batch: StreamBatch) -> anyhow::Result<()> {
        if !self.is_running() {
            anyhow::bail!("node {} is down", self.id());
        }
        if self.faults.is_blocked(batch.sender, self.id()) {
            anyhow::bail!("link {} -> {} is partitioned", batch.sender, self.id());
        }
        let queues = self.apply_tx.lock().unwrap();
        let Some(tx) = queues.get(&batch.sender) else {
            anyhow::bail!("no stream from node {}", batch.sender);
        };
        tx.send(batch)
            .map_err(|_| anyhow::anyhow!("applier for the stream is gone"))
    }

    fn ack_stream(&self, sender: NodeId, lsn: Lsn) {
        if let Some(peer) = self.peer_link(sender) {
            peer.record_flush(self.id(), lsn);
        }
    }

    /// Sender-side slot bookkeeping: the receiver confirmed everything up
    /// to `lsn` durable.
    pub fn record_flush(&self, receiver: NodeId, lsn: Lsn) {
        let mut shared = self.ctx.shared_mut();
        let record = shared.record_mut(receiver);
        if lsn > record.flush_position {
            record.flush_position = lsn;
        }
    }

    // ----- replication: applier side -----

    async fn run_applier(
        self: Arc<Self>,
        sender: NodeId,
        mut rx: mpsc::UnboundedReceiver<StreamBatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let batch = tokio::select! {
                b = rx.recv() => match b { Some(b) => b, None => return },
                _ = shutdown.changed() => return,
            };
            // During recovery only the donor stream may apply; other
            // streams stay parked so the node sees a linear history.
            loop {
                let (status, slot) = {
                    let shared = self.ctx.shared();
                    (shared.status, shared.recovery_slot)
                };
                if status != ClusterStatus::Recovery || slot == Some(sender) {
                    break;
                }
                if *shutdown.borrow() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let Ok(permit) = self.apply_permits.clone().acquire_owned().await else {
                return;
            };
            self.apply_batch(sender, batch).await;
            drop(permit);
        }
    }

    async fn apply_batch(self: &Arc<Self>, sender: NodeId, batch: StreamBatch) {
        let (status, slot) = {
            let shared = self.ctx.shared();
            (shared.status, shared.recovery_slot)
        };
        let in_recovery = status == ClusterStatus::Recovery && slot == Some(sender);

        if batch.frames.is_empty() {
            if batch.caught_up && in_recovery {
                self.finish_recovery().await;
            }
            self.ack_stream(sender, batch.sender_lsn);
            return;
        }

        // Per-origin dedup: forwarded and direct copies of the same
        // transaction coexist after recovery.
        let progress = self
            .origin_progress
            .read()
            .unwrap()
            .get(&batch.origin)
            .copied()
            .unwrap_or(0);
        if batch.origin_end_lsn != 0 && batch.origin_end_lsn <= progress {
            self.ack_stream(sender, batch.sender_lsn);
            return;
        }

        let mut txn: Option<CurrentTxn> = None;
        let mut relation: Option<String> = None;
        let mut aborted = false;
        let mut caught_up = batch.caught_up;
        let mut row_frames: Vec<Vec<u8>> = Vec::new();
        let mut snapshot_csn = INVALID_CSN;

        for raw in &batch.frames {
            let frame = match ReplFrame::decode(raw) {
                Ok(frame) => frame,
                Err(err) => {
                    // A corrupt stream is a non-recoverable local error.
                    self.arbiter
                        .out_of_service(&format!("replication stream corrupted: {err:#}"));
                    aborted = true;
                    break;
                }
            };
            match frame {
                ReplFrame::Begin {
                    origin,
                    xid,
                    snapshot,
                } => {
                    snapshot_csn = snapshot;
                    txn = Some(self.coordinator.join_remote(
                        Gtid::new(origin, xid),
                        snapshot,
                        in_recovery,
                    ));
                }
                ReplFrame::Relation { schema: _, name } => {
                    self.engine.create_table(&name);
                    relation = Some(name);
                    row_frames.push(raw.clone());
                }
                ReplFrame::Insert { new_tuple } => {
                    if aborted {
                        continue;
                    }
                    if let Err(err) = self.apply_insert(&txn, &relation, &new_tuple).await {
                        self.apply_conflict(&mut txn, in_recovery, err).await;
                        aborted = true;
                    } else {
                        row_frames.push(raw.clone());
                    }
                }
                ReplFrame::Update { key, new_tuple } => {
                    if aborted {
                        continue;
                    }
                    if let Err(err) = self
                        .apply_update(&txn, &relation, key.as_ref(), &new_tuple)
                        .await
                    {
                        self.apply_conflict(&mut txn, in_recovery, err).await;
                        aborted = true;
                    } else {
                        row_frames.push(raw.clone());
                    }
                }
                ReplFrame::Delete { key } => {
                    if aborted {
                        continue;
                    }
                    if let Err(err) = self.apply_delete(&txn, &relation, &key).await {
                        self.apply_conflict(&mut txn, in_recovery, err).await;
                        aborted = true;
                    } else {
                        row_frames.push(raw.clone());
                    }
                }
                ReplFrame::Commit {
                    kind,
                    caught_up: flagged,
                    commit_time,
                    csn,
                    gid,
                    ..
                } => {
                    caught_up |= flagged;
                    match kind {
                        CommitKind::Prepare => {
                            let gid = gid.unwrap_or_default();
                            if !aborted {
                                if let Some(txn) = txn.as_mut() {
                                    match self
                                        .coordinator
                                        .prepared_remote(txn, &gid, in_recovery)
                                        .await
                                    {
                                        PreparedOutcome::InDoubt => {}
                                        PreparedOutcome::AlreadyCommitted => {
                                            self.engine.mark_committed(txn.xid);
                                            self.locks.release_all(txn.xid);
                                        }
                                        PreparedOutcome::AlreadyAborted => {
                                            self.engine.rollback_xid(txn.xid);
                                            self.locks.release_all(txn.xid);
                                        }
                                    }
                                    self.log.append(
                                        LogEntry {
                                            origin: txn.gtid.node,
                                            origin_xid: txn.gtid.xid,
                                            snapshot: snapshot_csn,
                                            origin_end_lsn: batch.origin_end_lsn,
                                            start_lsn: 0,
                                            end_lsn: 0,
                                            row_frames: std::mem::take(&mut row_frames),
                                            commit: CommitInfo {
                                                kind: CommitKind::Prepare,
                                                commit_time,
                                                csn: None,
                                                gid: Some(gid),
                                            },
                                        },
                                        false,
                                    );
                                }
                            }
                        }
                        CommitKind::CommitPrepared => {
                            let gid = gid.unwrap_or_default();
                            let final_csn = csn.unwrap_or(INVALID_CSN);
                            self.finalize_commit(&gid, final_csn);
                            self.log.append(
                                LogEntry {
                                    origin: batch.origin,
                                    origin_xid: 0,
                                    snapshot: snapshot_csn.max(1),
                                    origin_end_lsn: batch.origin_end_lsn,
                                    start_lsn: 0,
                                    end_lsn: 0,
                                    row_frames: Vec::new(),
                                    commit: CommitInfo {
                                        kind: CommitKind::CommitPrepared,
                                        commit_time,
                                        csn: Some(final_csn),
                                        gid: Some(gid),
                                    },
                                },
                                false,
                            );
                        }
                        CommitKind::AbortPrepared => {
                            let gid = gid.unwrap_or_default();
                            self.finalize_abort(&gid);
                            self.log.append(
                                LogEntry {
                                    origin: batch.origin,
                                    origin_xid: 0,
                                    snapshot: snapshot_csn.max(1),
                                    origin_end_lsn: batch.origin_end_lsn,
                                    start_lsn: 0,
                                    end_lsn: 0,
                                    row_frames: Vec::new(),
                                    commit: CommitInfo {
                                        kind: CommitKind::AbortPrepared,
                                        commit_time,
                                        csn: None,
                                        gid: Some(gid),
                                    },
                                },
                                false,
                            );
                        }
                        CommitKind::Commit => {
                            // One-phase commits only appear on forwarded
                            // recovery streams.
                            if let Some(txn) = txn.as_ref() {
                                let mut registry = self.ctx.registry_mut();
                                let csn = self.ctx.clock.assign_csn();
                                let ts = registry.create(txn.xid);
                                ts.gtid = txn.gtid;
                                ts.snapshot = txn.snapshot;
                                ts.status = XidStatus::Committed;
                                ts.csn = csn;
                                registry.enqueue(txn.xid);
                                drop(registry);
                                self.engine.mark_committed(txn.xid);
                            }
                        }
                    }
                }
            }
        }

        if batch.origin_end_lsn != 0 {
            self.origin_progress
                .write()
                .unwrap()
                .insert(batch.origin, batch.origin_end_lsn);
        }
        self.ack_stream(sender, batch.sender_lsn);
        if caught_up && in_recovery {
            self.finish_recovery().await;
        }
    }

    async fn apply_insert(
        &self,
        txn: &Option<CurrentTxn>,
        relation: &Option<String>,
        tuple: &TupleData,
    ) -> anyhow::Result<()> {
        let (txn, relation) = Self::applier_target(txn, relation)?;
        let (key, value) = tuple_kv(tuple)?;
        self.lock_for(txn, relation, &key).await?;
        self.engine.insert(relation, &key, &value, txn.xid)
    }

    async fn apply_update(
        &self,
        txn: &Option<CurrentTxn>,
        relation: &Option<String>,
        key: Option<&TupleData>,
        tuple: &TupleData,
    ) -> anyhow::Result<()> {
        let (txn, relation) = Self::applier_target(txn, relation)?;
        let (new_key, value) = tuple_kv(tuple)?;
        let key = match key {
            Some(key) => tuple_key(key)?,
            None => new_key.clone(),
        };
        self.lock_for(txn, relation, &key).await?;
        self.engine.update(relation, &key, &value, txn.xid)
    }

    async fn apply_delete(
        &self,
        txn: &Option<CurrentTxn>,
        relation: &Option<String>,
        key: &TupleData,
    ) -> anyhow::Result<()> {
        let (txn, relation) = Self::applier_target(txn, relation)?;
        let key = tuple_key(key)?;
        self.lock_for(txn, relation, &key).await?;
        self.engine.delete(relation, &key, txn.xid)
    }

    fn applier_target<'a>(
        txn: &'a Option<CurrentTxn>,
        relation: &'a Option<String>,
    ) -> anyhow::Result<(&'a CurrentTxn, &'a str)> {
        let txn = txn
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("row change before BEGIN"))?;
        let relation = relation
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("row change before RELATION"))?;
        Ok((txn, relation))
    }

    async fn lock_for(&self, txn: &CurrentTxn, relation: &str, key: &[u8]) -> anyhow::Result<()> {
        let ctx = self.ctx.clone();
        let gid = if txn.gid.is_empty() {
            txn.gtid.gid()
        } else {
            txn.gid.clone()
        };
        let xid = txn.xid;
        self.locks
            .acquire(relation, key, txn.xid, txn.gtid, move || {
                let registry = ctx.registry.read().unwrap();
                registry
                    .get(xid)
                    .map(|ts| ts.status == XidStatus::Aborted)
                    .unwrap_or(false)
                    || registry.gid_status(&gid) == Some(XidStatus::Aborted)
            })
            .await
    }

    async fn apply_conflict(
        &self,
        txn: &mut Option<CurrentTxn>,
        in_recovery: bool,
        err: anyhow::Error,
    ) {
        let Some(txn) = txn.as_mut() else { return };
        tracing::warn!(
            node = self.id(),
            gtid = %txn.gtid,
            error = %err,
            "apply conflict, aborting transaction"
        );
        self.coordinator.abort_remote(txn, in_recovery).await;
        self.engine.rollback_xid(txn.xid);
        self.locks.release_all(txn.xid);
    }

    async fn finish_recovery(self: &Arc<Self>) {
        self.recovery.recovery_completed();
        let disabled = {
            let shared = self.ctx.shared();
            shared.disabled_mask
        };
        for peer in self.peer_ids() {
            if disabled.contains(peer) {
                continue;
            }
            // Our receivers re-attach in normal mode.
            self.arbiter.on_receiver_started(peer);
            // The peers' receivers from us reconnect as our senders unpark.
            if let Some(link) = self.peer_link(peer) {
                link.arbiter.on_receiver_started(self.id());
            }
        }
    }

    /// Recoverer side of the donor handshake: while in recovery with no
    /// donor claimed, pick the lowest reachable peer, claim the recovery
    /// slot and ask the donor for a recovery-mode stream.
    async fn run_recovery_bootstrap(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            let needs_donor = {
                let shared = self.ctx.shared();
                shared.status == ClusterStatus::Recovery && shared.recovery_slot.is_none()
            };
            if !needs_donor {
                continue;
            }
            let me = self.id();
            let mut candidates = self.peer_ids();
            candidates.sort_unstable();
            for peer in candidates {
                if !self.hub.is_registered(peer) || self.faults.is_blocked(me, peer) {
                    continue;
                }
                let Some(link) = self.peer_link(peer) else { continue };
                if self.recovery.claim_recovery_slot(peer) {
                    link.begin_recovery_session(me);
                    break;
                }
            }
        }
    }

    /// Donor side of the handshake: a recovering peer announced it will
    /// pull its history from us. Treat it as disabled so the stream runs in
    /// recovery mode and the catch-up thresholds apply.
    pub fn begin_recovery_session(&self, recoverer: NodeId) {
        {
            let mut shared = self.ctx.shared_mut();
            if !shared.disabled_mask.contains(recoverer) {
                tracing::warn!(
                    node = self.id(),
                    recoverer,
                    "peer requested recovery while not marked disabled"
                );
                self.arbiter.disable_node(&mut shared, recoverer);
                self.arbiter.check_quorum(&mut shared);
            }
        }
        self.recovery_sessions.write().unwrap().insert(recoverer);
    }

    // ----- deadlock detection -----

    async fn run_deadlock_detector(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.ctx.cfg.deadlock_timeout / 2;
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(50)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            self.deadlock_tick();
        }
    }

    fn deadlock_tick(&self) {
        let me = self.id();
        let local = LockGraph {
            edges: self.locks.wait_edges(),
        };
        if let Err(err) = self.store.put(&lock_graph_key(me), &local.encode()) {
            tracing::warn!(node = me, error = %err, "lock graph publication failed");
        }
        let mut union = local;
        let all_nodes = self.ctx.shared().all_nodes;
        for node in 1..=all_nodes as NodeId {
            if node == me {
                continue;
            }
            // A missing or unreadable peer graph contributes no edges; it
            // never manufactures a victim.
            if let Ok(Some(blob)) = self.store.get(&lock_graph_key(node)) {
                if let Ok(graph) = LockGraph::decode(&blob) {
                    union.merge(&graph);
                }
            }
        }

        if let Some(cycle) = find_cycle(&union.edges) {
            if let Some(victim) = pick_local_victim(&cycle, me) {
                tracing::warn!(node = me, victim = %victim, "distributed deadlock, aborting victim");
                self.abort_deadlock_victim(victim);
            }
            return;
        }

        // Implicit deadlock: an applier has been stuck on a row lock well
        // past the deadlock timeout with no cycle visible (a peer graph may
        // be missing). Abort the youngest participant if it is ours. The
        // margin keeps cycle detection as the primary path.
        let stall = self.locks.longest_wait().unwrap_or_default();
        if stall > self.ctx.cfg.deadlock_timeout * 4 {
            let participants = self.locks.participants();
            let remote_waiter_stuck = self
                .locks
                .wait_edges()
                .iter()
                .any(|edge| edge.waiter.node != me);
            if remote_waiter_stuck {
                if let Some(victim) = pick_local_victim(&participants, me) {
                    tracing::warn!(node = me, victim = %victim, "apply stall, treating as deadlock");
                    self.abort_deadlock_victim(victim);
                }
            }
        }
    }

    fn abort_deadlock_victim(&self, victim: Gtid) {
        self.coordinator.abort_victim(victim.xid);
        self.engine.rollback_xid(victim.xid);
        self.locks.release_all(victim.xid);
    }

    // ----- GC / vacuum -----

    async fn run_gc_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = (self.ctx.cfg.vacuum_delay / 2).max(Duration::from_millis(200));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            self.run_gc();
        }
    }

    fn run_gc(&self) {
        let bound = {
            let registry = self.ctx.registry();
            registry.oldest_active_xid()
        }
        .unwrap_or_else(|| self.ctx.current_xid());
        self.visibility.oldest_xmin(bound);
        // A committed version forgotten by the state table is older than
        // every live snapshot; anything it supersedes is unreachable.
        self.engine
            .vacuum(|xid| self.ctx.registry().get(xid).is_none());
    }

    // ----- slot policing -----

    async fn run_slot_police(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ctx.cfg.heartbeat_recv_timeout);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            let slots: Vec<(NodeId, Lsn)> = {
                let shared = self.ctx.shared();
                self.peer_ids()
                    .into_iter()
                    .map(|peer| (peer, shared.record(peer).flush_position))
                    .collect()
            };
            for node in self.recovery.slots_to_drop(&slots, self.log.end_lsn()) {
                tracing::warn!(
                    node = self.id(),
                    peer = node,
                    "slot lag exceeds max-recovery-lag, dropping slot"
                );
                self.dropped_slots.write().unwrap().insert(node);
            }
        }
    }

    // ----- sessions -----

    /// Open a client session under snapshot isolation. Periodically
    /// piggybacks a GC sweep, the way the host engine runs its vacuum
    /// bookkeeping on transaction start.
    pub fn begin(self: &Arc<Self>) -> Result<Session, CommitError> {
        self.begin_with_isolation(IsolationLevel::RepeatableRead)
    }

    pub fn begin_with_isolation(
        self: &Arc<Self>,
        isolation: IsolationLevel,
    ) -> Result<Session, CommitError> {
        if isolation != IsolationLevel::RepeatableRead {
            return Err(CommitError::UnsupportedIsolation(isolation.as_str()));
        }
        let ticks = self.gc_ticks.fetch_add(1, Ordering::Relaxed);
        if ticks % self.ctx.cfg.gc_period.max(1) == self.ctx.cfg.gc_period.max(1) - 1 {
            self.run_gc();
        }
        let txn = self.coordinator.begin()?;
        Ok(Session {
            node: self.clone(),
            txn,
            frames: Vec::new(),
            last_relation: None,
            subxids: Vec::new(),
            current_sub: None,
            had_local_writes: false,
            finished: false,
        })
    }

    fn append_outcome_entry(&self, txn: &CurrentTxn, kind: CommitKind, csn: Option<Csn>) {
        self.log.append(
            LogEntry {
                origin: self.id(),
                origin_xid: txn.xid,
                snapshot: txn.snapshot,
                origin_end_lsn: 0,
                start_lsn: 0,
                end_lsn: 0,
                row_frames: Vec::new(),
                commit: CommitInfo {
                    kind,
                    commit_time: self.ctx.clock.now(),
                    csn,
                    gid: Some(txn.gid.clone()),
                },
            },
            true,
        );
    }

    /// First phase: replicate the rows, request votes, wait for every
    /// enabled participant. On failure the transaction is aborted
    /// cluster-wide before the error is returned.
    async fn prepare_distributed(
        self: &Arc<Self>,
        txn: &mut CurrentTxn,
        subxids: &[Xid],
        frames: &[ReplFrame],
    ) -> Result<(), CommitError> {
        if let Err(err) = self.coordinator.pre_prepare(txn, subxids).await {
            self.rollback_writes(txn.xid, subxids);
            return Err(err);
        }
        let now = self.ctx.clock.now();
        self.log.append(
            LogEntry {
                origin: self.id(),
                origin_xid: txn.xid,
                snapshot: txn.snapshot,
                origin_end_lsn: 0,
                start_lsn: 0,
                end_lsn: 0,
                row_frames: frames.iter().map(|f| f.encode()).collect(),
                commit: CommitInfo {
                    kind: CommitKind::Prepare,
                    commit_time: now,
                    csn: None,
                    gid: Some(txn.gid.clone()),
                },
            },
            true,
        );
        self.coordinator.send_prepare_requests(txn).await;

        if let Err(err) = self.coordinator.wait_votes(txn).await {
            self.rollback_writes(txn.xid, subxids);
            self.append_outcome_entry(txn, CommitKind::AbortPrepared, None);
            self.coordinator.broadcast_outcome(txn, false).await;
            return Err(err);
        }
        Ok(())
    }

    /// Second phase: finalize with the maximum participant CSN and tell
    /// everyone.
    async fn commit_prepared_distributed(self: &Arc<Self>, txn: &mut CurrentTxn, subxids: &[Xid]) {
        self.coordinator.finish(txn, true);
        self.engine.mark_committed(txn.xid);
        for sub in subxids {
            self.engine.mark_committed(*sub);
        }
        self.append_outcome_entry(txn, CommitKind::CommitPrepared, Some(txn.csn));
        self.coordinator.broadcast_outcome(txn, true).await;
    }

    async fn commit_distributed(
        self: &Arc<Self>,
        txn: &mut CurrentTxn,
        subxids: &[Xid],
        frames: &[ReplFrame],
    ) -> Result<(), CommitError> {
        self.prepare_distributed(txn, subxids, frames).await?;
        self.commit_prepared_distributed(txn, subxids).await;
        Ok(())
    }

    /// Resolve a prepared transaction by its GID (COMMIT PREPARED / ABORT
    /// PREPARED), including transactions prepared before a restart.
    pub async fn finish_prepared_gid(
        self: &Arc<Self>,
        gid: &str,
        commit: bool,
    ) -> anyhow::Result<()> {
        let mut txn = {
            let registry = self.ctx.registry();
            let ts = registry
                .get_by_gid(gid)
                .ok_or_else(|| anyhow::anyhow!("prepared transaction {gid} not found"))?;
            anyhow::ensure!(
                matches!(ts.status, XidStatus::Unknown | XidStatus::InProgress),
                "transaction {gid} is already {}",
                ts.status
            );
            CurrentTxn {
                xid: ts.xid,
                gtid: ts.gtid,
                gid: gid.to_string(),
                snapshot: ts.snapshot,
                csn: ts.csn,
                is_replicated: false,
                is_distributed: true,
                contains_dml: true,
                is_prepared: true,
                status: ts.status,
            }
        };
        if commit {
            self.commit_prepared_distributed(&mut txn, &[]).await;
        } else {
            self.coordinator.finish(&mut txn, false);
            self.engine.rollback_xid(txn.xid);
            self.append_outcome_entry(&txn, CommitKind::AbortPrepared, None);
            self.coordinator.broadcast_outcome(&txn, false).await;
        }
        self.locks.release_all(txn.xid);
        Ok(())
    }

    /// GIDs of transactions currently prepared (in doubt) at this node.
    pub fn prepared_gids(&self) -> Vec<String> {
        let registry = self.ctx.registry();
        let mut gids: Vec<String> = registry
            .iter_fifo()
            .filter(|ts| ts.status == XidStatus::Unknown && !ts.gid.is_empty())
            .map(|ts| ts.gid.clone())
            .collect();
        gids.sort();
        gids.dedup();
        gids
    }

    fn commit_local(&self, txn: &CurrentTxn, subxids: &[Xid]) {
        let mut shared = self.ctx.shared_mut();
        let mut registry = self.ctx.registry_mut();
        let csn = self.ctx.clock.assign_csn();
        let ts = registry.create(txn.xid);
        ts.gtid = txn.gtid;
        ts.snapshot = txn.snapshot;
        ts.status = XidStatus::Committed;
        ts.csn = csn;
        ts.is_local = true;
        registry.enqueue(txn.xid);
        if !subxids.is_empty() {
            registry.add_subtransactions(txn.xid, subxids);
        }
        drop(registry);
        drop(shared);
        self.engine.mark_committed(txn.xid);
        for sub in subxids {
            self.engine.mark_committed(*sub);
        }
    }

    fn rollback_writes(&self, xid: Xid, subxids: &[Xid]) {
        self.engine.rollback_xid(xid);
        for sub in subxids {
            self.engine.rollback_xid(*sub);
        }
    }

    // ----- administrative operations -----

    pub fn get_cluster_state(&self) -> ClusterStateInfo {
        let shared = self.ctx.shared();
        ClusterStateInfo {
            node_id: self.id(),
            status: shared.status.to_string(),
            disabled_mask: shared.disabled_mask.raw(),
            connectivity_mask: shared.connectivity_mask.raw(),
            live_nodes: shared.live_nodes,
            all_nodes: shared.all_nodes,
            last_csn: self.ctx.clock.last_csn(),
            oldest_xid: shared.oldest_xid,
            config_changes: shared.config_changes,
            active_transactions: shared.active_transactions,
            recovery_slot: shared.recovery_slot,
        }
    }

    pub fn get_nodes_state(&self) -> Vec<NodeStateInfo> {
        let shared = self.ctx.shared();
        (1..=shared.all_nodes as NodeId)
            .map(|node| {
                let record = shared.record(node);
                NodeStateInfo {
                    node_id: node,
                    disabled: shared.disabled_mask.contains(node),
                    receiver_connected: record.receiver_connected,
                    last_heartbeat: record.last_heartbeat,
                    oldest_snapshot: record.oldest_snapshot,
                    flush_position: record.flush_position,
                }
            })
            .collect()
    }

    /// Add a node within the fixed `max_nodes` bound. The new node starts
    /// disabled and joins through recovery.
    pub fn add_node(&self, member: MemberAddr) -> anyhow::Result<()> {
        let mut members = self.members.write().unwrap();
        let mut shared = self.ctx.shared_mut();
        anyhow::ensure!(
            shared.all_nodes < self.ctx.cfg.max_nodes,
            "cluster is at max-nodes ({})",
            self.ctx.cfg.max_nodes
        );
        let next_id = shared.all_nodes as NodeId + 1;
        anyhow::ensure!(
            member.node_id == next_id,
            "node id {} is not the next free id {next_id}",
            member.node_id
        );
        shared.nodes.push(Default::default());
        shared.all_nodes += 1;
        shared.disabled_mask.set(member.node_id);
        members.push(member);
        self.ctx.bump_config_changes(&mut shared);
        let blob = serde_json::to_vec(&*members)?;
        self.store.put(MEMBERS_KEY, &blob)?;
        Ok(())
    }

    /// Permanently exclude a node.
    pub fn drop_node(&self, node: NodeId, drop_slot: bool) -> anyhow::Result<()> {
        {
            let mut shared = self.ctx.shared_mut();
            anyhow::ensure!(
                node >= 1 && (node as usize) <= shared.all_nodes,
                "node id {node} is out of range [1,{}]",
                shared.all_nodes
            );
            if !shared.disabled_mask.contains(node) {
                self.arbiter.disable_node(&mut shared, node);
                self.arbiter.check_quorum(&mut shared);
            }
        }
        if drop_slot {
            self.dropped_slots.write().unwrap().insert(node);
        }
        Ok(())
    }

    /// Re-create the replication slot for a disabled node so it can pull
    /// recovery from us again.
    pub fn recover_node(&self, node: NodeId) -> anyhow::Result<()> {
        let shared = self.ctx.shared();
        anyhow::ensure!(
            shared.disabled_mask.contains(node),
            "node {node} was not disabled"
        );
        drop(shared);
        self.dropped_slots.write().unwrap().remove(&node);
        Ok(())
    }

    /// Wait until `node`'s disabled state matches `enabled`.
    pub async fn poll_node(&self, node: NodeId, enabled: bool, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let disabled = self.ctx.shared().disabled_mask.contains(node);
            if disabled != enabled {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn create_table(&self, name: &str) {
        self.engine.create_table(name);
    }

    /// Exclude a table from replication; its writes stay node-local.
    pub fn make_table_local(&self, name: &str) {
        self.engine.make_local(name);
    }

    /// Union wait-for graph as currently visible from this node.
    pub fn dump_lock_graph(&self) -> LockGraph {
        let mut union = LockGraph {
            edges: self.locks.wait_edges(),
        };
        let all_nodes = self.ctx.shared().all_nodes;
        for node in 1..=all_nodes as NodeId {
            if node == self.id() {
                continue;
            }
            if let Ok(Some(blob)) = self.store.get(&lock_graph_key(node)) {
                if let Ok(graph) = LockGraph::decode(&blob) {
                    union.merge(&graph);
                }
            }
        }
        union
    }

    /// Testing hook: fail the next 2PC at the given phase (1..3).
    pub fn inject_2pc_error(&self, phase: u8) {
        self.ctx.shared_mut().inject_2pc_error = phase;
    }

    pub fn get_csn(&self) -> Csn {
        self.ctx.clock.last_csn()
    }

    pub fn get_snapshot(&self) -> Csn {
        self.ctx.clock.now()
    }
}

/// One client transaction against a node.
pub struct Session {
    node: Arc<Node>,
    txn: CurrentTxn,
    frames: Vec<ReplFrame>,
    last_relation: Option<String>,
    subxids: Vec<Xid>,
    current_sub: Option<Xid>,
    had_local_writes: bool,
    finished: bool,
}

impl Session {
    pub fn xid(&self) -> Xid {
        self.txn.xid
    }

    pub fn snapshot(&self) -> Csn {
        self.txn.snapshot
    }

    fn current_xid(&self) -> Xid {
        self.current_sub.unwrap_or(self.txn.xid)
    }

    fn own_xids(&self) -> Vec<Xid> {
        let mut xids = vec![self.txn.xid];
        xids.extend(self.subxids.iter().copied());
        if let Some(sub) = self.current_sub {
            xids.push(sub);
        }
        xids
    }

    fn push_row_frame(&mut self, table: &str, frame: ReplFrame) {
        if self.last_relation.as_deref() != Some(table) {
            self.frames.push(ReplFrame::Relation {
                schema: "public".to_string(),
                name: table.to_string(),
            });
            self.last_relation = Some(table.to_string());
        }
        self.frames.push(frame);
    }

    async fn lock_row(&self, table: &str, key: &[u8]) -> anyhow::Result<()> {
        let ctx = self.node.ctx.clone();
        let xid = self.txn.xid;
        self.node
            .locks
            .acquire(table, key, self.txn.xid, self.txn.gtid, move || {
                ctx.registry
                    .read()
                    .unwrap()
                    .get(xid)
                    .map(|ts| ts.status == XidStatus::Aborted)
                    .unwrap_or(false)
            })
            .await
    }

    pub async fn insert(&mut self, table: &str, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(!self.finished, "transaction already finished");
        if self.node.engine.is_local(table) {
            self.node.engine.insert(table, key, value, self.current_xid())?;
            self.had_local_writes = true;
            return Ok(());
        }
        self.lock_row(table, key).await?;
        self.node.engine.insert(table, key, value, self.current_xid())?;
        self.push_row_frame(
            table,
            ReplFrame::Insert {
                new_tuple: TupleData::text(&[key, value]),
            },
        );
        self.txn.contains_dml = true;
        Ok(())
    }

    pub async fn update(&mut self, table: &str, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(!self.finished, "transaction already finished");
        if self.node.engine.is_local(table) {
            self.node.engine.update(table, key, value, self.current_xid())?;
            self.had_local_writes = true;
            return Ok(());
        }
        self.lock_row(table, key).await?;
        self.node.engine.update(table, key, value, self.current_xid())?;
        self.push_row_frame(
            table,
            ReplFrame::Update {
                key: Some(TupleData::text(&[key])),
                new_tuple: TupleData::text(&[key, value]),
            },
        );
        self.txn.contains_dml = true;
        Ok(())
    }

    pub async fn delete(&mut self, table: &str, key: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(!self.finished, "transaction already finished");
        if self.node.engine.is_local(table) {
            self.node.engine.delete(table, key, self.current_xid())?;
            self.had_local_writes = true;
            return Ok(());
        }
        self.lock_row(table, key).await?;
        self.node.engine.delete(table, key, self.current_xid())?;
        self.push_row_frame(
            table,
            ReplFrame::Delete {
                key: TupleData::text(&[key]),
            },
        );
        self.txn.contains_dml = true;
        Ok(())
    }

    pub async fn select(&self, table: &str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.node
            .engine
            .read(
                table,
                key,
                self.txn.snapshot,
                &self.own_xids(),
                &self.node.visibility,
            )
            .await
            .map_err(Into::into)
    }

    /// Open a sub-transaction; subsequent writes belong to it until it is
    /// committed or rolled back.
    pub fn begin_subtxn(&mut self) -> anyhow::Result<Xid> {
        anyhow::ensure!(self.current_sub.is_none(), "sub-transaction already open");
        let sub = self.node.ctx.alloc_xid();
        self.current_sub = Some(sub);
        Ok(sub)
    }

    pub fn commit_subtxn(&mut self) -> anyhow::Result<()> {
        let sub = self
            .current_sub
            .take()
            .ok_or_else(|| anyhow::anyhow!("no open sub-transaction"))?;
        self.subxids.push(sub);
        Ok(())
    }

    pub fn rollback_subtxn(&mut self) -> anyhow::Result<()> {
        let sub = self
            .current_sub
            .take()
            .ok_or_else(|| anyhow::anyhow!("no open sub-transaction"))?;
        self.node.engine.rollback_xid(sub);
        self.node.locks.release_all(sub);
        Ok(())
    }

    /// Commit: local-only transactions finish without the cluster, anything
    /// that wrote a replicated table goes through two-phase commit.
    pub async fn commit(&mut self) -> Result<(), CommitError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if let Some(sub) = self.current_sub.take() {
            self.subxids.push(sub);
        }

        let result = if self.txn.contains_dml {
            let subxids = self.subxids.clone();
            let frames = std::mem::take(&mut self.frames);
            self.node
                .commit_distributed(&mut self.txn, &subxids, &frames)
                .await
        } else {
            if self.had_local_writes || !self.subxids.is_empty() {
                self.node.commit_local(&self.txn, &self.subxids);
            }
            Ok(())
        };
        self.release_everything();
        result
    }

    /// PREPARE TRANSACTION: run the first commit phase under an explicit
    /// GID and leave the transaction prepared. The session ends; the
    /// prepared transaction keeps its row locks until COMMIT PREPARED or
    /// ABORT PREPARED resolves it through the node handle.
    pub async fn prepare(mut self, gid: &str) -> Result<(), CommitError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if let Some(sub) = self.current_sub.take() {
            self.subxids.push(sub);
        }
        if !self.txn.contains_dml {
            if self.had_local_writes || !self.subxids.is_empty() {
                self.node.commit_local(&self.txn, &self.subxids);
            }
            self.release_everything();
            return Ok(());
        }
        self.txn.gid = gid.to_string();
        let subxids = self.subxids.clone();
        let frames = std::mem::take(&mut self.frames);
        let result = self
            .node
            .prepare_distributed(&mut self.txn, &subxids, &frames)
            .await;
        if result.is_err() {
            self.release_everything();
        }
        result
    }

    /// Abort the transaction and discard its writes.
    pub fn rollback(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        for xid in self.own_xids() {
            self.node.engine.rollback_xid(xid);
        }
        let mut shared = self.node.ctx.shared_mut();
        let mut registry = self.node.ctx.registry_mut();
        if registry.contains(self.txn.xid) {
            if let Some(ts) = registry.get_mut(self.txn.xid) {
                if ts.status != XidStatus::Aborted {
                    ts.status = XidStatus::Aborted;
                    if ts.counted {
                        ts.counted = false;
                        shared.active_transactions =
                            shared.active_transactions.saturating_sub(1);
                    }
                }
            }
            registry.adjust_subtransactions(self.txn.xid);
            if !self.txn.gid.is_empty() {
                registry.exchange_global_status(&self.txn.gid, XidStatus::Aborted);
            }
        }
        drop(registry);
        drop(shared);
        self.release_everything();
    }

    fn release_everything(&self) {
        for xid in self.own_xids() {
            self.node.locks.release_all(xid);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

fn tuple_kv(tuple: &TupleData) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    anyhow::ensure!(tuple.attrs.len() >= 2, "tuple is missing key or value");
    Ok((attr_bytes(&tuple.attrs[0])?, attr_bytes(&tuple.attrs[1])?))
}

fn tuple_key(tuple: &TupleData) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(!tuple.attrs.is_empty(), "key tuple is empty");
    attr_bytes(&tuple.attrs[0])
}

fn attr_bytes(attr: &conclave_core::AttrValue) -> anyhow::Result<Vec<u8>> {
    use conclave_core::AttrValue;
    match attr {
        AttrValue::Text(data) | AttrValue::Binary(data) | AttrValue::SendRecv(data) => {
            Ok(data.clone())
        }
        AttrValue::Null => Ok(Vec::new()),
        AttrValue::UnchangedToast => anyhow::bail!("unchanged TOAST attribute has no bytes"),
    }
}
