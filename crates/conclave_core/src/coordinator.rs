//! Two-phase commit coordinator and applier-side transaction control.
//!
//! Every distributed write is wrapped in PREPARE / COMMIT PREPARED. The
//! coordinator assigns the prepare CSN, fans the vote request out on the
//! arbiter channel, waits for every enabled participant, then broadcasts the
//! maximum of the returned CSNs as the final commit CSN. Participants apply
//! the replicated rows, move the transaction to `unknown` (in-doubt) at
//! prepare, and finalize on COMMIT/ABORT PREPARED, syncing their clock to
//! the final CSN.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time;

use crate::config::ClusterConfig;
use crate::context::NodeContext;
use crate::error::CommitError;
use crate::messages::ArbiterMessage;
use crate::types::{
    ArbiterTransport, ClusterStatus, Csn, Gtid, NodeId, Xid, XidStatus, INVALID_CSN,
};

/// Per-backend transaction descriptor, reset between transactions.
#[derive(Clone, Debug)]
pub struct CurrentTxn {
    pub xid: Xid,
    pub gtid: Gtid,
    pub gid: String,
    pub snapshot: Csn,
    pub csn: Csn,
    /// Arrived through the replication stream rather than a local client.
    pub is_replicated: bool,
    /// Must reach the rest of the cluster.
    pub is_distributed: bool,
    /// Issued at least one replicated write.
    pub contains_dml: bool,
    pub is_prepared: bool,
    pub status: XidStatus,
}

impl CurrentTxn {
    fn local(xid: Xid, node: NodeId, snapshot: Csn) -> Self {
        Self {
            xid,
            gtid: Gtid::new(node, xid),
            gid: String::new(),
            snapshot,
            csn: INVALID_CSN,
            is_replicated: false,
            is_distributed: true,
            contains_dml: false,
            is_prepared: false,
            status: XidStatus::InProgress,
        }
    }
}

/// Minimum/maximum back-off while waiting out the cluster recovery lock.
const MIN_LOCK_WAIT: Duration = Duration::from_millis(1);
const MAX_LOCK_WAIT: Duration = Duration::from_millis(100);

/// Result of a participant-side PREPARE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreparedOutcome {
    /// Prepared and waiting for the coordinator's decision.
    InDoubt,
    /// The commit notification arrived first; finalized as committed.
    AlreadyCommitted,
    /// The abort arrived first; finalized as aborted.
    AlreadyAborted,
}

/// Per-transaction PREPARE timeout: proportional to the transaction's own
/// prepare latency, floored by the configured minimum.
pub fn prepare_timeout(cfg: &ClusterConfig, snapshot: Csn, prepare_csn: Csn) -> Duration {
    let latency_us = prepare_csn.saturating_sub(snapshot);
    let scaled = Duration::from_micros(latency_us.saturating_mul(cfg.prepare_ratio) / 100);
    scaled.max(cfg.min_2pc_timeout)
}

pub struct Coordinator {
    ctx: Arc<NodeContext>,
    transport: Arc<dyn ArbiterTransport>,
}

impl Coordinator {
    pub fn new(ctx: Arc<NodeContext>, transport: Arc<dyn ArbiterTransport>) -> Arc<Self> {
        Arc::new(Self { ctx, transport })
    }

    /// Start a local user transaction: gate on cluster status and take the
    /// snapshot CSN.
    pub fn begin(&self) -> Result<CurrentTxn, CommitError> {
        let status = self.ctx.status();
        match status {
            ClusterStatus::Online => {}
            ClusterStatus::InMinority => return Err(CommitError::InMinority),
            other => return Err(CommitError::NotOnline(other)),
        }
        let snapshot = self.ctx.clock.assign_csn();
        let xid = self.ctx.alloc_xid();
        Ok(CurrentTxn::local(xid, self.ctx.my_id(), snapshot))
    }

    /// Wait until no donor wal-sender holds the almost-caught-up lock.
    ///
    /// Own transactions are blocked here to give catch-up a chance to finish;
    /// replicated transactions pass through so the recovering side keeps
    /// draining.
    pub async fn check_cluster_lock(&self) {
        let mut delay = MIN_LOCK_WAIT;
        loop {
            let unlock = self.ctx.cluster_unlock.notified();
            {
                let shared = self.ctx.shared();
                if shared.sender_locker_mask.is_empty() {
                    return;
                }
            }
            tokio::select! {
                _ = unlock => {}
                _ = time::sleep(delay) => {
                    if delay * 2 <= MAX_LOCK_WAIT {
                        delay *= 2;
                    }
                }
            }
        }
    }

    /// PRE-PREPARE: create the transaction state, assign the prepare CSN and
    /// register vote accounting. Called exactly once before any row-change
    /// record is emitted.
    pub async fn pre_prepare(
        &self,
        txn: &mut CurrentTxn,
        subxids: &[Xid],
    ) -> Result<(), CommitError> {
        if !txn.is_distributed {
            return Ok(());
        }
        if txn.gid.is_empty() {
            txn.gid = txn.gtid.gid();
        }

        if !txn.is_replicated {
            self.take_injected_error(&txn.gid, 1)?;
            self.check_cluster_lock().await;
            let status = self.ctx.status();
            if !status.accepts_writes() {
                return Err(CommitError::NotOnline(status));
            }
        }

        let csn;
        {
            let mut shared = self.ctx.shared_mut();
            let mut registry = self.ctx.registry_mut();
            csn = self.ctx.clock.assign_csn();
            let votes_needed = if txn.is_replicated {
                Default::default()
            } else {
                shared.enabled_peers(self.ctx.my_id())
            };
            let ts = registry.create(txn.xid);
            ts.gtid = txn.gtid;
            ts.gid = txn.gid.clone();
            ts.status = XidStatus::InProgress;
            ts.snapshot = txn.snapshot;
            ts.is_local = txn.is_replicated || !txn.contains_dml;
            ts.csn = csn;
            ts.votes_needed = votes_needed;
            ts.votes_received = Default::default();
            ts.voting_complete = false;
            ts.counted = true;
            shared.active_transactions += 1;
            registry.enqueue(txn.xid);
            registry.bind_gid(&txn.gid, txn.xid);
            if !subxids.is_empty() {
                registry.add_subtransactions(txn.xid, subxids);
            }
        }
        txn.is_prepared = true;
        txn.csn = csn;
        tracing::debug!(
            node = self.ctx.my_id(),
            xid = txn.xid,
            gid = %txn.gid,
            csn,
            "pre-prepared transaction"
        );
        Ok(())
    }

    /// Fan the PREPARE vote request out to every enabled participant.
    pub async fn send_prepare_requests(&self, txn: &CurrentTxn) {
        let peers = {
            let shared = self.ctx.shared();
            shared.enabled_peers(self.ctx.my_id())
        };
        let msg = ArbiterMessage::Prepare {
            gid: txn.gid.clone(),
            gtid: txn.gtid,
            csn: txn.csn,
        };
        let mut futs = FuturesUnordered::new();
        for node in peers.iter() {
            let transport = self.transport.clone();
            let msg = msg.clone();
            futs.push(async move { (node, transport.send(node, msg).await) });
        }
        while let Some((node, res)) = futs.next().await {
            if let Err(err) = res {
                // A dead peer is the watchdog's problem; the vote wait will
                // observe the config change.
                tracing::warn!(node = self.ctx.my_id(), peer = node, error = %err, "prepare send failed");
            }
        }
    }

    /// POST-PREPARE, coordinator side: wait until every enabled participant
    /// voted, the configuration changed, the transaction was aborted, or the
    /// timeout expired. Returns the final commit CSN.
    pub async fn wait_votes(&self, txn: &mut CurrentTxn) -> Result<Csn, CommitError> {
        self.take_injected_error(&txn.gid, 2)
            .inspect_err(|_| self.abort_local(txn))?;

        let (waiter, timeout) = {
            let registry = self.ctx.registry();
            let ts = match registry.get(txn.xid) {
                Some(ts) => ts,
                None => return Err(CommitError::RemoteAbort { gid: txn.gid.clone() }),
            };
            (
                ts.waiter.clone(),
                prepare_timeout(&self.ctx.cfg, ts.snapshot, ts.csn),
            )
        };
        let config_epoch = self.ctx.shared().config_changes;
        let started = time::Instant::now();
        let deadline = started + timeout;
        let poll_slice = self.ctx.cfg.heartbeat_recv_timeout;

        loop {
            let vote_wakeup = waiter.notified();
            let config_wakeup = self.ctx.config_change.notified();

            enum Verdict {
                Done(Csn),
                Fail(CommitError),
                Wait,
            }
            let verdict = {
                let shared = self.ctx.shared();
                let mut registry = self.ctx.registry_mut();
                let Some(ts) = registry.get_mut(txn.xid) else {
                    return Err(CommitError::RemoteAbort { gid: txn.gid.clone() });
                };
                // A node that got disabled mid-vote must not block the
                // commit: the required set is always evaluated against the
                // current membership.
                let still_needed = ts.votes_needed.difference(shared.disabled_mask);
                if ts.status == XidStatus::Aborted {
                    Verdict::Fail(CommitError::RemoteAbort { gid: txn.gid.clone() })
                } else if ts.voting_complete
                    || still_needed.difference(ts.votes_received).is_empty()
                {
                    ts.voting_complete = true;
                    Verdict::Done(ts.csn)
                } else if shared.config_changes != config_epoch {
                    Verdict::Fail(CommitError::ConfigChanged)
                } else if shared.status != ClusterStatus::Online {
                    Verdict::Fail(CommitError::NotOnline(shared.status))
                } else if time::Instant::now() >= deadline {
                    Verdict::Fail(CommitError::PrepareTimeout {
                        gid: txn.gid.clone(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
                } else {
                    Verdict::Wait
                }
            };

            match verdict {
                Verdict::Done(csn) => {
                    txn.csn = csn;
                    self.take_injected_error(&txn.gid, 3)
                        .inspect_err(|_| self.abort_local(txn))?;
                    return Ok(csn);
                }
                Verdict::Fail(err) => {
                    tracing::warn!(
                        node = self.ctx.my_id(),
                        gid = %txn.gid,
                        error = %err,
                        "distributed prepare failed"
                    );
                    self.abort_local(txn);
                    return Err(err);
                }
                Verdict::Wait => {
                    let remaining = deadline.saturating_duration_since(time::Instant::now());
                    let slice = remaining.min(poll_slice).max(Duration::from_millis(1));
                    tokio::select! {
                        _ = vote_wakeup => {}
                        _ = config_wakeup => {}
                        _ = time::sleep(slice) => {}
                    }
                }
            }
        }
    }

    /// Finalize a prepared transaction at the coordinator.
    pub fn finish(&self, txn: &mut CurrentTxn, commit: bool) {
        if !txn.is_prepared {
            return;
        }
        let mut shared = self.ctx.shared_mut();
        let mut registry = self.ctx.registry_mut();
        if commit {
            if let Some(ts) = registry.get_mut(txn.xid) {
                let final_csn = ts.csn;
                ts.status = XidStatus::Committed;
                if ts.counted {
                    ts.counted = false;
                    shared.active_transactions = shared.active_transactions.saturating_sub(1);
                }
                self.ctx.clock.sync(final_csn);
                registry.adjust_subtransactions(txn.xid);
                registry.exchange_global_status(&txn.gid, XidStatus::Committed);
                txn.status = XidStatus::Committed;
            }
        } else {
            Self::abort_entry(&mut shared, &mut registry, txn.xid);
            registry.exchange_global_status(&txn.gid, XidStatus::Aborted);
            txn.status = XidStatus::Aborted;
        }
    }

    /// Broadcast the outcome to every enabled participant.
    pub async fn broadcast_outcome(&self, txn: &CurrentTxn, commit: bool) {
        let peers = {
            let shared = self.ctx.shared();
            shared.enabled_peers(self.ctx.my_id())
        };
        let msg = if commit {
            ArbiterMessage::Commit {
                gid: txn.gid.clone(),
                csn: txn.csn,
            }
        } else {
            ArbiterMessage::Abort {
                gid: txn.gid.clone(),
            }
        };
        let mut futs = FuturesUnordered::new();
        for node in peers.iter() {
            let transport = self.transport.clone();
            let msg = msg.clone();
            futs.push(async move { (node, transport.send(node, msg).await) });
        }
        while let Some((node, res)) = futs.next().await {
            if let Err(err) = res {
                tracing::warn!(node = self.ctx.my_id(), peer = node, error = %err, "outcome send failed");
            }
        }
    }

    fn abort_local(&self, txn: &mut CurrentTxn) {
        let mut shared = self.ctx.shared_mut();
        let mut registry = self.ctx.registry_mut();
        Self::abort_entry(&mut shared, &mut registry, txn.xid);
        registry.exchange_global_status(&txn.gid, XidStatus::Aborted);
        txn.status = XidStatus::Aborted;
    }

    fn abort_entry(
        shared: &mut crate::context::SharedState,
        registry: &mut crate::registry::TxnRegistry,
        xid: Xid,
    ) {
        if let Some(ts) = registry.get_mut(xid) {
            // Committed is terminal; only live or in-doubt records abort.
            if matches!(ts.status, XidStatus::InProgress | XidStatus::Unknown) {
                tracing::info!(gtid = %ts.gtid, xid, "rollback active transaction");
                ts.status = XidStatus::Aborted;
                if ts.counted {
                    ts.counted = false;
                    shared.active_transactions = shared.active_transactions.saturating_sub(1);
                }
                registry.adjust_subtransactions(xid);
            }
        }
    }

    // ----- applier (participant) side -----

    /// Join a transaction replicated from `gtid.node`: ratchet the clock to
    /// the origin snapshot and allocate the local XID mapping. During
    /// recovery no state is registered; the donor's stream is authoritative.
    pub fn join_remote(&self, gtid: Gtid, snapshot: Csn, in_recovery: bool) -> CurrentTxn {
        if snapshot != INVALID_CSN {
            self.ctx.clock.sync(snapshot);
        }
        let xid = self.ctx.alloc_xid();
        let mut txn = CurrentTxn::local(xid, self.ctx.my_id(), snapshot);
        txn.gtid = gtid;
        txn.is_replicated = true;
        txn.contains_dml = true;
        if !in_recovery && gtid.is_valid() {
            let mut registry = self.ctx.registry_mut();
            let ts = registry.create(xid);
            ts.gtid = gtid;
            ts.snapshot = snapshot;
            ts.status = XidStatus::InProgress;
        }
        txn
    }

    /// Participant PREPARE: move to in-doubt, assign the local CSN and send
    /// the READY vote back to the coordinator (suppressed during recovery).
    ///
    /// The outcome may already be known: a commit or abort notification can
    /// outrun the replication stream right after this node was re-enabled.
    /// Such a transaction is finalized on the spot instead of being left in
    /// doubt.
    pub async fn prepared_remote(
        &self,
        txn: &mut CurrentTxn,
        gid: &str,
        in_recovery: bool,
    ) -> PreparedOutcome {
        txn.gid = gid.to_string();
        let local_csn;
        let outcome;
        {
            let mut shared = self.ctx.shared_mut();
            let mut registry = self.ctx.registry_mut();
            local_csn = self.ctx.clock.assign_csn();
            let known = registry
                .gid_entry(gid)
                .map(|entry| (entry.status, entry.csn));
            let ts = registry.create(txn.xid);
            ts.gtid = txn.gtid;
            ts.gid = txn.gid.clone();
            ts.snapshot = txn.snapshot;
            ts.is_local = false;
            ts.csn = local_csn;
            ts.voting_complete = true;
            match known {
                Some((XidStatus::Committed, final_csn)) => {
                    ts.status = XidStatus::Committed;
                    if final_csn != INVALID_CSN {
                        ts.csn = final_csn;
                    }
                    outcome = PreparedOutcome::AlreadyCommitted;
                }
                Some((XidStatus::Aborted, _)) => {
                    ts.status = XidStatus::Aborted;
                    outcome = PreparedOutcome::AlreadyAborted;
                }
                _ => {
                    ts.status = XidStatus::Unknown;
                    if !ts.counted {
                        ts.counted = true;
                        shared.active_transactions += 1;
                    }
                    outcome = PreparedOutcome::InDoubt;
                }
            }
            let csn = ts.csn;
            registry.enqueue(txn.xid);
            registry.bind_gid(&txn.gid, txn.xid);
            if outcome == PreparedOutcome::AlreadyCommitted {
                self.ctx.clock.sync(csn);
            }
        }
        txn.is_prepared = true;
        txn.csn = local_csn;
        txn.status = match outcome {
            PreparedOutcome::InDoubt => XidStatus::Unknown,
            PreparedOutcome::AlreadyCommitted => XidStatus::Committed,
            PreparedOutcome::AlreadyAborted => XidStatus::Aborted,
        };

        if !in_recovery && outcome == PreparedOutcome::InDoubt {
            let vote = ArbiterMessage::Ready {
                gid: gid.to_string(),
                node: self.ctx.my_id(),
                csn: local_csn,
            };
            if let Err(err) = self.transport.send(txn.gtid.node, vote).await {
                tracing::warn!(
                    node = self.ctx.my_id(),
                    coordinator = txn.gtid.node,
                    gid,
                    error = %err,
                    "ready vote send failed"
                );
            }
        }
        outcome
    }

    /// Applier failed to apply the transaction: abort it locally and vote
    /// ABORTED so the coordinator aborts globally. Never fails the applier's
    /// own loop.
    pub async fn abort_remote(&self, txn: &mut CurrentTxn, in_recovery: bool) {
        {
            let mut shared = self.ctx.shared_mut();
            let mut registry = self.ctx.registry_mut();
            let gid = if txn.gid.is_empty() {
                txn.gtid.gid()
            } else {
                txn.gid.clone()
            };
            txn.gid = gid.clone();
            let ts = registry.create(txn.xid);
            ts.gtid = txn.gtid;
            ts.gid = gid.clone();
            ts.snapshot = txn.snapshot;
            ts.status = XidStatus::Aborted;
            if ts.csn == INVALID_CSN {
                ts.csn = self.ctx.clock.assign_csn();
            }
            if ts.counted {
                ts.counted = false;
                shared.active_transactions = shared.active_transactions.saturating_sub(1);
            }
            ts.voting_complete = true;
            registry.enqueue(txn.xid);
            registry.bind_gid(&gid, txn.xid);
            registry.exchange_global_status(&gid, XidStatus::Aborted);
        }
        txn.status = XidStatus::Aborted;
        if !in_recovery && txn.gtid.is_valid() {
            let vote = ArbiterMessage::Aborted {
                gid: txn.gid.clone(),
                node: self.ctx.my_id(),
            };
            if let Err(err) = self.transport.send(txn.gtid.node, vote).await {
                tracing::warn!(
                    node = self.ctx.my_id(),
                    coordinator = txn.gtid.node,
                    error = %err,
                    "aborted vote send failed"
                );
            }
        }
    }

    /// COMMIT PREPARED at a participant. Applying the same record twice is a
    /// no-op after the first application finalized the transaction. Returns
    /// the local XID on the first, effective application.
    pub fn commit_prepared(&self, gid: &str, final_csn: Csn) -> Option<Xid> {
        let mut shared = self.ctx.shared_mut();
        let mut registry = self.ctx.registry_mut();
        let old = registry.exchange_global_status(gid, XidStatus::Committed);
        if old == XidStatus::Aborted {
            tracing::warn!(node = self.ctx.my_id(), gid, "commit prepared after abort ignored");
            return None;
        }
        if old == XidStatus::Committed {
            return None;
        }
        let Some(ts) = registry.get_by_gid_mut(gid) else {
            // The prepare has not been applied yet; keep the final CSN so it
            // can finalize when it arrives.
            registry.set_gid_csn(gid, final_csn);
            return None;
        };
        if ts.status == XidStatus::Committed {
            return None;
        }
        let xid = ts.xid;
        if final_csn != INVALID_CSN && (final_csn > ts.csn || ts.csn == INVALID_CSN) {
            ts.csn = final_csn;
        }
        let csn = ts.csn;
        ts.status = XidStatus::Committed;
        if ts.counted {
            ts.counted = false;
            shared.active_transactions = shared.active_transactions.saturating_sub(1);
        }
        self.ctx.clock.sync(csn);
        registry.adjust_subtransactions(xid);
        Some(xid)
    }

    /// ABORT PREPARED at a participant; duplicate deliveries are no-ops and
    /// an already-committed transaction stays committed.
    pub fn abort_prepared(&self, gid: &str) -> Option<Xid> {
        let mut shared = self.ctx.shared_mut();
        let mut registry = self.ctx.registry_mut();
        if registry.gid_status(gid) == Some(XidStatus::Committed) {
            tracing::warn!(node = self.ctx.my_id(), gid, "abort prepared after commit ignored");
            return None;
        }
        let old = registry.exchange_global_status(gid, XidStatus::Aborted);
        if old == XidStatus::Aborted {
            return None;
        }
        let xid = registry.get_by_gid(gid).map(|ts| ts.xid)?;
        Self::abort_entry(&mut shared, &mut registry, xid);
        Some(xid)
    }

    // ----- vote sink (coordinator receiving arbiter messages) -----

    /// READY vote from a participant.
    pub fn handle_ready(&self, gid: &str, node: NodeId, csn: Csn) {
        self.ctx.clock.sync(csn);
        let mut registry = self.ctx.registry_mut();
        let Some(ts) = registry.get_by_gid_mut(gid) else {
            tracing::debug!(node = self.ctx.my_id(), gid, "vote for unknown gid");
            return;
        };
        if ts.gtid.node != self.ctx.my_id() || ts.status == XidStatus::Aborted {
            return;
        }
        ts.votes_received.set(node);
        if csn > ts.csn {
            ts.csn = csn;
        }
        if ts.votes_needed.difference(ts.votes_received).is_empty() && !ts.voting_complete {
            ts.voting_complete = true;
            ts.waiter.notify_waiters();
        }
    }

    /// ABORTED vote from a participant. A vote arriving after the commit
    /// was already decided is stale and ignored.
    pub fn handle_aborted(&self, gid: &str, node: NodeId) {
        let mut shared = self.ctx.shared_mut();
        let mut registry = self.ctx.registry_mut();
        let Some(ts) = registry.get_by_gid(gid) else {
            return;
        };
        if ts.status == XidStatus::Committed {
            return;
        }
        let xid = ts.xid;
        tracing::warn!(node = self.ctx.my_id(), gid, voter = node, "abort vote received");
        Self::abort_entry(&mut shared, &mut registry, xid);
        registry.exchange_global_status(gid, XidStatus::Aborted);
        if let Some(ts) = registry.get(xid) {
            ts.waiter.notify_waiters();
        }
    }

    /// PREPARE vote request: if this participant already prepared the
    /// transaction (the replication stream outran the arbiter channel),
    /// answer immediately; otherwise the vote goes out when the applier
    /// prepares.
    pub async fn handle_prepare_request(&self, gid: &str, gtid: Gtid, csn: Csn) {
        self.ctx.clock.sync(csn);
        let reply = {
            let registry = self.ctx.registry();
            registry.get_by_gid(gid).and_then(|ts| {
                (ts.status == XidStatus::Unknown).then_some((ts.csn, gtid.node))
            })
        };
        if let Some((local_csn, coordinator)) = reply {
            let vote = ArbiterMessage::Ready {
                gid: gid.to_string(),
                node: self.ctx.my_id(),
                csn: local_csn,
            };
            if let Err(err) = self.transport.send(coordinator, vote).await {
                tracing::warn!(node = self.ctx.my_id(), gid, error = %err, "ready re-send failed");
            }
        }
    }

    /// Interrupt voting for transactions this node coordinates; called when
    /// membership changes so their backends stop hanging. A transaction
    /// whose missing votes all come from freshly disabled nodes is allowed
    /// to complete; everything else is aborted.
    pub fn abort_active_voting(&self) {
        let mut shared = self.ctx.shared_mut();
        let mut registry = self.ctx.registry_mut();
        let me = self.ctx.my_id();
        let disabled = shared.disabled_mask;
        let mut stuck: Vec<(Xid, bool)> = Vec::new();
        for ts in registry.iter_fifo() {
            if ts.gtid.node != me || ts.voting_complete || ts.status == XidStatus::Aborted {
                continue;
            }
            let still_needed = ts.votes_needed.difference(disabled);
            let completable = still_needed.difference(ts.votes_received).is_empty();
            stuck.push((ts.xid, completable));
        }
        for (xid, completable) in stuck {
            if !completable {
                Self::abort_entry(&mut shared, &mut registry, xid);
            }
            if let Some(ts) = registry.get(xid) {
                ts.waiter.notify_waiters();
            }
        }
    }

    /// Abort a transaction picked as a deadlock victim. A victim still
    /// waiting on its first row lock has no state yet; an aborted record is
    /// created so the lock wait observes the verdict.
    pub fn abort_victim(&self, xid: Xid) {
        let mut shared = self.ctx.shared_mut();
        let mut registry = self.ctx.registry_mut();
        if !registry.contains(xid) {
            let csn = self.ctx.clock.assign_csn();
            let ts = registry.create(xid);
            ts.gtid = Gtid::new(self.ctx.my_id(), xid);
            ts.status = XidStatus::Aborted;
            ts.csn = csn;
            registry.enqueue(xid);
            return;
        }
        Self::abort_entry(&mut shared, &mut registry, xid);
        if let Some(ts) = registry.get(xid) {
            ts.waiter.notify_waiters();
        }
    }

    fn take_injected_error(&self, gid: &str, phase: u8) -> Result<(), CommitError> {
        let mut shared = self.ctx.shared_mut();
        if shared.inject_2pc_error == phase {
            shared.inject_2pc_error = 0;
            return Err(CommitError::Injected {
                gid: gid.to_string(),
                phase,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(NodeId, ArbiterMessage)>>,
    }

    #[async_trait::async_trait]
    impl ArbiterTransport for RecordingTransport {
        async fn send(&self, target: NodeId, msg: ArbiterMessage) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((target, msg));
            Ok(())
        }
    }

    fn online_coordinator() -> (Arc<Coordinator>, Arc<RecordingTransport>, Arc<NodeContext>) {
        let mut cfg = ClusterConfig::in_process(1, 3);
        cfg.min_2pc_timeout = Duration::from_millis(200);
        let ctx = NodeContext::new(cfg);
        {
            let mut shared = ctx.shared_mut();
            shared.status = ClusterStatus::Online;
        }
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = Coordinator::new(ctx.clone(), transport.clone());
        (coordinator, transport, ctx)
    }

    #[test]
    fn timeout_is_proportional_with_a_floor() {
        let cfg = ClusterConfig::in_process(1, 3);
        // Tiny prepare latency hits the floor.
        assert_eq!(prepare_timeout(&cfg, 100, 200), cfg.min_2pc_timeout);
        // 10 s of prepare latency at ratio 200% yields 20 s.
        let long = prepare_timeout(&cfg, 0, 10_000_000);
        assert_eq!(long, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn votes_complete_the_wait_with_the_max_csn() {
        let (coordinator, _transport, ctx) = online_coordinator();
        let mut txn = coordinator.begin().expect("begin");
        txn.contains_dml = true;
        coordinator.pre_prepare(&mut txn, &[]).await.expect("pre-prepare");
        let csn0 = txn.csn;

        let gid = txn.gid.clone();
        let remote_csn = csn0 + 1_000;
        let waiter = {
            let coordinator = coordinator.clone();
            let mut txn = txn.clone();
            tokio::spawn(async move { coordinator.wait_votes(&mut txn).await })
        };
        coordinator.handle_ready(&gid, 2, remote_csn);
        coordinator.handle_ready(&gid, 3, csn0);
        let final_csn = waiter.await.expect("join").expect("votes");
        assert!(final_csn >= remote_csn, "final CSN respects participant CSNs");

        assert_eq!(ctx.shared().active_transactions, 1);
        coordinator.finish(&mut txn, true);
        assert_eq!(ctx.shared().active_transactions, 0);
        assert_eq!(
            ctx.registry().get(txn.xid).unwrap().status,
            XidStatus::Committed
        );
    }

    #[tokio::test]
    async fn abort_vote_fails_the_commit() {
        let (coordinator, _transport, _ctx) = online_coordinator();
        let mut txn = coordinator.begin().expect("begin");
        txn.contains_dml = true;
        coordinator.pre_prepare(&mut txn, &[]).await.expect("pre-prepare");
        let gid = txn.gid.clone();

        let waiter = {
            let coordinator = coordinator.clone();
            let mut txn = txn.clone();
            tokio::spawn(async move { coordinator.wait_votes(&mut txn).await })
        };
        coordinator.handle_aborted(&gid, 3);
        let err = waiter.await.expect("join").expect_err("must abort");
        assert!(matches!(err, CommitError::RemoteAbort { .. }));
    }

    #[tokio::test]
    async fn vote_wait_times_out() {
        let (coordinator, _transport, ctx) = online_coordinator();
        let mut txn = coordinator.begin().expect("begin");
        txn.contains_dml = true;
        coordinator.pre_prepare(&mut txn, &[]).await.expect("pre-prepare");
        let err = coordinator.wait_votes(&mut txn).await.expect_err("timeout");
        assert!(matches!(err, CommitError::PrepareTimeout { .. }));
        // P5: nothing is left in-doubt after the abort.
        assert_eq!(
            ctx.registry().get(txn.xid).unwrap().status,
            XidStatus::Aborted
        );
    }

    #[tokio::test]
    async fn disabled_participant_stops_blocking_after_config_change() {
        let (coordinator, _transport, ctx) = online_coordinator();
        let mut txn = coordinator.begin().expect("begin");
        txn.contains_dml = true;
        coordinator.pre_prepare(&mut txn, &[]).await.expect("pre-prepare");
        let gid = txn.gid.clone();

        coordinator.handle_ready(&gid, 2, txn.csn + 1);
        // Node 3 dies before voting; the watchdog disables it and bumps the
        // config epoch. The coordinator re-evaluates and commits with the
        // remaining participants.
        {
            let mut shared = ctx.shared_mut();
            shared.disabled_mask.set(3);
            shared.live_nodes -= 1;
            shared.config_changes += 1;
        }
        ctx.config_change.notify_waiters();
        let final_csn = coordinator.wait_votes(&mut txn).await.expect("re-evaluated");
        assert!(final_csn > 0);
    }

    #[tokio::test]
    async fn duplicate_commit_prepared_is_noop() {
        let (coordinator, _transport, ctx) = online_coordinator();
        let gtid = Gtid::new(2, 55);
        let mut txn = coordinator.join_remote(gtid, ctx.clock.assign_csn(), false);
        let gid = gtid.gid();
        let outcome = coordinator.prepared_remote(&mut txn, &gid, false).await;
        assert_eq!(outcome, PreparedOutcome::InDoubt);

        let first = coordinator.commit_prepared(&gid, txn.csn + 10);
        assert_eq!(first, Some(txn.xid));
        let second = coordinator.commit_prepared(&gid, txn.csn + 10);
        assert_eq!(second, None);
        assert_eq!(
            ctx.registry().get(txn.xid).unwrap().status,
            XidStatus::Committed
        );
    }

    #[tokio::test]
    async fn participant_votes_ready_with_its_local_csn() {
        let (coordinator, transport, ctx) = online_coordinator();
        let gtid = Gtid::new(3, 9);
        let snapshot = ctx.clock.assign_csn();
        let mut txn = coordinator.join_remote(gtid, snapshot, false);
        let gid = gtid.gid();
        coordinator.prepared_remote(&mut txn, &gid, false).await;
        let local_csn = ctx.registry().get(txn.xid).unwrap().csn;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (target, msg) = &sent[0];
        assert_eq!(*target, 3);
        match msg {
            ArbiterMessage::Ready { gid: g, node, csn } => {
                assert_eq!(g, &gid);
                assert_eq!(*node, 1);
                assert_eq!(*csn, local_csn);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn recovery_suppresses_votes() {
        let (coordinator, transport, ctx) = online_coordinator();
        let gtid = Gtid::new(2, 70);
        let mut txn = coordinator.join_remote(gtid, ctx.clock.assign_csn(), true);
        coordinator.prepared_remote(&mut txn, &gtid.gid(), true).await;
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_outrunning_the_prepare_finalizes_on_arrival() {
        let (coordinator, transport, ctx) = online_coordinator();
        let gtid = Gtid::new(2, 80);
        let gid = gtid.gid();
        // The commit notification lands before the replication stream
        // delivered the prepare.
        assert_eq!(coordinator.commit_prepared(&gid, 9_999_999), None);

        let mut txn = coordinator.join_remote(gtid, ctx.clock.assign_csn(), false);
        let outcome = coordinator.prepared_remote(&mut txn, &gid, false).await;
        assert_eq!(outcome, PreparedOutcome::AlreadyCommitted);
        let ts_status = ctx.registry().get(txn.xid).unwrap().status;
        assert_eq!(ts_status, XidStatus::Committed);
        // No vote goes out for an already-decided transaction.
        assert!(transport.sent.lock().unwrap().is_empty());
    }
}
