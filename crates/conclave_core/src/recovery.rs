//! Recovery controller: donor-side catch-up thresholds and the
//! recoverer-side state transitions.
//!
//! A node that boots into recovery pulls a linear history from a single
//! donor. The donor watches the recoverer's slot position; once the lag
//! falls under `min_recovery_lag` it asserts the cluster lock so new local
//! commits pause, and once the slot has fully drained with no transactions
//! in flight it re-enables the node and releases the lock.

use std::sync::Arc;

use crate::context::NodeContext;
use crate::types::{ClusterStatus, Lsn, NodeId};

pub struct RecoveryController {
    ctx: Arc<NodeContext>,
}

impl RecoveryController {
    pub fn new(ctx: Arc<NodeContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Enter recovery: mark ourselves disabled and wait for a donor. The
    /// live count always includes this node, so only peers move it.
    pub fn start_recovery(&self) {
        let me = self.ctx.my_id();
        let mut shared = self.ctx.shared_mut();
        shared.disabled_mask.set(me);
        shared.recovery_slot = None;
        self.ctx.switch_status(&mut shared, ClusterStatus::Recovery);
    }

    /// Claim the recovery slot for `donor`. Only the first donor (or a
    /// repeat claim by the same donor) wins; receivers from other nodes stay
    /// parked until recovery completes.
    pub fn claim_recovery_slot(&self, donor: NodeId) -> bool {
        let mut shared = self.ctx.shared_mut();
        if shared.status != ClusterStatus::Recovery {
            return false;
        }
        match shared.recovery_slot {
            None => {
                tracing::warn!(node = self.ctx.my_id(), donor, "starting recovery from donor");
                shared.recovery_slot = Some(donor);
                shared.recovery_count += 1;
                shared.receivers_connected = 0;
                for record in shared.nodes.iter_mut() {
                    record.receiver_connected = false;
                    record.restart_lsn = 0;
                }
                true
            }
            Some(current) => current == donor,
        }
    }

    /// Recovery finished: clear our own disabled bit, defuse the watchdog
    /// and go `connected`. The node turns `online` once every receiver has
    /// reconnected.
    pub fn recovery_completed(&self) {
        let me = self.ctx.my_id();
        let mut shared = self.ctx.shared_mut();
        shared.disabled_mask.clear(me);
        shared.recovery_slot = None;
        for record in shared.nodes.iter_mut() {
            record.last_heartbeat = 0;
        }
        tracing::warn!(
            node = me,
            disabled = %shared.disabled_mask,
            live = shared.live_nodes,
            "recovery completed"
        );
        self.ctx.switch_status(&mut shared, ClusterStatus::Connected);
        self.ctx.bump_config_changes(&mut shared);
    }

    /// Donor-side catch-up evaluation, called whenever a COMMIT record is
    /// about to be emitted to a recovering peer. Returns true exactly when
    /// the peer is caught up and has just been re-enabled.
    pub fn recovery_caught_up(&self, node: NodeId, slot_lsn: Lsn, wal_lsn: Lsn) -> bool {
        let mut shared = self.ctx.shared_mut();
        if !shared.disabled_mask.contains(node) {
            return false;
        }
        if slot_lsn == wal_lsn && shared.active_transactions == 0 {
            if shared.node_locker_mask.contains(node) {
                tracing::warn!(node = self.ctx.my_id(), peer = node, "recovering node caught up");
                shared.node_locker_mask.clear(node);
                shared.sender_locker_mask.clear(node);
                shared.lockers = shared.lockers.saturating_sub(1);
            } else {
                tracing::info!(
                    node = self.ctx.my_id(),
                    peer = node,
                    "recovering node caught up without locking the cluster"
                );
            }
            shared.disabled_mask.clear(node);
            shared.live_nodes += 1;
            let now = self.ctx.clock.now();
            shared.record_mut(node).last_status_change = now;
            shared.record_mut(node).last_heartbeat = 0;
            self.ctx.bump_config_changes(&mut shared);
            if shared.status == ClusterStatus::InMinority && shared.live_nodes >= shared.quorum()
            {
                self.ctx.switch_status(&mut shared, ClusterStatus::Online);
            }
            if shared.sender_locker_mask.is_empty() {
                self.ctx.cluster_unlock.notify_waiters();
            }
            true
        } else if !shared.node_locker_mask.contains(node)
            && slot_lsn + self.ctx.cfg.min_recovery_lag > wal_lsn
        {
            // Almost caught up: stop new local commits so the remaining WAL
            // can drain.
            tracing::warn!(
                node = self.ctx.my_id(),
                peer = node,
                slot_lsn,
                wal_lsn,
                active = shared.active_transactions,
                "recovering node almost caught up, locking cluster"
            );
            shared.node_locker_mask.set(node);
            shared.sender_locker_mask.set(node);
            shared.lockers += 1;
            false
        } else {
            false
        }
    }

    /// Police replication slots: a disabled node whose lag exceeds
    /// `max_recovery_lag` loses its slot and must restart from a base copy.
    pub fn slots_to_drop(&self, slot_lsns: &[(NodeId, Lsn)], wal_lsn: Lsn) -> Vec<NodeId> {
        let shared = self.ctx.shared();
        if self.ctx.cfg.max_recovery_lag == 0 || shared.disabled_mask.is_empty() {
            return Vec::new();
        }
        slot_lsns
            .iter()
            .filter(|(node, slot_lsn)| {
                shared.disabled_mask.contains(*node)
                    && slot_lsn + self.ctx.cfg.max_recovery_lag < wal_lsn
            })
            .map(|(node, _)| *node)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    fn controller() -> (Arc<RecoveryController>, Arc<NodeContext>) {
        let mut cfg = ClusterConfig::in_process(1, 3);
        cfg.min_recovery_lag = 100;
        cfg.max_recovery_lag = 1_000;
        let ctx = NodeContext::new(cfg);
        (RecoveryController::new(ctx.clone()), ctx)
    }

    #[test]
    fn donor_locks_then_enables_on_caught_up() {
        let (recovery, ctx) = controller();
        {
            let mut shared = ctx.shared_mut();
            shared.disabled_mask.set(3);
            shared.live_nodes = 2;
            shared.status = ClusterStatus::Online;
        }
        // Far behind: no lock yet.
        assert!(!recovery.recovery_caught_up(3, 0, 10_000));
        assert!(ctx.shared().sender_locker_mask.is_empty());

        // Within min_recovery_lag: cluster lock asserted.
        assert!(!recovery.recovery_caught_up(3, 9_950, 10_000));
        assert!(ctx.shared().sender_locker_mask.contains(3));
        assert_eq!(ctx.shared().lockers, 1);

        // Slot has not fully drained yet.
        assert!(!recovery.recovery_caught_up(3, 9_990, 10_000));

        // Fully drained with no active transactions: enabled, lock released.
        assert!(recovery.recovery_caught_up(3, 10_000, 10_000));
        let shared = ctx.shared();
        assert!(!shared.disabled_mask.contains(3));
        assert!(shared.sender_locker_mask.is_empty());
        assert_eq!(shared.live_nodes, 3);
    }

    #[test]
    fn caught_up_waits_for_active_transactions() {
        let (recovery, ctx) = controller();
        {
            let mut shared = ctx.shared_mut();
            shared.disabled_mask.set(2);
            shared.live_nodes = 2;
            shared.active_transactions = 1;
        }
        assert!(!recovery.recovery_caught_up(2, 500, 500));
        ctx.shared_mut().active_transactions = 0;
        assert!(recovery.recovery_caught_up(2, 500, 500));
    }

    #[test]
    fn recovery_slot_is_single_donor() {
        let (recovery, ctx) = controller();
        recovery.start_recovery();
        assert_eq!(ctx.status(), ClusterStatus::Recovery);
        assert!(ctx.shared().disabled_mask.contains(1));

        assert!(recovery.claim_recovery_slot(2));
        assert!(recovery.claim_recovery_slot(2), "same donor may re-claim");
        assert!(!recovery.claim_recovery_slot(3), "second donor is parked");
    }

    #[test]
    fn overlong_lag_drops_the_slot() {
        let (recovery, ctx) = controller();
        {
            let mut shared = ctx.shared_mut();
            shared.disabled_mask.set(3);
        }
        let drops = recovery.slots_to_drop(&[(2, 9_000), (3, 100)], 10_000);
        assert_eq!(drops, vec![3]);
    }
}
