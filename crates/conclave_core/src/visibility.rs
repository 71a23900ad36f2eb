//! MVCC visibility against the transaction state table, and the
//! cluster-wide vacuum horizon.

use std::sync::Arc;
use std::time::Duration;

use crate::context::NodeContext;
use crate::error::VisibilityError;
use crate::types::{Csn, Xid, XidStatus, INVALID_CSN};

/// Verdict of a visibility check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Invisible,
    /// No state exists for the XID; the host engine falls back to its own
    /// visibility rule.
    Unmapped,
}

const MIN_WAIT: Duration = Duration::from_millis(1);
const MAX_WAIT: Duration = Duration::from_millis(100);
const MAX_WAIT_LOOPS: usize = 100;

/// Visibility and snapshot service over one node's state table.
#[derive(Clone)]
pub struct VisibilityService {
    ctx: Arc<NodeContext>,
}

impl VisibilityService {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Decide whether `xid`'s writes are visible under `snapshot`.
    ///
    /// An in-doubt transaction makes the reader wait: the table lock is
    /// released, the task sleeps with exponential back-off and re-reads.
    /// A reader never observes an outcome before the coordinator finalizes
    /// it. The retry cap fails the reader, not the in-doubt transaction.
    pub async fn xid_visible(
        &self,
        xid: Xid,
        snapshot: Csn,
    ) -> Result<Visibility, VisibilityError> {
        let mut delay = MIN_WAIT;
        for _ in 0..MAX_WAIT_LOOPS {
            let verdict = {
                let registry = self.ctx.registry();
                match registry.get(xid) {
                    None => Some(Visibility::Unmapped),
                    Some(ts) => {
                        if ts.csn != INVALID_CSN && ts.csn > snapshot {
                            Some(Visibility::Invisible)
                        } else {
                            match ts.status {
                                XidStatus::Unknown => None,
                                XidStatus::Committed => Some(Visibility::Visible),
                                XidStatus::Aborted | XidStatus::InProgress => {
                                    Some(Visibility::Invisible)
                                }
                            }
                        }
                    }
                }
            };
            match verdict {
                Some(v) => return Ok(v),
                None => {
                    tokio::time::sleep(delay).await;
                    if delay * 2 <= MAX_WAIT {
                        delay *= 2;
                    }
                }
            }
        }
        Err(VisibilityError::StatusUnresolved { xid })
    }

    /// Compute the cluster-wide oldest xmin and garbage collect the state
    /// table behind it.
    ///
    /// Starting from the host's local xmin, the horizon is lowered to the
    /// minimum `oldest-snapshot` reported by any enabled node, minus the
    /// configured vacuum-delay slack, so a snapshot taken anywhere keeps
    /// tuples readable everywhere.
    pub fn oldest_xmin(&self, local_xmin: Xid) -> Xid {
        let vacuum_delay_us =
            self.ctx.cfg.vacuum_delay.as_micros().min(u128::from(u64::MAX)) as u64;
        let me = self.ctx.my_id();

        let mut shared = self.ctx.shared_mut();
        let mut registry = self.ctx.registry_mut();

        let Some(snapshot) = registry.get(local_xmin).map(|ts| ts.snapshot) else {
            // No state for the boundary XID: keep the previously observed
            // horizon if it is older.
            return if shared.oldest_xid != 0 && shared.oldest_xid < local_xmin {
                shared.oldest_xid
            } else {
                local_xmin
            };
        };

        let own = shared.record_mut(me);
        let mut oldest_snapshot = if own.oldest_snapshot < snapshot {
            own.oldest_snapshot = snapshot;
            snapshot
        } else {
            own.oldest_snapshot
        };
        let disabled = shared.disabled_mask;
        for (i, record) in shared.nodes.iter().enumerate() {
            let node = (i + 1) as u32;
            if disabled.contains(node) || node == me {
                continue;
            }
            if record.oldest_snapshot != INVALID_CSN && record.oldest_snapshot < oldest_snapshot {
                oldest_snapshot = record.oldest_snapshot;
            }
        }
        let cutoff = oldest_snapshot.saturating_sub(vacuum_delay_us);

        let result = registry.gc(cutoff, local_xmin);
        match result.new_oldest {
            Some(new_oldest) => {
                shared.oldest_xid = new_oldest;
                new_oldest
            }
            None => {
                if shared.oldest_xid != 0 && shared.oldest_xid < local_xmin {
                    shared.oldest_xid
                } else {
                    local_xmin
                }
            }
        }
    }

    /// Oldest snapshot this node still references, for heartbeat gossip.
    pub fn local_oldest_snapshot(&self) -> Csn {
        let registry = self.ctx.registry();
        registry
            .oldest_active_xid()
            .and_then(|xid| registry.get(xid).map(|ts| ts.snapshot))
            .unwrap_or(INVALID_CSN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::types::Gtid;

    fn service() -> VisibilityService {
        let ctx = NodeContext::new(ClusterConfig::in_process(1, 3));
        VisibilityService::new(ctx)
    }

    #[tokio::test]
    async fn committed_csn_ordering_decides_visibility() {
        let svc = service();
        {
            let mut reg = svc.ctx.registry_mut();
            let ts = reg.create(10);
            ts.status = XidStatus::Committed;
            ts.csn = 500;
        }
        assert_eq!(
            svc.xid_visible(10, 499).await.expect("check"),
            Visibility::Invisible
        );
        assert_eq!(
            svc.xid_visible(10, 500).await.expect("check"),
            Visibility::Visible
        );
    }

    #[tokio::test]
    async fn aborted_is_always_invisible() {
        let svc = service();
        {
            let mut reg = svc.ctx.registry_mut();
            let ts = reg.create(11);
            ts.status = XidStatus::Aborted;
            ts.csn = 100;
        }
        assert_eq!(
            svc.xid_visible(11, 1_000_000).await.expect("check"),
            Visibility::Invisible
        );
    }

    #[tokio::test]
    async fn unmapped_defers_to_the_host_engine() {
        let svc = service();
        assert_eq!(
            svc.xid_visible(999, 100).await.expect("check"),
            Visibility::Unmapped
        );
    }

    #[tokio::test]
    async fn reader_waits_for_in_doubt_outcome() {
        let svc = service();
        {
            let mut reg = svc.ctx.registry_mut();
            let ts = reg.create(12);
            ts.gtid = Gtid::new(2, 7);
            ts.status = XidStatus::Unknown;
            ts.csn = 50;
        }
        let waiter = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.xid_visible(12, 60).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let mut reg = svc.ctx.registry_mut();
            let ts = reg.get_mut(12).unwrap();
            ts.status = XidStatus::Committed;
        }
        let verdict = waiter.await.expect("join").expect("visibility");
        assert_eq!(verdict, Visibility::Visible);
    }

    #[tokio::test]
    async fn in_doubt_with_future_csn_needs_no_wait() {
        let svc = service();
        {
            let mut reg = svc.ctx.registry_mut();
            let ts = reg.create(13);
            ts.status = XidStatus::Unknown;
            ts.csn = 5_000;
        }
        // CSN already exceeds the snapshot, so the verdict is immediate even
        // though the outcome is unknown.
        assert_eq!(
            svc.xid_visible(13, 4_000).await.expect("check"),
            Visibility::Invisible
        );
    }
}
