//! Transaction state table.
//!
//! One record per active or recently finished XID, held in an arena of slots
//! with a FIFO threaded through `next` indices. The FIFO preserves insertion
//! order so garbage collection can walk from the head and stop at the first
//! record that is still too young. Secondary hash maps index records by XID
//! and by textual GID; the GID map keeps the last known status after the slot
//! is gone so duplicate deliveries of COMMIT/ABORT PREPARED are no-ops.
//!
//! The registry is plain data: the owning context wraps it in a
//! reader-writer lock, and nothing here ever blocks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::types::{Csn, Gtid, NodeMask, Xid, XidStatus, INVALID_CSN};

/// Per-XID record of status, CSN, snapshot, GID and voting progress.
#[derive(Debug)]
pub struct TxnState {
    pub xid: Xid,
    pub gtid: Gtid,
    pub gid: String,
    pub status: XidStatus,
    /// CSN of the snapshot taken at begin.
    pub snapshot: Csn,
    /// Commit CSN: assigned at prepare, may only grow to the cluster maximum.
    pub csn: Csn,
    /// True iff the transaction must not be replicated.
    pub is_local: bool,
    /// Participants whose PREPARE ack is required.
    pub votes_needed: NodeMask,
    /// Participants that acked so far.
    pub votes_received: NodeMask,
    pub voting_complete: bool,
    /// Whether this record is counted in `active_transactions`; guards the
    /// decrement against double application.
    pub counted: bool,
    /// Number of committed sub-transactions chained right after this record.
    pub n_subxids: usize,
    /// Wakes the local backend waiting on vote completion.
    pub waiter: Arc<Notify>,
    /// FIFO link (arena slot index).
    next: Option<usize>,
    enqueued: bool,
}

impl TxnState {
    fn new(xid: Xid) -> Self {
        Self {
            xid,
            gtid: Gtid::invalid(),
            gid: String::new(),
            status: XidStatus::InProgress,
            snapshot: INVALID_CSN,
            csn: INVALID_CSN,
            is_local: true,
            votes_needed: NodeMask::empty(),
            votes_received: NodeMask::empty(),
            voting_complete: false,
            counted: false,
            n_subxids: 0,
            waiter: Arc::new(Notify::new()),
            next: None,
            enqueued: false,
        }
    }
}

/// GID-level bookkeeping surviving slot removal. `csn` carries the final
/// commit CSN so a prepare arriving after the commit notification can still
/// finalize correctly.
#[derive(Debug, Clone)]
pub struct GidEntry {
    pub slot: Option<usize>,
    pub status: XidStatus,
    pub csn: Csn,
}

/// Result of one GC sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcResult {
    pub removed: usize,
    /// New FIFO head XID, if the sweep advanced the horizon.
    pub new_oldest: Option<Xid>,
}

#[derive(Debug, Default)]
pub struct TxnRegistry {
    slots: Vec<Option<TxnState>>,
    free: Vec<usize>,
    by_xid: HashMap<Xid, usize>,
    by_gid: HashMap<String, GidEntry>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_xid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_xid.is_empty()
    }

    fn alloc(&mut self, state: TxnState) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(state);
            idx
        } else {
            self.slots.push(Some(state));
            self.slots.len() - 1
        }
    }

    /// Fetch or create the record for `xid`. At most one record per XID ever
    /// exists; a second create returns the existing one.
    pub fn create(&mut self, xid: Xid) -> &mut TxnState {
        if let Some(&idx) = self.by_xid.get(&xid) {
            return self.slots[idx].as_mut().expect("indexed slot occupied");
        }
        let idx = self.alloc(TxnState::new(xid));
        self.by_xid.insert(xid, idx);
        self.slots[idx].as_mut().expect("fresh slot occupied")
    }

    pub fn get(&self, xid: Xid) -> Option<&TxnState> {
        let idx = *self.by_xid.get(&xid)?;
        self.slots[idx].as_ref()
    }

    pub fn get_mut(&mut self, xid: Xid) -> Option<&mut TxnState> {
        let idx = *self.by_xid.get(&xid)?;
        self.slots[idx].as_mut()
    }

    pub fn contains(&self, xid: Xid) -> bool {
        self.by_xid.contains_key(&xid)
    }

    /// Bind a GID to an existing record so remote PREPARE/COMMIT PREPARED
    /// messages can find it.
    pub fn bind_gid(&mut self, gid: &str, xid: Xid) {
        let Some(&idx) = self.by_xid.get(&xid) else {
            return;
        };
        if let Some(ts) = self.slots[idx].as_mut() {
            ts.gid = gid.to_string();
        }
        let status = self.slots[idx].as_ref().map(|ts| ts.status);
        self.by_gid
            .entry(gid.to_string())
            .and_modify(|e| e.slot = Some(idx))
            .or_insert(GidEntry {
                slot: Some(idx),
                status: status.unwrap_or(XidStatus::InProgress),
                csn: INVALID_CSN,
            });
    }

    pub fn get_by_gid(&self, gid: &str) -> Option<&TxnState> {
        let entry = self.by_gid.get(gid)?;
        let idx = entry.slot?;
        self.slots[idx].as_ref()
    }

    pub fn get_by_gid_mut(&mut self, gid: &str) -> Option<&mut TxnState> {
        let idx = self.by_gid.get(gid)?.slot?;
        self.slots[idx].as_mut()
    }

    pub fn gid_status(&self, gid: &str) -> Option<XidStatus> {
        self.by_gid.get(gid).map(|e| e.status)
    }

    /// Atomically read and replace the GID-level status. An `aborted` entry
    /// is final and never downgraded. Returns the previous status, or
    /// `InProgress` when the GID was unknown.
    pub fn exchange_global_status(&mut self, gid: &str, new: XidStatus) -> XidStatus {
        match self.by_gid.get_mut(gid) {
            Some(entry) => {
                let old = entry.status;
                if old != XidStatus::Aborted {
                    entry.status = new;
                }
                old
            }
            None => {
                self.by_gid.insert(
                    gid.to_string(),
                    GidEntry {
                        slot: None,
                        status: new,
                        csn: INVALID_CSN,
                    },
                );
                XidStatus::InProgress
            }
        }
    }

    /// Remember the final commit CSN at the GID level.
    pub fn set_gid_csn(&mut self, gid: &str, csn: Csn) {
        if let Some(entry) = self.by_gid.get_mut(gid) {
            entry.csn = csn;
        }
    }

    /// GID-level entry, for out-of-order commit handling.
    pub fn gid_entry(&self, gid: &str) -> Option<&GidEntry> {
        self.by_gid.get(gid)
    }

    /// Append the record to the GC FIFO (no-op if already enqueued).
    pub fn enqueue(&mut self, xid: Xid) {
        let Some(&idx) = self.by_xid.get(&xid) else {
            return;
        };
        {
            let ts = self.slots[idx].as_mut().expect("indexed slot occupied");
            if ts.enqueued {
                return;
            }
            ts.enqueued = true;
            ts.next = None;
        }
        match self.tail {
            Some(tail_idx) => {
                self.slots[tail_idx]
                    .as_mut()
                    .expect("tail slot occupied")
                    .next = Some(idx);
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    /// Record committed sub-transactions. Children inherit the parent's
    /// status and CSN and are linked immediately after the parent so GC
    /// removes them together.
    pub fn add_subtransactions(&mut self, parent: Xid, subxids: &[Xid]) {
        let Some(&parent_idx) = self.by_xid.get(&parent) else {
            return;
        };
        let (status, csn) = {
            let ts = self.slots[parent_idx].as_mut().expect("parent occupied");
            ts.n_subxids = subxids.len();
            (ts.status, ts.csn)
        };
        let mut after = parent_idx;
        for &sub in subxids {
            let idx = match self.by_xid.get(&sub) {
                Some(&idx) => idx,
                None => {
                    let idx = self.alloc(TxnState::new(sub));
                    self.by_xid.insert(sub, idx);
                    idx
                }
            };
            {
                let ts = self.slots[idx].as_mut().expect("sub slot occupied");
                ts.status = status;
                ts.csn = csn;
                ts.voting_complete = true;
                ts.enqueued = true;
            }
            // Splice after `after`, keeping the FIFO tail coherent.
            let after_next = self.slots[after].as_ref().expect("after occupied").next;
            self.slots[idx].as_mut().expect("sub slot occupied").next = after_next;
            self.slots[after].as_mut().expect("after occupied").next = Some(idx);
            if self.tail == Some(after) {
                self.tail = Some(idx);
            }
            after = idx;
        }
    }

    /// Propagate the parent's status and CSN to its chained children.
    pub fn adjust_subtransactions(&mut self, parent: Xid) {
        let Some(&parent_idx) = self.by_xid.get(&parent) else {
            return;
        };
        let (status, csn, n) = {
            let ts = self.slots[parent_idx].as_ref().expect("parent occupied");
            (ts.status, ts.csn, ts.n_subxids)
        };
        let mut cursor = self.slots[parent_idx].as_ref().expect("parent").next;
        for _ in 0..n {
            let Some(idx) = cursor else { break };
            let ts = self.slots[idx].as_mut().expect("sub occupied");
            ts.status = status;
            ts.csn = csn;
            cursor = ts.next;
        }
    }

    /// Walk the FIFO from the head, removing records whose CSN precedes
    /// `cutoff` and whose XID precedes `xid_bound`. The last record walked
    /// stays as the new head, matching the vacuum-horizon contract: the
    /// horizon never advances past a record the sweep has not cleared.
    pub fn gc(&mut self, cutoff: Csn, xid_bound: Xid) -> GcResult {
        let mut result = GcResult::default();
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let ts = self.slots[idx].as_ref().expect("fifo slot occupied");
            if ts.csn >= cutoff || ts.xid >= xid_bound {
                break;
            }
            let next = ts.next;
            if let Some(prev_idx) = prev {
                self.remove_slot(prev_idx);
                result.removed += 1;
            }
            prev = Some(idx);
            cursor = next;
        }
        if let Some(prev_idx) = prev {
            self.head = Some(prev_idx);
            result.new_oldest = self.slots[prev_idx].as_ref().map(|ts| ts.xid);
        }
        result
    }

    fn remove_slot(&mut self, idx: usize) {
        let Some(ts) = self.slots[idx].take() else {
            return;
        };
        self.by_xid.remove(&ts.xid);
        if !ts.gid.is_empty() {
            if let Some(entry) = self.by_gid.get_mut(&ts.gid) {
                entry.slot = None;
                entry.status = ts.status;
                entry.csn = ts.csn;
            }
        }
        self.free.push(idx);
    }

    /// Iterate all live records in FIFO order.
    pub fn iter_fifo(&self) -> impl Iterator<Item = &TxnState> {
        FifoIter {
            registry: self,
            cursor: self.head,
        }
    }

    /// XID of the oldest in-progress or in-doubt record, used as the local
    /// xmin floor.
    pub fn oldest_active_xid(&self) -> Option<Xid> {
        self.slots
            .iter()
            .flatten()
            .filter(|ts| matches!(ts.status, XidStatus::InProgress | XidStatus::Unknown))
            .map(|ts| ts.xid)
            .min()
    }
}

struct FifoIter<'a> {
    registry: &'a TxnRegistry,
    cursor: Option<usize>,
}

impl<'a> Iterator for FifoIter<'a> {
    type Item = &'a TxnState;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let ts = self.registry.slots[idx].as_ref()?;
        self.cursor = ts.next;
        Some(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(reg: &mut TxnRegistry, xid: Xid, csn: Csn) {
        let ts = reg.create(xid);
        ts.status = XidStatus::Committed;
        ts.csn = csn;
        reg.enqueue(xid);
    }

    #[test]
    fn create_is_idempotent_per_xid() {
        let mut reg = TxnRegistry::new();
        reg.create(7).snapshot = 100;
        let again = reg.create(7);
        assert_eq!(again.snapshot, 100);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn gc_keeps_the_last_walked_record() {
        let mut reg = TxnRegistry::new();
        for (xid, csn) in [(1, 10), (2, 20), (3, 30), (4, 40)] {
            committed(&mut reg, xid, csn);
        }
        // Cutoff clears records 1..3; record 3 stays as the new head.
        let result = reg.gc(35, 100);
        assert_eq!(result.removed, 2);
        assert_eq!(result.new_oldest, Some(3));
        assert!(!reg.contains(1));
        assert!(!reg.contains(2));
        assert!(reg.contains(3));
        assert!(reg.contains(4));
    }

    #[test]
    fn gc_respects_xid_bound() {
        let mut reg = TxnRegistry::new();
        for (xid, csn) in [(1, 10), (2, 20), (3, 30)] {
            committed(&mut reg, xid, csn);
        }
        let result = reg.gc(100, 2);
        assert_eq!(result.removed, 0);
        assert!(reg.contains(1));
    }

    #[test]
    fn subtransactions_follow_parent_through_gc() {
        let mut reg = TxnRegistry::new();
        {
            let ts = reg.create(10);
            ts.status = XidStatus::Committed;
            ts.csn = 50;
        }
        reg.enqueue(10);
        reg.add_subtransactions(10, &[11, 12]);
        committed(&mut reg, 20, 60);

        assert_eq!(reg.get(11).unwrap().csn, 50);
        assert_eq!(reg.get(12).unwrap().status, XidStatus::Committed);

        let fifo: Vec<Xid> = reg.iter_fifo().map(|ts| ts.xid).collect();
        assert_eq!(fifo, vec![10, 11, 12, 20]);

        // Everything before record 20 is collectable; parent and children go
        // together.
        let result = reg.gc(55, 100);
        assert_eq!(result.removed, 2);
        assert_eq!(result.new_oldest, Some(12));
        assert!(!reg.contains(10));
        assert!(!reg.contains(11));
        assert!(reg.contains(12));
    }

    #[test]
    fn adjust_subtransactions_propagates_outcome() {
        let mut reg = TxnRegistry::new();
        reg.create(10);
        reg.enqueue(10);
        reg.add_subtransactions(10, &[11]);
        {
            let ts = reg.get_mut(10).unwrap();
            ts.status = XidStatus::Aborted;
            ts.csn = 99;
        }
        reg.adjust_subtransactions(10);
        assert_eq!(reg.get(11).unwrap().status, XidStatus::Aborted);
        assert_eq!(reg.get(11).unwrap().csn, 99);
    }

    #[test]
    fn gid_status_survives_slot_removal() {
        let mut reg = TxnRegistry::new();
        {
            let ts = reg.create(5);
            ts.status = XidStatus::Committed;
            ts.csn = 10;
        }
        reg.bind_gid("CNV-1-5", 5);
        reg.exchange_global_status("CNV-1-5", XidStatus::Committed);
        committed(&mut reg, 5, 10);
        committed(&mut reg, 6, 20);
        committed(&mut reg, 7, 30);
        let _ = reg.gc(25, 100);
        assert!(!reg.contains(5));
        assert_eq!(reg.gid_status("CNV-1-5"), Some(XidStatus::Committed));
    }

    #[test]
    fn exchange_never_downgrades_aborted() {
        let mut reg = TxnRegistry::new();
        assert_eq!(
            reg.exchange_global_status("g1", XidStatus::Aborted),
            XidStatus::InProgress
        );
        assert_eq!(
            reg.exchange_global_status("g1", XidStatus::Committed),
            XidStatus::Aborted
        );
        assert_eq!(reg.gid_status("g1"), Some(XidStatus::Aborted));
    }
}
