//! Per-node replication log and the stream batches exchanged between nodes.
//!
//! Every replicable transaction applied at a node (local or forwarded) is
//! appended to that node's ordered log; LSNs are byte offsets into it. A
//! sender streams log entries to one peer: in normal mode only transactions
//! this node originated, in recovery mode everything after the recoverer's
//! slot position, with the caught-up evaluation attached to each outgoing
//! commit record.

use std::sync::RwLock;

use conclave_core::{CommitKind, Csn, Lsn, NodeId, ReplFrame, Xid, INVALID_CSN};
use tokio::sync::Notify;

/// Commit metadata of a log entry; the closing `C` frame is encoded at send
/// time so the caught-up flag reflects the donor's current verdict.
#[derive(Clone, Debug)]
pub struct CommitInfo {
    pub kind: CommitKind,
    pub commit_time: u64,
    pub csn: Option<Csn>,
    pub gid: Option<String>,
}

/// One transaction in the replication log.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub origin: NodeId,
    pub origin_xid: Xid,
    /// Snapshot CSN carried by the `B` frame; invalid means the transaction
    /// is local-only and must never reach the wire.
    pub snapshot: Csn,
    /// End position of this transaction in the *origin's* log, preserved
    /// across forwarding for per-origin dedup.
    pub origin_end_lsn: Lsn,
    /// Positions in this node's log.
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    /// Encoded row frames (R/I/U/D), without `B` and `C`.
    pub row_frames: Vec<Vec<u8>>,
    pub commit: CommitInfo,
}

impl LogEntry {
    fn payload_len(&self) -> u64 {
        // Approximate on-wire footprint: rows plus the B and C frames.
        let rows: usize = self.row_frames.iter().map(|f| f.len()).sum();
        (rows + 64) as u64
    }
}

#[derive(Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    end_lsn: Lsn,
}

/// Append-only ordered log with byte-offset LSNs.
#[derive(Default)]
pub struct ReplLog {
    inner: RwLock<LogInner>,
    pub appended: Notify,
}

impl ReplLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transaction; returns its end LSN. Entries whose origin is
    /// this node get their `origin_end_lsn` stamped here.
    pub fn append(&self, mut entry: LogEntry, stamp_origin_lsn: bool) -> Lsn {
        let mut inner = self.inner.write().unwrap();
        entry.start_lsn = inner.end_lsn;
        let end = inner.end_lsn + entry.payload_len();
        entry.end_lsn = end;
        if stamp_origin_lsn {
            entry.origin_end_lsn = end;
        }
        inner.end_lsn = end;
        inner.entries.push(entry);
        drop(inner);
        self.appended.notify_waiters();
        end
    }

    pub fn end_lsn(&self) -> Lsn {
        self.inner.read().unwrap().end_lsn
    }

    /// Entries strictly after `pos`.
    pub fn read_from(&self, pos: Lsn) -> Vec<LogEntry> {
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.end_lsn > pos)
            .cloned()
            .collect()
    }
}

/// One transaction shipped over a replication link, plus the stream
/// position bookkeeping the receiver acks.
#[derive(Clone, Debug)]
pub struct StreamBatch {
    /// Node whose sender delivered this batch (donor during recovery).
    pub sender: NodeId,
    /// Position in the sender's log after this batch; the receiver acks it.
    pub sender_lsn: Lsn,
    /// Originating node of the transaction (differs from `sender` on
    /// forwarded recovery streams).
    pub origin: NodeId,
    /// End position in the origin's log, the receiver's dedup horizon.
    /// Zero for keepalive batches.
    pub origin_end_lsn: Lsn,
    /// Fully encoded frames: `B`, rows, `C`.
    pub frames: Vec<Vec<u8>>,
    /// Donor's caught-up verdict for keepalive batches with no frames.
    pub caught_up: bool,
}

/// Encode a log entry into wire frames for one receiver.
pub fn encode_entry(entry: &LogEntry, caught_up: bool) -> Vec<Vec<u8>> {
    let mut frames = Vec::with_capacity(entry.row_frames.len() + 2);
    if !entry.row_frames.is_empty() || entry.commit.kind == CommitKind::Prepare {
        frames.push(
            ReplFrame::Begin {
                origin: entry.origin,
                xid: entry.origin_xid,
                snapshot: entry.snapshot,
            }
            .encode(),
        );
        frames.extend(entry.row_frames.iter().cloned());
    }
    frames.push(
        ReplFrame::Commit {
            kind: entry.commit.kind,
            origin: entry.origin,
            caught_up,
            commit_lsn: entry.origin_end_lsn,
            end_lsn: entry.origin_end_lsn,
            commit_time: entry.commit.commit_time,
            csn: entry.commit.csn,
            gid: entry.commit.gid.clone(),
        }
        .encode(),
    );
    frames
}

/// The output-side filter: a transaction with an invalid snapshot CSN is
/// local-only and is dropped unless the stream is a recovery session.
pub fn entry_shippable(entry: &LogEntry, recovery: bool) -> bool {
    entry.snapshot != INVALID_CSN || recovery
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(origin: NodeId, xid: Xid, kind: CommitKind) -> LogEntry {
        LogEntry {
            origin,
            origin_xid: xid,
            snapshot: 100,
            origin_end_lsn: 0,
            start_lsn: 0,
            end_lsn: 0,
            row_frames: vec![ReplFrame::Insert {
                new_tuple: conclave_core::TupleData::text(&[b"k", b"v"]),
            }
            .encode()],
            commit: CommitInfo {
                kind,
                commit_time: 1,
                csn: None,
                gid: Some("CNV-1-1".into()),
            },
        }
    }

    #[test]
    fn lsns_are_monotone_byte_offsets() {
        let log = ReplLog::new();
        let a = log.append(entry(1, 1, CommitKind::Prepare), true);
        let b = log.append(entry(1, 2, CommitKind::Prepare), true);
        assert!(b > a);
        assert_eq!(log.end_lsn(), b);

        let tail = log.read_from(a);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].origin_xid, 2);
        assert_eq!(tail[0].origin_end_lsn, b);
    }

    #[test]
    fn forwarded_entries_keep_the_origin_lsn() {
        let log = ReplLog::new();
        let mut forwarded = entry(2, 9, CommitKind::Prepare);
        forwarded.origin_end_lsn = 7777;
        log.append(forwarded, false);
        assert_eq!(log.read_from(0)[0].origin_end_lsn, 7777);
    }

    #[test]
    fn filtered_transactions_stay_off_the_wire() {
        let mut e = entry(1, 1, CommitKind::Prepare);
        e.snapshot = INVALID_CSN;
        assert!(!entry_shippable(&e, false));
        assert!(entry_shippable(&e, true));
    }

    #[test]
    fn encoded_entry_brackets_rows_with_begin_and_commit() {
        let e = entry(1, 5, CommitKind::Prepare);
        let frames = encode_entry(&e, false);
        assert_eq!(frames.len(), 3);
        assert!(matches!(
            ReplFrame::decode(&frames[0]).unwrap(),
            ReplFrame::Begin { xid: 5, .. }
        ));
        assert!(matches!(
            ReplFrame::decode(&frames[2]).unwrap(),
            ReplFrame::Commit {
                kind: CommitKind::Prepare,
                ..
            }
        ));
    }
}
