//! Row lock table feeding the distributed deadlock detector.
//!
//! Updates and deletes take a per-row lock for the duration of the owning
//! transaction. Waiters register a wait-for edge (waiter GTID -> holder
//! GTID) that the deadlock detector snapshots and publishes; acquisition is
//! async and polls a cancellation predicate so a transaction aborted as a
//! deadlock victim stops waiting promptly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conclave_core::deadlock::WaitEdge;
use conclave_core::{Gtid, Xid};
use tokio::sync::Notify;

type RowKey = (String, Vec<u8>);

struct LockEntry {
    holder: Xid,
    holder_gtid: Gtid,
    waiters: Vec<Waiter>,
    notify: Arc<Notify>,
}

struct Waiter {
    xid: Xid,
    gtid: Gtid,
    since: Instant,
}

#[derive(Default)]
pub struct LockTable {
    rows: Mutex<HashMap<RowKey, LockEntry>>,
}

const LOCK_POLL: Duration = Duration::from_millis(50);

impl LockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the row lock for `xid`, waiting out any current holder.
    /// `cancelled` is polled on every wake-up; returning true fails the
    /// acquisition (the transaction was aborted while waiting).
    pub async fn acquire(
        &self,
        table: &str,
        key: &[u8],
        xid: Xid,
        gtid: Gtid,
        cancelled: impl Fn() -> bool,
    ) -> anyhow::Result<()> {
        let row: RowKey = (table.to_string(), key.to_vec());
        loop {
            let wakeup = {
                let mut rows = self.rows.lock().unwrap();
                match rows.get_mut(&row) {
                    None => {
                        rows.insert(
                            row.clone(),
                            LockEntry {
                                holder: xid,
                                holder_gtid: gtid,
                                waiters: Vec::new(),
                                notify: Arc::new(Notify::new()),
                            },
                        );
                        return Ok(());
                    }
                    Some(entry) if entry.holder == xid => return Ok(()),
                    Some(entry) => {
                        if !entry.waiters.iter().any(|w| w.xid == xid) {
                            entry.waiters.push(Waiter {
                                xid,
                                gtid,
                                since: Instant::now(),
                            });
                        }
                        entry.notify.clone()
                    }
                }
            };

            let notified = wakeup.notified();
            if cancelled() {
                self.drop_waiter(&row, xid);
                anyhow::bail!("transaction {xid} aborted while waiting for a row lock");
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(LOCK_POLL) => {}
            }
            if cancelled() {
                self.drop_waiter(&row, xid);
                anyhow::bail!("transaction {xid} aborted while waiting for a row lock");
            }
        }
    }

    fn drop_waiter(&self, row: &RowKey, xid: Xid) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(entry) = rows.get_mut(row) {
            entry.waiters.retain(|w| w.xid != xid);
        }
    }

    /// Forget every lock and waiter, as a crash would.
    pub fn reset(&self) {
        let mut rows = self.rows.lock().unwrap();
        for entry in rows.values() {
            entry.notify.notify_waiters();
        }
        rows.clear();
    }

    /// Release every lock held by `xid` and wake the contenders.
    pub fn release_all(&self, xid: Xid) {
        let mut rows = self.rows.lock().unwrap();
        let mut freed = Vec::new();
        for (row, entry) in rows.iter_mut() {
            entry.waiters.retain(|w| w.xid != xid);
            if entry.holder == xid {
                freed.push(row.clone());
            }
        }
        for row in freed {
            if let Some(entry) = rows.remove(&row) {
                entry.notify.notify_waiters();
            }
        }
    }

    /// Snapshot of the local wait-for graph.
    pub fn wait_edges(&self) -> Vec<WaitEdge> {
        let rows = self.rows.lock().unwrap();
        let mut edges = Vec::new();
        for entry in rows.values() {
            for waiter in &entry.waiters {
                edges.push(WaitEdge {
                    waiter: waiter.gtid,
                    holder: entry.holder_gtid,
                });
            }
        }
        edges
    }

    /// Age of the longest-waiting waiter, if any; feeds the implicit
    /// deadlock heuristic when the apply pool stops making progress.
    pub fn longest_wait(&self) -> Option<Duration> {
        let rows = self.rows.lock().unwrap();
        rows.values()
            .flat_map(|entry| entry.waiters.iter())
            .map(|w| w.since.elapsed())
            .max()
    }

    /// Local transactions involved in any wait relationship.
    pub fn participants(&self) -> Vec<Gtid> {
        let rows = self.rows.lock().unwrap();
        let mut out = Vec::new();
        for entry in rows.values() {
            if !entry.waiters.is_empty() {
                out.push(entry.holder_gtid);
                out.extend(entry.waiters.iter().map(|w| w.gtid));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn lock_is_reentrant_and_exclusive() {
        let locks = LockTable::new();
        locks
            .acquire("t", b"k", 1, Gtid::new(1, 1), || false)
            .await
            .expect("first");
        locks
            .acquire("t", b"k", 1, Gtid::new(1, 1), || false)
            .await
            .expect("reentrant");

        let locks2 = locks.clone();
        let contender = tokio::spawn(async move {
            locks2
                .acquire("t", b"k", 2, Gtid::new(1, 2), || false)
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!contender.is_finished());
        assert_eq!(locks.wait_edges().len(), 1);

        locks.release_all(1);
        contender.await.expect("join").expect("acquired after release");
    }

    #[tokio::test]
    async fn cancelled_waiter_gives_up() {
        let locks = LockTable::new();
        locks
            .acquire("t", b"k", 1, Gtid::new(1, 1), || false)
            .await
            .expect("holder");
        let flag = Arc::new(AtomicBool::new(false));
        let locks2 = locks.clone();
        let flag2 = flag.clone();
        let contender = tokio::spawn(async move {
            locks2
                .acquire("t", b"k", 2, Gtid::new(1, 2), move || {
                    flag2.load(Ordering::Relaxed)
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.store(true, Ordering::Relaxed);
        let res = contender.await.expect("join");
        assert!(res.is_err());
        assert!(locks.wait_edges().is_empty());
    }
}
