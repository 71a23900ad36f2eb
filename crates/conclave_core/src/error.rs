//! Typed errors surfaced to users of the coordinating node.
//!
//! Plumbing-level failures (transport, codec, config store) travel as
//! `anyhow` chains; the enums here cover the outcomes callers must be able
//! to match on.

use crate::types::{ClusterStatus, Xid};

/// Why a distributed commit did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("node is not online: current status {0}")]
    NotOnline(ClusterStatus),

    #[error("node is in minority")]
    InMinority,

    #[error("cluster configuration changed during commit")]
    ConfigChanged,

    #[error("transaction {gid} aborted after {elapsed_ms} msec prepare timeout")]
    PrepareTimeout { gid: String, elapsed_ms: u64 },

    #[error("transaction {gid} aborted by remote vote")]
    RemoteAbort { gid: String },

    #[error("transaction {gid} aborted as a deadlock victim")]
    DeadlockVictim { gid: String },

    #[error("error injection for transaction {gid} (phase {phase})")]
    Injected { gid: String, phase: u8 },

    #[error("isolation level {0} is not supported for distributed transactions")]
    UnsupportedIsolation(&'static str),
}

/// Failure of an MVCC visibility check.
#[derive(Debug, thiserror::Error)]
pub enum VisibilityError {
    /// The in-doubt wait exhausted its retry budget. The reader fails; the
    /// in-doubt transaction itself is left alone.
    #[error("failed to get status of transaction {xid}")]
    StatusUnresolved { xid: Xid },
}
