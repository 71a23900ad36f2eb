//! Distributed commit and cluster-membership core for synchronous
//! multi-master replication.
//!
//! The crate is transport-agnostic: the node runtime supplies an arbiter
//! channel ([`types::ArbiterTransport`]), a shared config store
//! ([`types::ConfigStore`]) and a logical replication transport speaking the
//! framing defined in [`proto`]. On top of those seams the core provides:
//!
//! - a monotone CSN clock ([`clock`]) seeding snapshots and commit
//!   timestamps,
//! - the transaction state table ([`registry`]) with MVCC visibility and the
//!   cluster-wide vacuum horizon ([`visibility`]),
//! - the two-phase commit coordinator and applier control ([`coordinator`]),
//! - the connectivity-clique failure detector ([`arbiter`], [`clique`]),
//! - the single-donor recovery protocol ([`recovery`]),
//! - distributed deadlock detection over merged wait-for graphs
//!   ([`deadlock`]).

pub mod arbiter;
pub mod clique;
pub mod clock;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod deadlock;
pub mod error;
pub mod messages;
pub mod proto;
pub mod registry;
pub mod recovery;
pub mod types;
pub mod visibility;

pub use arbiter::Arbiter;
pub use clock::CsnClock;
pub use config::{ClusterConfig, MemberAddr};
pub use context::{NodeContext, NodeRecord, SharedState};
pub use coordinator::{prepare_timeout, Coordinator, CurrentTxn, PreparedOutcome};
pub use error::{CommitError, VisibilityError};
pub use messages::ArbiterMessage;
pub use proto::{AttrValue, CommitKind, ReplFrame, TupleData};
pub use recovery::RecoveryController;
pub use registry::{TxnRegistry, TxnState};
pub use types::{
    lock_graph_key, node_mask_key, ArbiterTransport, ClusterStatus, ConfigStore, Csn, Gtid, Lsn,
    NodeId, NodeMask, Xid, XidStatus, INVALID_CSN, INVALID_XID, MAX_NODES, MEMBERS_KEY,
};
pub use visibility::{Visibility, VisibilityService};
