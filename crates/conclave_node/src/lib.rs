//! Node runtime for the conclave multi-master replication core.
//!
//! Wires the transport-agnostic core to concrete pieces: an in-memory host
//! engine, in-process and TCP arbiter transports, the replication log and
//! its per-peer streams, a row-lock table feeding the deadlock detector,
//! and the administrative surface. Integration tests build whole clusters
//! in one process out of these parts.

pub mod configstore;
pub mod engine;
pub mod locks;
pub mod node;
pub mod replication;
pub mod transport;

pub use configstore::{DirConfigStore, MemoryConfigStore};
pub use engine::MemoryEngine;
pub use locks::LockTable;
pub use node::{ClusterStateInfo, IsolationLevel, Node, NodeStateInfo, Session};
pub use replication::{ReplLog, StreamBatch};
pub use transport::{FaultInjector, LocalArbiter, LocalArbiterHub, TcpArbiter};
