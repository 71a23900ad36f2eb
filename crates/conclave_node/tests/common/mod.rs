//! Shared helpers for integration tests: an in-process cluster harness with
//! fault injection and poll-until helpers.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conclave_core::{ClusterConfig, NodeId};
use conclave_node::{FaultInjector, LocalArbiterHub, MemoryConfigStore, Node};

/// Default deadline for cluster convergence checks.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct TestCluster {
    pub nodes: Vec<Arc<Node>>,
    pub faults: Arc<FaultInjector>,
    pub hub: Arc<LocalArbiterHub>,
    pub store: Arc<MemoryConfigStore>,
}

/// Timing knobs tightened for tests.
pub fn test_config(node_id: NodeId, n: usize) -> ClusterConfig {
    let mut cfg = ClusterConfig::in_process(node_id, n);
    cfg.heartbeat_send_timeout = Duration::from_millis(50);
    cfg.heartbeat_recv_timeout = Duration::from_millis(250);
    cfg.node_disable_delay = Duration::ZERO;
    cfg.min_2pc_timeout = Duration::from_secs(5);
    cfg.prepare_ratio = 200;
    cfg.min_recovery_lag = 512;
    cfg.max_recovery_lag = 1 << 40;
    cfg.vacuum_delay = Duration::from_millis(500);
    cfg.gc_period = 64;
    cfg.worker_pool_size = 4;
    cfg.deadlock_timeout = Duration::from_millis(300);
    cfg
}

impl TestCluster {
    pub fn launch(n: usize) -> Self {
        Self::launch_with(n, |_| {})
    }

    pub fn launch_with(n: usize, tweak: impl Fn(&mut ClusterConfig)) -> Self {
        let faults = FaultInjector::new();
        let hub = LocalArbiterHub::new(faults.clone());
        let store = MemoryConfigStore::new();
        let nodes: Vec<Arc<Node>> = (1..=n as NodeId)
            .map(|id| {
                let mut cfg = test_config(id, n);
                tweak(&mut cfg);
                Node::new(cfg, hub.clone(), faults.clone(), store.clone())
            })
            .collect();
        for node in &nodes {
            node.link_peers(&nodes);
        }
        for node in &nodes {
            node.start();
        }
        for node in &nodes {
            node.finish_boot();
        }
        Self {
            nodes,
            faults,
            hub,
            store,
        }
    }

    pub fn node(&self, id: NodeId) -> Arc<Node> {
        self.nodes[(id - 1) as usize].clone()
    }

    pub fn create_table_all(&self, name: &str) {
        for node in &self.nodes {
            node.create_table(name);
        }
    }

    /// Insert through a full distributed commit on `node`.
    pub async fn put(&self, node: NodeId, table: &str, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let mut session = self.node(node).begin()?;
        session.insert(table, key, value).await?;
        session.commit().await?;
        Ok(())
    }

    pub async fn update(
        &self,
        node: NodeId,
        table: &str,
        key: &[u8],
        value: &[u8],
    ) -> anyhow::Result<()> {
        let mut session = self.node(node).begin()?;
        session.update(table, key, value).await?;
        session.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, node: NodeId, table: &str, key: &[u8]) -> anyhow::Result<()> {
        let mut session = self.node(node).begin()?;
        session.delete(table, key).await?;
        session.commit().await?;
        Ok(())
    }

    /// Read under a fresh snapshot on `node`.
    pub async fn get(&self, node: NodeId, table: &str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let session = self.node(node).begin()?;
        session.select(table, key).await
    }

    /// Poll until `node` reads `expected` for the key.
    pub async fn wait_for_value(
        &self,
        node: NodeId,
        table: &str,
        key: &[u8],
        expected: Option<&[u8]>,
    ) {
        let ok = eventually(CONVERGE_TIMEOUT, || async {
            match self.get(node, table, key).await {
                Ok(value) => value.as_deref() == expected,
                Err(_) => false,
            }
        })
        .await;
        assert!(
            ok,
            "node {node} never converged to {:?} for key {:?} in {table}",
            expected.map(String::from_utf8_lossy),
            String::from_utf8_lossy(key),
        );
    }

    pub async fn wait_for_status(&self, node: NodeId, status: &str) {
        let ok = eventually(CONVERGE_TIMEOUT, || async {
            self.node(node).get_cluster_state().status == status
        })
        .await;
        assert!(
            ok,
            "node {node} never reached status {status}, currently {}",
            self.node(node).get_cluster_state().status
        );
    }

    pub async fn wait_for_disabled_mask(&self, node: NodeId, mask: u64) {
        let ok = eventually(CONVERGE_TIMEOUT, || async {
            self.node(node).get_cluster_state().disabled_mask == mask
        })
        .await;
        assert!(
            ok,
            "node {node} never saw disabled mask {mask:#x}, currently {:#x}",
            self.node(node).get_cluster_state().disabled_mask
        );
    }
}

/// Poll an async predicate until it holds or the deadline passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut pred: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pred().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
