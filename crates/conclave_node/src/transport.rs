//! Arbiter channel transports.
//!
//! Two implementations of the core's `ArbiterTransport` seam: an in-process
//! hub used by tests and single-process clusters (with fault injection for
//! partition scenarios), and a TCP transport framing messages with a length
//! prefix for real deployments.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use conclave_core::{ArbiterMessage, ArbiterTransport, NodeId};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Injected connectivity faults shared by the arbiter hub and the
/// replication links of an in-process cluster.
#[derive(Default)]
pub struct FaultInjector {
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl FaultInjector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sever both directions between `a` and `b`.
    pub fn block_pair(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.write().unwrap();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    pub fn unblock_pair(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.write().unwrap();
        blocked.remove(&(a, b));
        blocked.remove(&(b, a));
    }

    /// Partition the cluster into two camps.
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        for &a in left {
            for &b in right {
                self.block_pair(a, b);
            }
        }
    }

    pub fn heal(&self) {
        self.blocked.write().unwrap().clear();
    }

    pub fn is_blocked(&self, from: NodeId, to: NodeId) -> bool {
        self.blocked.read().unwrap().contains(&(from, to))
    }
}

/// In-process message hub: each registered node owns a receiver; sends are
/// instant unless a fault is injected or the peer is unregistered.
pub struct LocalArbiterHub {
    faults: Arc<FaultInjector>,
    inboxes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<(NodeId, ArbiterMessage)>>>,
    incarnations: RwLock<HashMap<NodeId, u64>>,
    epoch: AtomicU64,
}

impl LocalArbiterHub {
    pub fn new(faults: Arc<FaultInjector>) -> Arc<Self> {
        Arc::new(Self {
            faults,
            inboxes: RwLock::new(HashMap::new()),
            incarnations: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        })
    }

    /// Attach a node (or a restarted incarnation of it) and hand back its
    /// inbox.
    pub fn register(&self, node: NodeId) -> mpsc::UnboundedReceiver<(NodeId, ArbiterMessage)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().unwrap().insert(node, tx);
        let incarnation = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        self.incarnations.write().unwrap().insert(node, incarnation);
        rx
    }

    pub fn unregister(&self, node: NodeId) {
        self.inboxes.write().unwrap().remove(&node);
    }

    /// Monotone per-node incarnation, bumped on every (re)register. Senders
    /// use it to notice a peer restart and rewind to the acked position.
    pub fn incarnation(&self, node: NodeId) -> u64 {
        self.incarnations
            .read()
            .unwrap()
            .get(&node)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_registered(&self, node: NodeId) -> bool {
        self.inboxes.read().unwrap().contains_key(&node)
    }

    fn send(&self, from: NodeId, to: NodeId, msg: ArbiterMessage) -> anyhow::Result<()> {
        if self.faults.is_blocked(from, to) {
            anyhow::bail!("link {from} -> {to} is partitioned");
        }
        let inboxes = self.inboxes.read().unwrap();
        let Some(tx) = inboxes.get(&to) else {
            anyhow::bail!("node {to} is not reachable");
        };
        tx.send((from, msg))
            .map_err(|_| anyhow::anyhow!("node {to} inbox closed"))
    }
}

/// Per-node handle implementing the core transport seam over the hub.
pub struct LocalArbiter {
    hub: Arc<LocalArbiterHub>,
    me: NodeId,
}

impl LocalArbiter {
    pub fn new(hub: Arc<LocalArbiterHub>, me: NodeId) -> Arc<Self> {
        Arc::new(Self { hub, me })
    }
}

#[async_trait]
impl ArbiterTransport for LocalArbiter {
    async fn send(&self, target: NodeId, msg: ArbiterMessage) -> anyhow::Result<()> {
        self.hub.send(self.me, target, msg)
    }
}

/// Length-prefixed frame codec shared by both TCP directions.
fn frame_message(msg: &ArbiterMessage) -> BytesMut {
    let payload = msg.encode();
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    buf
}

async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<Option<ArbiterMessage>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= 1 << 20, "oversized arbiter frame ({len} bytes)");
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.context("read frame")?;
    Ok(Some(ArbiterMessage::decode(&payload)?))
}

/// TCP transport: lazily connected per-peer sockets with jittered
/// exponential back-off reconnects.
pub struct TcpArbiter {
    me: NodeId,
    peers: HashMap<NodeId, String>,
    conns: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<Option<TcpStream>>>>>,
}

impl TcpArbiter {
    pub fn new(me: NodeId, peers: HashMap<NodeId, String>) -> Arc<Self> {
        Arc::new(Self {
            me,
            peers,
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// Accept loop: decode frames and forward them into `inbox` tagged with
    /// the sender announced in the message itself.
    pub async fn serve(
        listen: String,
        inbox: mpsc::UnboundedSender<(NodeId, ArbiterMessage)>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("bind arbiter socket {listen}"))?;
        loop {
            let (mut stream, addr) = listener.accept().await.context("accept arbiter conn")?;
            let inbox = inbox.clone();
            tokio::spawn(async move {
                loop {
                    match read_frame(&mut stream).await {
                        Ok(Some(msg)) => {
                            let from = message_sender(&msg);
                            if inbox.send((from, msg)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(err) => {
                            tracing::debug!(peer = %addr, error = %err, "arbiter conn closed");
                            return;
                        }
                    }
                }
            });
        }
    }

    fn conn_slot(&self, target: NodeId) -> Arc<tokio::sync::Mutex<Option<TcpStream>>> {
        self.conns
            .lock()
            .unwrap()
            .entry(target)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }
}

/// Best-effort mapping from a message to the node that sent it.
fn message_sender(msg: &ArbiterMessage) -> NodeId {
    match msg {
        ArbiterMessage::Heartbeat { node, .. } => *node,
        ArbiterMessage::Ready { node, .. } => *node,
        ArbiterMessage::Aborted { node, .. } => *node,
        ArbiterMessage::Prepare { gtid, .. } => gtid.node,
        // COMMIT/ABORT senders are identified by the gid's coordinator.
        ArbiterMessage::Commit { .. } | ArbiterMessage::Abort { .. } => 0,
    }
}

#[async_trait]
impl ArbiterTransport for TcpArbiter {
    async fn send(&self, target: NodeId, msg: ArbiterMessage) -> anyhow::Result<()> {
        let addr = self
            .peers
            .get(&target)
            .with_context(|| format!("unknown peer {target}"))?
            .clone();
        let slot = self.conn_slot(target);
        let mut guard = slot.lock().await;

        let mut delay = Duration::from_millis(10);
        for attempt in 0..4 {
            if guard.is_none() {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => *guard = Some(stream),
                    Err(err) => {
                        if attempt == 3 {
                            return Err(err).with_context(|| format!("connect arbiter {addr}"));
                        }
                        let jitter = rand::thread_rng().gen_range(0..delay.as_millis() as u64 + 1);
                        tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                        delay = (delay * 2).min(Duration::from_millis(200));
                        continue;
                    }
                }
            }
            let stream = guard.as_mut().expect("connection present");
            let frame = frame_message(&msg);
            match stream.write_all(frame.chunk()).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    tracing::debug!(node = self.me, peer = target, error = %err, "arbiter send failed, reconnecting");
                    *guard = None;
                }
            }
        }
        anyhow::bail!("arbiter send to node {target} failed after retries")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_hub_delivers_and_partitions() {
        let faults = FaultInjector::new();
        let hub = LocalArbiterHub::new(faults.clone());
        let _rx1 = hub.register(1);
        let mut rx2 = hub.register(2);

        let t1 = LocalArbiter::new(hub.clone(), 1);
        t1.send(2, ArbiterMessage::Abort { gid: "g".into() })
            .await
            .expect("delivery");
        let (from, msg) = rx2.recv().await.expect("message");
        assert_eq!(from, 1);
        assert_eq!(msg, ArbiterMessage::Abort { gid: "g".into() });

        faults.block_pair(1, 2);
        assert!(t1
            .send(2, ArbiterMessage::Abort { gid: "g".into() })
            .await
            .is_err());
        faults.heal();
        assert!(t1
            .send(2, ArbiterMessage::Abort { gid: "g".into() })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn incarnation_bumps_on_reregister() {
        let hub = LocalArbiterHub::new(FaultInjector::new());
        let _rx = hub.register(3);
        let first = hub.incarnation(3);
        let _rx = hub.register(3);
        assert!(hub.incarnation(3) > first);
    }

    #[tokio::test]
    async fn tcp_transport_round_trips() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);
        let serve_addr = addr.clone();
        tokio::spawn(async move {
            let _ = TcpArbiter::serve(serve_addr, tx).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let peers = HashMap::from([(2u32, addr)]);
        let transport = TcpArbiter::new(1, peers);
        transport
            .send(
                2,
                ArbiterMessage::Ready {
                    gid: "CNV-1-1".into(),
                    node: 1,
                    csn: 42,
                },
            )
            .await
            .expect("send");
        let (from, msg) = rx.recv().await.expect("frame");
        assert_eq!(from, 1);
        match msg {
            ArbiterMessage::Ready { csn, .. } => assert_eq!(csn, 42),
            other => panic!("unexpected {other:?}"),
        }
    }
}
