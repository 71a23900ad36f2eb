//! Wire messages of the arbiter channel.
//!
//! The arbiter socket is the latency-critical path carrying PREPARE requests,
//! votes and commit/abort notifications directly between nodes, plus
//! heartbeats. Frames are hand-encoded big-endian with a leading tag byte;
//! the slow, size-bounded state (masks, lock graphs) travels through the
//! shared config store instead.

use crate::types::{Csn, Gtid, NodeId, Xid};

const TAG_PREPARE: u8 = b'P';
const TAG_READY: u8 = b'R';
const TAG_ABORTED: u8 = b'A';
const TAG_COMMIT: u8 = b'C';
const TAG_ABORT: u8 = b'X';
const TAG_HEARTBEAT: u8 = b'H';

/// One frame on the arbiter channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArbiterMessage {
    /// Coordinator -> participants: request a vote on `gid`. `csn` is the
    /// coordinator's prepare CSN and ratchets the receiver's clock.
    Prepare { gid: String, gtid: Gtid, csn: Csn },
    /// Participant -> coordinator: prepared successfully, local CSN attached.
    Ready { gid: String, node: NodeId, csn: Csn },
    /// Participant -> coordinator: prepare failed or was refused.
    Aborted { gid: String, node: NodeId },
    /// Coordinator -> participants: commit with the final CSN.
    Commit { gid: String, csn: Csn },
    /// Coordinator -> participants: abort.
    Abort { gid: String },
    /// Periodic liveness beacon. Besides the sender's connectivity mask it
    /// gossips the sender's clock and oldest snapshot, which feed clock
    /// synchronization and the cluster-wide vacuum horizon.
    Heartbeat {
        node: NodeId,
        time: u64,
        connectivity: u64,
        last_csn: Csn,
        oldest_snapshot: Csn,
    },
}

impl ArbiterMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match self {
            ArbiterMessage::Prepare { gid, gtid, csn } => {
                out.push(TAG_PREPARE);
                put_str(&mut out, gid);
                out.extend_from_slice(&gtid.node.to_be_bytes());
                out.extend_from_slice(&gtid.xid.to_be_bytes());
                out.extend_from_slice(&csn.to_be_bytes());
            }
            ArbiterMessage::Ready { gid, node, csn } => {
                out.push(TAG_READY);
                put_str(&mut out, gid);
                out.extend_from_slice(&node.to_be_bytes());
                out.extend_from_slice(&csn.to_be_bytes());
            }
            ArbiterMessage::Aborted { gid, node } => {
                out.push(TAG_ABORTED);
                put_str(&mut out, gid);
                out.extend_from_slice(&node.to_be_bytes());
            }
            ArbiterMessage::Commit { gid, csn } => {
                out.push(TAG_COMMIT);
                put_str(&mut out, gid);
                out.extend_from_slice(&csn.to_be_bytes());
            }
            ArbiterMessage::Abort { gid } => {
                out.push(TAG_ABORT);
                put_str(&mut out, gid);
            }
            ArbiterMessage::Heartbeat {
                node,
                time,
                connectivity,
                last_csn,
                oldest_snapshot,
            } => {
                out.push(TAG_HEARTBEAT);
                out.extend_from_slice(&node.to_be_bytes());
                out.extend_from_slice(&time.to_be_bytes());
                out.extend_from_slice(&connectivity.to_be_bytes());
                out.extend_from_slice(&last_csn.to_be_bytes());
                out.extend_from_slice(&oldest_snapshot.to_be_bytes());
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(!buf.is_empty(), "empty arbiter frame");
        let mut offset = 1usize;
        match buf[0] {
            TAG_PREPARE => {
                let gid = get_str(buf, &mut offset)?;
                let node = get_u32(buf, &mut offset)?;
                let xid = get_u64(buf, &mut offset)? as Xid;
                let csn = get_u64(buf, &mut offset)?;
                Ok(ArbiterMessage::Prepare {
                    gid,
                    gtid: Gtid::new(node, xid),
                    csn,
                })
            }
            TAG_READY => {
                let gid = get_str(buf, &mut offset)?;
                let node = get_u32(buf, &mut offset)?;
                let csn = get_u64(buf, &mut offset)?;
                Ok(ArbiterMessage::Ready { gid, node, csn })
            }
            TAG_ABORTED => {
                let gid = get_str(buf, &mut offset)?;
                let node = get_u32(buf, &mut offset)?;
                Ok(ArbiterMessage::Aborted { gid, node })
            }
            TAG_COMMIT => {
                let gid = get_str(buf, &mut offset)?;
                let csn = get_u64(buf, &mut offset)?;
                Ok(ArbiterMessage::Commit { gid, csn })
            }
            TAG_ABORT => {
                let gid = get_str(buf, &mut offset)?;
                Ok(ArbiterMessage::Abort { gid })
            }
            TAG_HEARTBEAT => {
                let node = get_u32(buf, &mut offset)?;
                let time = get_u64(buf, &mut offset)?;
                let connectivity = get_u64(buf, &mut offset)?;
                let last_csn = get_u64(buf, &mut offset)?;
                let oldest_snapshot = get_u64(buf, &mut offset)?;
                Ok(ArbiterMessage::Heartbeat {
                    node,
                    time,
                    connectivity,
                    last_csn,
                    oldest_snapshot,
                })
            }
            other => anyhow::bail!("unknown arbiter frame tag {other:#x}"),
        }
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn get_str(buf: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let len = get_u16(buf, offset)? as usize;
    anyhow::ensure!(*offset + len <= buf.len(), "arbiter frame short string");
    let s = std::str::from_utf8(&buf[*offset..*offset + len])?.to_string();
    *offset += len;
    Ok(s)
}

fn get_u16(buf: &[u8], offset: &mut usize) -> anyhow::Result<u16> {
    anyhow::ensure!(*offset + 2 <= buf.len(), "arbiter frame short u16");
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[*offset..*offset + 2]);
    *offset += 2;
    Ok(u16::from_be_bytes(raw))
}

fn get_u32(buf: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= buf.len(), "arbiter frame short u32");
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(raw))
}

fn get_u64(buf: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= buf.len(), "arbiter frame short u64");
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_survive_the_wire() {
        let msgs = vec![
            ArbiterMessage::Prepare {
                gid: "CNV-1-42".into(),
                gtid: Gtid::new(1, 42),
                csn: 123_456,
            },
            ArbiterMessage::Ready {
                gid: "CNV-1-42".into(),
                node: 3,
                csn: 123_500,
            },
            ArbiterMessage::Heartbeat {
                node: 2,
                time: 1,
                connectivity: 0b100,
                last_csn: 99,
                oldest_snapshot: 17,
            },
        ];
        for msg in msgs {
            let decoded = ArbiterMessage::decode(&msg.encode()).expect("decode");
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let buf = ArbiterMessage::Abort { gid: "g".into() }.encode();
        assert!(ArbiterMessage::decode(&buf[..buf.len() - 1]).is_err());
    }
}
