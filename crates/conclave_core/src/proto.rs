//! Byte-stream framing of the logical replication transport.
//!
//! The transport itself is external; the core defines the frame layout so
//! both ends agree. A transaction travels as `B`, then relation/row frames,
//! then a closing `C` whose flags byte distinguishes plain commit, prepare,
//! commit-prepared and abort-prepared.
//!
//! A `B` frame with an invalid CSN and no recovery session means the
//! transaction was local-only (read-only, or touching local tables) and the
//! output side drops it entirely.

use crate::types::{Csn, Lsn, NodeId, Xid};

/// Flags byte of a `C` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitKind {
    Commit = 0x00,
    Prepare = 0x01,
    CommitPrepared = 0x02,
    AbortPrepared = 0x03,
}

impl CommitKind {
    fn from_byte(b: u8) -> anyhow::Result<Self> {
        Ok(match b {
            0x00 => CommitKind::Commit,
            0x01 => CommitKind::Prepare,
            0x02 => CommitKind::CommitPrepared,
            0x03 => CommitKind::AbortPrepared,
            other => anyhow::bail!("unknown commit flags {other:#x}"),
        })
    }
}

/// One attribute inside a tuple block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    /// `n`: SQL NULL.
    Null,
    /// `u`: unchanged TOAST value, carried by reference only.
    UnchangedToast,
    /// `b`: internal binary representation.
    Binary(Vec<u8>),
    /// `s`: send/recv binary representation.
    SendRecv(Vec<u8>),
    /// `t`: text representation.
    Text(Vec<u8>),
}

/// Decoded tuple block (`T`).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TupleData {
    pub attrs: Vec<AttrValue>,
}

impl TupleData {
    pub fn text(values: &[&[u8]]) -> Self {
        Self {
            attrs: values.iter().map(|v| AttrValue::Text(v.to_vec())).collect(),
        }
    }
}

/// One frame of the replication stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplFrame {
    Begin {
        origin: NodeId,
        xid: Xid,
        snapshot: Csn,
    },
    Commit {
        kind: CommitKind,
        origin: NodeId,
        /// Donor's caught-up verdict at emit time; acted on only by a
        /// recovering receiver.
        caught_up: bool,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: u64,
        /// Final CSN, present only for commit-prepared.
        csn: Option<Csn>,
        /// GID, present for everything except plain commit.
        gid: Option<String>,
    },
    Relation {
        schema: String,
        name: String,
    },
    Insert {
        new_tuple: TupleData,
    },
    Update {
        key: Option<TupleData>,
        new_tuple: TupleData,
    },
    Delete {
        key: TupleData,
    },
}

impl ReplFrame {
    pub fn commit_prepared(origin: NodeId, gid: &str, csn: Csn, end_lsn: Lsn, time: u64) -> Self {
        ReplFrame::Commit {
            kind: CommitKind::CommitPrepared,
            origin,
            caught_up: false,
            commit_lsn: end_lsn,
            end_lsn,
            commit_time: time,
            csn: Some(csn),
            gid: Some(gid.to_string()),
        }
    }

    pub fn abort_prepared(origin: NodeId, gid: &str, end_lsn: Lsn, time: u64) -> Self {
        ReplFrame::Commit {
            kind: CommitKind::AbortPrepared,
            origin,
            caught_up: false,
            commit_lsn: end_lsn,
            end_lsn,
            commit_time: time,
            csn: None,
            gid: Some(gid.to_string()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match self {
            ReplFrame::Begin {
                origin,
                xid,
                snapshot,
            } => {
                out.push(b'B');
                out.extend_from_slice(&origin.to_be_bytes());
                out.extend_from_slice(&xid.to_be_bytes());
                out.extend_from_slice(&snapshot.to_be_bytes());
            }
            ReplFrame::Commit {
                kind,
                origin,
                caught_up,
                commit_lsn,
                end_lsn,
                commit_time,
                csn,
                gid,
            } => {
                out.push(b'C');
                out.push(*kind as u8);
                out.push(*origin as u8);
                out.push(u8::from(*caught_up));
                out.extend_from_slice(&commit_lsn.to_be_bytes());
                out.extend_from_slice(&end_lsn.to_be_bytes());
                out.extend_from_slice(&commit_time.to_be_bytes());
                if *kind == CommitKind::CommitPrepared {
                    out.extend_from_slice(&csn.unwrap_or_default().to_be_bytes());
                }
                if *kind != CommitKind::Commit {
                    put_string(&mut out, gid.as_deref().unwrap_or(""));
                }
            }
            ReplFrame::Relation { schema, name } => {
                out.push(b'R');
                put_name(&mut out, schema);
                put_name(&mut out, name);
            }
            ReplFrame::Insert { new_tuple } => {
                out.push(b'I');
                out.push(b'N');
                put_tuple(&mut out, new_tuple);
            }
            ReplFrame::Update { key, new_tuple } => {
                out.push(b'U');
                if let Some(key) = key {
                    out.push(b'K');
                    put_tuple(&mut out, key);
                }
                out.push(b'N');
                put_tuple(&mut out, new_tuple);
            }
            ReplFrame::Delete { key } => {
                out.push(b'D');
                out.push(b'K');
                put_tuple(&mut out, key);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(!buf.is_empty(), "empty replication frame");
        let mut offset = 1usize;
        match buf[0] {
            b'B' => {
                let origin = get_u32(buf, &mut offset)?;
                let xid = get_u64(buf, &mut offset)?;
                let snapshot = get_u64(buf, &mut offset)?;
                Ok(ReplFrame::Begin {
                    origin,
                    xid,
                    snapshot,
                })
            }
            b'C' => {
                let kind = CommitKind::from_byte(get_u8(buf, &mut offset)?)?;
                let origin = get_u8(buf, &mut offset)? as NodeId;
                let caught_up = get_u8(buf, &mut offset)? != 0;
                let commit_lsn = get_u64(buf, &mut offset)?;
                let end_lsn = get_u64(buf, &mut offset)?;
                let commit_time = get_u64(buf, &mut offset)?;
                let csn = if kind == CommitKind::CommitPrepared {
                    Some(get_u64(buf, &mut offset)?)
                } else {
                    None
                };
                let gid = if kind != CommitKind::Commit {
                    Some(get_string(buf, &mut offset)?)
                } else {
                    None
                };
                Ok(ReplFrame::Commit {
                    kind,
                    origin,
                    caught_up,
                    commit_lsn,
                    end_lsn,
                    commit_time,
                    csn,
                    gid,
                })
            }
            b'R' => {
                let schema = get_name(buf, &mut offset)?;
                let name = get_name(buf, &mut offset)?;
                Ok(ReplFrame::Relation { schema, name })
            }
            b'I' => {
                anyhow::ensure!(get_u8(buf, &mut offset)? == b'N', "INSERT missing new tuple");
                let new_tuple = get_tuple(buf, &mut offset)?;
                Ok(ReplFrame::Insert { new_tuple })
            }
            b'U' => {
                let marker = get_u8(buf, &mut offset)?;
                let (key, marker) = if marker == b'K' {
                    let key = get_tuple(buf, &mut offset)?;
                    (Some(key), get_u8(buf, &mut offset)?)
                } else {
                    (None, marker)
                };
                anyhow::ensure!(marker == b'N', "UPDATE missing new tuple");
                let new_tuple = get_tuple(buf, &mut offset)?;
                Ok(ReplFrame::Update { key, new_tuple })
            }
            b'D' => {
                anyhow::ensure!(get_u8(buf, &mut offset)? == b'K', "DELETE missing key tuple");
                let key = get_tuple(buf, &mut offset)?;
                Ok(ReplFrame::Delete { key })
            }
            other => anyhow::bail!("unknown replication frame tag {other:#x}"),
        }
    }
}

fn put_name(out: &mut Vec<u8>, name: &str) {
    let bytes = name.as_bytes();
    out.push(bytes.len().min(u8::MAX as usize) as u8);
    out.extend_from_slice(&bytes[..bytes.len().min(u8::MAX as usize)]);
}

fn get_name(buf: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let len = get_u8(buf, offset)? as usize;
    anyhow::ensure!(*offset + len <= buf.len(), "frame short name");
    let s = std::str::from_utf8(&buf[*offset..*offset + len])?.to_string();
    *offset += len;
    Ok(s)
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn get_string(buf: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let len = get_u16(buf, offset)? as usize;
    anyhow::ensure!(*offset + len <= buf.len(), "frame short string");
    let s = std::str::from_utf8(&buf[*offset..*offset + len])?.to_string();
    *offset += len;
    Ok(s)
}

fn put_tuple(out: &mut Vec<u8>, tuple: &TupleData) {
    out.push(b'T');
    out.extend_from_slice(&(tuple.attrs.len() as u16).to_be_bytes());
    for attr in &tuple.attrs {
        match attr {
            AttrValue::Null => out.push(b'n'),
            AttrValue::UnchangedToast => out.push(b'u'),
            AttrValue::Binary(data) => {
                out.push(b'b');
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
            AttrValue::SendRecv(data) => {
                out.push(b's');
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
            AttrValue::Text(data) => {
                out.push(b't');
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
        }
    }
}

fn get_tuple(buf: &[u8], offset: &mut usize) -> anyhow::Result<TupleData> {
    anyhow::ensure!(get_u8(buf, offset)? == b'T', "expected tuple block");
    let natts = get_u16(buf, offset)? as usize;
    let mut attrs = Vec::with_capacity(natts);
    for _ in 0..natts {
        let kind = get_u8(buf, offset)?;
        let attr = match kind {
            b'n' => AttrValue::Null,
            b'u' => AttrValue::UnchangedToast,
            b'b' | b's' | b't' => {
                let len = get_u32(buf, offset)? as usize;
                anyhow::ensure!(*offset + len <= buf.len(), "tuple short attribute");
                let data = buf[*offset..*offset + len].to_vec();
                *offset += len;
                match kind {
                    b'b' => AttrValue::Binary(data),
                    b's' => AttrValue::SendRecv(data),
                    _ => AttrValue::Text(data),
                }
            }
            other => anyhow::bail!("unknown attribute kind {other:#x}"),
        };
        attrs.push(attr);
    }
    Ok(TupleData { attrs })
}

fn get_u8(buf: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset < buf.len(), "frame short u8");
    let b = buf[*offset];
    *offset += 1;
    Ok(b)
}

fn get_u16(buf: &[u8], offset: &mut usize) -> anyhow::Result<u16> {
    anyhow::ensure!(*offset + 2 <= buf.len(), "frame short u16");
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[*offset..*offset + 2]);
    *offset += 2;
    Ok(u16::from_be_bytes(raw))
}

fn get_u32(buf: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= buf.len(), "frame short u32");
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(raw))
}

fn get_u64(buf: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= buf.len(), "frame short u64");
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_preserves_values_nulls_and_toast_markers() {
        let tuple = TupleData {
            attrs: vec![
                AttrValue::Text(b"42".to_vec()),
                AttrValue::Null,
                AttrValue::UnchangedToast,
                AttrValue::Binary(vec![0, 1, 2, 255]),
                AttrValue::SendRecv(vec![7; 300]),
            ],
        };
        let frame = ReplFrame::Insert {
            new_tuple: tuple.clone(),
        };
        let decoded = ReplFrame::decode(&frame.encode()).expect("decode");
        match decoded {
            ReplFrame::Insert { new_tuple } => assert_eq!(new_tuple, tuple),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn commit_prepared_carries_csn_and_gid() {
        let frame = ReplFrame::commit_prepared(2, "CNV-2-9", 777, 4096, 123);
        let decoded = ReplFrame::decode(&frame.encode()).expect("decode");
        match decoded {
            ReplFrame::Commit { kind, csn, gid, .. } => {
                assert_eq!(kind, CommitKind::CommitPrepared);
                assert_eq!(csn, Some(777));
                assert_eq!(gid.as_deref(), Some("CNV-2-9"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn update_without_key_tuple_decodes() {
        let frame = ReplFrame::Update {
            key: None,
            new_tuple: TupleData::text(&[b"k", b"v"]),
        };
        assert_eq!(ReplFrame::decode(&frame.encode()).expect("decode"), frame);
    }
}
