//! Distributed deadlock detection over merged wait-for graphs.
//!
//! Each node periodically snapshots its local wait-for edges (waiter
//! transaction -> holder transaction, expressed as GTIDs), publishes the
//! serialized graph under its per-node config-store key, reads every peer's
//! graph, unions them and searches for cycles. Victim selection is
//! deterministic so that every node looking at the same union picks the same
//! transaction: the youngest participant, by XID with the node id as a
//! tie-break.

use std::collections::{HashMap, HashSet};

use crate::types::{Gtid, NodeId};

/// One wait-for edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaitEdge {
    pub waiter: Gtid,
    pub holder: Gtid,
}

/// Serialized wait-for graph of one node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockGraph {
    pub edges: Vec<WaitEdge>,
}

impl LockGraph {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.edges.len() * 24);
        out.extend_from_slice(&(self.edges.len() as u32).to_be_bytes());
        for edge in &self.edges {
            out.extend_from_slice(&edge.waiter.node.to_be_bytes());
            out.extend_from_slice(&edge.waiter.xid.to_be_bytes());
            out.extend_from_slice(&edge.holder.node.to_be_bytes());
            out.extend_from_slice(&edge.holder.xid.to_be_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let count = get_u32(buf, &mut offset)? as usize;
        let mut edges = Vec::with_capacity(count);
        for _ in 0..count {
            let waiter_node = get_u32(buf, &mut offset)?;
            let waiter_xid = get_u64(buf, &mut offset)?;
            let holder_node = get_u32(buf, &mut offset)?;
            let holder_xid = get_u64(buf, &mut offset)?;
            edges.push(WaitEdge {
                waiter: Gtid::new(waiter_node, waiter_xid),
                holder: Gtid::new(holder_node, holder_xid),
            });
        }
        Ok(Self { edges })
    }

    pub fn merge(&mut self, other: &LockGraph) {
        self.edges.extend(other.edges.iter().copied());
    }
}

/// Find one cycle in the union graph, if any. Returns the transactions on
/// the cycle.
pub fn find_cycle(edges: &[WaitEdge]) -> Option<Vec<Gtid>> {
    let mut adjacency: HashMap<Gtid, Vec<Gtid>> = HashMap::new();
    for edge in edges {
        adjacency.entry(edge.waiter).or_default().push(edge.holder);
    }

    let mut done: HashSet<Gtid> = HashSet::new();
    for &start in adjacency.keys() {
        if done.contains(&start) {
            continue;
        }
        let mut stack = vec![(start, 0usize)];
        let mut path = vec![start];
        let mut on_path: HashSet<Gtid> = HashSet::from([start]);
        while let Some((node, next_idx)) = stack.last_mut() {
            let succ = adjacency.get(node).map(|v| v.as_slice()).unwrap_or(&[]);
            if *next_idx < succ.len() {
                let child = succ[*next_idx];
                *next_idx += 1;
                if on_path.contains(&child) {
                    let pos = path.iter().position(|g| *g == child).unwrap_or(0);
                    return Some(path[pos..].to_vec());
                }
                if !done.contains(&child) {
                    stack.push((child, 0));
                    path.push(child);
                    on_path.insert(child);
                }
            } else {
                done.insert(*node);
                on_path.remove(node);
                path.pop();
                stack.pop();
            }
        }
    }
    None
}

/// Deterministic victim: the youngest transaction on the cycle (largest XID,
/// node id as tie-break). Returns the victim only if it is local to `node`;
/// the owning node is the one that aborts it.
pub fn pick_local_victim(cycle: &[Gtid], node: NodeId) -> Option<Gtid> {
    let victim = cycle.iter().copied().max_by_key(|g| (g.xid, g.node))?;
    (victim.node == node).then_some(victim)
}

fn get_u32(buf: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= buf.len(), "lock graph short u32");
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(raw))
}

fn get_u64(buf: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= buf.len(), "lock graph short u64");
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(wn: NodeId, wx: u64, hn: NodeId, hx: u64) -> WaitEdge {
        WaitEdge {
            waiter: Gtid::new(wn, wx),
            holder: Gtid::new(hn, hx),
        }
    }

    #[test]
    fn graph_codec_round_trips() {
        let graph = LockGraph {
            edges: vec![edge(1, 10, 2, 20), edge(2, 20, 1, 10)],
        };
        assert_eq!(LockGraph::decode(&graph.encode()).expect("decode"), graph);
    }

    #[test]
    fn cross_node_cycle_is_found() {
        // T1 on node 1 waits for T2 on node 2 and vice versa; each node only
        // sees its own half until the graphs are merged.
        let mut union = LockGraph {
            edges: vec![edge(1, 10, 2, 20)],
        };
        assert!(find_cycle(&union.edges).is_none());
        union.merge(&LockGraph {
            edges: vec![edge(2, 20, 1, 10)],
        });
        let cycle = find_cycle(&union.edges).expect("cycle");
        assert_eq!(cycle.len(), 2);
    }

    #[test]
    fn acyclic_chain_has_no_cycle() {
        let edges = vec![edge(1, 1, 2, 2), edge(2, 2, 3, 3), edge(1, 1, 3, 3)];
        assert!(find_cycle(&edges).is_none());
    }

    #[test]
    fn victim_is_the_youngest_and_only_local() {
        let cycle = vec![Gtid::new(1, 10), Gtid::new(2, 20)];
        assert_eq!(pick_local_victim(&cycle, 2), Some(Gtid::new(2, 20)));
        assert_eq!(pick_local_victim(&cycle, 1), None);
    }
}
