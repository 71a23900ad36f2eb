//! Maximum-clique computation over the internode connectivity graph.
//!
//! Cluster sizes are bounded by a machine word, so the graph is a slice of
//! adjacency bitmasks and Bron-Kerbosch with pivoting is cheap even in the
//! worst case.

/// Build a symmetric adjacency matrix from per-node *disconnect* masks.
///
/// `reported[i]` has bit `j` set when node `i+1` claims it cannot reach node
/// `j+1`. An edge exists iff both endpoints report each other reachable, so
/// a disconnect claimed by either side removes the edge.
pub fn build_adjacency(reported: &[u64], n: usize) -> Vec<u64> {
    let all = if n >= 64 { u64::MAX } else { (1u64 << n) - 1 };
    let mut adj = vec![0u64; n];
    for i in 0..n {
        let mut row = !reported[i] & all;
        for (j, other) in reported.iter().enumerate().take(n) {
            if (other >> i) & 1 == 1 {
                row &= !(1u64 << j);
            }
        }
        row &= !(1u64 << i);
        adj[i] = row;
    }
    adj
}

/// Find a maximum clique; returns the member mask and its size.
pub fn find_max_clique(adj: &[u64], n: usize) -> (u64, usize) {
    let all = if n >= 64 { u64::MAX } else { (1u64 << n) - 1 };
    let mut best = 0u64;
    expand(adj, 0, all, 0, &mut best);
    (best, best.count_ones() as usize)
}

/// Maximum clique constrained to contain node index `seed`. Stale masks
/// published by dead nodes can tie with the live partition; a node always
/// prefers an equally large clique it belongs to, since it knows itself to
/// be alive.
pub fn find_max_clique_with(adj: &[u64], n: usize, seed: usize) -> (u64, usize) {
    let all = if n >= 64 { u64::MAX } else { (1u64 << n) - 1 };
    let seed_bit = 1u64 << seed;
    let mut best = seed_bit;
    expand(adj, seed_bit, adj[seed] & all, 0, &mut best);
    (best, best.count_ones() as usize)
}

fn expand(adj: &[u64], r: u64, mut p: u64, mut x: u64, best: &mut u64) {
    if p == 0 && x == 0 {
        if r.count_ones() > best.count_ones() {
            *best = r;
        }
        return;
    }
    // Prune branches that cannot beat the current best.
    if r.count_ones() + p.count_ones() <= best.count_ones() {
        return;
    }

    // Pivot on the candidate with the most neighbors in P.
    let pivot = pick_pivot(adj, p | x, p);
    let mut candidates = p & !adj[pivot];
    while candidates != 0 {
        let v = candidates.trailing_zeros() as usize;
        let bit = 1u64 << v;
        candidates &= !bit;

        expand(adj, r | bit, p & adj[v], x & adj[v], best);
        p &= !bit;
        x |= bit;
    }
}

fn pick_pivot(adj: &[u64], from: u64, p: u64) -> usize {
    let mut pivot = from.trailing_zeros() as usize;
    let mut best_deg = 0u32;
    let mut rest = from;
    while rest != 0 {
        let v = rest.trailing_zeros() as usize;
        rest &= rest - 1;
        let deg = (adj[v] & p).count_ones();
        if deg >= best_deg {
            best_deg = deg;
            pivot = v;
        }
    }
    pivot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_connected_cluster_is_one_clique() {
        let reported = vec![0u64; 5];
        let adj = build_adjacency(&reported, 5);
        let (clique, size) = find_max_clique(&adj, 5);
        assert_eq!(size, 5);
        assert_eq!(clique, 0b11111);
    }

    #[test]
    fn one_sided_disconnect_removes_the_edge() {
        // Node 1 claims it cannot reach node 3; the edge must disappear for
        // both even though node 3 reports nothing.
        let mut reported = vec![0u64; 3];
        reported[0] = 0b100;
        let adj = build_adjacency(&reported, 3);
        assert_eq!(adj[0] & 0b100, 0);
        assert_eq!(adj[2] & 0b001, 0);
        let (_, size) = find_max_clique(&adj, 3);
        assert_eq!(size, 2);
    }

    #[test]
    fn five_node_split_yields_majority_partition() {
        // Partition {1,2} vs {3,4,5}: each side reports the other
        // unreachable.
        let minority = 0b00011u64;
        let majority = 0b11100u64;
        let mut reported = vec![0u64; 5];
        for i in 0..2 {
            reported[i] = majority;
        }
        for i in 2..5 {
            reported[i] = minority;
        }
        let adj = build_adjacency(&reported, 5);
        let (clique, size) = find_max_clique(&adj, 5);
        assert_eq!(size, 3);
        assert_eq!(clique, majority);
    }

    #[test]
    fn seeded_clique_prefers_the_seed_on_ties() {
        // Edge 1-2 is gone; {1,3} and {2,3} tie at size two. Node 1 must
        // pick the clique containing itself.
        let mut reported = vec![0u64; 3];
        reported[0] = 0b010;
        let adj = build_adjacency(&reported, 3);
        let (clique, size) = find_max_clique_with(&adj, 3, 0);
        assert_eq!(size, 2);
        assert_eq!(clique, 0b101);
    }

    #[test]
    fn isolated_node_leaves_remaining_clique() {
        let mut reported = vec![0u64; 3];
        reported[2] = 0b011; // node 3 sees nobody
        let adj = build_adjacency(&reported, 3);
        let (clique, size) = find_max_clique(&adj, 3);
        assert_eq!(size, 2);
        assert_eq!(clique, 0b011);
    }
}
