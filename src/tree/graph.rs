//! Weighted undirected graphs in CSR form and the partitioner seam.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Compressed adjacency: the neighbours of `v` are
/// `adjncy[xadj[v]..xadj[v + 1]]` with matching `adjwgt`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    pub xadj: Vec<usize>,
    pub adjncy: Vec<usize>,
    pub adjwgt: Vec<usize>,
    pub vwgt: Vec<usize>,
}

impl Graph {
    /// Build from undirected weighted edges. Parallel edges are summed and
    /// self loops dropped.
    pub fn from_edges(vwgt: Vec<usize>, edges: &[(usize, usize, usize)]) -> Self {
        let n = vwgt.len();
        let mut adj: Vec<BTreeMap<usize, usize>> = vec![BTreeMap::new(); n];
        for &(u, v, w) in edges {
            assert!(u < n && v < n, "edge ({}, {}) outside {} vertices", u, v, n);
            if u == v {
                continue;
            }
            *adj[u].entry(v).or_insert(0) += w;
            *adj[v].entry(u).or_insert(0) += w;
        }
        let mut g = Graph {
            xadj: Vec::with_capacity(n + 1),
            vwgt,
            ..Default::default()
        };
        g.xadj.push(0);
        for row in adj {
            for (v, w) in row {
                g.adjncy.push(v);
                g.adjwgt.push(w);
            }
            g.xadj.push(g.adjncy.len());
        }
        g
    }

    pub fn nvtxs(&self) -> usize {
        self.vwgt.len()
    }

    pub fn neighbors(&self, v: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        let r = self.xadj[v]..self.xadj[v + 1];
        self.adjncy[r.clone()].iter().copied().zip(self.adjwgt[r].iter().copied())
    }

    pub fn total_weight(&self) -> usize {
        self.vwgt.iter().sum()
    }

    /// The subgraph on `vertices`, renumbered in the given order.
    pub fn induced(&self, vertices: &[usize]) -> Graph {
        let mut local = vec![usize::MAX; self.nvtxs()];
        for (i, &v) in vertices.iter().enumerate() {
            local[v] = i;
        }
        let mut g = Graph {
            xadj: Vec::with_capacity(vertices.len() + 1),
            vwgt: vertices.iter().map(|&v| self.vwgt[v]).collect(),
            ..Default::default()
        };
        g.xadj.push(0);
        for &v in vertices {
            for (u, w) in self.neighbors(v) {
                if local[u] != usize::MAX {
                    g.adjncy.push(local[u]);
                    g.adjwgt.push(w);
                }
            }
            g.xadj.push(g.adjncy.len());
        }
        g
    }

    /// Weight of the edges whose ends are in different parts.
    pub fn edge_cut(&self, part: &[usize]) -> usize {
        let mut cut = 0;
        for v in 0..self.nvtxs() {
            for (u, w) in self.neighbors(v) {
                if u > v && part[u] != part[v] {
                    cut += w;
                }
            }
        }
        cut
    }
}

/// Assigns every vertex a part in `0..nparts`. Implementations are pure:
/// equal inputs give equal outputs.
pub trait GraphPartitioner: Send + Sync {
    fn partition(&self, graph: &Graph, nparts: usize) -> Vec<usize>;
}

/// Recursive bisection by breadth-first graph growing from a
/// pseudo-peripheral vertex, optionally followed by Fiduccia-Mattheyses
/// passes on every cut.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrowingPartitioner {
    pub refine: bool,
}

const IMBALANCE: f64 = 1.1;
const FM_PASSES: usize = 4;

impl GraphPartitioner for GrowingPartitioner {
    fn partition(&self, graph: &Graph, nparts: usize) -> Vec<usize> {
        let mut part = vec![0; graph.nvtxs()];
        if nparts > 1 {
            let all: Vec<usize> = (0..graph.nvtxs()).collect();
            self.recurse(graph, &all, nparts, 0, &mut part);
        }
        part
    }
}

impl GrowingPartitioner {
    fn recurse(&self, graph: &Graph, vertices: &[usize], k: usize, first: usize, part: &mut [usize]) {
        if k <= 1 || vertices.len() <= 1 {
            for &v in vertices {
                part[v] = first;
            }
            return;
        }
        let k0 = k / 2;
        let sub = graph.induced(vertices);
        let side = self.bisect(&sub, k0 as f64 / k as f64);
        let (mut left, mut right) = (Vec::new(), Vec::new());
        for (i, &v) in vertices.iter().enumerate() {
            if side[i] == 0 {
                left.push(v);
            } else {
                right.push(v);
            }
        }
        self.recurse(graph, &left, k0, first, part);
        self.recurse(graph, &right, k - k0, first + k0, part);
    }

    /// Two-way split where part 0 carries about `fraction` of the weight.
    /// Both parts are non-empty whenever the graph has two vertices.
    pub fn bisect(&self, graph: &Graph, fraction: f64) -> Vec<usize> {
        let n = graph.nvtxs();
        let mut side = vec![1; n];
        if n < 2 {
            return vec![0; n];
        }
        let total = graph.total_weight();
        let target = fraction * total as f64;

        let start = pseudo_peripheral(graph, 0);
        let mut visited = vec![false; n];
        let mut queue = VecDeque::from([start]);
        visited[start] = true;
        let (mut grown, mut count) = (0usize, 0usize);
        let mut next_seed = 0;
        loop {
            let v = match queue.pop_front() {
                Some(v) => v,
                None => {
                    // Disconnected: continue with the next untouched vertex.
                    while next_seed < n && visited[next_seed] {
                        next_seed += 1;
                    }
                    if next_seed == n {
                        break;
                    }
                    visited[next_seed] = true;
                    next_seed
                }
            };
            if count > 0 && (grown as f64 >= target || count + 1 == n) {
                break;
            }
            side[v] = 0;
            grown += graph.vwgt[v];
            count += 1;
            for (u, _) in graph.neighbors(v) {
                if !visited[u] {
                    visited[u] = true;
                    queue.push_back(u);
                }
            }
        }
        if self.refine {
            let targets = [target, total as f64 - target];
            for _ in 0..FM_PASSES {
                if !fm_pass(graph, &mut side, targets) {
                    break;
                }
            }
        }
        side
    }
}

/// Last vertex reached by two breadth-first sweeps from `seed`.
fn pseudo_peripheral(graph: &Graph, seed: usize) -> usize {
    let mut v = seed;
    for _ in 0..2 {
        let mut seen = vec![false; graph.nvtxs()];
        let mut queue = VecDeque::from([v]);
        seen[v] = true;
        while let Some(x) = queue.pop_front() {
            v = x;
            for (u, _) in graph.neighbors(x) {
                if !seen[u] {
                    seen[u] = true;
                    queue.push_back(u);
                }
            }
        }
    }
    v
}

/// One Fiduccia-Mattheyses pass: move every vertex once in order of best
/// gain, then keep the prefix of moves with the lowest cut. Returns whether
/// the cut improved.
///
/// Unlocked vertices sit in one gain-ordered set per side; a move only
/// updates the gains of its neighbours.
fn fm_pass(graph: &Graph, side: &mut [usize], targets: [f64; 2]) -> bool {
    let n = graph.nvtxs();
    let mut gains: Vec<i64> = (0..n)
        .map(|v| {
            graph
                .neighbors(v)
                .map(|(u, w)| if side[u] == side[v] { -(w as i64) } else { w as i64 })
                .sum()
        })
        .collect();
    // Highest gain last; ties go to the lower vertex.
    let mut buckets: [BTreeSet<(i64, Reverse<usize>)>; 2] = Default::default();
    let mut weight = [0usize; 2];
    let mut count = [0usize; 2];
    for v in 0..n {
        weight[side[v]] += graph.vwgt[v];
        count[side[v]] += 1;
        buckets[side[v]].insert((gains[v], Reverse(v)));
    }
    let slack = graph.vwgt.iter().copied().max().unwrap_or(0) as f64;
    let limit = targets.map(|t| (IMBALANCE * t).max(t + slack));
    let mut moves = Vec::new();
    let (mut acc, mut best, mut best_len) = (0i64, 0i64, 0usize);
    loop {
        let mut pick: Option<(i64, usize)> = None;
        for from in 0..2 {
            if count[from] == 1 {
                continue;
            }
            let to = 1 - from;
            let first = buckets[from]
                .iter()
                .rev()
                .find(|&&(_, Reverse(v))| (weight[to] + graph.vwgt[v]) as f64 <= limit[to]);
            if let Some(&(g, Reverse(v))) = first {
                if pick.map_or(true, |(bg, bv)| g > bg || (g == bg && v < bv)) {
                    pick = Some((g, v));
                }
            }
        }
        let Some((g, v)) = pick else { break };
        let (from, to) = (side[v], 1 - side[v]);
        buckets[from].remove(&(g, Reverse(v)));
        side[v] = to;
        weight[from] -= graph.vwgt[v];
        weight[to] += graph.vwgt[v];
        count[from] -= 1;
        count[to] += 1;
        for (u, w) in graph.neighbors(v) {
            let bucket = &mut buckets[side[u]];
            if !bucket.remove(&(gains[u], Reverse(u))) {
                // Locked.
                continue;
            }
            let w = 2 * w as i64;
            gains[u] += if side[u] == to { -w } else { w };
            bucket.insert((gains[u], Reverse(u)));
        }
        moves.push(v);
        acc += g;
        if acc > best {
            best = acc;
            best_len = moves.len();
        }
    }
    for &v in moves[best_len..].iter().rev() {
        side[v] = 1 - side[v];
    }
    best > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two 4-cliques joined by one light edge.
    fn barbell() -> Graph {
        let mut edges = Vec::new();
        for base in [0, 4] {
            for i in 0..4 {
                for j in i + 1..4 {
                    edges.push((base + i, base + j, 5));
                }
            }
        }
        edges.push((3, 4, 1));
        Graph::from_edges(vec![1; 8], &edges)
    }

    #[test]
    fn csr_is_symmetric() {
        let g = Graph::from_edges(vec![1, 2, 3], &[(0, 1, 2), (1, 0, 1), (1, 2, 4), (2, 2, 9)]);
        assert_eq!(g.xadj, vec![0, 1, 3, 4]);
        assert_eq!(g.neighbors(1).collect::<Vec<_>>(), vec![(0, 3), (2, 4)]);
        assert_eq!(g.total_weight(), 6);
        let sub = g.induced(&[2, 1]);
        assert_eq!(sub.vwgt, vec![3, 2]);
        assert_eq!(sub.neighbors(0).collect::<Vec<_>>(), vec![(1, 4)]);
    }

    #[test]
    fn refined_bisection_finds_the_bridge() {
        let g = barbell();
        let part = GrowingPartitioner { refine: true }.partition(&g, 2);
        assert_eq!(g.edge_cut(&part), 1);
        assert_eq!(part.iter().filter(|&&p| p == 0).count(), 4);
    }

    #[test]
    fn both_sides_are_never_empty() {
        let g = Graph::from_edges(vec![10, 1], &[(0, 1, 1)]);
        for refine in [false, true] {
            let side = GrowingPartitioner { refine }.bisect(&g, 0.5);
            assert_ne!(side[0], side[1]);
        }
        let lonely = Graph::from_edges(vec![1, 1, 1], &[]);
        let side = GrowingPartitioner::default().bisect(&lonely, 0.5);
        assert!(side.contains(&0) && side.contains(&1));
    }

    #[test]
    fn refinement_keeps_balance_and_never_raises_the_cut() {
        // 40x40 grid with a scrambled vertex order.
        let side = 40;
        let id = |i: usize, j: usize| (i * side + j) * 7 % (side * side);
        let mut edges = Vec::new();
        for i in 0..side {
            for j in 0..side {
                if i + 1 < side {
                    edges.push((id(i, j), id(i + 1, j), 1));
                }
                if j + 1 < side {
                    edges.push((id(i, j), id(i, j + 1), 1 + (i + j) % 3));
                }
            }
        }
        let g = Graph::from_edges(vec![1; side * side], &edges);
        let plain = GrowingPartitioner { refine: false }.bisect(&g, 0.5);
        let refined = GrowingPartitioner { refine: true }.bisect(&g, 0.5);
        assert!(g.edge_cut(&refined) <= g.edge_cut(&plain));
        let left = refined.iter().filter(|&&p| p == 0).count() as f64;
        let half = (side * side) as f64 / 2.0;
        assert!(left <= IMBALANCE * half && (side * side) as f64 - left <= IMBALANCE * half);
    }

    #[test]
    fn kway_uses_every_part() {
        let n = 12;
        let edges: Vec<_> = (0..n - 1).map(|i| (i, i + 1, 1)).collect();
        let g = Graph::from_edges(vec![1; n], &edges);
        let part = GrowingPartitioner::default().partition(&g, 3);
        for p in 0..3 {
            assert_eq!(part.iter().filter(|&&x| x == p).count(), 4);
        }
        assert_eq!(g.edge_cut(&part), 2);
    }
}
