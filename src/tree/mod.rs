//! Elimination tree construction.
//!
//! The leaves of a [`Mesh`] form a graph (shared DOF as edge weight, own
//! DOF as vertex weight). A strategy groups them into parents until a
//! single root remains; [`Mesh::finalize`] then derives what every element
//! eliminates.

use std::collections::BTreeSet;

use tracing::info;

use crate::error::{Error, Result};
use crate::mesh::{ElementId, Mesh};
use crate::traits::Scalar;

mod graph;
mod greedy;
mod split;

pub use graph::{Graph, GraphPartitioner, GrowingPartitioner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeStrategy {
    /// Pairwise matching of the orphans, round by round.
    Greedy,
    /// `parts`-ary tree from repeated k-way partitions.
    KWay { parts: usize, parallel: bool },
    /// Binary tree from refined bisections; in parallel mode subproblems of
    /// at least `min_subtree` leaves are built as separate tasks.
    Bisection { parallel: bool, min_subtree: usize },
}

impl Default for TreeStrategy {
    fn default() -> Self {
        TreeStrategy::Bisection {
            parallel: true,
            min_subtree: 8,
        }
    }
}

/// Rebuild the tree over the leaves of `mesh` and return its root.
/// `partitioner` replaces the built-in one for the partition based
/// strategies.
pub fn build<S: Scalar>(
    mesh: &mut Mesh<S>,
    strategy: TreeStrategy,
    partitioner: Option<&dyn GraphPartitioner>,
) -> Result<ElementId> {
    let leaves = mesh.leaves();
    if leaves.is_empty() {
        return Err(Error::InvalidProblem {
            element: 0,
            message: "problem has no elements".into(),
        });
    }
    mesh.reset_tree();
    let graph = leaf_graph(mesh);
    let root = match strategy {
        TreeStrategy::Greedy => greedy::build(mesh)?,
        TreeStrategy::KWay { parts, parallel } => {
            assert!(parts >= 2, "k-way tree needs at least two parts");
            let default = GrowingPartitioner { refine: false };
            let p = partitioner.unwrap_or(&default);
            split::build(mesh, &graph, p, parts, parallel, 0)
        }
        TreeStrategy::Bisection { parallel, min_subtree } => {
            let default = GrowingPartitioner { refine: true };
            let p = partitioner.unwrap_or(&default);
            split::build(mesh, &graph, p, 2, parallel, min_subtree)
        }
    };
    mesh.finalize(root)?;
    let height = mesh.element(root)?.generation();
    info!(
        ?strategy,
        leaves = leaves.len(),
        elements = mesh.elements().len(),
        height,
        "elimination tree built"
    );
    Ok(root)
}

/// Vertices are the leaves; two leaves are adjacent when they share a node.
pub(crate) fn leaf_graph<S: Scalar>(mesh: &Mesh<S>) -> Graph {
    let vwgt = mesh
        .leaves()
        .map(|e| {
            mesh.elements()[e]
                .nodes()
                .iter()
                .map(|&v| mesh.nodes()[v].dof())
                .sum()
        })
        .collect();
    let mut edges = Vec::new();
    for node in mesh.nodes() {
        let owners: Vec<ElementId> = node.owners().iter().copied().collect();
        for (i, &a) in owners.iter().enumerate() {
            for &b in &owners[i + 1..] {
                edges.push((a, b, node.dof()));
            }
        }
    }
    Graph::from_edges(vwgt, &edges)
}

/// Current orphans: elements without a parent.
pub(crate) fn orphans<S: Scalar>(mesh: &Mesh<S>) -> BTreeSet<ElementId> {
    mesh.elements()
        .iter()
        .filter(|e| e.parent().is_none())
        .map(|e| e.id())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{NodeKind, Separation};

    /// A chain of `n` leaves, leaf `i` over nodes `i` and `i + 1`.
    fn chain(n: usize) -> Mesh<f64> {
        let mut m = Mesh::new(1);
        for k in 0..=n {
            m.add_node(k, 2, 1, NodeKind::Interior).unwrap();
        }
        for i in 0..n {
            m.add_element(&[i, i + 1], vec![0.0; 16], vec![0.0; 4]).unwrap();
        }
        m
    }

    fn check_tree(m: &Mesh<f64>, root: ElementId) {
        assert_eq!(orphans(m).into_iter().collect::<Vec<_>>(), vec![root]);
        assert_eq!(m.postorder(root).len(), m.elements().len());
        let mut offsets: Vec<usize> = m.nodes().iter().map(|n| n.offset().unwrap()).collect();
        offsets.sort_unstable();
        let expect: Vec<usize> = (0..m.nodes().len()).map(|i| 2 * i).collect();
        assert_eq!(offsets, expect);
        for e in m.elements() {
            for &c in e.children() {
                assert!(m.elements()[c].generation() < e.generation());
            }
            if e.is_root() {
                assert_eq!(e.schur_dof(), 0);
            }
        }
        for n in m.nodes() {
            assert_eq!(n.separation(), Separation::Factor);
        }
    }

    #[test]
    fn every_strategy_yields_one_rooted_tree() {
        let strategies = [
            TreeStrategy::Greedy,
            TreeStrategy::KWay { parts: 3, parallel: false },
            TreeStrategy::KWay { parts: 2, parallel: true },
            TreeStrategy::Bisection { parallel: false, min_subtree: 8 },
            TreeStrategy::Bisection { parallel: true, min_subtree: 2 },
        ];
        for strategy in strategies {
            let mut m = chain(13);
            let root = build(&mut m, strategy, None).unwrap();
            check_tree(&m, root);
            // Rebuilding starts over from the leaves.
            let again = build(&mut m, strategy, None).unwrap();
            assert_eq!(again, root);
            check_tree(&m, again);
        }
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let mut m = chain(1);
        let root = build(&mut m, TreeStrategy::default(), None).unwrap();
        assert_eq!(root, 0);
        assert_eq!(m.element(0).unwrap().factor_dof(), 4);
    }

    #[test]
    fn empty_problem_is_rejected() {
        let mut m = Mesh::<f64>::new(1);
        assert!(build(&mut m, TreeStrategy::Greedy, None).is_err());
    }

    struct Everything;

    impl GraphPartitioner for Everything {
        fn partition(&self, graph: &Graph, _nparts: usize) -> Vec<usize> {
            vec![0; graph.nvtxs()]
        }
    }

    #[test]
    fn degenerate_partitions_fall_back_to_halves() {
        let mut m = chain(6);
        let strategy = TreeStrategy::Bisection { parallel: false, min_subtree: 8 };
        let root = build(&mut m, strategy, Some(&Everything)).unwrap();
        check_tree(&m, root);
        assert_eq!(m.element(root).unwrap().children().len(), 2);
    }
}
