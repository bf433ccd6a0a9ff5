//! Top-down builders: partition the leaf graph, recurse into every part,
//! and join the resulting subtrees under a new parent.

use std::sync::Mutex;

use rayon::prelude::*;
use tracing::debug;

use super::graph::{Graph, GraphPartitioner};
use crate::mesh::{ElementId, Mesh};
use crate::traits::Scalar;

struct Splitter<'a, S> {
    arena: Mutex<&'a mut Mesh<S>>,
    graph: &'a Graph,
    partitioner: &'a dyn GraphPartitioner,
    parts: usize,
    parallel: bool,
    min_subtree: usize,
}

pub(super) fn build<S: Scalar>(
    mesh: &mut Mesh<S>,
    graph: &Graph,
    partitioner: &dyn GraphPartitioner,
    parts: usize,
    parallel: bool,
    min_subtree: usize,
) -> ElementId {
    let vertices: Vec<usize> = (0..graph.nvtxs()).collect();
    let s = Splitter {
        arena: Mutex::new(mesh),
        graph,
        partitioner,
        parts,
        parallel,
        min_subtree,
    };
    s.subtree(vertices)
}

impl<S: Scalar> Splitter<'_, S> {
    /// Root of the subtree over `vertices`, which are leaf ids.
    fn subtree(&self, vertices: Vec<usize>) -> ElementId {
        if vertices.len() == 1 {
            return vertices[0];
        }
        let groups = self.split(&vertices);
        let children: Vec<ElementId> = if self.parallel && vertices.len() >= self.min_subtree {
            groups.into_par_iter().map(|g| self.subtree(g)).collect()
        } else {
            groups.into_iter().map(|g| self.subtree(g)).collect()
        };
        let mut arena = match self.arena.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        arena.add_parent(children)
    }

    /// Non-empty parts of `vertices`, at least two of them.
    fn split(&self, vertices: &[usize]) -> Vec<Vec<usize>> {
        let nparts = self.parts.min(vertices.len());
        let sub = self.graph.induced(vertices);
        let part = self.partitioner.partition(&sub, nparts);
        let mut groups = vec![Vec::new(); nparts];
        for (i, &v) in vertices.iter().enumerate() {
            groups[part[i].min(nparts - 1)].push(v);
        }
        groups.retain(|g| !g.is_empty());
        if groups.len() < 2 {
            debug!(vertices = vertices.len(), "degenerate partition, splitting in halves");
            let (l, r) = vertices.split_at(vertices.len() / 2);
            return vec![l.to_vec(), r.to_vec()];
        }
        groups
    }
}
