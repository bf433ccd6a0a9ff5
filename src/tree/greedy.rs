//! Bottom-up pairing of orphans.
//!
//! Every round scores each pair of orphans sharing a node by the DOF only
//! the pair holds minus the DOF either of them still shares with the rest,
//! and matches pairs best score first.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::orphans;
use crate::error::Result;
use crate::mesh::{ElementId, Mesh, NodeId, NodeKind};
use crate::traits::Scalar;

pub(super) fn build<S: Scalar>(mesh: &mut Mesh<S>) -> Result<ElementId> {
    let mut round = 0;
    loop {
        let live = orphans(mesh);
        if live.len() == 1 {
            let root = live.into_iter().next().unwrap_or_default();
            return Ok(root);
        }
        let tops = node_tops(mesh);
        let mut scored = score(mesh, &tops);
        scored.sort_by(|x, y| y.0.cmp(&x.0).then(x.1.cmp(&y.1)).then(x.2.cmp(&y.2)));

        let mut matched = BTreeSet::new();
        let mut pairs = Vec::new();
        for (_, a, b) in scored {
            if !matched.contains(&a) && !matched.contains(&b) {
                matched.insert(a);
                matched.insert(b);
                pairs.push((a, b));
            }
        }
        if pairs.is_empty() {
            pairs.push(lightest_two(mesh, &tops, &live));
        }
        debug!(round, orphans = live.len(), parents = pairs.len(), "greedy round");
        for (a, b) in pairs {
            mesh.add_parent(vec![a, b]);
        }
        round += 1;
    }
}

/// For every node, the orphans above its owners.
fn node_tops<S: Scalar>(mesh: &Mesh<S>) -> Vec<BTreeSet<ElementId>> {
    mesh.nodes()
        .iter()
        .map(|n| n.owners().iter().map(|&e| mesh.top_of(e)).collect())
        .collect()
}

/// `(score, a, b)` for every pair of orphans sharing at least one node.
fn score<S: Scalar>(mesh: &Mesh<S>, tops: &[BTreeSet<ElementId>]) -> Vec<(i64, ElementId, ElementId)> {
    let mut touching: BTreeMap<ElementId, Vec<NodeId>> = BTreeMap::new();
    let mut pairs = BTreeSet::new();
    for (v, t) in tops.iter().enumerate() {
        for &e in t {
            touching.entry(e).or_default().push(v);
        }
        let t: Vec<ElementId> = t.iter().copied().collect();
        for (i, &a) in t.iter().enumerate() {
            for &b in &t[i + 1..] {
                pairs.insert((a, b));
            }
        }
    }
    pairs
        .into_iter()
        .map(|(a, b)| {
            let within = |v: NodeId| tops[v].iter().all(|&e| e == a || e == b);
            let mut exclusive = 0i64;
            let mut external = 0i64;
            let mut seen = BTreeSet::new();
            for &x in [a, b].iter() {
                for &v in &touching[&x] {
                    let node = &mesh.nodes()[v];
                    let dof = node.dof() as i64;
                    let shared_out = node.kind() == NodeKind::Boundary || !within(v);
                    if shared_out {
                        external += dof;
                    } else if tops[v].len() == 2 && seen.insert(v) {
                        exclusive += dof;
                    }
                }
            }
            (exclusive - external, a, b)
        })
        .collect()
}

fn lightest_two<S: Scalar>(
    mesh: &Mesh<S>,
    tops: &[BTreeSet<ElementId>],
    live: &BTreeSet<ElementId>,
) -> (ElementId, ElementId) {
    let mut weight: BTreeMap<ElementId, usize> = live.iter().map(|&e| (e, 0)).collect();
    for (v, t) in tops.iter().enumerate() {
        for e in t {
            if let Some(w) = weight.get_mut(e) {
                *w += mesh.nodes()[v].dof();
            }
        }
    }
    let mut by_weight: Vec<(usize, ElementId)> = weight.into_iter().map(|(e, w)| (w, e)).collect();
    by_weight.sort_unstable();
    let (a, b) = (by_weight[0].1, by_weight[1].1);
    (a.min(b), a.max(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strongly_coupled_leaves_pair_first() {
        // Leaves 0 and 1 share three DOF, 1 and 2 share one.
        let mut m = Mesh::<f64>::new(1);
        m.add_node(0, 3, 1, NodeKind::Interior).unwrap();
        m.add_node(1, 1, 1, NodeKind::Interior).unwrap();
        m.add_node(2, 1, 1, NodeKind::Interior).unwrap();
        m.add_element(&[0], vec![0.0; 9], vec![0.0; 3]).unwrap();
        m.add_element(&[0, 1], vec![0.0; 16], vec![0.0; 4]).unwrap();
        m.add_element(&[1, 2], vec![0.0; 4], vec![0.0; 2]).unwrap();
        let root = build(&mut m).unwrap();
        assert_eq!(m.element(3).unwrap().children(), &[0, 1]);
        assert_eq!(m.element(root).unwrap().children(), &[2, 3]);
    }

    #[test]
    fn disconnected_orphans_are_joined_lightest_first() {
        let mut m = Mesh::<f64>::new(1);
        for (k, dof) in [(0, 5), (1, 1), (2, 2)] {
            m.add_node(k, dof, 1, NodeKind::Interior).unwrap();
            let n = dof * dof;
            m.add_element(&[k], vec![0.0; n], vec![0.0; dof]).unwrap();
        }
        let root = build(&mut m).unwrap();
        assert_eq!(m.element(3).unwrap().children(), &[1, 2]);
        assert_eq!(m.element(root).unwrap().children(), &[0, 3]);
    }
}
