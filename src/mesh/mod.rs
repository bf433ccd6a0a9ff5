//! Problem description: nodes (groups of unknowns) and elements (dense
//! sub-problems) stored in an arena and referenced by index.
//!
//! Leaf elements carry their unassembled contribution `A_e` (square over the
//! element's nodes, in the order they were given) and `B_e`. Internal
//! elements are added by the tree builders; [`Mesh::finalize`] then derives
//! every element's node set, the factor/schur separation and the local
//! offsets used by the per-element matrices.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::error::{Error, Result};
use crate::sparse::{CompressedMatrix, Layout, Triplets};
use crate::tile::Tile;
use crate::traits::{Int, Scalar};

pub type NodeId = usize;
pub type ElementId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeKind {
    #[default]
    Interior,
    /// Never eliminated below the root.
    Boundary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Separation {
    #[default]
    Unseparated,
    /// Eliminated in the element.
    Factor,
    /// Passed to the parent in the Schur complement.
    Schur,
}

#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    key: usize,
    dof: usize,
    order: usize,
    kind: NodeKind,
    owners: BTreeSet<ElementId>,
    separation: Separation,
    offset: Option<usize>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// User supplied identifier.
    pub fn key(&self) -> usize {
        self.key
    }

    pub fn dof(&self) -> usize {
        self.dof
    }

    /// Polynomial order, informational only.
    pub fn order(&self) -> usize {
        self.order
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn owners(&self) -> &BTreeSet<ElementId> {
        &self.owners
    }

    pub fn separation(&self) -> Separation {
        self.separation
    }

    /// Position of the node's first unknown in elimination order.
    pub fn offset(&self) -> Option<usize> {
        self.offset
    }
}

/// Unassembled dense contribution of a leaf.
pub struct Contribution<S> {
    a: Tile<S>,
    b: Tile<S>,
    modified: bool,
}

impl<S: Scalar> fmt::Debug for Contribution<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contribution")
            .field("a", &self.a)
            .field("b", &self.b)
            .field("modified", &self.modified)
            .finish()
    }
}

impl<S: Scalar> Contribution<S> {
    pub fn a(&self) -> &Tile<S> {
        &self.a
    }

    pub fn b(&self) -> &Tile<S> {
        &self.b
    }

    /// Whether `A_e` changed since the last factorization.
    pub fn modified(&self) -> bool {
        self.modified
    }
}

pub struct Element<S> {
    id: ElementId,
    generation: usize,
    parent: Option<ElementId>,
    children: Vec<ElementId>,
    nodes: Vec<NodeId>,
    separation: BTreeMap<NodeId, Separation>,
    factor: Vec<(NodeId, usize)>,
    schur: Vec<(NodeId, usize)>,
    factor_dof: usize,
    schur_dof: usize,
    reuse: bool,
    contribution: Option<Contribution<S>>,
}

impl<S: Scalar> fmt::Debug for Element<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("nodes", &self.nodes)
            .field("factor", &self.factor)
            .field("schur", &self.schur)
            .field("reuse", &self.reuse)
            .field("contribution", &self.contribution)
            .finish()
    }
}

impl<S: Scalar> Element<S> {
    fn new(id: ElementId, nodes: Vec<NodeId>, contribution: Option<Contribution<S>>) -> Self {
        Self {
            id,
            generation: 0,
            parent: None,
            children: Vec::new(),
            nodes,
            separation: BTreeMap::new(),
            factor: Vec::new(),
            schur: Vec::new(),
            factor_dof: 0,
            schur_dof: 0,
            reuse: false,
            contribution,
        }
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    /// Height above the leaves.
    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn parent(&self) -> Option<ElementId> {
        self.parent
    }

    pub fn children(&self) -> &[ElementId] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.contribution.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn separation(&self, node: NodeId) -> Separation {
        self.separation.get(&node).copied().unwrap_or_default()
    }

    /// Factor nodes with their offsets in the factor block.
    pub fn factor_nodes(&self) -> &[(NodeId, usize)] {
        &self.factor
    }

    /// Schur nodes with their offsets in the schur block.
    pub fn schur_nodes(&self) -> &[(NodeId, usize)] {
        &self.schur
    }

    pub fn factor_dof(&self) -> usize {
        self.factor_dof
    }

    pub fn schur_dof(&self) -> usize {
        self.schur_dof
    }

    /// Whether the last factorization kept this element's factors.
    pub fn reuse(&self) -> bool {
        self.reuse
    }

    pub(crate) fn set_reuse(&mut self, reuse: bool) {
        self.reuse = reuse;
    }

    pub fn contribution(&self) -> Option<&Contribution<S>> {
        self.contribution.as_ref()
    }

    pub(crate) fn clear_modified(&mut self) {
        if let Some(c) = &mut self.contribution {
            c.modified = false;
        }
    }
}

pub struct Mesh<S> {
    nrhs: usize,
    nodes: Vec<Node>,
    by_key: HashMap<usize, NodeId>,
    elements: Vec<Element<S>>,
    leaves: usize,
    root: Option<ElementId>,
    topology: u64,
}

impl<S: Scalar> Mesh<S> {
    /// An empty problem with `nrhs` right-hand-side columns.
    pub fn new(nrhs: usize) -> Self {
        Self {
            nrhs,
            nodes: Vec::new(),
            by_key: HashMap::new(),
            elements: Vec::new(),
            leaves: 0,
            root: None,
            topology: 0,
        }
    }

    pub fn nrhs(&self) -> usize {
        self.nrhs
    }

    pub fn add_node(&mut self, key: usize, dof: usize, order: usize, kind: NodeKind) -> Result<NodeId> {
        if self.by_key.contains_key(&key) {
            return Err(Error::DuplicateNode(key));
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            key,
            dof,
            order,
            kind,
            owners: BTreeSet::new(),
            separation: Separation::Unseparated,
            offset: None,
        });
        self.by_key.insert(key, id);
        self.touch();
        Ok(id)
    }

    /// Add a leaf over the nodes `keys`. `a` is the column-major `n x n`
    /// contribution and `b` the `n x nrhs` right-hand side, `n` being the
    /// total DOF of the nodes in the given order.
    pub fn add_element(&mut self, keys: &[usize], a: Vec<S>, b: Vec<S>) -> Result<ElementId> {
        // Internal elements are dropped below, so the next leaf slot is the id.
        let id = self.leaves;
        let mut nodes = Vec::with_capacity(keys.len());
        for &k in keys {
            let n = *self.by_key.get(&k).ok_or(Error::UnknownNode(k))?;
            if nodes.contains(&n) {
                return Err(Error::InvalidProblem {
                    element: id,
                    message: format!("node {} listed twice", k),
                });
            }
            nodes.push(n);
        }
        let n: usize = nodes.iter().map(|&v| self.nodes[v].dof).sum();
        if a.len() != n * n || b.len() != n * self.nrhs {
            return Err(Error::InvalidProblem {
                element: id,
                message: format!(
                    "expected {}x{} contribution and {}x{} right-hand side, got {} and {} values",
                    n,
                    n,
                    n,
                    self.nrhs,
                    a.len(),
                    b.len()
                ),
            });
        }
        if self.root.is_some() {
            self.reset_tree();
        }
        // Leaves occupy the front of the arena.
        debug_assert_eq!(self.elements.len(), self.leaves);
        for &v in &nodes {
            self.nodes[v].owners.insert(id);
        }
        let contribution = Contribution {
            a: Tile::from_col_major(n, n, a),
            b: Tile::from_col_major(n, self.nrhs, b),
            modified: true,
        };
        self.elements.push(Element::new(id, nodes, Some(contribution)));
        self.leaves += 1;
        self.touch();
        Ok(id)
    }

    /// Replace a leaf's `A_e`. Its connectivity is unchanged, so the tree is
    /// kept, but the leaf and its ancestors are refactored.
    pub fn set_contribution(&mut self, leaf: ElementId, a: Vec<S>) -> Result<()> {
        let e = self.leaf_mut(leaf)?;
        let c = e.contribution.as_mut().ok_or(Error::UnknownElement(leaf))?;
        let n = c.a.rows();
        if a.len() != n * n {
            return Err(Error::ShapeMismatch {
                expected: (n, n),
                actual: (a.len(), 1),
            });
        }
        c.a = Tile::from_col_major(n, n, a);
        c.modified = true;
        Ok(())
    }

    /// Replace a leaf's `B_e`; factorizations stay valid.
    pub fn set_rhs(&mut self, leaf: ElementId, b: Vec<S>) -> Result<()> {
        let nrhs = self.nrhs;
        let e = self.leaf_mut(leaf)?;
        let c = e.contribution.as_mut().ok_or(Error::UnknownElement(leaf))?;
        let n = c.b.rows();
        if b.len() != n * nrhs {
            return Err(Error::ShapeMismatch {
                expected: (n, nrhs),
                actual: (b.len(), 1),
            });
        }
        c.b = Tile::from_col_major(n, nrhs, b);
        Ok(())
    }

    fn leaf_mut(&mut self, leaf: ElementId) -> Result<&mut Element<S>> {
        if leaf >= self.leaves {
            return Err(Error::UnknownElement(leaf));
        }
        Ok(&mut self.elements[leaf])
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id).ok_or(Error::UnknownNode(id))
    }

    pub fn node_by_key(&self, key: usize) -> Result<&Node> {
        let id = *self.by_key.get(&key).ok_or(Error::UnknownNode(key))?;
        Ok(&self.nodes[id])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn element(&self, id: ElementId) -> Result<&Element<S>> {
        self.elements.get(id).ok_or(Error::UnknownElement(id))
    }

    pub(crate) fn element_mut(&mut self, id: ElementId) -> Result<&mut Element<S>> {
        self.elements.get_mut(id).ok_or(Error::UnknownElement(id))
    }

    pub fn elements(&self) -> &[Element<S>] {
        &self.elements
    }

    pub fn leaves(&self) -> std::ops::Range<ElementId> {
        0..self.leaves
    }

    pub fn root(&self) -> Option<ElementId> {
        self.root
    }

    /// Total number of unknowns.
    pub fn total_dof(&self) -> usize {
        self.nodes.iter().map(|n| n.dof).sum()
    }

    /// Changes whenever nodes or leaves are added.
    pub fn topology(&self) -> u64 {
        self.topology
    }

    fn touch(&mut self) {
        self.topology = self.topology.wrapping_add(1);
    }

    /// Natural position of every node's first unknown: nodes in id order.
    pub fn natural_offsets(&self) -> Vec<usize> {
        let mut at = 0;
        self.nodes
            .iter()
            .map(|n| {
                let o = at;
                at += n.dof;
                o
            })
            .collect()
    }

    /// Drop the internal elements and every derived attribute. Node owner
    /// sets go back to the leaves alone.
    pub(crate) fn reset_tree(&mut self) {
        self.elements.truncate(self.leaves);
        for e in &mut self.elements {
            e.parent = None;
            e.children.clear();
            e.generation = 0;
            e.separation.clear();
            e.factor.clear();
            e.schur.clear();
            e.factor_dof = 0;
            e.schur_dof = 0;
            e.reuse = false;
        }
        for n in &mut self.nodes {
            n.owners.clear();
            n.separation = Separation::Unseparated;
            n.offset = None;
        }
        for e in &self.elements {
            for &v in &e.nodes {
                self.nodes[v].owners.insert(e.id);
            }
        }
        self.root = None;
    }

    /// Append an internal element over `children`.
    pub(crate) fn add_parent(&mut self, children: Vec<ElementId>) -> ElementId {
        let id = self.elements.len();
        for &c in &children {
            self.elements[c].parent = Some(id);
        }
        let mut e = Element::new(id, Vec::new(), None);
        e.children = children;
        self.elements.push(e);
        id
    }

    /// The orphan currently above `e`.
    pub(crate) fn top_of(&self, mut e: ElementId) -> ElementId {
        while let Some(p) = self.elements[e].parent {
            e = p;
        }
        e
    }

    /// Derive node sets, separations, offsets and generations bottom-up from
    /// `root`, then number the factor nodes in elimination order.
    pub(crate) fn finalize(&mut self, root: ElementId) -> Result<()> {
        let order = self.postorder(root);
        if order.len() != self.elements.len() {
            return Err(Error::InvalidProblem {
                element: root,
                message: format!(
                    "tree reaches {} of {} elements",
                    order.len(),
                    self.elements.len()
                ),
            });
        }
        self.root = Some(root);
        for &e in &order {
            if !self.elements[e].is_leaf() {
                self.merge_nodes_from_children(e);
            }
            self.separate_nodes(e);
            self.arrange_nodes(e);
            let generation = self.elements[e]
                .children
                .iter()
                .map(|&c| self.elements[c].generation + 1)
                .max()
                .unwrap_or(0);
            self.elements[e].generation = generation;
        }
        let mut at = 0;
        for &e in &order {
            for i in 0..self.elements[e].factor.len() {
                let v = self.elements[e].factor[i].0;
                self.nodes[v].offset = Some(at);
                at += self.nodes[v].dof;
            }
        }
        Ok(())
    }

    /// Elements below and including `root`, children before parents.
    pub fn postorder(&self, root: ElementId) -> Vec<ElementId> {
        let mut out = Vec::with_capacity(self.elements.len());
        let mut stack = vec![(root, false)];
        while let Some((e, expanded)) = stack.pop() {
            if expanded {
                out.push(e);
                continue;
            }
            stack.push((e, true));
            for &c in self.elements[e].children.iter().rev() {
                stack.push((c, false));
            }
        }
        out
    }

    /// An internal element takes over the schur nodes of its children.
    pub(crate) fn merge_nodes_from_children(&mut self, e: ElementId) {
        let mut nodes = BTreeSet::new();
        for &c in &self.elements[e].children {
            nodes.extend(self.elements[c].schur.iter().map(|&(v, _)| v));
        }
        for &c in &self.elements[e].children {
            for &(v, _) in &self.elements[c].schur {
                let owners = &mut self.nodes[v].owners;
                owners.remove(&c);
                owners.insert(e);
            }
        }
        self.elements[e].nodes = nodes.into_iter().collect();
    }

    /// A node is eliminated where it has a single owner, unless it is a
    /// boundary node. The root eliminates everything.
    pub(crate) fn separate_nodes(&mut self, e: ElementId) {
        let root = self.elements[e].parent.is_none();
        let mut map = BTreeMap::new();
        for &v in &self.elements[e].nodes {
            let node = &mut self.nodes[v];
            let only_here = node.owners.len() == 1 && node.owners.contains(&e);
            let sep = if root || (only_here && node.kind == NodeKind::Interior) {
                Separation::Factor
            } else {
                Separation::Schur
            };
            node.separation = sep;
            map.insert(v, sep);
        }
        self.elements[e].separation = map;
    }

    /// Local offsets of the factor and schur nodes, in element node order.
    pub(crate) fn arrange_nodes(&mut self, e: ElementId) {
        let (mut factor, mut schur) = (Vec::new(), Vec::new());
        let (mut nf, mut ns) = (0, 0);
        let el = &self.elements[e];
        for &v in &el.nodes {
            let dof = self.nodes[v].dof;
            match el.separation(v) {
                Separation::Factor => {
                    factor.push((v, nf));
                    nf += dof;
                }
                _ => {
                    schur.push((v, ns));
                    ns += dof;
                }
            }
        }
        let el = &mut self.elements[e];
        el.factor = factor;
        el.schur = schur;
        el.factor_dof = nf;
        el.schur_dof = ns;
    }

    /// Sum of the leaf contributions in natural numbering (nodes by id).
    pub fn assemble(&self) -> Triplets<S> {
        let n = self.total_dof();
        let offsets = self.natural_offsets();
        let mut t = Triplets::new(n, n);
        for leaf in self.leaves() {
            let Some(c) = self.elements[leaf].contribution() else {
                continue;
            };
            let rows = self.leaf_rows(leaf, &offsets);
            for (q, &col) in rows.iter().enumerate() {
                for (p, &row) in rows.iter().enumerate() {
                    let v = c.a().get(p, q);
                    if v != S::zero() {
                        t.push(row, col, v);
                    }
                }
            }
        }
        t
    }

    /// Summed right-hand sides, `total_dof x nrhs` column-major.
    pub fn assemble_rhs(&self) -> Vec<S> {
        let n = self.total_dof();
        let offsets = self.natural_offsets();
        let mut b = vec![S::zero(); n * self.nrhs];
        for leaf in self.leaves() {
            let Some(c) = self.elements[leaf].contribution() else {
                continue;
            };
            for (p, row) in self.leaf_rows(leaf, &offsets).into_iter().enumerate() {
                for k in 0..self.nrhs {
                    b[k * n + row] += c.b().get(p, k);
                }
            }
        }
        b
    }

    /// Natural row of every contribution row of `leaf`.
    fn leaf_rows(&self, leaf: ElementId, offsets: &[usize]) -> Vec<usize> {
        self.elements[leaf]
            .nodes
            .iter()
            .flat_map(|&v| offsets[v]..offsets[v] + self.nodes[v].dof)
            .collect()
    }

    /// Star decomposition of a square sparse matrix: one single-DOF node
    /// per column and one leaf per column `j` holding `a_jj` and the
    /// couplings `a_ij`, `a_ji` with `i > j`. The leaves sum to `A`.
    /// `b` is `n x nrhs`, column-major; row `j` goes to leaf `j`.
    pub fn from_csc<I: Int>(a: &CompressedMatrix<I, S>, b: &[S], nrhs: usize) -> Result<Self> {
        let a = match a.is_upper_only() {
            true => a.normalized(Layout::ColumnMajor),
            false => a.clone(),
        };
        let n = a.cols();
        if a.rows() != n || b.len() != n * nrhs {
            return Err(Error::ShapeMismatch {
                expected: (n, n * nrhs),
                actual: (a.rows(), b.len()),
            });
        }
        // entries[j] collects (i, a_ij) and (i, a_ji) for i >= j.
        let mut lower: Vec<BTreeMap<usize, (S, S)>> = vec![BTreeMap::new(); n];
        for (i, j, v) in a.entries() {
            let (lo, hi) = if i >= j { (j, i) } else { (i, j) };
            let slot = lower[lo].entry(hi).or_insert((S::zero(), S::zero()));
            if i >= j {
                slot.0 += v;
            } else {
                slot.1 += v;
            }
        }
        let mut mesh = Mesh::new(nrhs);
        for j in 0..n {
            mesh.add_node(j, 1, 1, NodeKind::Interior)?;
        }
        for (j, couplings) in lower.iter().enumerate() {
            let mut keys = vec![j];
            keys.extend(couplings.keys().copied().filter(|&i| i != j));
            let m = keys.len();
            let mut ae = vec![S::zero(); m * m];
            for (p, &i) in keys.iter().enumerate() {
                if let Some(&(below, above)) = couplings.get(&i) {
                    if i == j {
                        ae[0] = below + above;
                    } else {
                        // a_ij lands at (p, 0), a_ji at (0, p).
                        ae[p] = below;
                        ae[p * m] = above;
                    }
                }
            }
            let mut be = vec![S::zero(); m * nrhs];
            for c in 0..nrhs {
                be[c * m] = b[c * n + j];
            }
            mesh.add_element(&keys, ae, be)?;
        }
        Ok(mesh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn two_leaves() -> Mesh<f64> {
        // Leaves {0,1,2} and {1,2,3}: node 0 and 3 are private.
        let mut m = Mesh::new(1);
        for k in 0..4 {
            m.add_node(k, 1, 1, NodeKind::Interior).unwrap();
        }
        m.add_element(&[0, 1, 2], vec![1.0; 9], vec![1.0; 3]).unwrap();
        m.add_element(&[1, 2, 3], vec![1.0; 9], vec![1.0; 3]).unwrap();
        m
    }

    #[test]
    fn duplicate_and_unknown_nodes_are_rejected() {
        let mut m = Mesh::<f64>::new(1);
        m.add_node(7, 2, 1, NodeKind::Interior).unwrap();
        assert!(matches!(
            m.add_node(7, 1, 1, NodeKind::Interior),
            Err(Error::DuplicateNode(7))
        ));
        assert!(matches!(
            m.add_element(&[8], vec![0.0], vec![0.0]),
            Err(Error::UnknownNode(8))
        ));
        assert!(matches!(
            m.add_element(&[7], vec![0.0; 3], vec![0.0; 2]),
            Err(Error::InvalidProblem { .. })
        ));
    }

    #[test]
    fn finalize_separates_and_numbers() {
        let mut m = two_leaves();
        let root = m.add_parent(vec![0, 1]);
        m.finalize(root).unwrap();

        let l0 = m.element(0).unwrap();
        assert_eq!(l0.separation(0), Separation::Factor);
        assert_eq!(l0.separation(1), Separation::Schur);
        assert_eq!(l0.factor_dof(), 1);
        assert_eq!(l0.schur_dof(), 2);

        let r = m.element(root).unwrap();
        assert_eq!(r.nodes(), &[1, 2]);
        assert_eq!(r.factor_dof(), 2);
        assert_eq!(r.generation(), 1);
        assert_eq!(m.node(1).unwrap().owners().iter().copied().collect::<Vec<_>>(), vec![root]);

        let mut offsets: Vec<usize> = m.nodes().iter().map(|n| n.offset().unwrap()).collect();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
    }

    #[test]
    fn boundary_nodes_wait_for_the_root() {
        let mut m = Mesh::<f64>::new(1);
        m.add_node(0, 1, 1, NodeKind::Boundary).unwrap();
        m.add_node(1, 1, 1, NodeKind::Interior).unwrap();
        m.add_node(2, 1, 1, NodeKind::Interior).unwrap();
        m.add_element(&[0, 1], vec![1.0; 4], vec![0.0; 2]).unwrap();
        m.add_element(&[2], vec![1.0], vec![0.0]).unwrap();
        let root = m.add_parent(vec![0, 1]);
        m.finalize(root).unwrap();
        assert_eq!(m.element(0).unwrap().separation(0), Separation::Schur);
        assert_eq!(m.element(0).unwrap().separation(1), Separation::Factor);
        assert_eq!(m.element(root).unwrap().separation(0), Separation::Factor);
        // The root has zero factor work from leaf 1 and only node 0 overall.
        assert_eq!(m.element(root).unwrap().nodes(), &[0]);
    }

    #[test]
    fn adding_a_leaf_resets_the_tree() {
        let mut m = two_leaves();
        let root = m.add_parent(vec![0, 1]);
        m.finalize(root).unwrap();
        let before = m.topology();
        let id = m.add_element(&[3], vec![2.0], vec![0.0]).unwrap();
        assert_eq!(id, 2);
        assert!(m.root().is_none());
        assert_eq!(m.elements().len(), 3);
        assert_eq!(m.elements()[id].id(), id);
        let owners: Vec<ElementId> = m.node(3).unwrap().owners().iter().copied().collect();
        assert_eq!(owners, vec![1, 2]);
        assert_ne!(m.topology(), before);

        let a = m.add_parent(vec![0, 1]);
        let root = m.add_parent(vec![a, id]);
        m.finalize(root).unwrap();
        assert_eq!(m.elements()[root].children(), &[a, id]);
    }
}
