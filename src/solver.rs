//! Multifrontal factorization and solve over a [`Mesh`].
//!
//! Every element owns a [`PerNodeMatrix`] behind a mutex. During the
//! leaf-to-root passes an element locks itself and then each of its
//! children, which have finished by then, to pull their contributions in;
//! during the root-to-leaf pass it locks itself and then its parent. Sums
//! over siblings are therefore serialized by the parent's lock.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::{Backend, Context, Traversal};
use crate::error::{Error, Result};
use crate::helper::{Helper, Side};
use crate::kernels::{blas, Trans};
use crate::matrix::{ElementState, PerNodeMatrix, RhsKind};
use crate::mesh::{ElementId, Mesh, NodeId, Separation};
use crate::scheduler::{Direction, Scheduler};
use crate::tile::Tile;
use crate::traits::Field;
use crate::tree::{self, GraphPartitioner};

/// Outcome of [`Solver::factorize`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactorReport {
    /// Elements whose previous factors were kept.
    pub reused: usize,
    pub factored: usize,
    /// Micro-kernel calls issued by this factorization.
    pub kernel_calls: u64,
    pub flops_estimate: f64,
}

/// Connectivity an element was factored with.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Signature {
    nodes: Vec<(NodeId, usize, Separation)>,
    children: Vec<ElementId>,
}

struct Front<S> {
    matrix: PerNodeMatrix<S>,
    to_parent: Option<Helper>,
    leaf: Option<Helper>,
    signature: Option<Signature>,
    spill: Option<PathBuf>,
    /// Leaf residual, in contribution order.
    residual: Option<Tile<S>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Rhs,
    Residual,
}

pub struct Solver<S> {
    ctx: Context,
    mesh: Mesh<S>,
    scheduler: Scheduler,
    fronts: Vec<Mutex<Front<S>>>,
    partitioner: Option<Arc<dyn GraphPartitioner>>,
    topology: Option<u64>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn signature<S: Field>(mesh: &Mesh<S>, e: ElementId) -> Signature {
    let el = &mesh.elements()[e];
    Signature {
        nodes: el
            .nodes()
            .iter()
            .map(|&v| (v, mesh.nodes()[v].dof(), el.separation(v)))
            .collect(),
        children: el.children().to_vec(),
    }
}

/// Bring a written out matrix back into memory.
fn resident<S: Field>(front: &mut Front<S>) -> Result<()> {
    if front.matrix.state() == ElementState::Finalized {
        if let Some(path) = &front.spill {
            front.matrix.read_from(BufReader::new(File::open(path)?))?;
        }
    }
    Ok(())
}

impl<S: Field> Solver<S> {
    pub fn new(ctx: Context, mesh: Mesh<S>) -> Self {
        Self {
            ctx,
            mesh,
            scheduler: Scheduler::default(),
            fronts: Vec::new(),
            partitioner: None,
            topology: None,
        }
    }

    /// Use `p` instead of the built-in partitioner.
    pub fn with_partitioner(mut self, p: Arc<dyn GraphPartitioner>) -> Self {
        self.partitioner = Some(p);
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn mesh(&self) -> &Mesh<S> {
        &self.mesh
    }

    /// Contributions and right-hand sides may change between
    /// factorizations; adding nodes or elements rebuilds the tree.
    pub fn mesh_mut(&mut self) -> &mut Mesh<S> {
        &mut self.mesh
    }

    /// Build the elimination tree and the per-element storage. Previous
    /// factors are carried over by element id and kept only when reuse
    /// later confirms them.
    pub fn build_tree(&mut self) -> Result<ElementId> {
        let strategy = self.ctx.config().strategy;
        let partitioner = self.partitioner.clone();
        let mesh = &mut self.mesh;
        let root = self
            .ctx
            .install(|| tree::build(mesh, strategy, partitioner.as_deref()))?;
        self.topology = Some(self.mesh.topology());
        self.lock_tree()?;
        Ok(root)
    }

    fn lock_tree(&mut self) -> Result<()> {
        self.scheduler.load(&self.mesh);
        let mut old: Vec<Option<Front<S>>> = std::mem::take(&mut self.fronts)
            .into_iter()
            .map(|m| Some(m.into_inner().unwrap_or_else(|p| p.into_inner())))
            .collect();
        let (nrhs, mb) = (self.mesh.nrhs(), self.ctx.block_size());
        for e in self.mesh.elements() {
            let id = e.id();
            let (nf, ns) = (e.factor_dof(), e.schur_dof());
            let to_parent = match e.parent() {
                Some(p) => Some(Helper::new(&self.mesh, p, id)?),
                None => None,
            };
            let leaf = match e.is_leaf() {
                true => Some(Helper::for_leaf(&self.mesh, id)?),
                false => None,
            };
            let kept = old
                .get_mut(id)
                .and_then(Option::take)
                .filter(|f| f.matrix.nfactor() == nf && f.matrix.nschur() == ns);
            let front = match kept {
                Some(f) => Front {
                    to_parent,
                    leaf,
                    residual: None,
                    ..f
                },
                None => {
                    let mut matrix = PerNodeMatrix::new(id, nf, ns, nrhs, mb);
                    matrix.arrange()?;
                    Front {
                        matrix,
                        to_parent,
                        leaf,
                        signature: None,
                        spill: None,
                        residual: None,
                    }
                }
            };
            self.fronts.push(Mutex::new(front));
        }
        for f in old.into_iter().flatten() {
            if let Some(path) = f.spill {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn root(&self) -> Result<ElementId> {
        self.mesh.root().ok_or(Error::NoTree)
    }

    fn traverse<F>(&self, direction: Direction, op: F) -> Result<()>
    where
        F: Fn(ElementId) -> Result<()> + Sync + Send,
    {
        let scheduler = &self.scheduler;
        match self.ctx.config().traversal {
            Traversal::Tree => self.ctx.install(|| scheduler.execute_tree(op, direction)),
            Traversal::Levels { parallel } => self
                .ctx
                .install(|| scheduler.execute_elements(op, direction, parallel)),
        }
    }

    /// Which elements can keep their factors, children first.
    fn reusable(&self) -> Result<Vec<bool>> {
        let mut keep = vec![false; self.fronts.len()];
        if !self.ctx.config().reuse {
            return Ok(keep);
        }
        let root = self.root()?;
        for e in self.mesh.postorder(root) {
            let el = &self.mesh.elements()[e];
            let front = lock(&self.fronts[e]);
            let factored = match front.matrix.state() {
                ElementState::Factored | ElementState::Solved => true,
                ElementState::Finalized => front.spill.is_some(),
                _ => false,
            };
            let unmodified = el.contribution().map_or(true, |c| !c.modified());
            keep[e] = factored
                && unmodified
                && front.signature.as_ref() == Some(&signature(&self.mesh, e))
                && el.children().iter().all(|&c| keep[c]);
        }
        // A zeroed child contribution cannot be merged again.
        if self.ctx.config().zero_merged_source && !keep[root] {
            keep.iter_mut().for_each(|k| *k = false);
        }
        Ok(keep)
    }

    /// Assemble and factor every element that cannot be reused.
    pub fn factorize(&mut self) -> Result<FactorReport> {
        if self.topology != Some(self.mesh.topology()) || self.mesh.root().is_none() {
            self.build_tree()?;
        }
        let keep = self.reusable()?;
        for (e, m) in self.fronts.iter_mut().enumerate() {
            if keep[e] {
                continue;
            }
            let front = m.get_mut().unwrap_or_else(|p| p.into_inner());
            if let Some(path) = front.spill.take() {
                let _ = fs::remove_file(path);
            }
            front.matrix.reset();
            front.matrix.create_buffers()?;
        }

        let calls = self.ctx.kernel_calls();
        let (ctx, mesh, fronts, keep_ref) = (&self.ctx, &self.mesh, &self.fronts, &keep);
        let method = ctx.method();
        let zero_source = ctx.config().zero_merged_source;
        self.traverse(Direction::LeafToRoot, move |e| {
            if keep_ref[e] {
                debug!(element = e, "reused");
                return Ok(());
            }
            let el = &mesh.elements()[e];
            let mut front = lock(&fronts[e]);
            let front = &mut *front;
            if let (Some(c), Some(h)) = (el.contribution(), &front.leaf) {
                let a = c.a().handle()?;
                h.merge_a(a.as_ref(), &mut front.matrix)?;
            }
            for &c in el.children() {
                let mut child = lock(&fronts[c]);
                resident(&mut child)?;
                let h = child.to_parent.as_ref().ok_or(Error::NoTree)?;
                {
                    let abr = child.matrix.abr().handle()?;
                    h.merge_a(abr.as_ref(), &mut front.matrix)?;
                }
                if zero_source {
                    child.matrix.clear_abr()?;
                }
            }
            front.matrix.assembled()?;
            front.matrix.factor(ctx, method)?;
            debug!(
                element = e,
                nfactor = front.matrix.nfactor(),
                nschur = front.matrix.nschur(),
                "factored"
            );
            Ok(())
        })?;

        let mut report = FactorReport {
            kernel_calls: self.ctx.kernel_calls() - calls,
            ..Default::default()
        };
        for (e, m) in self.fronts.iter_mut().enumerate() {
            let front = m.get_mut().unwrap_or_else(|p| p.into_inner());
            if keep[e] {
                report.reused += 1;
            } else {
                report.factored += 1;
                report.flops_estimate += front.matrix.flops(method);
                front.signature = Some(signature(&self.mesh, e));
            }
        }
        for (e, &kept) in keep.iter().enumerate() {
            self.mesh.element_mut(e)?.set_reuse(kept);
        }
        for leaf in self.mesh.leaves() {
            self.mesh.element_mut(leaf)?.clear_modified();
        }
        if let Backend::OutOfCore { dir } = &self.ctx.config().backend {
            self.spill(dir.clone(), &keep)?;
        }
        info!(
            reused = report.reused,
            factored = report.factored,
            kernel_calls = report.kernel_calls,
            flops = report.flops_estimate,
            "factorization done"
        );
        Ok(report)
    }

    /// Write every freshly factored element to `dir` and release it.
    fn spill(&self, dir: PathBuf, keep: &[bool]) -> Result<()> {
        fs::create_dir_all(&dir)?;
        let fronts = &self.fronts;
        self.ctx.install(|| {
            fronts.par_iter().enumerate().try_for_each(|(e, m)| {
                if keep[e] {
                    return Ok(());
                }
                let mut front = lock(m);
                let path = dir.join(format!("element-{}.bin", e));
                front.matrix.write_to(BufWriter::new(File::create(&path)?))?;
                front.matrix.free();
                front.spill = Some(path);
                Ok(())
            })
        })
    }

    /// Forward elimination then back substitution of the mesh right-hand
    /// sides.
    pub fn solve(&mut self) -> Result<()> {
        self.solve_from(Source::Rhs)?;
        info!(nrhs = self.mesh.nrhs(), "solve done");
        Ok(())
    }

    fn solve_from(&mut self, source: Source) -> Result<()> {
        self.root()?;
        for m in &mut self.fronts {
            resident(m.get_mut().unwrap_or_else(|p| p.into_inner()))?;
        }
        let (ctx, mesh, fronts) = (&self.ctx, &self.mesh, &self.fronts);
        self.traverse(Direction::LeafToRoot, |e| {
            let el = &mesh.elements()[e];
            let mut front = lock(&fronts[e]);
            let front = &mut *front;
            front.matrix.clear_rhs(RhsKind::B)?;
            front.matrix.clear_rhs(RhsKind::X)?;
            if let (Some(c), Some(h)) = (el.contribution(), &front.leaf) {
                let b = match source {
                    Source::Rhs => c.b().handle()?,
                    Source::Residual => front.residual.as_ref().ok_or(Error::InvalidState {
                        element: e,
                        state: front.matrix.state().as_str(),
                        operation: "refine without residual",
                    })?.handle()?,
                };
                h.merge_rhs_b(b.as_ref(), &mut front.matrix)?;
            }
            for &c in el.children() {
                let child = lock(&fronts[c]);
                let h = child.to_parent.as_ref().ok_or(Error::NoTree)?;
                let bb = child.matrix.rhs(RhsKind::B, Side::Bottom).handle()?;
                h.merge_rhs_b(bb.as_ref(), &mut front.matrix)?;
            }
            front.matrix.solve_forward(ctx)
        })?;
        self.traverse(Direction::RootToLeaf, |e| {
            let el = &mesh.elements()[e];
            let mut front = lock(&fronts[e]);
            let front = &mut *front;
            if let (Some(p), Some(h)) = (el.parent(), &front.to_parent) {
                let parent = lock(&fronts[p]);
                let xb = front.matrix.rhs(RhsKind::X, Side::Bottom).handle()?;
                // SAFETY: the element's lock is held.
                h.branch_rhs_x(&parent.matrix, unsafe { xb.as_mut() })?;
            }
            front.matrix.solve_backward(ctx)
        })
    }

    fn require_solved(&self) -> Result<()> {
        for m in &self.fronts {
            let front = lock(m);
            let state = front.matrix.state();
            if state != ElementState::Solved {
                return Err(Error::InvalidState {
                    element: front.matrix.element(),
                    state: state.as_str(),
                    operation: "read the solution",
                });
            }
        }
        if self.fronts.is_empty() {
            return Err(Error::NoTree);
        }
        Ok(())
    }

    /// `‖b - A x‖` over all columns, summed through the tree.
    pub fn residual_norm(&mut self) -> Result<f64> {
        self.require_solved()?;
        let (mesh, fronts, nrhs) = (&self.mesh, &self.fronts, self.mesh.nrhs());
        self.scheduler.execute_leaves(|e| {
            let c = mesh.elements()[e].contribution().ok_or(Error::UnknownElement(e))?;
            let mut front = lock(&fronts[e]);
            let front = &mut *front;
            let h = front.leaf.as_ref().ok_or(Error::NoTree)?;
            let x = Tile::zeros(h.rows(), nrhs);
            let xh = x.handle()?;
            // SAFETY: `x` is local.
            h.branch_rhs_x(&front.matrix, unsafe { xh.as_mut() })?;
            let r = c.b().duplicate()?;
            let (rh, ah) = (r.handle()?, c.a().handle()?);
            // SAFETY: `r` is local.
            blas::gemm(Trans::NoTrans, Trans::NoTrans, -S::one(), ah.as_ref(), xh.as_ref(), S::one(), unsafe {
                rh.as_mut()
            });
            front.residual = Some(r);
            Ok(())
        })?;
        self.traverse(Direction::LeafToRoot, |e| {
            let el = &mesh.elements()[e];
            let mut front = lock(&fronts[e]);
            let front = &mut *front;
            front.matrix.clear_rhs(RhsKind::R)?;
            if let (Some(r), Some(h)) = (&front.residual, &front.leaf) {
                let rh = r.handle()?;
                h.merge_rhs_r(rh.as_ref(), &mut front.matrix)?;
            }
            for &c in el.children() {
                let child = lock(&fronts[c]);
                let h = child.to_parent.as_ref().ok_or(Error::NoTree)?;
                let rb = child.matrix.rhs(RhsKind::R, Side::Bottom).handle()?;
                h.merge_rhs_r(rb.as_ref(), &mut front.matrix)?;
            }
            Ok(())
        })?;
        let mut sum = 0.0;
        for m in fronts {
            let front = lock(m);
            for v in front.matrix.rhs(RhsKind::R, Side::Top).to_vec()? {
                let a = v.norm();
                sum += a * a;
            }
        }
        Ok(sum.sqrt())
    }

    /// `iterations` rounds of `x += A⁻¹ (b - A x)`; returns the final
    /// residual norm.
    pub fn refine(&mut self, iterations: usize) -> Result<f64> {
        let mut norm = self.residual_norm()?;
        for it in 0..iterations {
            let saved = self
                .fronts
                .iter()
                .map(|m| {
                    let front = lock(m);
                    let top = front.matrix.rhs(RhsKind::X, Side::Top).duplicate()?;
                    let bottom = front.matrix.rhs(RhsKind::X, Side::Bottom).duplicate()?;
                    Ok([top, bottom])
                })
                .collect::<Result<Vec<_>>>()?;
            self.solve_from(Source::Residual)?;
            for (m, saved) in self.fronts.iter().zip(&saved) {
                let front = lock(m);
                let x = front.matrix.rhs_handles(RhsKind::X)?;
                for (side, s) in saved.iter().enumerate() {
                    let sh = s.handle()?;
                    // SAFETY: the element's lock is held.
                    unsafe { x[side].as_mut() }.add_from(sh.as_ref());
                }
            }
            norm = self.residual_norm()?;
            debug!(iteration = it, residual = norm, "refinement step");
        }
        Ok(norm)
    }

    /// `dof x nrhs` values of one node, column-major.
    fn node_values(&self, v: NodeId) -> Result<Vec<S>> {
        let node = self.mesh.node(v)?;
        let e = match node.owners().iter().next() {
            Some(&e) if node.offset().is_some() => e,
            _ => return Err(Error::NoTree),
        };
        let front = lock(&self.fronts[e]);
        let local = self.mesh.elements()[e]
            .factor_nodes()
            .iter()
            .find(|&&(n, _)| n == v)
            .map(|&(_, at)| at)
            .ok_or(Error::UnknownNode(v))?;
        let xt = front.matrix.rhs(RhsKind::X, Side::Top);
        let mut out = Vec::with_capacity(node.dof() * self.mesh.nrhs());
        for c in 0..self.mesh.nrhs() {
            for i in 0..node.dof() {
                out.push(xt.get(local + i, c));
            }
        }
        Ok(out)
    }

    /// The solution in natural order: nodes by id, `total_dof x nrhs`
    /// column-major.
    pub fn solution(&self) -> Result<Vec<S>> {
        self.require_solved()?;
        let n = self.mesh.total_dof();
        let offsets = self.mesh.natural_offsets();
        let mut out = vec![S::zero(); n * self.mesh.nrhs()];
        for node in self.mesh.nodes() {
            let vals = self.node_values(node.id())?;
            for (k, v) in vals.into_iter().enumerate() {
                let (i, c) = (k % node.dof(), k / node.dof());
                out[c * n + offsets[node.id()] + i] = v;
            }
        }
        Ok(out)
    }

    /// Solution of the node with user key `key`, `dof x nrhs`.
    pub fn node_solution(&self, key: usize) -> Result<Vec<S>> {
        self.require_solved()?;
        let v = self.mesh.node_by_key(key)?.id();
        self.node_values(v)
    }

    /// Run `f` on the matrix of element `e`.
    pub fn inspect<R>(&self, e: ElementId, f: impl FnOnce(&PerNodeMatrix<S>) -> R) -> Result<R> {
        let m = self.fronts.get(e).ok_or(Error::UnknownElement(e))?;
        Ok(f(&lock(m).matrix))
    }
}

impl<S> Drop for Solver<S> {
    fn drop(&mut self) {
        for m in &mut self.fronts {
            if let Ok(front) = m.get_mut() {
                if let Some(path) = front.spill.take() {
                    let _ = fs::remove_file(path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FactorMethod;
    use crate::mesh::NodeKind;
    use crate::tree::TreeStrategy;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Symmetric positive definite `n x n` contribution.
    fn spd(n: usize, rng: &mut ChaCha8Rng) -> Vec<f64> {
        let mut a = vec![0.0; n * n];
        for j in 0..n {
            for i in 0..j {
                let v = rng.gen_range(-0.5..0.5);
                a[j * n + i] = v;
                a[i * n + j] = v;
            }
            a[j * n + j] = n as f64;
        }
        a
    }

    /// Two leaves with three private DOF each and three shared DOF.
    fn two_leaves(rng: &mut ChaCha8Rng) -> (Mesh<f64>, Vec<Vec<f64>>) {
        let mut m = Mesh::new(1);
        for k in 0..9 {
            m.add_node(k, 1, 1, NodeKind::Interior).unwrap();
        }
        let keys = [[0, 1, 2, 6, 7, 8], [3, 4, 5, 6, 7, 8]];
        let mut contributions = Vec::new();
        for k in keys {
            let a = spd(6, rng);
            let b: Vec<f64> = (0..6).map(|_| rng.gen_range(-1.0..1.0)).collect();
            m.add_element(&k, a.clone(), b).unwrap();
            contributions.push(a);
        }
        (m, contributions)
    }

    /// Schur complement of the trailing `s` rows of a dense `n x n`.
    fn schur(n: usize, s: usize, a: &[f64]) -> Vec<f64> {
        let f = n - s;
        let mut w = a.to_vec();
        for k in 0..f {
            for i in k + 1..n {
                let l = w[k * n + i] / w[k * n + k];
                for j in k..n {
                    w[j * n + i] -= l * w[j * n + k];
                }
            }
        }
        let mut out = vec![0.0; s * s];
        for j in 0..s {
            for i in 0..s {
                out[j * s + i] = w[(f + j) * n + f + i];
            }
        }
        out
    }

    #[test]
    fn root_assembles_the_sum_of_leaf_schur_complements() {
        let mut rng = ChaCha8Rng::seed_from_u64(61);
        let (mesh, contributions) = two_leaves(&mut rng);
        let ctx = Context::builder()
            .threads(2)
            .block_size(2)
            .method(FactorMethod::LuNoPiv)
            .strategy(TreeStrategy::Greedy)
            .build()
            .unwrap();
        let mut solver = Solver::new(ctx, mesh);
        let report = solver.factorize().unwrap();
        assert_eq!(report.factored, 3);
        let root = solver.mesh().root().unwrap();

        let expect: Vec<f64> = schur(6, 3, &contributions[0])
            .iter()
            .zip(schur(6, 3, &contributions[1]))
            .map(|(x, y)| x + y)
            .collect();
        // Rebuild L U from the factored root.
        let lu = solver.inspect(root, |m| m.atl().to_vec().unwrap()).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let mut s = 0.0;
                for k in 0..=i.min(j) {
                    let l = if k == i { 1.0 } else { lu[k * 3 + i] };
                    s += l * lu[j * 3 + k];
                }
                assert_abs_diff_eq!(s, expect[j * 3 + i], epsilon = 1e-12);
            }
        }

        solver.solve().unwrap();
        assert!(solver.residual_norm().unwrap() < 1e-12);
    }

    #[test]
    fn solution_requires_a_solve() {
        let mut rng = ChaCha8Rng::seed_from_u64(62);
        let (mesh, _) = two_leaves(&mut rng);
        let mut solver = Solver::new(Context::default(), mesh);
        assert!(matches!(solver.solution(), Err(Error::NoTree)));
        solver.factorize().unwrap();
        assert!(matches!(solver.solution(), Err(Error::InvalidState { .. })));
        solver.solve().unwrap();
        assert_eq!(solver.solution().unwrap().len(), 9);
        assert_eq!(solver.node_solution(4).unwrap().len(), 1);
    }

    #[test]
    fn refinement_keeps_the_residual_small() {
        let mut rng = ChaCha8Rng::seed_from_u64(63);
        let (mesh, _) = two_leaves(&mut rng);
        let ctx = Context::builder().method(FactorMethod::Qr).build().unwrap();
        let mut solver = Solver::new(ctx, mesh);
        solver.factorize().unwrap();
        solver.solve().unwrap();
        let x0 = solver.solution().unwrap();
        let r = solver.refine(2).unwrap();
        assert!(r < 1e-12);
        for (a, b) in solver.solution().unwrap().iter().zip(&x0) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }
}
