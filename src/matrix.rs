//! Dense storage of one element.
//!
//! ```text
//!          factor  schur
//! factor [  ATL    ATR  ]   [ Bt ]   [ Xt ]
//! schur  [  ABL    ABR  ]   [ Bb ]   [ Xb ]
//! ```
//!
//! Factoring eliminates the factor rows: ATL is replaced by its factors, ATR
//! and ABL by the panel solves and ABR becomes the Schur complement handed
//! to the parent.

use std::io::{Read, Write};

use tracing::trace;

use crate::config::{Context, FactorMethod};
use crate::debug::trace_tile;
use crate::error::{Error, Result};
use crate::helper::Side;
use crate::hier::HierMatrix;
use crate::kernels::{
    apply_lu_incpiv, apply_pivots, apply_q, apply_q_inc, chol, gemm, lu_incpiv, lu_nopiv, lu_piv, qr,
    qr_inc, trsm, Diag, IncPivots, IncQr, PivotDirection, Side as KSide, Trans, Uplo,
};
use crate::mesh::ElementId;
use crate::tile::{Tile, TileHandle};
use crate::traits::Field;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Unassembled,
    /// Separated and arranged, no buffers.
    Arranged,
    Buffered,
    /// Children and contribution merged in.
    Assembled,
    Factored,
    Solved,
    /// Buffers released or written out.
    Finalized,
}

impl ElementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementState::Unassembled => "unassembled",
            ElementState::Arranged => "arranged",
            ElementState::Buffered => "buffered",
            ElementState::Assembled => "assembled",
            ElementState::Factored => "factored",
            ElementState::Solved => "solved",
            ElementState::Finalized => "finalized",
        }
    }
}

/// Right-hand side, solution or residual columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhsKind {
    B,
    X,
    R,
}

impl RhsKind {
    fn index(self) -> usize {
        match self {
            RhsKind::B => 0,
            RhsKind::X => 1,
            RhsKind::R => 2,
        }
    }
}

enum Factors<S> {
    None,
    Pivots(Vec<usize>),
    IncPiv(IncPivots),
    Qr(Vec<Tile<S>>),
    QrInc(IncQr<S>),
}

const ATL: usize = 0;
const ATR: usize = 1;
const ABL: usize = 2;
const ABR: usize = 3;

pub struct PerNodeMatrix<S> {
    element: ElementId,
    nfactor: usize,
    nschur: usize,
    nrhs: usize,
    mb: usize,
    state: ElementState,
    method: Option<FactorMethod>,
    blocks: [Tile<S>; 4],
    rhs: [[Tile<S>; 2]; 3],
    factors: Factors<S>,
}

impl<S: Field> PerNodeMatrix<S> {
    /// A bufferless matrix for `element` blocked by `mb`.
    pub fn new(element: ElementId, nfactor: usize, nschur: usize, nrhs: usize, mb: usize) -> Self {
        Self {
            element,
            nfactor,
            nschur,
            nrhs,
            mb,
            state: ElementState::Unassembled,
            method: None,
            blocks: Default::default(),
            rhs: Default::default(),
            factors: Factors::None,
        }
    }

    pub fn element(&self) -> ElementId {
        self.element
    }

    pub fn nfactor(&self) -> usize {
        self.nfactor
    }

    pub fn nschur(&self) -> usize {
        self.nschur
    }

    pub fn state(&self) -> ElementState {
        self.state
    }

    fn require(&self, allowed: &[ElementState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                element: self.element,
                state: self.state.as_str(),
                operation,
            })
        }
    }

    fn block_shape(&self, i: usize) -> (usize, usize) {
        let (f, s) = (self.nfactor, self.nschur);
        match i {
            ATL => (f, f),
            ATR => (f, s),
            ABL => (s, f),
            _ => (s, s),
        }
    }

    fn rhs_rows(&self, side: usize) -> usize {
        if side == 0 {
            self.nfactor
        } else {
            self.nschur
        }
    }

    pub fn arrange(&mut self) -> Result<()> {
        self.require(&[ElementState::Unassembled], "arrange")?;
        self.state = ElementState::Arranged;
        Ok(())
    }

    /// Allocate zeroed blocks and solve columns.
    pub fn create_buffers(&mut self) -> Result<()> {
        self.require(&[ElementState::Arranged], "create buffers")?;
        for i in 0..4 {
            let (r, c) = self.block_shape(i);
            self.blocks[i] = Tile::zeros(r, c);
        }
        for kind in 0..3 {
            for side in 0..2 {
                self.rhs[kind][side] = Tile::zeros(self.rhs_rows(side), self.nrhs);
            }
        }
        self.state = ElementState::Buffered;
        Ok(())
    }

    /// Drop all numeric content and go back to the arranged state.
    pub fn reset(&mut self) {
        self.release();
        self.method = None;
        self.factors = Factors::None;
        self.state = ElementState::Arranged;
    }

    pub fn assembled(&mut self) -> Result<()> {
        self.require(&[ElementState::Buffered], "finish assembly")?;
        self.state = ElementState::Assembled;
        Ok(())
    }

    pub fn atl(&self) -> &Tile<S> {
        &self.blocks[ATL]
    }

    pub fn atr(&self) -> &Tile<S> {
        &self.blocks[ATR]
    }

    pub fn abl(&self) -> &Tile<S> {
        &self.blocks[ABL]
    }

    pub fn abr(&self) -> &Tile<S> {
        &self.blocks[ABR]
    }

    pub fn rhs(&self, kind: RhsKind, side: Side) -> &Tile<S> {
        &self.rhs[kind.index()][side.index()]
    }

    /// `[[ATL, ATR], [ABL, ABR]]`
    pub(crate) fn block_handles(&self) -> Result<[[TileHandle<S>; 2]; 2]> {
        Ok([
            [self.blocks[ATL].handle()?, self.blocks[ATR].handle()?],
            [self.blocks[ABL].handle()?, self.blocks[ABR].handle()?],
        ])
    }

    /// `[top, bottom]` of one set of columns.
    pub(crate) fn rhs_handles(&self, kind: RhsKind) -> Result<[TileHandle<S>; 2]> {
        let r = &self.rhs[kind.index()];
        Ok([r[0].handle()?, r[1].handle()?])
    }

    pub fn clear_rhs(&mut self, kind: RhsKind) -> Result<()> {
        for t in &mut self.rhs[kind.index()] {
            if !t.is_empty() {
                t.set_zero()?;
            }
        }
        Ok(())
    }

    /// Zero ABR once it has been merged into the parent.
    pub fn clear_abr(&mut self) -> Result<()> {
        if !self.blocks[ABR].is_empty() {
            self.blocks[ABR].set_zero()?;
        }
        Ok(())
    }

    fn hier(&self, t: &Tile<S>) -> Result<HierMatrix<S>> {
        HierMatrix::from_flat(t, self.mb, self.mb)
    }

    /// Eliminate the factor rows; ABR becomes the Schur complement.
    pub fn factor(&mut self, ctx: &Context, method: FactorMethod) -> Result<()> {
        self.require(&[ElementState::Assembled], "factor")?;
        let one = S::one();
        let [atl, atr, abl, abr] = [
            self.hier(&self.blocks[ATL])?,
            self.hier(&self.blocks[ATR])?,
            self.hier(&self.blocks[ABL])?,
            self.hier(&self.blocks[ABR])?,
        ];
        let factors = if self.nfactor == 0 {
            Factors::None
        } else if method == FactorMethod::Cholesky {
            chol(ctx, &atl)?;
            trsm(ctx, KSide::Left, Uplo::Lower, Trans::NoTrans, Diag::NonUnit, one, &atl, &atr)?;
            gemm(ctx, Trans::ConjTrans, Trans::NoTrans, -one, &atr, &atr, one, &abr)?;
            Factors::None
        } else {
            let factors = match method {
                FactorMethod::LuNoPiv => {
                    lu_nopiv(ctx, &atl)?;
                    trsm(ctx, KSide::Left, Uplo::Lower, Trans::NoTrans, Diag::Unit, one, &atl, &atr)?;
                    Factors::None
                }
                FactorMethod::LuPiv => {
                    let ipiv = lu_piv(ctx, &atl)?;
                    apply_pivots(ctx, &ipiv, &atr, PivotDirection::Forward)?;
                    trsm(ctx, KSide::Left, Uplo::Lower, Trans::NoTrans, Diag::Unit, one, &atl, &atr)?;
                    Factors::Pivots(ipiv)
                }
                FactorMethod::LuIncPiv => {
                    let piv = lu_incpiv(ctx, &atl)?;
                    apply_lu_incpiv(ctx, &atl, &piv, &atr)?;
                    Factors::IncPiv(piv)
                }
                FactorMethod::Qr => {
                    let ts = qr(ctx, &atl)?;
                    apply_q(ctx, &atl, &ts, Trans::ConjTrans, &atr)?;
                    Factors::Qr(ts)
                }
                FactorMethod::QrInc => {
                    let f = qr_inc(ctx, &atl)?;
                    apply_q_inc(ctx, &atl, &f, Trans::ConjTrans, &atr)?;
                    Factors::QrInc(f)
                }
                FactorMethod::Cholesky => unreachable!("handled above"),
            };
            // ABL <- ABL U⁻¹ (R⁻¹ for QR); the upper factor is where every
            // method leaves it.
            trsm(ctx, KSide::Right, Uplo::Upper, Trans::NoTrans, Diag::NonUnit, one, &atl, &abl)?;
            gemm(ctx, Trans::NoTrans, Trans::NoTrans, -one, &abl, &atr, one, &abr)?;
            factors
        };
        self.factors = factors;
        self.method = Some(method);
        self.state = ElementState::Factored;
        trace!(element = self.element, nfactor = self.nfactor, nschur = self.nschur, "factored");
        trace_tile!("ATL", &self.blocks[ATL]);
        Ok(())
    }

    fn factored_method(&self, operation: &'static str) -> Result<FactorMethod> {
        self.require(&[ElementState::Factored, ElementState::Solved], operation)?;
        match self.method {
            Some(m) => Ok(m),
            None => Err(Error::InvalidState {
                element: self.element,
                state: self.state.as_str(),
                operation,
            }),
        }
    }

    /// `Bt <- L⁻¹ P Bt` (`Qᴴ Bt`), then `Bb <- Bb - ABL Bt`.
    pub fn solve_forward(&mut self, ctx: &Context) -> Result<()> {
        let method = self.factored_method("solve forward")?;
        if self.nfactor == 0 {
            return Ok(());
        }
        let one = S::one();
        let atl = self.hier(&self.blocks[ATL])?;
        let bt = self.hier(&self.rhs[RhsKind::B.index()][0])?;
        let bb = self.hier(&self.rhs[RhsKind::B.index()][1])?;
        let unit_lower = |bt: &HierMatrix<S>| {
            trsm(ctx, KSide::Left, Uplo::Lower, Trans::NoTrans, Diag::Unit, one, &atl, bt)
        };
        match (&self.factors, method) {
            (_, FactorMethod::Cholesky) => {
                trsm(ctx, KSide::Left, Uplo::Lower, Trans::NoTrans, Diag::NonUnit, one, &atl, &bt)?;
                let atr = self.hier(&self.blocks[ATR])?;
                return gemm(ctx, Trans::ConjTrans, Trans::NoTrans, -one, &atr, &bt, one, &bb);
            }
            (Factors::Pivots(ipiv), _) => {
                apply_pivots(ctx, ipiv, &bt, PivotDirection::Forward)?;
                unit_lower(&bt)?;
            }
            (Factors::IncPiv(piv), _) => apply_lu_incpiv(ctx, &atl, piv, &bt)?,
            (Factors::Qr(ts), _) => apply_q(ctx, &atl, ts, Trans::ConjTrans, &bt)?,
            (Factors::QrInc(f), _) => apply_q_inc(ctx, &atl, f, Trans::ConjTrans, &bt)?,
            (Factors::None, _) => unit_lower(&bt)?,
        }
        let abl = self.hier(&self.blocks[ABL])?;
        gemm(ctx, Trans::NoTrans, Trans::NoTrans, -one, &abl, &bt, one, &bb)
    }

    /// `Xt <- U⁻¹ (Bt - ATR Xb)` with `Xb` already branched in.
    pub fn solve_backward(&mut self, ctx: &Context) -> Result<()> {
        let method = self.factored_method("solve backward")?;
        if self.nfactor > 0 {
            let one = S::one();
            let [b, x, _] = &mut self.rhs;
            x[0].copy_from(&b[0])?;
            let atl = self.hier(&self.blocks[ATL])?;
            let atr = self.hier(&self.blocks[ATR])?;
            let xt = self.hier(&self.rhs[RhsKind::X.index()][0])?;
            let xb = self.hier(&self.rhs[RhsKind::X.index()][1])?;
            gemm(ctx, Trans::NoTrans, Trans::NoTrans, -one, &atr, &xb, one, &xt)?;
            let (uplo, trans) = match method {
                FactorMethod::Cholesky => (Uplo::Lower, Trans::ConjTrans),
                _ => (Uplo::Upper, Trans::NoTrans),
            };
            trsm(ctx, KSide::Left, uplo, trans, Diag::NonUnit, one, &atl, &xt)?;
        }
        self.state = ElementState::Solved;
        Ok(())
    }

    fn factor_tiles(&self) -> Vec<&Tile<S>> {
        match &self.factors {
            Factors::Qr(ts) => ts.iter().collect(),
            Factors::QrInc(f) => f.tiles().collect(),
            _ => Vec::new(),
        }
    }

    fn factor_tiles_mut(&mut self) -> Vec<&mut Tile<S>> {
        match &mut self.factors {
            Factors::Qr(ts) => ts.iter_mut().collect(),
            Factors::QrInc(f) => f.tiles_mut().collect(),
            _ => Vec::new(),
        }
    }

    /// Raw ATL, ATR, ABL, ABR and reflector factors in native byte order.
    /// Pivot sequences stay in memory.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<()> {
        self.require(&[ElementState::Factored, ElementState::Solved], "write")?;
        for t in self.blocks.iter().chain(self.factor_tiles()) {
            w.write_all(bytemuck::cast_slice(&t.to_vec()?))?;
        }
        w.flush()?;
        Ok(())
    }

    /// Counterpart of [`write_to`](Self::write_to) on a finalized matrix.
    pub fn read_from<R: Read>(&mut self, mut r: R) -> Result<()> {
        self.require(&[ElementState::Finalized], "read")?;
        self.method.ok_or(Error::InvalidState {
            element: self.element,
            state: self.state.as_str(),
            operation: "read unfactored",
        })?;
        for i in 0..4 {
            let (rows, cols) = self.block_shape(i);
            self.blocks[i] = read_tile(&mut r, rows, cols)?;
        }
        for t in self.factor_tiles_mut() {
            *t = read_tile(&mut r, t.rows(), t.cols())?;
        }
        for kind in 0..3 {
            for side in 0..2 {
                self.rhs[kind][side] = Tile::zeros(self.rhs_rows(side), self.nrhs);
            }
        }
        self.state = ElementState::Factored;
        Ok(())
    }

    /// Release every buffer. Factors stay describable but unusable until
    /// read back.
    pub fn free(&mut self) {
        self.release();
        self.state = ElementState::Finalized;
    }

    fn release(&mut self) {
        for t in &mut self.blocks {
            t.free();
        }
        for t in self.rhs.iter_mut().flatten() {
            t.free();
        }
        for t in self.factor_tiles_mut() {
            t.free();
        }
    }

    /// Floating point operations of [`factor`](Self::factor).
    pub fn flops(&self, method: FactorMethod) -> f64 {
        let (f, s) = (self.nfactor as f64, self.nschur as f64);
        let (diag, panels) = match method {
            FactorMethod::Cholesky => (f * f * f / 3.0, f * f * s),
            FactorMethod::Qr | FactorMethod::QrInc => (4.0 * f * f * f / 3.0, 3.0 * f * f * s),
            _ => (2.0 * f * f * f / 3.0, 2.0 * f * f * s),
        };
        diag + panels + 2.0 * f * s * s
    }
}

fn read_tile<S: Field, R: Read>(r: &mut R, rows: usize, cols: usize) -> Result<Tile<S>> {
    let mut data = vec![S::zero(); rows * cols];
    r.read_exact(bytemuck::cast_slice_mut(&mut data))?;
    Ok(Tile::from_col_major(rows, cols, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const METHODS: [FactorMethod; 6] = [
        FactorMethod::Cholesky,
        FactorMethod::LuNoPiv,
        FactorMethod::LuPiv,
        FactorMethod::LuIncPiv,
        FactorMethod::Qr,
        FactorMethod::QrInc,
    ];

    /// Symmetric, diagonally dominant `n x n`.
    fn spd(n: usize, rng: &mut ChaCha8Rng) -> Vec<f64> {
        let mut a = vec![0.0; n * n];
        for j in 0..n {
            for i in 0..j {
                let v = rng.gen_range(-1.0..1.0);
                a[j * n + i] = v;
                a[i * n + j] = v;
            }
            a[j * n + j] = n as f64 + 1.0;
        }
        a
    }

    fn load(pm: &mut PerNodeMatrix<f64>, a: &[f64], b: &[f64]) {
        let n = pm.nfactor + pm.nschur;
        let f = pm.nfactor;
        pm.arrange().unwrap();
        pm.create_buffers().unwrap();
        for (k, t) in pm.blocks.iter_mut().enumerate() {
            let (r0, c0) = [(0, 0), (0, f), (f, 0), (f, f)][k];
            for j in 0..t.cols() {
                for i in 0..t.rows() {
                    t.set(i, j, a[(c0 + j) * n + r0 + i]);
                }
            }
        }
        for (side, t) in pm.rhs[0].iter_mut().enumerate() {
            for i in 0..t.rows() {
                t.set(i, 0, b[i + side * f]);
            }
        }
        pm.assembled().unwrap();
    }

    #[test]
    fn element_solve_matches_dense_system() {
        let mut rng = ChaCha8Rng::seed_from_u64(51);
        let (f, s) = (7, 4);
        let n = f + s;
        let a = spd(n, &mut rng);
        let x0: Vec<f64> = (0..n).map(|i| 1.0 + i as f64 * 0.25).collect();
        let b: Vec<f64> = (0..n).map(|i| (0..n).map(|j| a[j * n + i] * x0[j]).sum()).collect();
        let ctx = Context::builder().threads(2).build().unwrap();
        for method in METHODS {
            let mut pm = PerNodeMatrix::new(0, f, s, 1, 3);
            load(&mut pm, &a, &b);
            pm.factor(&ctx, method).unwrap();
            pm.solve_forward(&ctx).unwrap();

            // Solve the Schur system densely for the bottom unknowns.
            let schur = pm.abr().to_vec().unwrap();
            let mut rhs = pm.rhs(RhsKind::B, Side::Bottom).to_vec().unwrap();
            let xb = dense_solve(s, schur, &mut rhs);
            for (g, e) in xb.iter().zip(&x0[f..]) {
                assert_abs_diff_eq!(g, e, epsilon = 1e-9);
            }
            for (i, v) in xb.iter().enumerate() {
                pm.rhs[RhsKind::X.index()][1].set(i, 0, *v);
            }
            pm.solve_backward(&ctx).unwrap();
            assert_eq!(pm.state(), ElementState::Solved);
            let xt = pm.rhs(RhsKind::X, Side::Top).to_vec().unwrap();
            for (g, e) in xt.iter().zip(&x0[..f]) {
                assert_abs_diff_eq!(g, e, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn schur_complement_matches_dense_elimination() {
        let mut rng = ChaCha8Rng::seed_from_u64(53);
        let (f, s) = (7, 4);
        let n = f + s;
        let a = spd(n, &mut rng);
        let at = |i: usize, j: usize| a[j * n + i];
        // S = A22 - A21 A11⁻¹ A12, one column of A11⁻¹ A12 at a time.
        let a11: Vec<f64> = (0..f).flat_map(|j| (0..f).map(move |i| (i, j))).map(|(i, j)| at(i, j)).collect();
        let mut expect = vec![0.0; s * s];
        for j in 0..s {
            let mut col: Vec<f64> = (0..f).map(|i| at(i, f + j)).collect();
            let y = dense_solve(f, a11.clone(), &mut col);
            for i in 0..s {
                let dot: f64 = (0..f).map(|k| at(f + i, k) * y[k]).sum();
                expect[j * s + i] = at(f + i, f + j) - dot;
            }
        }
        let ctx = Context::builder().threads(3).build().unwrap();
        for mb in [1, 2, 3, 7, 64] {
            for method in METHODS {
                let mut pm = PerNodeMatrix::new(0, f, s, 1, mb);
                load(&mut pm, &a, &vec![0.0; n]);
                ctx.install(|| pm.factor(&ctx, method)).unwrap();
                let got = pm.abr().to_vec().unwrap();
                for (g, e) in got.iter().zip(&expect) {
                    assert_abs_diff_eq!(g, e, epsilon = 1e-12);
                }
            }
        }
    }

    fn dense_solve(n: usize, mut a: Vec<f64>, b: &mut [f64]) -> Vec<f64> {
        for k in 0..n {
            let p = (k..n)
                .max_by(|&x, &y| a[k * n + x].abs().total_cmp(&a[k * n + y].abs()))
                .unwrap();
            for j in 0..n {
                a.swap(j * n + k, j * n + p);
            }
            b.swap(k, p);
            for i in k + 1..n {
                let l = a[k * n + i] / a[k * n + k];
                for j in k..n {
                    a[j * n + i] -= l * a[j * n + k];
                }
                b[i] -= l * b[k];
            }
        }
        let mut x = b.to_vec();
        for k in (0..n).rev() {
            for j in k + 1..n {
                x[k] -= a[j * n + k] * x[j];
            }
            x[k] /= a[k * n + k];
        }
        x
    }

    #[test]
    fn out_of_order_operations_are_rejected() {
        let mut pm = PerNodeMatrix::<f64>::new(3, 2, 2, 1, 2);
        let ctx = Context::default();
        assert!(matches!(
            pm.factor(&ctx, FactorMethod::LuPiv),
            Err(Error::InvalidState { element: 3, state: "unassembled", .. })
        ));
        pm.arrange().unwrap();
        assert!(pm.solve_forward(&ctx).is_err());
        assert!(pm.arrange().is_err());
    }

    #[test]
    fn spill_round_trip_is_bit_identical() {
        let mut rng = ChaCha8Rng::seed_from_u64(52);
        let (f, s) = (5, 3);
        let a = spd(f + s, &mut rng);
        let b = vec![1.0; f + s];
        let ctx = Context::default();
        for method in [FactorMethod::LuPiv, FactorMethod::QrInc, FactorMethod::Qr] {
            let mut pm = PerNodeMatrix::new(0, f, s, 1, 2);
            load(&mut pm, &a, &b);
            pm.factor(&ctx, method).unwrap();
            let before: Vec<Vec<f64>> = pm.blocks.iter().map(|t| t.to_vec().unwrap()).collect();
            let mut bytes = Vec::new();
            pm.write_to(&mut bytes).unwrap();
            pm.free();
            assert_eq!(pm.state(), ElementState::Finalized);
            assert!(pm.atl().handle().is_err());

            pm.read_from(bytes.as_slice()).unwrap();
            let after: Vec<Vec<f64>> = pm.blocks.iter().map(|t| t.to_vec().unwrap()).collect();
            assert_eq!(before, after);
            pm.solve_forward(&ctx).unwrap();
        }
    }

    #[test]
    fn zero_factor_rows_only_pass_through() {
        let mut pm = PerNodeMatrix::<f64>::new(0, 0, 3, 2, 2);
        let a: Vec<f64> = (0..9).map(|v| v as f64).collect();
        load(&mut pm, &a, &[0.0; 3]);
        pm.factor(&Context::default(), FactorMethod::LuPiv).unwrap();
        assert_eq!(pm.abr().to_vec().unwrap(), a);
        assert_eq!(pm.flops(FactorMethod::LuPiv), 0.0);
    }
}
