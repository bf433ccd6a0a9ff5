//! Blocked triangular multiply `B = alpha op(A) B` or `B = alpha B op(A)`.

use super::{
    accumulate_cell, after, before, op_cell, op_is_lower, order, scale, tri_cell, Diag, Failures,
    Side, Trans, Uplo, Variant,
};
use crate::accel::TriKernel;
use crate::config::Context;
use crate::error::Result;
use crate::hier::{HierMatrix, Pinned};
use crate::traits::Field;

struct Sweep<'a, S> {
    ctx: &'a Context,
    uplo: Uplo,
    trans: Trans,
    diag: Diag,
    a: &'a Pinned<S>,
    b: &'a Pinned<S>,
}

impl<S: Field> Sweep<'_, S> {
    fn diag_block(&self, side: Side, k: usize, i: usize, j: usize) -> Result<()> {
        // SAFETY: callers give each task exclusive ownership of cell (i, j).
        let bij = unsafe { self.b.cell_mut(i, j) };
        tri_cell(
            self.ctx,
            TriKernel::Trmm,
            side,
            self.uplo,
            self.trans,
            self.diag,
            S::one(),
            self.a.cell(k, k),
            bij,
        )
    }
}

/// Overwrite `b` with the product. Blocks of `B` are overwritten in the
/// order that keeps every still-needed block untouched.
#[allow(clippy::too_many_arguments)]
pub fn trmm<S: Field>(
    ctx: &Context,
    side: Side,
    uplo: Uplo,
    trans: Trans,
    diag: Diag,
    alpha: S,
    a: &HierMatrix<S>,
    b: &HierMatrix<S>,
) -> Result<()> {
    assert_eq!(a.rows(), a.cols(), "trmm: A must be square");
    match side {
        Side::Left => assert_eq!(a.rows(), b.rows(), "trmm: A and B disagree"),
        Side::Right => assert_eq!(a.cols(), b.cols(), "trmm: A and B disagree"),
    }
    if b.is_empty() {
        return Ok(());
    }
    let (pa, pb) = (a.pin()?, b.pin()?);
    scale(alpha, &pb);
    let sw = Sweep {
        ctx,
        uplo,
        trans,
        diag,
        a: &pa,
        b: &pb,
    };
    match side {
        Side::Left => left(&sw, ctx.variant()),
        Side::Right => right(&sw, ctx.variant()),
    }
}

fn left<S: Field>(sw: &Sweep<'_, S>, variant: Variant) -> Result<()> {
    // Lower op(A) reads rows above the one being written: walk bottom up.
    let forward = !op_is_lower(sw.uplo, sw.trans);
    let (nk, nj) = (sw.b.block_rows(), sw.b.block_cols());
    for k in order(nk, forward) {
        let fails = Failures::default();
        let f = &fails;
        rayon::scope(|s| {
            for j in 0..nj {
                s.spawn(move |_| match variant {
                    Variant::One => {
                        f.record(sw.diag_block(Side::Left, k, k, j));
                        for p in after(k, nk, forward) {
                            // SAFETY: block column j belongs to this task.
                            let bkj = unsafe { sw.b.cell_mut(k, j) };
                            let akp = op_cell(sw.a, sw.trans, k, p);
                            accumulate_cell(sw.ctx, sw.trans, akp, Trans::NoTrans, sw.b.cell(p, j), bkj);
                        }
                    }
                    Variant::Two => {
                        for i in before(k, nk, forward) {
                            // SAFETY: block column j belongs to this task.
                            let bij = unsafe { sw.b.cell_mut(i, j) };
                            let aik = op_cell(sw.a, sw.trans, i, k);
                            accumulate_cell(sw.ctx, sw.trans, aik, Trans::NoTrans, sw.b.cell(k, j), bij);
                        }
                        f.record(sw.diag_block(Side::Left, k, k, j));
                    }
                });
            }
        });
        fails.finish()?;
    }
    Ok(())
}

fn right<S: Field>(sw: &Sweep<'_, S>, variant: Variant) -> Result<()> {
    let forward = op_is_lower(sw.uplo, sw.trans);
    let (ni, nk) = (sw.b.block_rows(), sw.b.block_cols());
    for k in order(nk, forward) {
        let fails = Failures::default();
        let f = &fails;
        rayon::scope(|s| {
            for i in 0..ni {
                s.spawn(move |_| match variant {
                    Variant::One => {
                        f.record(sw.diag_block(Side::Right, k, i, k));
                        for p in after(k, nk, forward) {
                            // SAFETY: block row i belongs to this task.
                            let bik = unsafe { sw.b.cell_mut(i, k) };
                            let apk = op_cell(sw.a, sw.trans, p, k);
                            accumulate_cell(sw.ctx, Trans::NoTrans, sw.b.cell(i, p), sw.trans, apk, bik);
                        }
                    }
                    Variant::Two => {
                        for q in before(k, nk, forward) {
                            // SAFETY: block row i belongs to this task.
                            let biq = unsafe { sw.b.cell_mut(i, q) };
                            let akq = op_cell(sw.a, sw.trans, k, q);
                            accumulate_cell(sw.ctx, Trans::NoTrans, sw.b.cell(i, k), sw.trans, akq, biq);
                        }
                        f.record(sw.diag_block(Side::Right, k, i, k));
                    }
                });
            }
        });
        fails.finish()?;
    }
    Ok(())
}
