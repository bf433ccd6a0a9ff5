//! Blocked triangular solve `op(A) X = alpha B` or `X op(A) = alpha B`.
//!
//! The eight `(side, uplo, trans)` cases reduce to four sweeps. The left
//! side walks block rows of `B` and the right side walks block columns,
//! forward when `op(A)` is lower (left) or upper (right), backward otherwise.

use super::{
    after, before, op_cell, op_is_lower, order, scale, tri_cell, update_cell, Diag, Failures,
    Side, Trans, Uplo, Variant,
};
use crate::accel::TriKernel;
use crate::config::Context;
use crate::error::Result;
use crate::hier::{HierMatrix, Pinned};
use crate::tile::MatMut;
use crate::traits::Field;

/// Shared arguments of one sweep.
struct Sweep<'a, S> {
    ctx: &'a Context,
    uplo: Uplo,
    trans: Trans,
    diag: Diag,
    a: &'a Pinned<S>,
    b: &'a Pinned<S>,
}

/// Overwrite `b` with the solution `X`. `a` must be square with the same
/// block partition as `b`'s rows (left) or columns (right).
#[allow(clippy::too_many_arguments)]
pub fn trsm<S: Field>(
    ctx: &Context,
    side: Side,
    uplo: Uplo,
    trans: Trans,
    diag: Diag,
    alpha: S,
    a: &HierMatrix<S>,
    b: &HierMatrix<S>,
) -> Result<()> {
    assert_eq!(a.rows(), a.cols(), "trsm: A must be square");
    match side {
        Side::Left => assert_eq!(a.rows(), b.rows(), "trsm: A and B disagree"),
        Side::Right => assert_eq!(a.cols(), b.cols(), "trsm: A and B disagree"),
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
    let forward = op_is_lower(sw.uplo, sw.trans);
    let (nk, nj) = (sw.b.block_rows(), sw.b.block_cols());
    for k in order(nk, forward) {
        let fails = Failures::default();
        let f = &fails;
        match variant {
            Variant::One => {
                rayon::scope(|s| {
                    for j in 0..nj {
                        s.spawn(move |_| {
                            // SAFETY: block column j of row k belongs to this task.
                            let bkj = unsafe { sw.b.cell_mut(k, j) };
                            f.record(solve_diag(sw, Side::Left, k, bkj));
                        });
                    }
                });
                fails.finish()?;
                rayon::scope(|s| {
                    for i in after(k, nk, forward) {
                        for j in 0..nj {
                            s.spawn(move |_| {
                                // SAFETY: one task per trailing cell; row k is read only.
                                let bij = unsafe { sw.b.cell_mut(i, j) };
                                let aik = op_cell(sw.a, sw.trans, i, k);
                                update_cell(sw.ctx, sw.trans, aik, Trans::NoTrans, sw.b.cell(k, j), bij);
                            });
                        }
                    }
                });
            }
            Variant::Two => {
                rayon::scope(|s| {
                    for j in 0..nj {
                        s.spawn(move |_| {
                            for p in before(k, nk, forward) {
                                // SAFETY: block column j belongs to this task.
                                let bkj = unsafe { sw.b.cell_mut(k, j) };
                                let akp = op_cell(sw.a, sw.trans, k, p);
                                update_cell(sw.ctx, sw.trans, akp, Trans::NoTrans, sw.b.cell(p, j), bkj);
                            }
                            // SAFETY: as above.
                            let bkj = unsafe { sw.b.cell_mut(k, j) };
                            f.record(solve_diag(sw, Side::Left, k, bkj));
                        });
                    }
                });
                fails.finish()?;
            }
        }
    }
    Ok(())
}

fn right<S: Field>(sw: &Sweep<'_, S>, variant: Variant) -> Result<()> {
    // X op(A) = B resolves column blocks first to last when op(A) is upper.
    let forward = !op_is_lower(sw.uplo, sw.trans);
    let (ni, nk) = (sw.b.block_rows(), sw.b.block_cols());
    for k in order(nk, forward) {
        let fails = Failures::default();
        let f = &fails;
        match variant {
            Variant::One => {
                rayon::scope(|s| {
                    for i in 0..ni {
                        s.spawn(move |_| {
                            // SAFETY: block row i of column k belongs to this task.
                            let bik = unsafe { sw.b.cell_mut(i, k) };
                            f.record(solve_diag(sw, Side::Right, k, bik));
                        });
                    }
                });
                fails.finish()?;
                rayon::scope(|s| {
                    for j in after(k, nk, forward) {
                        for i in 0..ni {
                            s.spawn(move |_| {
                                // SAFETY: one task per trailing cell; column k is read only.
                                let bij = unsafe { sw.b.cell_mut(i, j) };
                                let akj = op_cell(sw.a, sw.trans, k, j);
                                update_cell(sw.ctx, Trans::NoTrans, sw.b.cell(i, k), sw.trans, akj, bij);
                            });
                        }
                    }
                });
            }
            Variant::Two => {
                rayon::scope(|s| {
                    for i in 0..ni {
                        s.spawn(move |_| {
                            for p in before(k, nk, forward) {
                                // SAFETY: block row i belongs to this task.
                                let bik = unsafe { sw.b.cell_mut(i, k) };
                                let apk = op_cell(sw.a, sw.trans, p, k);
                                update_cell(sw.ctx, Trans::NoTrans, sw.b.cell(i, p), sw.trans, apk, bik);
                            }
                            // SAFETY: as above.
                            let bik = unsafe { sw.b.cell_mut(i, k) };
                            f.record(solve_diag(sw, Side::Right, k, bik));
                        });
                    }
                });
                fails.finish()?;
            }
        }
    }
    Ok(())
}

fn solve_diag<S: Field>(
    sw: &Sweep<'_, S>,
    side: Side,
    k: usize,
    b: MatMut<'_, S>,
) -> Result<()> {
    tri_cell(
        sw.ctx,
        TriKernel::Trsm,
        side,
        sw.uplo,
        sw.trans,
        sw.diag,
        S::one(),
        sw.a.cell(k, k),
        b,
    )
}
