//! Blocked right-looking LU, with and without partial pivoting.

use super::blas::laswp;
use super::lapack::{getrf, getrf_nopiv, shifted};
use super::{tri_cell, update_cell, Diag, Failures, Side, Trans, Uplo};
use crate::accel::TriKernel;
use crate::config::Context;
use crate::error::Result;
use crate::hier::{HierMatrix, Pinned};
use crate::tile::TileHandle;
use crate::traits::Field;

/// Order in which row interchanges are replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotDirection {
    /// `B <- P B`, as during the factorization.
    Forward,
    /// `B <- Pᵀ B`.
    Inverse,
}

/// `A = L U` in place, unit `L`.
pub fn lu_nopiv<S: Field>(ctx: &Context, a: &HierMatrix<S>) -> Result<()> {
    assert_eq!(a.rows(), a.cols(), "lu: matrix must be square");
    assert_eq!(a.block_rows(), a.block_cols(), "lu: partition must be square");
    let nb = a.block_rows();
    let pinned = a.pin()?;
    let p = &pinned;
    for k in 0..nb {
        ctx.count_kernel();
        // SAFETY: no task is running.
        getrf_nopiv(unsafe { p.cell_mut(k, k) }).map_err(|e| shifted(e, a.row_start(k)))?;
        panels(ctx, p, k, nb, true, |_| Ok(()))?;
        trailing(ctx, p, k, nb);
    }
    Ok(())
}

/// `P A = L U` in place with partial pivoting over whole block columns.
/// Returns LAPACK style global pivots: row `r` was exchanged with `ipiv[r]`.
pub fn lu_piv<S: Field>(ctx: &Context, a: &HierMatrix<S>) -> Result<Vec<usize>> {
    assert_eq!(a.rows(), a.cols(), "lu: matrix must be square");
    assert_eq!(a.block_rows(), a.block_cols(), "lu: partition must be square");
    let nb = a.block_rows();
    let mut ipiv = Vec::with_capacity(a.rows());
    for k in 0..nb {
        let r0 = a.row_start(k);
        // Column panels below the diagonal, one per block column.
        let columns = (0..nb)
            .map(|j| a.sub(k, j, nb - k, 1).flatten()?.handle())
            .collect::<Result<Vec<TileHandle<S>>>>()?;
        ctx.count_kernel();
        // SAFETY: no task is running.
        let local = getrf(unsafe { columns[k].as_mut() }).map_err(|e| shifted(e, r0))?;
        ipiv.extend(local.iter().map(|r| r + r0));

        let pinned = a.pin()?;
        let p = &pinned;
        let (columns, local) = (&columns, &local);
        // `getrf` ran on the whole column panel, so `L_ik` is final.
        panels(ctx, p, k, nb, false, move |j| {
            // SAFETY: the task for block column j owns that panel.
            laswp(unsafe { columns[j].as_mut() }, local, 0, local.len(), true);
            Ok(())
        })?;
        trailing(ctx, p, k, nb);
    }
    Ok(ipiv)
}

/// Apply the row interchanges of [`lu_piv`] to every column of `b`.
pub fn apply_pivots<S: Field>(
    ctx: &Context,
    ipiv: &[usize],
    b: &HierMatrix<S>,
    direction: PivotDirection,
) -> Result<()> {
    assert_eq!(ipiv.len(), b.rows(), "apply_pivots: pivot count");
    let columns = (0..b.block_cols())
        .map(|j| b.sub(0, j, b.block_rows(), 1).flatten()?.handle())
        .collect::<Result<Vec<TileHandle<S>>>>()?;
    let columns = &columns;
    rayon::scope(|s| {
        for col in columns {
            s.spawn(move |_| {
                ctx.count_kernel();
                // SAFETY: one task per block column.
                let c = unsafe { col.as_mut() };
                laswp(c, ipiv, 0, ipiv.len(), direction == PivotDirection::Forward);
            });
        }
    });
    Ok(())
}

/// Row panel `U_kj = L_kk⁻¹ A_kj` and, with `solve_columns`, column panel
/// `L_ik = A_ik U_kk⁻¹`. `before_row(j)` runs in the task of block column `j`
/// ahead of its solve, and alone for the block columns left of `k`.
fn panels<S: Field>(
    ctx: &Context,
    p: &Pinned<S>,
    k: usize,
    nb: usize,
    solve_columns: bool,
    before_row: impl Fn(usize) -> Result<()> + Sync,
) -> Result<()> {
    let fails = Failures::default();
    let (f, before_row) = (&fails, &before_row);
    rayon::scope(|s| {
        for j in (0..nb).filter(|&j| j != k) {
            s.spawn(move |_| {
                f.record(before_row(j));
                if j < k {
                    return;
                }
                // SAFETY: block column j belongs to this task.
                let akj = unsafe { p.cell_mut(k, j) };
                f.record(tri_cell(
                    ctx,
                    TriKernel::Trsm,
                    Side::Left,
                    Uplo::Lower,
                    Trans::NoTrans,
                    Diag::Unit,
                    S::one(),
                    p.cell(k, k),
                    akj,
                ));
            });
        }
    });
    fails.finish()?;
    if !solve_columns {
        return Ok(());
    }
    let fails = Failures::default();
    let f = &fails;
    rayon::scope(|s| {
        for i in k + 1..nb {
            s.spawn(move |_| {
                // SAFETY: block row i of column k belongs to this task.
                let aik = unsafe { p.cell_mut(i, k) };
                f.record(tri_cell(
                    ctx,
                    TriKernel::Trsm,
                    Side::Right,
                    Uplo::Upper,
                    Trans::NoTrans,
                    Diag::NonUnit,
                    S::one(),
                    p.cell(k, k),
                    aik,
                ));
            });
        }
    });
    fails.finish()
}

fn trailing<S: Field>(ctx: &Context, p: &Pinned<S>, k: usize, nb: usize) {
    rayon::scope(|s| {
        for j in k + 1..nb {
            for i in k + 1..nb {
                s.spawn(move |_| {
                    // SAFETY: one task per trailing cell, panels read only.
                    let aij = unsafe { p.cell_mut(i, j) };
                    update_cell(ctx, Trans::NoTrans, p.cell(i, k), Trans::NoTrans, p.cell(k, j), aij);
                });
            }
        }
    });
}
