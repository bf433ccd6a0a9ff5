//! Tile LU with incremental pivoting.
//!
//! Each diagonal tile is factored with partial pivoting on its own rows,
//! then coupled with every tile below it through `tstrf`. Pivoting never
//! crosses more than two tiles, so the row panel updates of one step can
//! run as independent tasks.

use super::blas::laswp;
use super::lapack::{getrf, shifted, ssssm, tstrf};
use super::{tri_cell, Diag, Failures, Side, Trans, Uplo};
use crate::accel::TriKernel;
use crate::config::Context;
use crate::error::Result;
use crate::hier::{HierMatrix, Pinned};
use crate::tile::{MatMut, MatRef};
use crate::traits::Field;

/// Elimination record of [`lu_incpiv`].
#[derive(Debug, Clone, Default)]
pub struct IncPivots {
    blocks: usize,
    /// Local pivots of each diagonal tile.
    diag: Vec<Vec<usize>>,
    /// `tstrf` pivots of the pair `(k, i)`, at `k * blocks + i`.
    coupled: Vec<Vec<usize>>,
}

impl IncPivots {
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }
}

/// Factor `a` in place. The `U` factor is formed by the upper triangles of
/// the diagonal tiles and the tiles right of them; the multipliers stay in
/// the lower triangles of the diagonal tiles and in the tiles below them.
pub fn lu_incpiv<S: Field>(ctx: &Context, a: &HierMatrix<S>) -> Result<IncPivots> {
    assert_eq!(a.rows(), a.cols(), "lu_incpiv: matrix must be square");
    assert_eq!(a.block_rows(), a.block_cols(), "lu_incpiv: partition must be square");
    let nb = a.block_rows();
    let pinned = a.pin()?;
    let p = &pinned;
    let mut piv = IncPivots {
        blocks: nb,
        diag: Vec::with_capacity(nb),
        coupled: vec![Vec::new(); nb * nb],
    };
    for k in 0..nb {
        ctx.count_kernel();
        // SAFETY: no task is running.
        let dk = getrf(unsafe { p.cell_mut(k, k) }).map_err(|e| shifted(e, a.row_start(k)))?;
        {
            let fails = Failures::default();
            let (f, dk) = (&fails, &dk);
            rayon::scope(|s| {
                for j in k + 1..nb {
                    s.spawn(move |_| {
                        // SAFETY: block column j belongs to this task.
                        laswp(unsafe { p.cell_mut(k, j) }, dk, 0, dk.len(), true);
                        let akj = unsafe { p.cell_mut(k, j) };
                        f.record(unit_lower_solve(ctx, p.cell(k, k), akj));
                    });
                }
            });
            fails.finish()?;
        }
        piv.diag.push(dk);

        for i in k + 1..nb {
            ctx.count_kernel();
            // SAFETY: no task is running. Only the upper triangle of the
            // diagonal tile is touched.
            let (ukk, aik) = unsafe { (p.cell_mut(k, k), p.cell_mut(i, k)) };
            let pk = tstrf(ukk, aik).map_err(|e| shifted(e, a.row_start(k)))?;
            let pk_ref = &pk;
            rayon::scope(|s| {
                for j in k + 1..nb {
                    s.spawn(move |_| {
                        ctx.count_kernel();
                        // SAFETY: block column j belongs to this task.
                        let (akj, aij) = unsafe { (p.cell_mut(k, j), p.cell_mut(i, j)) };
                        ssssm(akj, aij, p.cell(i, k), pk_ref);
                    });
                }
            });
            piv.coupled[k * nb + i] = pk;
        }
    }
    Ok(piv)
}

/// Replay the elimination of [`lu_incpiv`] on `b`: `b <- L⁻¹ P b`, with the
/// same row partition as `a`. One task per block column of `b`.
pub fn apply_lu_incpiv<S: Field>(
    ctx: &Context,
    a: &HierMatrix<S>,
    piv: &IncPivots,
    b: &HierMatrix<S>,
) -> Result<()> {
    assert_eq!(a.rows(), b.rows(), "apply_lu_incpiv: A and B disagree");
    assert_eq!(a.block_rows(), piv.blocks, "apply_lu_incpiv: stale pivots");
    if b.is_empty() {
        return Ok(());
    }
    let (pa, pb) = (a.pin()?, b.pin()?);
    let (pa, pb) = (&pa, &pb);
    let fails = Failures::default();
    let f = &fails;
    rayon::scope(|s| {
        for j in 0..pb.block_cols() {
            s.spawn(move |_| f.record(replay(ctx, pa, piv, pb, j)));
        }
    });
    fails.finish()
}

fn replay<S: Field>(ctx: &Context, a: &Pinned<S>, piv: &IncPivots, b: &Pinned<S>, j: usize) -> Result<()> {
    let nb = piv.blocks;
    for k in 0..nb {
        let dk = &piv.diag[k];
        // SAFETY: block column j of b belongs to the calling task.
        laswp(unsafe { b.cell_mut(k, j) }, dk, 0, dk.len(), true);
        unit_lower_solve(ctx, a.cell(k, k), unsafe { b.cell_mut(k, j) })?;
        for i in k + 1..nb {
            ctx.count_kernel();
            let (bkj, bij) = unsafe { (b.cell_mut(k, j), b.cell_mut(i, j)) };
            ssssm(bkj, bij, a.cell(i, k), &piv.coupled[k * nb + i]);
        }
    }
    Ok(())
}

fn unit_lower_solve<S: Field>(
    ctx: &Context,
    l: MatRef<'_, S>,
    b: MatMut<'_, S>,
) -> Result<()> {
    tri_cell(
        ctx,
        TriKernel::Trsm,
        Side::Left,
        Uplo::Lower,
        Trans::NoTrans,
        Diag::Unit,
        S::one(),
        l,
        b,
    )
}
