//! Blocked Householder QR over full column panels.

use super::lapack::{geqrt, larfb};
use super::Trans;
use crate::config::Context;
use crate::error::Result;
use crate::hier::HierMatrix;
use crate::tile::{Tile, TileHandle};
use crate::traits::Field;

/// Factor `a = Q R` in place. `R` lands on and above the diagonal, the
/// reflectors below it; the returned tiles are the block reflector factors,
/// one per column panel.
pub fn qr<S: Field>(ctx: &Context, a: &HierMatrix<S>) -> Result<Vec<Tile<S>>> {
    let nbr = a.block_rows();
    let steps = nbr.min(a.block_cols());
    let mut ts = Vec::with_capacity(steps);
    for k in 0..steps {
        let columns = (k..a.block_cols())
            .map(|j| a.sub(k, j, nbr - k, 1).flatten()?.handle())
            .collect::<Result<Vec<TileHandle<S>>>>()?;
        let (panel, trailing) = columns.split_at(1);
        let v = &panel[0];
        let kk = (a.rows() - a.row_start(k)).min(a.col_extent(k));
        let t = Tile::zeros(kk, kk);
        let th = t.handle()?;
        ctx.count_kernel();
        // SAFETY: no task is running.
        geqrt(unsafe { v.as_mut() }, unsafe { th.as_mut() });
        let th = &th;
        rayon::scope(|s| {
            for c in trailing {
                s.spawn(move |_| {
                    ctx.count_kernel();
                    // SAFETY: one task per trailing column panel.
                    larfb(v.as_ref(), th.as_ref(), Trans::ConjTrans, unsafe { c.as_mut() });
                });
            }
        });
        ts.push(t);
    }
    Ok(ts)
}

/// `b <- Q b` (`NoTrans`) or `b <- Qᴴ b` (`ConjTrans`) for the `Q` of
/// [`qr`]. `b` shares the row partition of `a`.
pub fn apply_q<S: Field>(
    ctx: &Context,
    a: &HierMatrix<S>,
    ts: &[Tile<S>],
    trans: Trans,
    b: &HierMatrix<S>,
) -> Result<()> {
    assert_eq!(a.rows(), b.rows(), "apply_q: A and B disagree");
    assert!(trans != Trans::Trans, "apply_q: plain transpose of Q is not supported");
    let nbr = a.block_rows();
    let mut steps: Vec<usize> = (0..ts.len()).collect();
    if trans == Trans::NoTrans {
        steps.reverse();
    }
    let panels = (0..ts.len())
        .map(|k| a.sub(k, k, nbr - k, 1).flatten()?.handle())
        .collect::<Result<Vec<_>>>()?;
    let tfactors = ts.iter().map(|t| t.handle()).collect::<Result<Vec<_>>>()?;
    for k in steps {
        let columns = (0..b.block_cols())
            .map(|j| b.sub(k, j, nbr - k, 1).flatten()?.handle())
            .collect::<Result<Vec<TileHandle<S>>>>()?;
        let (v, t) = (&panels[k], &tfactors[k]);
        rayon::scope(|s| {
            for c in &columns {
                s.spawn(move |_| {
                    ctx.count_kernel();
                    // SAFETY: one task per block column of b.
                    larfb(v.as_ref(), t.as_ref(), trans, unsafe { c.as_mut() });
                });
            }
        });
    }
    Ok(())
}
