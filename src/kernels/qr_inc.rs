//! Tile QR: each diagonal tile is factored alone and then coupled with the
//! tiles below it pairwise (`tsqrt`/`tsmqr`).

use super::lapack::{geqrt, larfb, tsmqr, tsqrt};
use super::Trans;
use crate::config::Context;
use crate::error::{Error, Result};
use crate::hier::{HierMatrix, Pinned};
use crate::tile::{Tile, TileHandle};
use crate::traits::Field;

/// Block reflector factors of [`qr_inc`]: `T_kk` for the diagonal tiles and
/// `T_ik` for each coupled pair.
pub struct IncQr<S> {
    blocks: usize,
    t: Vec<Option<Tile<S>>>,
}

impl<S: Field> IncQr<S> {
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// Present factors, `k` major.
    pub(crate) fn tiles(&self) -> impl Iterator<Item = &Tile<S>> {
        self.t.iter().flatten()
    }

    pub(crate) fn tiles_mut(&mut self) -> impl Iterator<Item = &mut Tile<S>> {
        self.t.iter_mut().flatten()
    }

    fn handle(&self, i: usize, k: usize) -> Result<TileHandle<S>> {
        match &self.t[k * self.blocks + i] {
            Some(t) => t.handle(),
            None => Err(Error::NotCreated),
        }
    }
}

/// Factor the square `a` in place; `R` is the upper triangle.
pub fn qr_inc<S: Field>(ctx: &Context, a: &HierMatrix<S>) -> Result<IncQr<S>> {
    assert_eq!(a.rows(), a.cols(), "qr_inc: matrix must be square");
    assert_eq!(a.block_rows(), a.block_cols(), "qr_inc: partition must be square");
    let nb = a.block_rows();
    let pinned = a.pin()?;
    let p = &pinned;
    let mut f = IncQr {
        blocks: nb,
        t: (0..nb * nb).map(|_| None).collect(),
    };
    for k in 0..nb {
        let w = a.col_extent(k);
        let tkk = Tile::zeros(w, w);
        let th = tkk.handle()?;
        ctx.count_kernel();
        // SAFETY: no task is running.
        geqrt(unsafe { p.cell_mut(k, k) }, unsafe { th.as_mut() });
        let thr = &th;
        rayon::scope(|s| {
            for j in k + 1..nb {
                s.spawn(move |_| {
                    ctx.count_kernel();
                    // SAFETY: block column j belongs to this task.
                    larfb(p.cell(k, k), thr.as_ref(), Trans::ConjTrans, unsafe { p.cell_mut(k, j) });
                });
            }
        });
        f.t[k * nb + k] = Some(tkk);

        for i in k + 1..nb {
            let tik = Tile::zeros(w, w);
            let th = tik.handle()?;
            ctx.count_kernel();
            // SAFETY: no task is running; only the upper triangle of the
            // diagonal tile is touched.
            unsafe { tsqrt(p.cell_mut(k, k), p.cell_mut(i, k), th.as_mut()) };
            let thr = &th;
            rayon::scope(|s| {
                for j in k + 1..nb {
                    s.spawn(move |_| {
                        ctx.count_kernel();
                        // SAFETY: block column j belongs to this task.
                        let (akj, aij) = unsafe { (p.cell_mut(k, j), p.cell_mut(i, j)) };
                        tsmqr(akj, aij, p.cell(i, k), thr.as_ref(), Trans::ConjTrans);
                    });
                }
            });
            f.t[k * nb + i] = Some(tik);
        }
    }
    Ok(f)
}

/// `b <- Q b` or `b <- Qᴴ b` for the `Q` of [`qr_inc`], one task per block
/// column of `b`.
pub fn apply_q_inc<S: Field>(
    ctx: &Context,
    a: &HierMatrix<S>,
    f: &IncQr<S>,
    trans: Trans,
    b: &HierMatrix<S>,
) -> Result<()> {
    assert_eq!(a.rows(), b.rows(), "apply_q_inc: A and B disagree");
    assert_eq!(a.block_rows(), f.blocks, "apply_q_inc: stale factors");
    assert!(trans != Trans::Trans, "apply_q_inc: plain transpose of Q is not supported");
    if b.is_empty() {
        return Ok(());
    }
    let nb = f.blocks;
    let mut ts = Vec::with_capacity(nb * nb);
    for k in 0..nb {
        for i in 0..nb {
            ts.push(if i >= k { Some(f.handle(i, k)?) } else { None });
        }
    }
    let (pa, pb) = (a.pin()?, b.pin()?);
    let (pa, pb, ts) = (&pa, &pb, &ts);
    rayon::scope(|s| {
        for j in 0..pb.block_cols() {
            s.spawn(move |_| replay(ctx, pa, ts, nb, trans, pb, j));
        }
    });
    Ok(())
}

fn replay<S: Field>(
    ctx: &Context,
    a: &Pinned<S>,
    ts: &[Option<TileHandle<S>>],
    nb: usize,
    trans: Trans,
    b: &Pinned<S>,
    j: usize,
) {
    let t = |i: usize, k: usize| match &ts[k * nb + i] {
        Some(h) => h.as_ref(),
        None => unreachable!("reflector factor ({}, {}) is always present", i, k),
    };
    let diag = |k: usize| {
        ctx.count_kernel();
        // SAFETY: block column j of b belongs to the calling task.
        larfb(a.cell(k, k), t(k, k), trans, unsafe { b.cell_mut(k, j) });
    };
    let pair = |k: usize, i: usize| {
        ctx.count_kernel();
        // SAFETY: as above.
        let (bk, bi) = unsafe { (b.cell_mut(k, j), b.cell_mut(i, j)) };
        tsmqr(bk, bi, a.cell(i, k), t(i, k), trans);
    };
    if trans == Trans::ConjTrans {
        for k in 0..nb {
            diag(k);
            for i in k + 1..nb {
                pair(k, i);
            }
        }
    } else {
        for k in (0..nb).rev() {
            for i in (k + 1..nb).rev() {
                pair(k, i);
            }
            diag(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{trsm, Diag, Side, Uplo};
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn tile_qr_solves_and_q_is_unitary() {
        let mut rng = ChaCha8Rng::seed_from_u64(41);
        let n = 9;
        let a0: Vec<f64> = (0..n * n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let x0: Vec<f64> = (0..n).map(|i| 0.5 * i as f64 - 1.0).collect();
        let b0: Vec<f64> = (0..n)
            .map(|i| (0..n).map(|j| a0[j * n + i] * x0[j]).sum())
            .collect();
        let ctx = Context::builder().threads(3).build().unwrap();
        let t = Tile::from_col_major(n, n, a0);
        let h = HierMatrix::from_flat(&t, 3, 3).unwrap();
        let f = ctx.install(|| qr_inc(&ctx, &h).unwrap());
        assert_eq!(f.blocks(), 3);

        let bt = Tile::from_col_major(n, 1, b0.clone());
        let hb = HierMatrix::from_flat(&bt, 3, 1).unwrap();
        apply_q_inc(&ctx, &h, &f, Trans::ConjTrans, &hb).unwrap();
        let norm_qhb: f64 = bt.to_vec().unwrap().iter().map(|v| v * v).sum();
        let norm_b: f64 = b0.iter().map(|v| v * v).sum();
        assert_abs_diff_eq!(norm_qhb, norm_b, epsilon = 1e-9);

        trsm(&ctx, Side::Left, Uplo::Upper, Trans::NoTrans, Diag::NonUnit, 1.0, &h, &hb).unwrap();
        for (g, e) in bt.to_vec().unwrap().iter().zip(&x0) {
            assert_abs_diff_eq!(g, e, epsilon = 1e-9);
        }

        apply_q_inc(&ctx, &h, &f, Trans::NoTrans, &hb).unwrap();
        apply_q_inc(&ctx, &h, &f, Trans::ConjTrans, &hb).unwrap();
        for (g, e) in bt.to_vec().unwrap().iter().zip(&x0) {
            assert_abs_diff_eq!(g, e, epsilon = 1e-9);
        }
    }
}
