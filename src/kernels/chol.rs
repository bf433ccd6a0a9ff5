//! Blocked right-looking Cholesky, lower triangle.

use super::lapack::{potrf, shifted};
use super::{tri_cell, update_cell, Diag, Failures, Side, Trans, Uplo};
use crate::accel::TriKernel;
use crate::config::Context;
use crate::error::Result;
use crate::hier::HierMatrix;
use crate::traits::Field;

/// Overwrite the lower triangle of `a` with `L`, `A = L Lᴴ`. Blocks above
/// the diagonal are not referenced.
pub fn chol<S: Field>(ctx: &Context, a: &HierMatrix<S>) -> Result<()> {
    assert_eq!(a.rows(), a.cols(), "chol: matrix must be square");
    assert_eq!(a.block_rows(), a.block_cols(), "chol: partition must be square");
    let nb = a.block_rows();
    let pinned = a.pin()?;
    let p = &pinned;
    for k in 0..nb {
        ctx.count_kernel();
        // SAFETY: no task is running; the diagonal cell is exclusive.
        potrf(unsafe { p.cell_mut(k, k) }).map_err(|e| shifted(e, a.row_start(k)))?;

        let fails = Failures::default();
        let f = &fails;
        rayon::scope(|s| {
            for i in k + 1..nb {
                s.spawn(move |_| {
                    // SAFETY: one task per panel cell, diagonal read only.
                    let aik = unsafe { p.cell_mut(i, k) };
                    f.record(tri_cell(
                        ctx,
                        TriKernel::Trsm,
                        Side::Right,
                        Uplo::Lower,
                        Trans::ConjTrans,
                        Diag::NonUnit,
                        S::one(),
                        p.cell(k, k),
                        aik,
                    ));
                });
            }
        });
        fails.finish()?;

        rayon::scope(|s| {
            for j in k + 1..nb {
                for i in j..nb {
                    s.spawn(move |_| {
                        // SAFETY: one task per trailing cell, panel read only.
                        let aij = unsafe { p.cell_mut(i, j) };
                        update_cell(ctx, Trans::NoTrans, p.cell(i, k), Trans::ConjTrans, p.cell(j, k), aij);
                    });
                }
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::tile::Tile;
    use approx::assert_abs_diff_eq;
    use num_complex::Complex64;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn hpd(n: usize, rng: &mut ChaCha8Rng) -> Vec<Complex64> {
        let b: Vec<Complex64> = (0..n * n)
            .map(|_| Complex64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect();
        let mut a = vec![Complex64::new(0.0, 0.0); n * n];
        for j in 0..n {
            for i in 0..n {
                let mut s = Complex64::new(0.0, 0.0);
                for p in 0..n {
                    s += b[i * n + p].conj() * b[j * n + p];
                }
                a[j * n + i] = s;
            }
            a[j * n + j] += Complex64::new(n as f64, 0.0);
        }
        a
    }

    #[test]
    fn reconstructs_hermitian_matrix() {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let n = 9;
        let a0 = hpd(n, &mut rng);
        let t = Tile::from_col_major(n, n, a0.clone());
        let h = HierMatrix::from_flat(&t, 4, 4).unwrap();
        let ctx = Context::builder().threads(2).build().unwrap();
        ctx.install(|| chol(&ctx, &h).unwrap());
        let l = |i: usize, j: usize| if i >= j { t.get(i, j) } else { Complex64::new(0.0, 0.0) };
        for j in 0..n {
            for i in j..n {
                let mut s = Complex64::new(0.0, 0.0);
                for p in 0..n {
                    s += l(i, p) * l(j, p).conj();
                }
                assert_abs_diff_eq!(s.re, a0[j * n + i].re, epsilon = 1e-10);
                assert_abs_diff_eq!(s.im, a0[j * n + i].im, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn indefinite_pivot_reports_global_index() {
        let n = 6;
        let t = Tile::from_fn(n, n, |i, j| if i == j { if i == 4 { -1.0 } else { 2.0 } } else { 0.0 });
        let h = HierMatrix::from_flat(&t, 3, 3).unwrap();
        let err = chol(&Context::default(), &h).unwrap_err();
        assert!(matches!(err, Error::Breakdown { index: 4, .. }));
    }
}
