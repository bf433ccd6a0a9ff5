//! Sequential factorization micro-kernels on flat column-major views.
//!
//! Householder reflectors follow the LAPACK convention: `H = I - tau v vᴴ`
//! with `v[0] = 1`, and `Hᴴ [alpha; x] = [beta; 0]` with `beta` real.

use super::Trans;
use crate::error::{Error, Result};
use crate::tile::{MatMut, MatRef};
use crate::traits::{Field, Scalar};

/// Move a breakdown reported at a local pivot to its global position.
pub(crate) fn shifted(e: Error, by: usize) -> Error {
    match e {
        Error::Breakdown { method, index } => Error::Breakdown {
            method,
            index: index + by,
        },
        other => other,
    }
}

/// Lower Cholesky `A = L Lᴴ`; the strict upper triangle is not referenced.
pub fn potrf<S: Field>(mut a: MatMut<'_, S>) -> Result<()> {
    let n = a.rows();
    assert_eq!(a.cols(), n, "potrf: matrix must be square");
    for j in 0..n {
        let mut d = a.get(j, j).re();
        for k in 0..j {
            d -= a.get(j, k).norm().powi(2);
        }
        if d <= 0.0 || d.is_nan() {
            return Err(Error::Breakdown {
                method: "cholesky",
                index: j,
            });
        }
        let ljj = d.sqrt();
        a.set(j, j, S::from_f64(ljj));
        let inv = S::from_f64(1.0 / ljj);
        for i in j + 1..n {
            let mut s = a.get(i, j);
            for k in 0..j {
                s -= a.get(i, k) * a.get(j, k).conj();
            }
            a.set(i, j, s * inv);
        }
    }
    Ok(())
}

/// `A = L U` without pivoting, unit `L` stored below the diagonal.
pub fn getrf_nopiv<S: Field>(mut a: MatMut<'_, S>) -> Result<()> {
    let (m, n) = (a.rows(), a.cols());
    for k in 0..m.min(n) {
        let p = a.get(k, k);
        if p == S::zero() {
            return Err(Error::Breakdown {
                method: "lu",
                index: k,
            });
        }
        for i in k + 1..m {
            let l = a.get(i, k) / p;
            a.set(i, k, l);
        }
        for j in k + 1..n {
            let ukj = a.get(k, j);
            for i in k + 1..m {
                let l = a.get(i, k);
                a.set(i, j, a.get(i, j) - l * ukj);
            }
        }
    }
    Ok(())
}

/// `P A = L U` with partial pivoting over all rows of `a`. Returns the
/// LAPACK style pivots (row `k` was swapped with row `ipiv[k]`).
pub fn getrf<S: Field>(mut a: MatMut<'_, S>) -> Result<Vec<usize>> {
    let (m, n) = (a.rows(), a.cols());
    let k = m.min(n);
    let mut ipiv = Vec::with_capacity(k);
    for c in 0..k {
        let mut p = c;
        let mut best = a.get(c, c).norm();
        for r in c + 1..m {
            let v = a.get(r, c).norm();
            if v > best {
                best = v;
                p = r;
            }
        }
        ipiv.push(p);
        a.swap_rows(c, p);
        let d = a.get(c, c);
        if d == S::zero() {
            return Err(Error::Breakdown {
                method: "lu",
                index: c,
            });
        }
        for r in c + 1..m {
            let l = a.get(r, c) / d;
            a.set(r, c, l);
        }
        for j in c + 1..n {
            let ucj = a.get(c, j);
            for r in c + 1..m {
                let l = a.get(r, c);
                a.set(r, j, a.get(r, j) - l * ucj);
            }
        }
    }
    Ok(ipiv)
}

/// Generate a reflector annihilating `x`; `x` is overwritten by `v[1..]`.
/// Returns `(beta, tau)`.
pub(crate) fn reflector<S: Field>(alpha: S, x: &mut [S]) -> (S, S) {
    let xnorm2: f64 = x.iter().map(|v| v.norm().powi(2)).sum();
    let alpha_im = alpha.part(1).unwrap_or(0.0);
    if xnorm2 == 0.0 && alpha_im == 0.0 {
        return (alpha, S::zero());
    }
    let anorm = alpha.norm();
    let mut beta = (anorm * anorm + xnorm2).sqrt();
    if alpha.re() >= 0.0 {
        beta = -beta;
    }
    let beta = S::from_f64(beta);
    let tau = (beta - alpha) / beta;
    let scale = S::one() / (alpha - beta);
    for v in x.iter_mut() {
        *v = *v * scale;
    }
    (beta, tau)
}

/// Build the upper triangular `T` of `Q = I - V T Vᴴ` column by column.
/// `dot(i, j)` returns `V(:, i)ᴴ V(:, j)` for `i < j`.
fn form_t<S: Field>(taus: &[S], mut t: MatMut<'_, S>, dot: impl Fn(usize, usize) -> S) {
    let k = taus.len();
    t.fill(S::zero());
    for j in 0..k {
        t.set(j, j, taus[j]);
        let z: Vec<S> = (0..j).map(|i| dot(i, j)).collect();
        for i in 0..j {
            let mut s = S::zero();
            for p in i..j {
                s += t.get(i, p) * z[p];
            }
            t.set(i, j, -taus[j] * s);
        }
    }
}

/// Householder QR of `a` (m x n): `R` on and above the diagonal, the
/// reflectors below it, and the block reflector factor in `t`
/// (`min(m, n)` square).
pub fn geqrt<S: Field>(mut a: MatMut<'_, S>, t: MatMut<'_, S>) {
    let (m, n) = (a.rows(), a.cols());
    let k = m.min(n);
    assert!(t.rows() == k && t.cols() == k, "geqrt: T must be {}x{}", k, k);
    let mut taus = Vec::with_capacity(k);
    for j in 0..k {
        let mut x: Vec<S> = (j + 1..m).map(|i| a.get(i, j)).collect();
        let (beta, tau) = reflector(a.get(j, j), &mut x);
        for (i, v) in (j + 1..m).zip(&x) {
            a.set(i, j, *v);
        }
        a.set(j, j, beta);
        taus.push(tau);
        let ctau = tau.conj();
        for c in j + 1..n {
            let mut w = a.get(j, c);
            for i in j + 1..m {
                w += a.get(i, j).conj() * a.get(i, c);
            }
            w *= ctau;
            a.set(j, c, a.get(j, c) - w);
            for i in j + 1..m {
                let v = a.get(i, j);
                a.set(i, c, a.get(i, c) - v * w);
            }
        }
    }
    let v = a.rb();
    form_t(&taus, t, |i, j| {
        let mut s = v.get(j, i).conj();
        for r in j + 1..m {
            s += v.get(r, i).conj() * v.get(r, j);
        }
        s
    });
}

/// Apply `Q` (`NoTrans`) or `Qᴴ` (`ConjTrans`) from a `geqrt` panel to `c`
/// from the left.
pub fn larfb<S: Field>(v: MatRef<'_, S>, t: MatRef<'_, S>, trans: Trans, mut c: MatMut<'_, S>) {
    assert!(trans != Trans::Trans, "larfb: plain transpose of Q is not supported");
    let (m, k) = (v.rows(), t.rows());
    assert!(c.rows() == m && k <= m && k <= v.cols(), "larfb: dimension mismatch");
    let n = c.cols();
    let vv = |r: usize, i: usize| -> S {
        if r < i {
            S::zero()
        } else if r == i {
            S::one()
        } else {
            v.get(r, i)
        }
    };
    let mut w = vec![S::zero(); k * n];
    for col in 0..n {
        for i in 0..k {
            let mut s = S::zero();
            for r in i..m {
                s += vv(r, i).conj() * c.get(r, col);
            }
            w[col * k + i] = s;
        }
    }
    apply_t(t, trans, &mut w, k, n);
    for col in 0..n {
        for r in 0..m {
            let mut s = S::zero();
            for i in 0..k.min(r + 1) {
                s += vv(r, i) * w[col * k + i];
            }
            c.set(r, col, c.get(r, col) - s);
        }
    }
}

/// `W = T W` or `W = Tᴴ W` for upper triangular `T` (k x k), `W` k x n.
fn apply_t<S: Field>(t: MatRef<'_, S>, trans: Trans, w: &mut [S], k: usize, n: usize) {
    for col in 0..n {
        let w = &mut w[col * k..(col + 1) * k];
        if trans == Trans::ConjTrans {
            for i in (0..k).rev() {
                let mut s = S::zero();
                for p in 0..=i {
                    s += t.get(p, i).conj() * w[p];
                }
                w[i] = s;
            }
        } else {
            for i in 0..k {
                let mut s = S::zero();
                for p in i..k {
                    s += t.get(i, p) * w[p];
                }
                w[i] = s;
            }
        }
    }
}

/// LU of `[U; A]` where `U` (nb x nb) is upper triangular, pivoting each
/// column between row `c` of `U` and the rows of `A`. Multipliers overwrite
/// `A` at the position they were applied to; `piv[c]` is `c` when no swap
/// happened and `nb + r` when row `c` of `U` was exchanged with row `r` of
/// `A` (columns `c..nb` only).
pub fn tstrf<S: Field>(mut u: MatMut<'_, S>, mut a: MatMut<'_, S>) -> Result<Vec<usize>> {
    let nb = u.rows();
    assert!(u.cols() == nb && a.cols() == nb, "tstrf: dimension mismatch");
    let m = a.rows();
    let mut piv = Vec::with_capacity(nb);
    for c in 0..nb {
        let mut best = u.get(c, c).norm();
        let mut swap = None;
        for r in 0..m {
            let v = a.get(r, c).norm();
            if v > best {
                best = v;
                swap = Some(r);
            }
        }
        match swap {
            Some(r) => {
                for j in c..nb {
                    let t = u.get(c, j);
                    u.set(c, j, a.get(r, j));
                    a.set(r, j, t);
                }
                piv.push(nb + r);
            }
            None => piv.push(c),
        }
        let p = u.get(c, c);
        if p == S::zero() {
            return Err(Error::Breakdown {
                method: "lu_incpiv",
                index: c,
            });
        }
        for r in 0..m {
            let l = a.get(r, c) / p;
            a.set(r, c, l);
            for j in c + 1..nb {
                a.set(r, j, a.get(r, j) - l * u.get(c, j));
            }
        }
    }
    Ok(piv)
}

/// Replay a `tstrf` elimination on the stacked pair `[C1; C2]`.
pub fn ssssm<S: Scalar>(mut c1: MatMut<'_, S>, mut c2: MatMut<'_, S>, l: MatRef<'_, S>, piv: &[usize]) {
    let nb = l.cols();
    assert!(
        c1.rows() == nb && c2.rows() == l.rows() && c1.cols() == c2.cols(),
        "ssssm: dimension mismatch"
    );
    let n = c1.cols();
    for c in 0..nb {
        if piv[c] != c {
            let r = piv[c] - nb;
            for j in 0..n {
                let t = c1.get(c, j);
                c1.set(c, j, c2.get(r, j));
                c2.set(r, j, t);
            }
        }
        for r in 0..c2.rows() {
            let lrc = l.get(r, c);
            if lrc == S::zero() {
                continue;
            }
            for j in 0..n {
                c2.set(r, j, c2.get(r, j) - lrc * c1.get(c, j));
            }
        }
    }
}

/// QR of `[R; A]` with `R` (nb x nb) upper triangular and `A` (m x nb) full.
/// The reflectors are `[e_j; v_j]` with `v_j` stored in `A`; `t` receives
/// the block reflector factor.
pub fn tsqrt<S: Field>(mut r: MatMut<'_, S>, mut a: MatMut<'_, S>, t: MatMut<'_, S>) {
    let nb = r.rows();
    assert!(r.cols() == nb && a.cols() == nb, "tsqrt: dimension mismatch");
    assert!(t.rows() == nb && t.cols() == nb, "tsqrt: T must be {}x{}", nb, nb);
    let m = a.rows();
    let mut taus = Vec::with_capacity(nb);
    for j in 0..nb {
        let mut x: Vec<S> = (0..m).map(|i| a.get(i, j)).collect();
        let (beta, tau) = reflector(r.get(j, j), &mut x);
        for (i, v) in x.iter().enumerate() {
            a.set(i, j, *v);
        }
        r.set(j, j, beta);
        taus.push(tau);
        let ctau = tau.conj();
        for c in j + 1..nb {
            let mut w = r.get(j, c);
            for i in 0..m {
                w += a.get(i, j).conj() * a.get(i, c);
            }
            w *= ctau;
            r.set(j, c, r.get(j, c) - w);
            for i in 0..m {
                let v = a.get(i, j);
                a.set(i, c, a.get(i, c) - v * w);
            }
        }
    }
    let v = a.rb();
    form_t(&taus, t, |i, j| {
        let mut s = S::zero();
        for row in 0..m {
            s += v.get(row, i).conj() * v.get(row, j);
        }
        s
    });
}

/// Apply the `tsqrt` reflectors (`Q` or `Qᴴ`) to the stacked pair `[C1; C2]`.
pub fn tsmqr<S: Field>(
    mut c1: MatMut<'_, S>,
    mut c2: MatMut<'_, S>,
    v: MatRef<'_, S>,
    t: MatRef<'_, S>,
    trans: Trans,
) {
    assert!(trans != Trans::Trans, "tsmqr: plain transpose of Q is not supported");
    let nb = t.rows();
    assert!(
        c1.rows() == nb && v.cols() == nb && c2.rows() == v.rows() && c1.cols() == c2.cols(),
        "tsmqr: dimension mismatch"
    );
    let (m, n) = (v.rows(), c1.cols());
    let mut w = vec![S::zero(); nb * n];
    for col in 0..n {
        for i in 0..nb {
            let mut s = c1.get(i, col);
            for r in 0..m {
                s += v.get(r, i).conj() * c2.get(r, col);
            }
            w[col * nb + i] = s;
        }
    }
    apply_t(t, trans, &mut w, nb, n);
    for col in 0..n {
        for i in 0..nb {
            c1.set(i, col, c1.get(i, col) - w[col * nb + i]);
        }
        for r in 0..m {
            let mut s = S::zero();
            for i in 0..nb {
                s += v.get(r, i) * w[col * nb + i];
            }
            c2.set(r, col, c2.get(r, col) - s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::blas;
    use crate::kernels::{Diag, Side, Uplo};
    use approx::assert_abs_diff_eq;
    use num_complex::Complex64;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random(n: usize, m: usize, seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n * m).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn spd(n: usize, seed: u64) -> Vec<f64> {
        let r = random(n, n, seed);
        let mut a = vec![0.0; n * n];
        blas::gemm(
            Trans::NoTrans,
            Trans::Trans,
            1.0,
            MatRef::from_slice(&r, n, n),
            MatRef::from_slice(&r, n, n),
            0.0,
            MatMut::from_slice(&mut a, n, n),
        );
        for i in 0..n {
            a[i * n + i] += n as f64;
        }
        a
    }

    #[test]
    fn potrf_reconstructs() {
        let n = 6;
        let a0 = spd(n, 1);
        let mut l = a0.clone();
        potrf(MatMut::from_slice(&mut l, n, n)).unwrap();
        for j in 0..n {
            for i in 0..j {
                l[j * n + i] = 0.0;
            }
        }
        let mut a = vec![0.0; n * n];
        blas::gemm(
            Trans::NoTrans,
            Trans::ConjTrans,
            1.0,
            MatRef::from_slice(&l, n, n),
            MatRef::from_slice(&l, n, n),
            0.0,
            MatMut::from_slice(&mut a, n, n),
        );
        for (x, y) in a.iter().zip(&a0) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-10);
        }
    }

    #[test]
    fn potrf_reports_indefinite_pivot() {
        let mut a = vec![1.0, 2.0, 2.0, 1.0];
        match potrf(MatMut::from_slice(&mut a, 2, 2)) {
            Err(Error::Breakdown { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected {:?}", other.err()),
        }
    }

    #[test]
    fn getrf_solves() {
        let n = 5;
        let a0 = random(n, n, 7);
        let x0: Vec<f64> = (0..n).map(|i| i as f64 + 1.0).collect();
        let mut b = vec![0.0; n];
        blas::gemm(
            Trans::NoTrans,
            Trans::NoTrans,
            1.0,
            MatRef::from_slice(&a0, n, n),
            MatRef::from_slice(&x0, n, 1),
            0.0,
            MatMut::from_slice(&mut b, n, 1),
        );
        let mut lu = a0.clone();
        let ipiv = getrf(MatMut::from_slice(&mut lu, n, n)).unwrap();
        blas::laswp(MatMut::from_slice(&mut b, n, 1), &ipiv, 0, n, true);
        let f = MatRef::from_slice(&lu, n, n);
        blas::trsm(Side::Left, Uplo::Lower, Trans::NoTrans, Diag::Unit, 1.0, f, MatMut::from_slice(&mut b, n, 1));
        blas::trsm(Side::Left, Uplo::Upper, Trans::NoTrans, Diag::NonUnit, 1.0, f, MatMut::from_slice(&mut b, n, 1));
        for (x, y) in b.iter().zip(&x0) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-10);
        }
    }

    #[test]
    fn geqrt_q_is_unitary_and_reconstructs() {
        let (m, n) = (6, 4);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let a0: Vec<Complex64> = (0..m * n)
            .map(|_| Complex64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect();
        let mut qr = a0.clone();
        let mut t = vec![Complex64::new(0.0, 0.0); n * n];
        geqrt(MatMut::from_slice(&mut qr, m, n), MatMut::from_slice(&mut t, n, n));

        // R padded to m x n, then Q R must give A back.
        let mut rr = vec![Complex64::new(0.0, 0.0); m * n];
        for j in 0..n {
            for i in 0..=j {
                rr[j * m + i] = qr[j * m + i];
            }
        }
        larfb(
            MatRef::from_slice(&qr, m, n),
            MatRef::from_slice(&t, n, n),
            Trans::NoTrans,
            MatMut::from_slice(&mut rr, m, n),
        );
        for (x, y) in rr.iter().zip(&a0) {
            assert_abs_diff_eq!(x.re, y.re, epsilon = 1e-12);
            assert_abs_diff_eq!(x.im, y.im, epsilon = 1e-12);
        }

        // Qᴴ A gives R with zeros below the diagonal.
        let mut c = a0.clone();
        larfb(
            MatRef::from_slice(&qr, m, n),
            MatRef::from_slice(&t, n, n),
            Trans::ConjTrans,
            MatMut::from_slice(&mut c, m, n),
        );
        for j in 0..n {
            for i in 0..m {
                let expect = if i <= j { qr[j * m + i] } else { Complex64::new(0.0, 0.0) };
                assert_abs_diff_eq!(c[j * m + i].re, expect.re, epsilon = 1e-12);
                assert_abs_diff_eq!(c[j * m + i].im, expect.im, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn tsqrt_annihilates_lower_tile() {
        let nb = 3;
        let m = 4;
        let mut r = random(nb, nb, 11);
        for j in 0..nb {
            for i in j + 1..nb {
                r[j * nb + i] = 0.0;
            }
        }
        let a = random(m, nb, 12);
        let (r0, a0) = (r.clone(), a.clone());
        let mut a = a;
        let mut t = vec![0.0; nb * nb];
        tsqrt(
            MatMut::from_slice(&mut r, nb, nb),
            MatMut::from_slice(&mut a, m, nb),
            MatMut::from_slice(&mut t, nb, nb),
        );
        let (mut c1, mut c2) = (r0, a0);
        tsmqr(
            MatMut::from_slice(&mut c1, nb, nb),
            MatMut::from_slice(&mut c2, m, nb),
            MatRef::from_slice(&a, m, nb),
            MatRef::from_slice(&t, nb, nb),
            Trans::ConjTrans,
        );
        for v in &c2 {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-12);
        }
        for j in 0..nb {
            for i in 0..=j {
                assert_abs_diff_eq!(c1[j * nb + i], r[j * nb + i], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn tstrf_replay_matches_elimination() {
        let nb = 3;
        let m = 3;
        let mut u = random(nb, nb, 21);
        for j in 0..nb {
            for i in j + 1..nb {
                u[j * nb + i] = 0.0;
            }
        }
        let a = random(m, nb, 22);
        let (u0, a0) = (u.clone(), a.clone());
        let mut a = a;
        let piv = tstrf(MatMut::from_slice(&mut u, nb, nb), MatMut::from_slice(&mut a, m, nb)).unwrap();
        // replaying on the original pair must give [U'; 0]
        let (mut c1, mut c2) = (u0, a0);
        ssssm(
            MatMut::from_slice(&mut c1, nb, nb),
            MatMut::from_slice(&mut c2, m, nb),
            MatRef::from_slice(&a, m, nb),
            &piv,
        );
        for v in &c2 {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-12);
        }
        for j in 0..nb {
            for i in 0..=j {
                assert_abs_diff_eq!(c1[j * nb + i], u[j * nb + i], epsilon = 1e-12);
            }
        }
    }
}
