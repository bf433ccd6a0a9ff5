//! Sequential level-3 micro-kernels on flat column-major views.

use super::{op_is_lower, Diag, Side, Trans, Uplo};
use crate::tile::{MatMut, MatRef};
use crate::traits::{Field, Scalar};

#[inline]
fn op<S: Scalar>(a: &MatRef<'_, S>, trans: Trans, i: usize, j: usize) -> S {
    match trans {
        Trans::NoTrans => a.get(i, j),
        Trans::Trans => a.get(j, i),
        Trans::ConjTrans => a.get(j, i).conj(),
    }
}

fn op_dims<S: Scalar>(a: &MatRef<'_, S>, trans: Trans) -> (usize, usize) {
    if trans.is_trans() {
        (a.cols(), a.rows())
    } else {
        (a.rows(), a.cols())
    }
}

/// `C = alpha op(A) op(B) + beta C`
pub fn gemm<S: Scalar>(
    transa: Trans,
    transb: Trans,
    alpha: S,
    a: MatRef<'_, S>,
    b: MatRef<'_, S>,
    beta: S,
    mut c: MatMut<'_, S>,
) {
    let (m, ka) = op_dims(&a, transa);
    let (kb, n) = op_dims(&b, transb);
    assert!(
        ka == kb && m == c.rows() && n == c.cols(),
        "gemm: {}x{} * {}x{} into {}x{}",
        m,
        ka,
        kb,
        n,
        c.rows(),
        c.cols()
    );
    for j in 0..n {
        for i in 0..m {
            let mut s = S::zero();
            for p in 0..ka {
                s += op(&a, transa, i, p) * op(&b, transb, p, j);
            }
            let v = if beta == S::zero() {
                alpha * s
            } else {
                alpha * s + beta * c.get(i, j)
            };
            c.set(i, j, v);
        }
    }
}

/// Solve `op(A) X = alpha B` (left) or `X op(A) = alpha B` (right) in place.
pub fn trsm<S: Field>(
    side: Side,
    uplo: Uplo,
    trans: Trans,
    diag: Diag,
    alpha: S,
    a: MatRef<'_, S>,
    mut b: MatMut<'_, S>,
) {
    let n = a.rows();
    assert_eq!(a.cols(), n, "trsm: triangular factor must be square");
    let lower = op_is_lower(uplo, trans);
    let unit = diag == Diag::Unit;
    match side {
        Side::Left => {
            assert_eq!(b.rows(), n, "trsm: left operand rows");
            for j in 0..b.cols() {
                let order: Box<dyn Iterator<Item = usize>> = if lower {
                    Box::new(0..n)
                } else {
                    Box::new((0..n).rev())
                };
                for i in order {
                    let mut s = alpha * b.get(i, j);
                    let range = if lower { 0..i } else { i + 1..n };
                    for p in range {
                        s -= op(&a, trans, i, p) * b.get(p, j);
                    }
                    if !unit {
                        s /= op(&a, trans, i, i);
                    }
                    b.set(i, j, s);
                }
            }
        }
        Side::Right => {
            assert_eq!(b.cols(), n, "trsm: right operand cols");
            for r in 0..b.rows() {
                let order: Box<dyn Iterator<Item = usize>> = if lower {
                    Box::new((0..n).rev())
                } else {
                    Box::new(0..n)
                };
                for j in order {
                    let mut s = alpha * b.get(r, j);
                    let range = if lower { j + 1..n } else { 0..j };
                    for p in range {
                        s -= b.get(r, p) * op(&a, trans, p, j);
                    }
                    if !unit {
                        s /= op(&a, trans, j, j);
                    }
                    b.set(r, j, s);
                }
            }
        }
    }
}

/// `B = alpha op(A) B` (left) or `B = alpha B op(A)` (right) in place.
pub fn trmm<S: Scalar>(
    side: Side,
    uplo: Uplo,
    trans: Trans,
    diag: Diag,
    alpha: S,
    a: MatRef<'_, S>,
    mut b: MatMut<'_, S>,
) {
    let n = a.rows();
    assert_eq!(a.cols(), n, "trmm: triangular factor must be square");
    let lower = op_is_lower(uplo, trans);
    let unit = diag == Diag::Unit;
    let d = |i: usize| if unit { S::one() } else { op(&a, trans, i, i) };
    match side {
        Side::Left => {
            assert_eq!(b.rows(), n, "trmm: left operand rows");
            for j in 0..b.cols() {
                // Rows still needed by later rows are overwritten last.
                let order: Box<dyn Iterator<Item = usize>> = if lower {
                    Box::new((0..n).rev())
                } else {
                    Box::new(0..n)
                };
                for i in order {
                    let mut s = d(i) * b.get(i, j);
                    let range = if lower { 0..i } else { i + 1..n };
                    for p in range {
                        s += op(&a, trans, i, p) * b.get(p, j);
                    }
                    b.set(i, j, alpha * s);
                }
            }
        }
        Side::Right => {
            assert_eq!(b.cols(), n, "trmm: right operand cols");
            for r in 0..b.rows() {
                let order: Box<dyn Iterator<Item = usize>> = if lower {
                    Box::new(0..n)
                } else {
                    Box::new((0..n).rev())
                };
                for j in order {
                    let mut s = b.get(r, j) * d(j);
                    let range = if lower { j + 1..n } else { 0..j };
                    for p in range {
                        s += b.get(r, p) * op(&a, trans, p, j);
                    }
                    b.set(r, j, alpha * s);
                }
            }
        }
    }
}

/// Row interchanges `ipiv[k1..k2]` (row `i` swapped with row `ipiv[i]`),
/// applied in order when `forward`, in reverse otherwise.
pub fn laswp<S: Scalar>(mut a: MatMut<'_, S>, ipiv: &[usize], k1: usize, k2: usize, forward: bool) {
    if forward {
        for i in k1..k2 {
            a.swap_rows(i, ipiv[i]);
        }
    } else {
        for i in (k1..k2).rev() {
            a.swap_rows(i, ipiv[i]);
        }
    }
}
