//! Blocked `C = alpha op(A) op(B) + beta C`, one task per cell of `C`.

use super::{blas, Trans};
use crate::config::Context;
use crate::error::Result;
use crate::hier::HierMatrix;
use crate::traits::Scalar;

/// The inner block partitions of `op(A)` and `op(B)` must agree.
#[allow(clippy::too_many_arguments)]
pub fn gemm<S: Scalar>(
    ctx: &Context,
    transa: Trans,
    transb: Trans,
    alpha: S,
    a: &HierMatrix<S>,
    b: &HierMatrix<S>,
    beta: S,
    c: &HierMatrix<S>,
) -> Result<()> {
    let (ka, kb) = match (transa.is_trans(), transb.is_trans()) {
        (false, false) => (a.block_cols(), b.block_rows()),
        (false, true) => (a.block_cols(), b.block_cols()),
        (true, false) => (a.block_rows(), b.block_rows()),
        (true, true) => (a.block_rows(), b.block_cols()),
    };
    assert_eq!(ka, kb, "gemm: inner block partitions disagree");
    if c.is_empty() {
        return Ok(());
    }
    let (pa, pb, pc) = (a.pin()?, b.pin()?, c.pin()?);
    let (pa, pb, pc) = (&pa, &pb, &pc);
    rayon::scope(|s| {
        for j in 0..pc.block_cols() {
            for i in 0..pc.block_rows() {
                s.spawn(move |_| {
                    // SAFETY: each task owns one cell of C; A and B are read only.
                    let mut cij = unsafe { pc.cell_mut(i, j) };
                    if ka == 0 {
                        let (r, cc) = (cij.rows(), cij.cols());
                        for q in 0..cc {
                            for p in 0..r {
                                let v = if beta == S::zero() { S::zero() } else { beta * cij.get(p, q) };
                                cij.set(p, q, v);
                            }
                        }
                        return;
                    }
                    for p in 0..ka {
                        let aip = super::op_cell(pa, transa, i, p);
                        let bpj = super::op_cell(pb, transb, p, j);
                        let b0 = if p == 0 { beta } else { S::one() };
                        ctx.count_kernel();
                        blas::gemm(transa, transb, alpha, aip, bpj, b0, cij.rb_mut());
                    }
                });
            }
        }
    });
    Ok(())
}
