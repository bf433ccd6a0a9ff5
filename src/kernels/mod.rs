//! Dense kernels.
//!
//! `blas` and `lapack` hold the sequential micro-kernels on flat strided
//! views. The remaining modules are the blocked drivers over
//! [`HierMatrix`](crate::HierMatrix): factor or update the diagonal cell,
//! dispatch one task per trailing cell inside a `rayon::scope`, join, advance.

use std::sync::Mutex;

use crate::accel::{run_on_device, TriKernel};
use crate::config::Context;
use crate::error::{Error, Result};
use crate::hier::Pinned;
use crate::tile::{MatMut, MatRef};
use crate::traits::{Field, Scalar};

pub mod blas;
pub mod lapack;

mod chol;
mod gemm;
mod lu;
mod lu_incpiv;
mod qr;
mod qr_inc;
mod trmm;
mod trsm;

pub use chol::chol;
pub use gemm::gemm;
pub use lu::{apply_pivots, lu_nopiv, lu_piv, PivotDirection};
pub use lu_incpiv::{apply_lu_incpiv, lu_incpiv, IncPivots};
pub use qr::{apply_q, qr};
pub use qr_inc::{apply_q_inc, qr_inc, IncQr};
pub use trmm::trmm;
pub use trsm::trsm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uplo {
    Lower,
    Upper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trans {
    NoTrans,
    Trans,
    ConjTrans,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diag {
    NonUnit,
    Unit,
}

/// Two functionally equivalent orderings of the blocked triangular kernels:
/// `One` updates the diagonal block before the off-diagonal contribution,
/// `Two` applies the off-diagonal contribution first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Variant {
    #[default]
    One,
    Two,
}

impl Trans {
    pub fn is_trans(&self) -> bool {
        !matches!(self, Trans::NoTrans)
    }
}

/// Whether `op(A)` is lower triangular.
pub(crate) fn op_is_lower(uplo: Uplo, trans: Trans) -> bool {
    (uplo == Uplo::Lower) != trans.is_trans()
}

/// First error raised by any task of a fork/join region.
#[derive(Default)]
pub(crate) struct Failures(Mutex<Option<Error>>);

impl Failures {
    pub(crate) fn record(&self, r: Result<()>) {
        if let Err(e) = r {
            let mut slot = match self.0.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.get_or_insert(e);
        }
    }

    pub(crate) fn finish(self) -> Result<()> {
        let slot = match self.0.into_inner() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slot {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Block `(i, j)` of `op(A)`; the transposition itself is applied by the
/// micro-kernel receiving the block.
pub(crate) fn op_cell<S: Scalar>(a: &Pinned<S>, trans: Trans, i: usize, j: usize) -> MatRef<'_, S> {
    if trans.is_trans() {
        a.cell(j, i)
    } else {
        a.cell(i, j)
    }
}

/// One triangular cell update, on the accelerator when the computing model
/// selects it for this worker.
#[allow(clippy::too_many_arguments)]
pub(crate) fn tri_cell<S: Field>(
    ctx: &Context,
    kernel: TriKernel,
    side: Side,
    uplo: Uplo,
    trans: Trans,
    diag: Diag,
    alpha: S,
    a: MatRef<'_, S>,
    b: MatMut<'_, S>,
) -> Result<()> {
    ctx.count_kernel();
    if let Some(acc) = ctx.accelerator() {
        return run_on_device(acc, kernel, side, uplo, trans, diag, alpha, a, b);
    }
    match kernel {
        TriKernel::Trsm => blas::trsm(side, uplo, trans, diag, alpha, a, b),
        TriKernel::Trmm => blas::trmm(side, uplo, trans, diag, alpha, a, b),
    }
    Ok(())
}

/// `B = alpha B`, one task per cell.
pub(crate) fn scale<S: Scalar>(alpha: S, b: &Pinned<S>) {
    if alpha == S::one() {
        return;
    }
    rayon::scope(|s| {
        for j in 0..b.block_cols() {
            for i in 0..b.block_rows() {
                s.spawn(move |_| {
                    // SAFETY: each task owns one cell.
                    let mut c = unsafe { b.cell_mut(i, j) };
                    for cj in 0..c.cols() {
                        for ci in 0..c.rows() {
                            let v = c.get(ci, cj);
                            c.set(ci, cj, alpha * v);
                        }
                    }
                });
            }
        }
    });
}

/// `C -= op(A) op(B)` on one cell pair.
pub(crate) fn update_cell<S: Scalar>(
    ctx: &Context,
    transa: Trans,
    a: MatRef<'_, S>,
    transb: Trans,
    b: MatRef<'_, S>,
    c: MatMut<'_, S>,
) {
    ctx.count_kernel();
    blas::gemm(transa, transb, -S::one(), a, b, S::one(), c);
}

/// `C += op(A) op(B)` on one cell pair.
pub(crate) fn accumulate_cell<S: Scalar>(
    ctx: &Context,
    transa: Trans,
    a: MatRef<'_, S>,
    transb: Trans,
    b: MatRef<'_, S>,
    c: MatMut<'_, S>,
) {
    ctx.count_kernel();
    blas::gemm(transa, transb, S::one(), a, b, S::one(), c);
}

/// Block order of a sweep over `n` blocks.
pub(crate) fn order(n: usize, forward: bool) -> Vec<usize> {
    if forward {
        (0..n).collect()
    } else {
        (0..n).rev().collect()
    }
}

/// Blocks visited before block `k` in the sweep direction.
pub(crate) fn before(k: usize, n: usize, forward: bool) -> Vec<usize> {
    if forward {
        (0..k).collect()
    } else {
        (k + 1..n).collect()
    }
}

/// Blocks visited after block `k`.
pub(crate) fn after(k: usize, n: usize, forward: bool) -> Vec<usize> {
    if forward {
        (k + 1..n).collect()
    } else {
        (0..k).collect()
    }
}
