use anyhow::Result;

use num_traits::NumAssignOps;
use spsolve::Solver;

use crate::config::{Config, Context};
use crate::error::Error;
use crate::mesh::Mesh;
use crate::solver::Solver as Multifrontal;
use crate::sparse::{CompressedMatrix, GilbertPeierls, Layout, Triplets};
use crate::traits::{Field, Int};

/// Gilbert-Peierls LU with an AMD column ordering.
#[derive(Default)]
pub struct AmdLu {
    pub control: amd::Control,
}

impl<I, S> Solver<I, S> for AmdLu
where
    I: Int + NumAssignOps,
    S: Field,
{
    fn solve(
        &self,
        n: usize,
        a_i: &[I],
        a_p: &[I],
        a_x: &[S],
        b: &mut [S],
        trans: bool,
    ) -> Result<()> {
        let (p, _p_inv, _info) = amd::order::<I>(I::from_usize(n), a_p, a_i, &self.control)
            .map_err(|st| Error::Backend {
                code: -1,
                message: format!("amd ordering: {:?}", st),
            })?;

        let a = CompressedMatrix::from_parts(n, n, Layout::ColumnMajor, a_p.to_vec(), a_i.to_vec(), a_x.to_vec())?;
        let gp = GilbertPeierls {
            col_perm: Some(p.iter().map(Int::to_index).collect()),
            no_pivot: false,
        };
        gp.factor(&a)?.solve(b, trans);
        Ok(())
    }
}

/// The multifrontal solver over the star decomposition of the matrix.
#[derive(Debug, Clone, Default)]
pub struct MultifrontalSolver {
    /// Pool size; rayon's default when `None`.
    pub threads: Option<usize>,
    pub config: Config,
}

impl<I, S> Solver<I, S> for MultifrontalSolver
where
    I: Int + NumAssignOps,
    S: Field,
{
    fn solve(
        &self,
        n: usize,
        a_i: &[I],
        a_p: &[I],
        a_x: &[S],
        b: &mut [S],
        trans: bool,
    ) -> Result<()> {
        let mut a = CompressedMatrix::from_parts(n, n, Layout::ColumnMajor, a_p.to_vec(), a_i.to_vec(), a_x.to_vec())?;
        if trans {
            let mut t = Triplets::new(n, n);
            for (i, j, v) in a.entries() {
                t.push(j, i, v);
            }
            a = t.compress(Layout::ColumnMajor, Default::default());
        }
        let mut builder = Context::builder().config(self.config.clone());
        if let Some(threads) = self.threads {
            builder = builder.threads(threads);
        }
        let mut solver = Multifrontal::new(builder.build()?, Mesh::from_csc(&a, b, 1)?);
        solver.factorize()?;
        solver.solve()?;
        b.copy_from_slice(&solver.solution()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    // |2 1 0 0|
    // |0 3 1 0|
    // |1 0 4 1|
    // |0 0 1 5|
    const A_P: [usize; 5] = [0, 2, 4, 7, 9];
    const A_I: [usize; 9] = [0, 2, 0, 1, 1, 2, 3, 2, 3];
    const A_X: [f64; 9] = [2.0, 1.0, 1.0, 3.0, 1.0, 4.0, 1.0, 1.0, 5.0];

    fn product(x: &[f64], trans: bool) -> Vec<f64> {
        let mut y = vec![0.0; 4];
        for j in 0..4 {
            for p in A_P[j]..A_P[j + 1] {
                if trans {
                    y[j] += A_X[p] * x[A_I[p]];
                } else {
                    y[A_I[p]] += A_X[p] * x[j];
                }
            }
        }
        y
    }

    fn check<T: Solver<usize, f64>>(solver: &T) {
        let x0 = [1.0, -1.0, 2.0, 0.5];
        for trans in [false, true] {
            let mut b = product(&x0, trans);
            solver.solve(4, &A_I, &A_P, &A_X, &mut b, trans).unwrap();
            for (g, e) in b.iter().zip(&x0) {
                assert_abs_diff_eq!(g, e, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn amd_lu_solves() {
        check(&AmdLu::default());
    }

    #[test]
    fn multifrontal_solves() {
        check(&MultifrontalSolver {
            threads: Some(2),
            ..Default::default()
        });
    }
}
