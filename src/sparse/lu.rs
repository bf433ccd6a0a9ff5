use std::iter::zip;

use tracing::trace;

use super::dfs::Dfs;
use crate::error::{Error, Result};
use crate::traits::{Field, Int};

// Simplified compressed column storage
//
// > We shall represent a column vector as a sequence of records, each containing a
// value and a row index. The row indices need not be in increasing order. We shall
// represent a matrix as an array of column vectors indexed from 0 to n.
pub type Record<S> = (usize, S);
pub type Col<S> = Vec<Record<S>>;
pub type Matrix<S> = Vec<Col<S>>;

/// `P A Q = L U` with unit lower `L`.
#[derive(Debug, Clone)]
pub struct LuFactors<S> {
    l: Matrix<S>,
    u: Matrix<S>,
    /// `row_perm[r] = k`: row `r` of `A` is pivot row `k`.
    row_perm: Vec<usize>,
    col_perm: Option<Vec<usize>>,
}

impl<S: Field> LuFactors<S> {
    pub fn n(&self) -> usize {
        self.row_perm.len()
    }

    pub fn l(&self) -> &Matrix<S> {
        &self.l
    }

    pub fn u(&self) -> &Matrix<S> {
        &self.u
    }

    pub fn nnz(&self) -> usize {
        self.l.iter().chain(&self.u).map(Vec::len).sum()
    }

    /// Overwrite `b` with `A⁻¹ b`, or `A⁻ᵀ b` when `trans`.
    pub fn solve(&self, b: &mut [S], trans: bool) {
        let n = self.n();
        assert_eq!(b.len(), n, "lu solve: rhs length");
        let q = |k: usize| self.col_perm.as_ref().map_or(k, |p| p[k]);
        let mut x = vec![S::zero(); n];
        if !trans {
            for (r, &k) in self.row_perm.iter().enumerate() {
                x[k] = b[r];
            }
            lsolve(&self.l, &mut x);
            usolve(&self.u, &mut x);
            for (k, &v) in x.iter().enumerate() {
                b[q(k)] = v;
            }
        } else {
            for (k, v) in x.iter_mut().enumerate() {
                *v = b[q(k)];
            }
            utsolve(&self.u, &mut x);
            ltsolve(&self.l, &mut x);
            for (r, &k) in self.row_perm.iter().enumerate() {
                b[r] = x[k];
            }
        }
    }
}

// 1. for j:= to n do
// 2.   {Compute column j of U and L.}
// 3.   Solve Ljuj = aj for uj;
// 4.   b'j := a'j - L'juj;
// 5.   Pivot: Swap bjj with the largest-magnitude element of b'j;
// 6.   ujj := bjj;
// 7.   l'j := b'j / ujj;
// 8. od

/// Left-looking LU (Gilbert-Peierls) of the `n x n` matrix in compressed
/// columns, processing columns in `col_perm` order.
pub fn lu<I: Int, S: Field>(
    n: usize,
    a_rowidx: &[I],
    a_colptr: &[I],
    a_values: &[S],
    col_perm: Option<&[usize]>,
    pivot: bool,
) -> Result<LuFactors<S>> {
    assert_eq!(a_colptr.len(), n + 1, "lu: column pointer length");
    let mut dfs = Dfs::new(n);

    // row_perm[r] = Some(k): row r of A is row k < j of PA. None: not yet
    // used as a pivot, still below the diagonal.
    let mut row_perm: Vec<Option<usize>> = vec![None; n];

    let mut l_mat: Matrix<S> = vec![vec![]; n];
    let mut u_mat: Matrix<S> = vec![vec![]; n];

    // > We compute uj as a dense n-vector, so that in step 3.3 we can subtract a multiple
    // of column k of Lj from it in constant time per nonzero in that column.
    let mut x = vec![S::zero(); n];
    let rows: Vec<usize> = a_rowidx.iter().map(Int::to_index).collect();

    for k in 0..n {
        let kp = col_perm.map_or(k, |p| p[k]);
        let range = a_colptr[kp].to_index()..a_colptr[kp + 1].to_index();
        let (b_rowidx, b_values) = (&rows[range.clone()], &a_values[range]);

        let found = dfs.reach(&l_mat, b_rowidx, &row_perm);
        lucomp(&l_mat, b_rowidx, b_values, &mut x, &row_perm, found);

        let d = x[kp];
        // Partial pivoting: the largest magnitude below the diagonal.
        let best = found
            .iter()
            .filter(|&&i| row_perm[i].is_none())
            .map(|&i| (i, x[i].norm()))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        let (pivrow, maxabs) = match best {
            Some(b) => b,
            None => return Err(Error::Breakdown { method: "sparse lu", index: k }),
        };
        trace!(k, kp, pivrow, maxabs, "pivot");

        let pivt = if !pivot || (row_perm[kp].is_none() && d.norm() >= maxabs) {
            (kp, d)
        } else {
            (pivrow, x[pivrow])
        };
        if pivt.1.norm() == 0.0 {
            return Err(Error::Breakdown { method: "sparse lu", index: k });
        }

        u_mat[k] = found
            .iter()
            .filter_map(|&i| row_perm[i].map(|r| (r, x[i])))
            .collect();
        u_mat[k].push((k, pivt.1));
        u_mat[k].shrink_to_fit();

        row_perm[pivt.0] = Some(k);

        l_mat[k] = found
            .iter()
            .filter(|&&i| row_perm[i].is_none())
            .map(|&i| (i, x[i] / pivt.1))
            .collect();
        l_mat[k].shrink_to_fit();

        // > Since we know the nonzero structure of uj before we start,
        // we need only initialize and manipulate the positions in this
        // dense vector that correspond to nonzero positions.
        found.iter().for_each(|&i| x[i] = S::zero());
    }

    let row_perm = row_perm
        .into_iter()
        .enumerate()
        .map(|(r, p)| p.ok_or(Error::Breakdown { method: "sparse lu", index: r }))
        .collect::<Result<Vec<_>>>()?;

    // Renumber so the columns hold L, not PᵀL.
    for col in &mut l_mat {
        for e in col {
            e.0 = row_perm[e.0];
        }
    }

    Ok(LuFactors {
        l: l_mat,
        u: u_mat,
        row_perm,
        col_perm: col_perm.map(<[usize]>::to_vec),
    })
}

fn lucomp<S: Field>(
    l_mat: &Matrix<S>,
    b_rowidx: &[usize],
    b_values: &[S],
    x: &mut [S],
    rperm: &[Option<usize>],
    found: &[usize],
) {
    for (&bi, &bx) in zip(b_rowidx, b_values) {
        x[bi] += bx; // scatter, duplicates summed
    }
    for &j in found {
        let col = match rperm[j] {
            Some(jp) => jp,
            None => continue,
        };
        let e1 = x[j];
        for &(i, l) in &l_mat[col] {
            x[i] -= l * e1;
        }
    }
}

pub fn lsolve<S: Field>(l_mat: &Matrix<S>, b: &mut [S]) {
    for e0 in 0..b.len() {
        for &(i, l) in &l_mat[e0] {
            let v = b[e0];
            b[i] -= l * v;
        }
    }
}

pub fn ltsolve<S: Field>(l_mat: &Matrix<S>, b: &mut [S]) {
    for e0 in (0..b.len()).rev() {
        for &(i, l) in l_mat[e0].iter().rev() {
            let v = b[i];
            b[e0] -= l * v;
        }
    }
}

/// The diagonal is the last record of each column.
pub fn usolve<S: Field>(u_mat: &Matrix<S>, b: &mut [S]) {
    for e0 in (0..b.len()).rev() {
        for &(i, u) in u_mat[e0].iter().rev() {
            if i == e0 {
                b[e0] /= u;
            } else {
                let v = b[e0];
                b[i] -= u * v;
            }
        }
    }
}

pub fn utsolve<S: Field>(u_mat: &Matrix<S>, b: &mut [S]) {
    for e0 in 0..b.len() {
        for &(i, u) in &u_mat[e0] {
            if i == e0 {
                b[e0] /= u;
            } else {
                let v = b[i];
                b[e0] -= u * v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Columns of the 6x6 band
    ///   |5 4 3     1|
    ///   |2 5 4 3    |
    ///   |  2 5 4 3  |
    ///   |    2 5 4 3|
    ///   |      2 5 4|
    ///   |1       2 5|
    fn band(n: usize) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
        let (mut rowidx, mut colptr, mut values) = (vec![], vec![0], vec![]);
        for j in 0..n {
            let mut col: Vec<(usize, f64)> = vec![(j, 5.0)];
            if j >= 1 {
                col.push((j - 1, 4.0));
            }
            if j >= 2 {
                col.push((j - 2, 3.0));
            }
            if j + 1 < n {
                col.push((j + 1, 2.0));
            }
            if j == 0 {
                col.push((n - 1, 1.0));
            }
            if j == n - 1 {
                col.push((0, 1.0));
            }
            for (i, v) in col {
                rowidx.push(i);
                values.push(v);
            }
            colptr.push(rowidx.len());
        }
        (rowidx, colptr, values)
    }

    fn matvec(n: usize, rowidx: &[usize], colptr: &[usize], values: &[f64], x: &[f64], trans: bool) -> Vec<f64> {
        let mut y = vec![0.0; n];
        for j in 0..n {
            for p in colptr[j]..colptr[j + 1] {
                if trans {
                    y[j] += values[p] * x[rowidx[p]];
                } else {
                    y[rowidx[p]] += values[p] * x[j];
                }
            }
        }
        y
    }

    #[test]
    fn band_solves_both_ways() {
        let n = 6;
        let (ri, cp, v) = band(n);
        let x0: Vec<f64> = (1..=n).map(|i| i as f64).collect();
        let perm: Vec<usize> = (0..n).rev().collect();
        for col_perm in [None, Some(perm.as_slice())] {
            let f = lu(n, &ri, &cp, &v, col_perm, true).unwrap();
            for trans in [false, true] {
                let mut b = matvec(n, &ri, &cp, &v, &x0, trans);
                f.solve(&mut b, trans);
                for (g, e) in b.iter().zip(&x0) {
                    assert_abs_diff_eq!(g, e, epsilon = 1e-10);
                }
            }
        }
    }

    #[test]
    fn pivoting_handles_a_zero_diagonal() {
        // |0 1|
        // |1 0|
        let f = lu(2, &[1usize, 0], &[0usize, 1, 2], &[1.0, 1.0], None, true).unwrap();
        let mut b = vec![3.0, 4.0];
        f.solve(&mut b, false);
        assert_eq!(b, vec![4.0, 3.0]);
        assert!(matches!(
            lu(2, &[1usize, 0], &[0usize, 1, 2], &[1.0, 1.0], None, false),
            Err(Error::Breakdown { index: 0, .. })
        ));
    }

    #[test]
    fn singular_matrix_is_reported() {
        // Second column empty.
        let err = lu(2, &[0usize], &[0usize, 1, 1], &[1.0], None, true).unwrap_err();
        assert!(matches!(err, Error::Breakdown { index: 1, .. }));
    }
}
