//! Assembled sparse form of a problem and the sparse backends that consume
//! it.

mod dfs;
mod lu;

pub use lu::{lu, lsolve, ltsolve, usolve, utsolve, Col, LuFactors, Matrix, Record};

use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};
use crate::traits::{Field, Int, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// Compressed columns (CSC).
    #[default]
    ColumnMajor,
    /// Compressed rows (CSR).
    RowMajor,
}

/// Index base and symmetry handling of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportOptions {
    pub one_based: bool,
    /// Keep only entries with `row <= col`.
    pub upper_only: bool,
}

/// Coordinate form, zero-based. Duplicates are allowed and sum.
#[derive(Debug, Clone, PartialEq)]
pub struct Triplets<S> {
    rows: usize,
    cols: usize,
    entries: Vec<(usize, usize, S)>,
}

impl<S: Scalar> Triplets<S> {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            entries: Vec::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn push(&mut self, row: usize, col: usize, value: S) {
        assert!(
            row < self.rows && col < self.cols,
            "triplet ({}, {}) outside {}x{}",
            row,
            col,
            self.rows,
            self.cols
        );
        self.entries.push((row, col, value));
    }

    pub fn entries(&self) -> &[(usize, usize, S)] {
        &self.entries
    }

    /// Duplicates summed and explicit zeros dropped, sorted by `(col, row)`.
    fn summed(&self, upper_only: bool) -> BTreeMap<(usize, usize), S> {
        let mut m = BTreeMap::new();
        for &(i, j, v) in &self.entries {
            if upper_only && i > j {
                continue;
            }
            *m.entry((j, i)).or_insert_with(S::zero) += v;
        }
        m.retain(|_, v| *v != S::zero());
        m
    }

    /// Coordinate arrays `(rows, cols, values)`.
    pub fn export<I: Int>(&self, opts: ExportOptions) -> (Vec<I>, Vec<I>, Vec<S>) {
        let base = usize::from(opts.one_based);
        let summed = self.summed(opts.upper_only);
        let mut out = (
            Vec::with_capacity(summed.len()),
            Vec::with_capacity(summed.len()),
            Vec::with_capacity(summed.len()),
        );
        for ((j, i), v) in summed {
            out.0.push(I::from_usize(i + base));
            out.1.push(I::from_usize(j + base));
            out.2.push(v);
        }
        out
    }

    pub fn compress<I: Int>(&self, layout: Layout, opts: ExportOptions) -> CompressedMatrix<I, S> {
        let base = usize::from(opts.one_based);
        let summed = self.summed(opts.upper_only);
        let major = match layout {
            Layout::ColumnMajor => self.cols,
            Layout::RowMajor => self.rows,
        };
        let mut lines: Vec<Vec<(usize, S)>> = vec![vec![]; major];
        for ((j, i), v) in summed {
            match layout {
                Layout::ColumnMajor => lines[j].push((i, v)),
                Layout::RowMajor => lines[i].push((j, v)),
            }
        }
        let mut ptr = Vec::with_capacity(major + 1);
        let (mut idx, mut values) = (vec![], vec![]);
        ptr.push(I::from_usize(base));
        for line in lines {
            for (k, v) in line {
                idx.push(I::from_usize(k + base));
                values.push(v);
            }
            ptr.push(I::from_usize(idx.len() + base));
        }
        CompressedMatrix {
            rows: self.rows,
            cols: self.cols,
            layout,
            one_based: opts.one_based,
            upper_only: opts.upper_only,
            ptr,
            idx,
            values,
        }
    }
}

/// CSC or CSR storage with either index base.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedMatrix<I, S> {
    rows: usize,
    cols: usize,
    layout: Layout,
    one_based: bool,
    upper_only: bool,
    ptr: Vec<I>,
    idx: Vec<I>,
    values: Vec<S>,
}

impl<I: Int, S: Scalar> CompressedMatrix<I, S> {
    /// Validate raw zero-based arrays.
    pub fn from_parts(
        rows: usize,
        cols: usize,
        layout: Layout,
        ptr: Vec<I>,
        idx: Vec<I>,
        values: Vec<S>,
    ) -> Result<Self> {
        let (major, minor) = match layout {
            Layout::ColumnMajor => (cols, rows),
            Layout::RowMajor => (rows, cols),
        };
        if ptr.len() != major + 1 || idx.len() != values.len() {
            return Err(Error::ShapeMismatch {
                expected: (major + 1, idx.len()),
                actual: (ptr.len(), values.len()),
            });
        }
        let bad_ptr = ptr.first().map_or(true, |p| p.to_index() != 0)
            || ptr.windows(2).any(|w| w[0] > w[1])
            || ptr[major].to_index() != idx.len();
        if bad_ptr || idx.iter().any(|i| i.to_index() >= minor) {
            return Err(Error::InvalidProblem {
                element: 0,
                message: "malformed compressed matrix".to_string(),
            });
        }
        Ok(Self {
            rows,
            cols,
            layout,
            one_based: false,
            upper_only: false,
            ptr,
            idx,
            values,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn is_one_based(&self) -> bool {
        self.one_based
    }

    pub fn is_upper_only(&self) -> bool {
        self.upper_only
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn ptr(&self) -> &[I] {
        &self.ptr
    }

    pub fn indices(&self) -> &[I] {
        &self.idx
    }

    pub fn values(&self) -> &[S] {
        &self.values
    }

    /// Zero-based `(row, col, value)` in storage order.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, S)> + '_ {
        let base = usize::from(self.one_based);
        self.ptr.windows(2).enumerate().flat_map(move |(major, w)| {
            (w[0].to_index() - base..w[1].to_index() - base).map(move |p| {
                let minor = self.idx[p].to_index() - base;
                match self.layout {
                    Layout::ColumnMajor => (minor, major, self.values[p]),
                    Layout::RowMajor => (major, minor, self.values[p]),
                }
            })
        })
    }

    /// Full zero-based storage in `layout`; an upper-only matrix is
    /// mirrored.
    pub fn normalized(&self, layout: Layout) -> Self {
        let mut t = Triplets::new(self.rows, self.cols);
        for (i, j, v) in self.entries() {
            t.push(i, j, v);
            if self.upper_only && i != j {
                t.push(j, i, v);
            }
        }
        t.compress(layout, ExportOptions::default())
    }
}

/// Black-box solver of an assembled problem.
pub trait SparseBackend<S: Field> {
    /// Overwrite the column-major `n x nrhs` block `b` with `A⁻¹ b`.
    fn solve<I: Int>(&self, a: &CompressedMatrix<I, S>, b: &mut [S], nrhs: usize) -> Result<()>;
}

/// Left-looking sparse LU with partial pivoting.
#[derive(Debug, Clone, Default)]
pub struct GilbertPeierls {
    /// Column elimination order; natural when `None`.
    pub col_perm: Option<Vec<usize>>,
    pub no_pivot: bool,
}

impl GilbertPeierls {
    pub fn factor<I: Int, S: Field>(&self, a: &CompressedMatrix<I, S>) -> Result<LuFactors<S>> {
        if a.rows() != a.cols() {
            return Err(Error::ShapeMismatch {
                expected: (a.cols(), a.cols()),
                actual: (a.rows(), a.cols()),
            });
        }
        let csc = a.normalized(Layout::ColumnMajor);
        let ptr: Vec<usize> = csc.ptr().iter().map(Int::to_index).collect();
        let idx: Vec<usize> = csc.indices().iter().map(Int::to_index).collect();
        let f = lu(a.cols(), &idx, &ptr, csc.values(), self.col_perm.as_deref(), !self.no_pivot)?;
        debug!(n = f.n(), nnz_a = csc.nnz(), nnz_lu = f.nnz(), "sparse lu");
        Ok(f)
    }
}

impl<S: Field> SparseBackend<S> for GilbertPeierls {
    fn solve<I: Int>(&self, a: &CompressedMatrix<I, S>, b: &mut [S], nrhs: usize) -> Result<()> {
        let n = a.cols();
        if b.len() != n * nrhs {
            return Err(Error::ShapeMismatch {
                expected: (n, nrhs),
                actual: (b.len(), nrhs),
            });
        }
        if n == 0 {
            return Ok(());
        }
        let f = self.factor(a)?;
        b.par_chunks_exact_mut(n).for_each(|col| f.solve(col, false));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample() -> Triplets<f64> {
        // |4 1 0|
        // |1 4 2|
        // |0 2 4|
        let mut t = Triplets::new(3, 3);
        for (i, j, v) in [(0, 0, 4.0), (1, 0, 1.0), (0, 1, 1.0), (1, 1, 3.0), (1, 1, 1.0), (2, 1, 2.0), (1, 2, 2.0), (2, 2, 4.0)] {
            t.push(i, j, v);
        }
        t
    }

    #[test]
    fn exports_sum_duplicates_and_honor_options() {
        let t = sample();
        let (r, c, v) = t.export::<i32>(ExportOptions::default());
        assert_eq!(r, vec![0, 1, 0, 1, 2, 1, 2]);
        assert_eq!(c, vec![0, 0, 1, 1, 1, 2, 2]);
        assert_eq!(v[3], 4.0);

        let (r, c, _) = t.export::<i32>(ExportOptions {
            one_based: true,
            upper_only: true,
        });
        assert_eq!(r, vec![1, 1, 2, 2, 3]);
        assert_eq!(c, vec![1, 2, 2, 3, 3]);

        let csr = t.compress::<usize>(Layout::RowMajor, ExportOptions::default());
        assert_eq!(csr.ptr(), &[0, 2, 5, 7]);
        assert_eq!(csr.indices(), &[0, 1, 0, 1, 2, 1, 2]);

        let upper = t.compress::<usize>(
            Layout::ColumnMajor,
            ExportOptions {
                one_based: true,
                upper_only: true,
            },
        );
        assert_eq!(upper.ptr(), &[1, 2, 4, 6]);
        let full = upper.normalized(Layout::ColumnMajor);
        assert_eq!(full, t.compress(Layout::ColumnMajor, ExportOptions::default()));
    }

    #[test]
    fn malformed_parts_are_rejected() {
        assert!(CompressedMatrix::<usize, f64>::from_parts(2, 2, Layout::ColumnMajor, vec![0, 1, 2], vec![0, 1], vec![1.0, 1.0]).is_ok());
        assert!(CompressedMatrix::<usize, f64>::from_parts(2, 2, Layout::ColumnMajor, vec![0, 2, 1], vec![0, 1], vec![1.0, 1.0]).is_err());
        assert!(CompressedMatrix::<usize, f64>::from_parts(2, 2, Layout::ColumnMajor, vec![0, 1, 2], vec![0, 5], vec![1.0, 1.0]).is_err());
    }

    #[test]
    fn backend_solves_several_columns_from_any_storage() {
        let t = sample();
        let x0 = [1.0, -2.0, 0.5, 3.0, 0.0, -1.0];
        let mut b = vec![0.0; 6];
        for &(i, j, v) in t.entries() {
            for c in 0..2 {
                b[c * 3 + i] += v * x0[c * 3 + j];
            }
        }
        let storages = [
            t.compress::<u32>(Layout::RowMajor, ExportOptions { one_based: true, upper_only: false }),
            t.compress::<u32>(Layout::ColumnMajor, ExportOptions { one_based: false, upper_only: true }),
        ];
        for a in &storages {
            let mut x = b.clone();
            GilbertPeierls::default().solve(a, &mut x, 2).unwrap();
            for (g, e) in x.iter().zip(&x0) {
                assert_abs_diff_eq!(g, e, epsilon = 1e-12);
            }
        }
    }
}
