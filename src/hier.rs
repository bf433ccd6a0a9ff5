//! One level of blocking over [`Tile`]s.
//!
//! A [`HierMatrix`] is a grid of tile views. Block boundaries come from a
//! target block size with the remainder in the last block row/column, so the
//! block extents always add up to the flat extent.

use crate::error::{Error, Result};
use crate::tile::{MatMut, MatRef, Tile, TileHandle};
use crate::traits::Scalar;

#[derive(Clone)]
pub struct HierMatrix<S> {
    rows: usize,
    cols: usize,
    // Prefix offsets, one more entry than blocks.
    row_bounds: Vec<usize>,
    col_bounds: Vec<usize>,
    // Column-major grid of cells.
    cells: Vec<Tile<S>>,
    // Present when the grid created its own flat buffer.
    owner: Option<Tile<S>>,
}

fn bounds(extent: usize, block: usize) -> Vec<usize> {
    assert!(block > 0, "block size must be positive");
    let mut b = Vec::with_capacity(extent / block + 2);
    b.push(0);
    let mut at = 0;
    while at < extent {
        at = usize::min(at + block, extent);
        b.push(at);
    }
    b
}

impl<S: Scalar> HierMatrix<S> {
    /// A zeroed `rows` x `cols` matrix blocked by `mb` x `nb`.
    pub fn create(rows: usize, cols: usize, mb: usize, nb: usize) -> Self {
        let owner = Tile::zeros(rows, cols);
        let mut h = match Self::from_flat(&owner, mb, nb) {
            Ok(h) => h,
            Err(e) => unreachable!("fresh flat tile: {}", e),
        };
        h.owner = Some(owner);
        h
    }

    /// Block the existing flat `tile`; cells are views sharing its buffer.
    pub fn from_flat(tile: &Tile<S>, mb: usize, nb: usize) -> Result<Self> {
        let row_bounds = bounds(tile.rows(), mb);
        let col_bounds = bounds(tile.cols(), nb);
        let (nbr, nbc) = (row_bounds.len() - 1, col_bounds.len() - 1);
        let mut cells = Vec::with_capacity(nbr * nbc);
        for j in 0..nbc {
            for i in 0..nbr {
                cells.push(Tile::create_view(
                    tile,
                    row_bounds[i + 1] - row_bounds[i],
                    col_bounds[j + 1] - col_bounds[j],
                    row_bounds[i],
                    col_bounds[j],
                )?);
            }
        }
        Ok(Self {
            rows: tile.rows(),
            cols: tile.cols(),
            row_bounds,
            col_bounds,
            cells,
            owner: None,
        })
    }

    fn from_parts(row_bounds: Vec<usize>, col_bounds: Vec<usize>, cells: Vec<Tile<S>>) -> Self {
        debug_assert_eq!(cells.len(), (row_bounds.len() - 1) * (col_bounds.len() - 1));
        Self {
            rows: *row_bounds.last().unwrap_or(&0),
            cols: *col_bounds.last().unwrap_or(&0),
            row_bounds,
            col_bounds,
            cells,
            owner: None,
        }
    }

    /// `[a b; c d]`
    pub fn merge_2x2(
        a: &HierMatrix<S>,
        b: &HierMatrix<S>,
        c: &HierMatrix<S>,
        d: &HierMatrix<S>,
    ) -> Result<Self> {
        let top = Self::merge_1x2(a, b)?;
        let bottom = Self::merge_1x2(c, d)?;
        Self::merge_2x1(&top, &bottom)
    }

    /// `[top; bottom]`
    pub fn merge_2x1(top: &HierMatrix<S>, bottom: &HierMatrix<S>) -> Result<Self> {
        if top.col_bounds != bottom.col_bounds {
            return Err(Error::ShapeMismatch {
                expected: (bottom.rows, top.cols),
                actual: (bottom.rows, bottom.cols),
            });
        }
        let row_bounds = concat_bounds(&top.row_bounds, &bottom.row_bounds);
        let (ntop, nbot) = (top.block_rows(), bottom.block_rows());
        let mut cells = Vec::with_capacity((ntop + nbot) * top.block_cols());
        for j in 0..top.block_cols() {
            for i in 0..ntop {
                cells.push(top.cell(i, j).clone());
            }
            for i in 0..nbot {
                cells.push(bottom.cell(i, j).clone());
            }
        }
        Ok(Self::from_parts(row_bounds, top.col_bounds.clone(), cells))
    }

    /// `[left right]`
    pub fn merge_1x2(left: &HierMatrix<S>, right: &HierMatrix<S>) -> Result<Self> {
        if left.row_bounds != right.row_bounds {
            return Err(Error::ShapeMismatch {
                expected: (left.rows, right.cols),
                actual: (right.rows, right.cols),
            });
        }
        let col_bounds = concat_bounds(&left.col_bounds, &right.col_bounds);
        let mut cells = Vec::with_capacity(left.cells.len() + right.cells.len());
        cells.extend(left.cells.iter().cloned());
        cells.extend(right.cells.iter().cloned());
        Ok(Self::from_parts(left.row_bounds.clone(), col_bounds, cells))
    }

    /// The flat tile covering all cells, when they are contiguous views of a
    /// single buffer.
    pub fn flatten(&self) -> Result<Tile<S>> {
        if self.cells.is_empty() {
            let mut t = Tile::new();
            t.create(S::KIND, self.rows, self.cols)?;
            return Ok(t);
        }
        let origin = &self.cells[0];
        let id = origin.buffer_id();
        if id.is_none() {
            return Err(Error::NotContiguous);
        }
        for j in 0..self.block_cols() {
            for i in 0..self.block_rows() {
                let c = self.cell(i, j);
                if c.buffer_id() != id
                    || c.stride() != origin.stride()
                    || c.row_offset() != origin.row_offset() + self.row_bounds[i]
                    || c.col_offset() != origin.col_offset() + self.col_bounds[j]
                {
                    return Err(Error::NotContiguous);
                }
            }
        }
        Ok(origin.widened(self.rows, self.cols))
    }

    /// The sub-grid of `nbi` x `nbj` blocks starting at block `(bi, bj)`.
    pub fn sub(&self, bi: usize, bj: usize, nbi: usize, nbj: usize) -> Self {
        assert!(bi + nbi <= self.block_rows() && bj + nbj <= self.block_cols());
        let rb: Vec<usize> = self.row_bounds[bi..=bi + nbi]
            .iter()
            .map(|r| r - self.row_bounds[bi])
            .collect();
        let cb: Vec<usize> = self.col_bounds[bj..=bj + nbj]
            .iter()
            .map(|c| c - self.col_bounds[bj])
            .collect();
        let mut cells = Vec::with_capacity(nbi * nbj);
        for j in bj..bj + nbj {
            for i in bi..bi + nbi {
                cells.push(self.cell(i, j).clone());
            }
        }
        Self::from_parts(rb, cb, cells)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn block_rows(&self) -> usize {
        self.row_bounds.len() - 1
    }

    pub fn block_cols(&self) -> usize {
        self.col_bounds.len() - 1
    }

    pub fn row_start(&self, i: usize) -> usize {
        self.row_bounds[i]
    }

    pub fn col_start(&self, j: usize) -> usize {
        self.col_bounds[j]
    }

    pub fn row_extent(&self, i: usize) -> usize {
        self.row_bounds[i + 1] - self.row_bounds[i]
    }

    pub fn col_extent(&self, j: usize) -> usize {
        self.col_bounds[j + 1] - self.col_bounds[j]
    }

    pub fn cell(&self, i: usize, j: usize) -> &Tile<S> {
        &self.cells[j * self.block_rows() + i]
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Pin every cell's buffer for the duration of a kernel.
    pub fn pin(&self) -> Result<Pinned<S>> {
        let handles = self
            .cells
            .iter()
            .map(|c| c.handle())
            .collect::<Result<Vec<_>>>()?;
        Ok(Pinned {
            handles,
            block_rows: self.block_rows(),
            block_cols: self.block_cols(),
        })
    }

    pub fn get(&self, r: usize, c: usize) -> S {
        let (i, ri) = locate(&self.row_bounds, r);
        let (j, cj) = locate(&self.col_bounds, c);
        self.cell(i, j).get(ri, cj)
    }

    /// Column-major copy of the whole matrix.
    pub fn to_vec(&self) -> Result<Vec<S>> {
        let mut out = vec![S::zero(); self.rows * self.cols];
        for j in 0..self.block_cols() {
            for i in 0..self.block_rows() {
                let h = self.cell(i, j).handle()?;
                let a = h.as_ref();
                for cj in 0..a.cols() {
                    for ci in 0..a.rows() {
                        out[(self.col_bounds[j] + cj) * self.rows + self.row_bounds[i] + ci] =
                            a.get(ci, cj);
                    }
                }
            }
        }
        Ok(out)
    }
}

fn concat_bounds(a: &[usize], b: &[usize]) -> Vec<usize> {
    let base = *a.last().unwrap_or(&0);
    a.iter()
        .copied()
        .chain(b.iter().skip(1).map(|x| x + base))
        .collect()
}

fn locate(bounds: &[usize], x: usize) -> (usize, usize) {
    assert!(x < *bounds.last().unwrap_or(&0), "index {} out of bounds", x);
    let i = bounds.partition_point(|&b| b <= x) - 1;
    (i, x - bounds[i])
}

/// Cell buffers of a [`HierMatrix`] held alive for a kernel.
pub struct Pinned<S> {
    handles: Vec<TileHandle<S>>,
    block_rows: usize,
    block_cols: usize,
}

impl<S: Scalar> Pinned<S> {
    pub fn block_rows(&self) -> usize {
        self.block_rows
    }

    pub fn block_cols(&self) -> usize {
        self.block_cols
    }

    pub fn cell(&self, i: usize, j: usize) -> MatRef<'_, S> {
        self.handles[j * self.block_rows + i].as_ref()
    }

    /// # Safety
    ///
    /// The caller must not create overlapping views of the same cell that are
    /// alive at the same time as the returned one.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn cell_mut(&self, i: usize, j: usize) -> MatMut<'_, S> {
        self.handles[j * self.block_rows + i].as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sums_match<S: Scalar>(h: &HierMatrix<S>) {
        let r: usize = (0..h.block_rows()).map(|i| h.row_extent(i)).sum();
        let c: usize = (0..h.block_cols()).map(|j| h.col_extent(j)).sum();
        assert_eq!(r, h.rows());
        assert_eq!(c, h.cols());
    }

    #[test]
    fn remainder_blocks() {
        let h = HierMatrix::<f64>::create(10, 7, 4, 3);
        assert_eq!(h.block_rows(), 3);
        assert_eq!(h.block_cols(), 3);
        assert_eq!(h.row_extent(2), 2);
        assert_eq!(h.col_extent(2), 1);
        sums_match(&h);

        for (rows, cols, mb, nb) in [(0, 5, 2, 2), (1, 1, 8, 8), (9, 9, 3, 3), (17, 4, 5, 1)] {
            sums_match(&HierMatrix::<f64>::create(rows, cols, mb, nb));
        }
    }

    #[test]
    fn from_flat_shares_buffer() {
        let flat = Tile::<f64>::from_fn(5, 5, |i, j| (i * 5 + j) as f64);
        let h = HierMatrix::from_flat(&flat, 2, 2).unwrap();
        assert_eq!(h.get(3, 4), 19.0);
        let c = h.cell(1, 2).handle().unwrap();
        unsafe { c.as_mut().set(1, 0, -3.0) };
        assert_eq!(flat.get(3, 4), -3.0);
        assert_eq!(h.to_vec().unwrap(), flat.to_vec().unwrap());
    }

    #[test]
    fn merge_and_flatten() {
        let flat = Tile::<f64>::from_fn(6, 6, |i, j| (i + 6 * j) as f64);
        let h = HierMatrix::from_flat(&flat, 2, 2).unwrap();
        let a = h.sub(0, 0, 1, 1);
        let b = h.sub(0, 1, 1, 2);
        let c = h.sub(1, 0, 2, 1);
        let d = h.sub(1, 1, 2, 2);
        let m = HierMatrix::merge_2x2(&a, &b, &c, &d).unwrap();
        sums_match(&m);
        assert_eq!(m.to_vec().unwrap(), flat.to_vec().unwrap());

        let panel = HierMatrix::merge_2x1(&h.sub(1, 1, 1, 1), &h.sub(2, 1, 1, 1)).unwrap();
        let f = panel.flatten().unwrap();
        assert_eq!((f.rows(), f.cols()), (4, 2));
        assert_eq!(f.get(0, 0), flat.get(2, 2));
        assert_eq!(f.get(3, 1), flat.get(5, 3));
    }

    #[test]
    fn flatten_rejects_foreign_cells() {
        let x = HierMatrix::<f64>::create(2, 2, 2, 2);
        let y = HierMatrix::<f64>::create(2, 2, 2, 2);
        let m = HierMatrix::merge_1x2(&x, &y).unwrap();
        assert!(matches!(m.flatten(), Err(Error::NotContiguous)));
    }
}
