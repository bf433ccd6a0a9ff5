//! Dense column-major tiles and the raw strided views the kernels operate on.
//!
//! A [`Tile`] either owns its [`Buffer`] (`Storage::Owns`) or aliases a
//! region of another tile's buffer (`Storage::ViewOf`). Views hold a weak
//! handle, so they can never release the memory and an access after the
//! owner is gone fails with [`Error::DanglingView`].
//!
//! The safe writers on [`Tile`] need the only reference to the buffer: an
//! owner with no live views or handles. Aliased regions are written through
//! [`TileHandle::as_mut`].

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::traits::{Scalar, ScalarKind};

/// Column-major storage shared by an owning tile and its views.
pub struct Buffer<S> {
    cells: Box<[UnsafeCell<S>]>,
    rows: usize,
    cols: usize,
}

// Safe writes need `Arc::get_mut` on the owner. Every other write goes
// through `MatMut`, whose constructors are unsafe and require disjoint
// regions.
unsafe impl<S: Send> Sync for Buffer<S> {}

impl<S: Scalar> Buffer<S> {
    pub fn zeroed(rows: usize, cols: usize) -> Arc<Self> {
        let cells = (0..rows * cols).map(|_| UnsafeCell::new(S::zero())).collect();
        Arc::new(Self { cells, rows, cols })
    }

    /// Adopt column-major `data` of `rows` x `cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<S>) -> Arc<Self> {
        assert_eq!(data.len(), rows * cols, "buffer length must be rows*cols");
        let cells = data.into_iter().map(UnsafeCell::new).collect();
        Arc::new(Self { cells, rows, cols })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    fn as_ptr(&self) -> *mut S {
        UnsafeCell::raw_get(self.cells.as_ptr())
    }
}

/// Ownership of a tile's buffer.
pub enum Storage<S> {
    Empty,
    Owns(Arc<Buffer<S>>),
    ViewOf(Weak<Buffer<S>>),
}

impl<S> Clone for Storage<S> {
    fn clone(&self) -> Self {
        match self {
            Storage::Empty => Storage::Empty,
            // A copied handle to an owned buffer is a view: ownership is never shared.
            Storage::Owns(buf) => Storage::ViewOf(Arc::downgrade(buf)),
            Storage::ViewOf(weak) => Storage::ViewOf(weak.clone()),
        }
    }
}

pub struct Tile<S> {
    rows: usize,
    cols: usize,
    row_offset: usize,
    col_offset: usize,
    stride: usize,
    storage: Storage<S>,
}

impl<S: Scalar> Default for Tile<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Scalar> Tile<S> {
    pub fn new() -> Self {
        Self {
            rows: 0,
            cols: 0,
            row_offset: 0,
            col_offset: 0,
            stride: 0,
            storage: Storage::Empty,
        }
    }

    /// An owning tile of zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        let mut t = Self::new();
        match t.create(S::KIND, rows, cols) {
            Ok(()) => t,
            Err(e) => unreachable!("fresh tile: {}", e),
        }
    }

    pub fn from_col_major(rows: usize, cols: usize, data: Vec<S>) -> Self {
        if rows == 0 || cols == 0 {
            let mut t = Self::new();
            t.rows = rows;
            t.cols = cols;
            return t;
        }
        Self {
            rows,
            cols,
            row_offset: 0,
            col_offset: 0,
            stride: rows,
            storage: Storage::Owns(Buffer::from_vec(rows, cols, data)),
        }
    }

    pub fn from_fn(rows: usize, cols: usize, f: impl Fn(usize, usize) -> S) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for j in 0..cols {
            for i in 0..rows {
                data.push(f(i, j));
            }
        }
        Self::from_col_major(rows, cols, data)
    }

    /// Allocate a zeroed buffer. Records the extents but allocates nothing
    /// when either is zero.
    pub fn create(&mut self, kind: ScalarKind, rows: usize, cols: usize) -> Result<()> {
        if self.is_created() {
            return Err(Error::AlreadyCreated);
        }
        if kind != S::KIND {
            return Err(Error::InvalidScalarKind {
                expected: S::KIND,
                given: kind,
            });
        }
        self.rows = rows;
        self.cols = cols;
        self.row_offset = 0;
        self.col_offset = 0;
        if rows == 0 || cols == 0 {
            self.stride = 0;
            self.storage = Storage::Empty;
            return Ok(());
        }
        self.stride = rows;
        self.storage = Storage::Owns(Buffer::zeroed(rows, cols));
        Ok(())
    }

    /// A `rows` x `cols` window of `parent` at the given offsets. Never allocates.
    pub fn create_view(
        parent: &Tile<S>,
        rows: usize,
        cols: usize,
        row_offset: usize,
        col_offset: usize,
    ) -> Result<Tile<S>> {
        if row_offset + rows > parent.rows || col_offset + cols > parent.cols {
            return Err(Error::OutOfBounds {
                rows,
                cols,
                row_offset,
                col_offset,
                parent_rows: parent.rows,
                parent_cols: parent.cols,
            });
        }
        let storage = if rows == 0 || cols == 0 {
            Storage::Empty
        } else {
            match &parent.storage {
                Storage::Empty => return Err(Error::NotCreated),
                other => other.clone(),
            }
        };
        Ok(Tile {
            rows,
            cols,
            row_offset: parent.row_offset + row_offset,
            col_offset: parent.col_offset + col_offset,
            stride: parent.stride,
            storage,
        })
    }

    /// A view over all of `buffer`; the tile never releases it.
    pub fn wrap(buffer: &Arc<Buffer<S>>) -> Tile<S> {
        let (rows, cols) = (buffer.rows(), buffer.cols());
        Tile {
            rows,
            cols,
            row_offset: 0,
            col_offset: 0,
            stride: rows,
            storage: if rows == 0 || cols == 0 {
                Storage::Empty
            } else {
                Storage::ViewOf(Arc::downgrade(buffer))
            },
        }
    }

    /// Release the buffer if owned, detach if a view.
    pub fn free(&mut self) {
        self.storage = Storage::Empty;
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row_offset(&self) -> usize {
        self.row_offset
    }

    pub fn col_offset(&self) -> usize {
        self.col_offset
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn kind(&self) -> ScalarKind {
        S::KIND
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    pub fn is_created(&self) -> bool {
        !matches!(self.storage, Storage::Empty)
    }

    pub fn is_view(&self) -> bool {
        matches!(self.storage, Storage::ViewOf(_))
    }

    pub fn owns(&self) -> bool {
        matches!(self.storage, Storage::Owns(_))
    }

    /// Shape and scalar kind agree.
    pub fn same_shape(&self, other: &Tile<S>) -> bool {
        self.rows == other.rows && self.cols == other.cols
    }

    /// A handle keeping the buffer alive while the tile is accessed.
    pub fn handle(&self) -> Result<TileHandle<S>> {
        let buf = match &self.storage {
            Storage::Empty if self.is_empty() => None,
            Storage::Empty => return Err(Error::NotCreated),
            Storage::Owns(buf) => Some(buf.clone()),
            Storage::ViewOf(weak) => Some(weak.upgrade().ok_or(Error::DanglingView)?),
        };
        Ok(TileHandle {
            buf,
            rows: self.rows,
            cols: self.cols,
            offset: self.col_offset * self.stride + self.row_offset,
            stride: self.stride,
        })
    }

    /// The same origin with a larger extent. Callers guarantee the region is
    /// inside the buffer (contiguous cells of one owner).
    pub(crate) fn widened(&self, rows: usize, cols: usize) -> Tile<S> {
        let mut t = self.clone();
        t.rows = rows;
        t.cols = cols;
        t
    }

    /// Identity of the underlying buffer, shared by the owner and all views.
    pub(crate) fn buffer_id(&self) -> Option<*const Buffer<S>> {
        match &self.storage {
            Storage::Empty => None,
            Storage::Owns(buf) => Some(Arc::as_ptr(buf)),
            Storage::ViewOf(weak) => Some(weak.as_ptr()),
        }
    }

    pub fn get(&self, row: usize, col: usize) -> S {
        assert!(
            row < self.rows && col < self.cols,
            "index ({}, {}) out of bounds for {}x{} tile",
            row,
            col,
            self.rows,
            self.cols
        );
        match self.handle() {
            Ok(h) => h.as_ref().get(row, col),
            Err(e) => panic!("tile access failed: {}", e),
        }
    }

    /// A handle for a safe write: this tile must own its buffer and no
    /// view or handle of it may be alive.
    fn exclusive(&mut self) -> Result<TileHandle<S>> {
        let unique = match &mut self.storage {
            Storage::Empty => true,
            Storage::Owns(buf) => Arc::get_mut(buf).is_some(),
            Storage::ViewOf(_) => false,
        };
        if !unique {
            return Err(Error::Aliased);
        }
        self.handle()
    }

    /// # Panics
    ///
    /// On an out of range index, or when the buffer is aliased (see
    /// [`Tile::set_zero`]).
    pub fn set(&mut self, row: usize, col: usize, value: S) {
        assert!(
            row < self.rows && col < self.cols,
            "index ({}, {}) out of bounds for {}x{} tile",
            row,
            col,
            self.rows,
            self.cols
        );
        match self.exclusive() {
            // SAFETY: no other reference to the buffer exists.
            Ok(h) => unsafe { h.as_mut().set(row, col, value) },
            Err(e) => panic!("tile write failed: {}", e),
        }
    }

    /// Real (`k == 0`) or imaginary (`k == 1`) component of an entry.
    pub fn part(&self, row: usize, col: usize, k: usize) -> f64 {
        match self.get(row, col).part(k) {
            Some(v) => v,
            None => panic!("component {} requested from a {:?} tile", k, S::KIND),
        }
    }

    /// Column-major copy of the contents.
    pub fn to_vec(&self) -> Result<Vec<S>> {
        let h = self.handle()?;
        let a = h.as_ref();
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for j in 0..self.cols {
            for i in 0..self.rows {
                out.push(a.get(i, j));
            }
        }
        Ok(out)
    }

    /// An independent owning copy.
    pub fn duplicate(&self) -> Result<Tile<S>> {
        Ok(Tile::from_col_major(self.rows, self.cols, self.to_vec()?))
    }

    pub fn copy_from(&mut self, src: &Tile<S>) -> Result<()> {
        if !self.same_shape(src) {
            return Err(Error::ShapeMismatch {
                expected: (self.rows, self.cols),
                actual: (src.rows, src.cols),
            });
        }
        let (dst, src) = (self.exclusive()?, src.handle()?);
        // SAFETY: no other reference to the destination buffer exists, so
        // `src` cannot alias it.
        unsafe { dst.as_mut().copy_from(src.as_ref()) };
        Ok(())
    }

    /// Fails with [`Error::Aliased`] on a view, or on an owner whose buffer
    /// still has views or handles.
    pub fn set_zero(&mut self) -> Result<()> {
        let h = self.exclusive()?;
        // SAFETY: no other reference to the buffer exists.
        unsafe { h.as_mut().fill(S::zero()) };
        Ok(())
    }
}

impl<S> Clone for Tile<S> {
    /// Clones are views: a tile's buffer has a single owner, and a view
    /// cannot write through the safe API.
    fn clone(&self) -> Self {
        Tile {
            rows: self.rows,
            cols: self.cols,
            row_offset: self.row_offset,
            col_offset: self.col_offset,
            stride: self.stride,
            storage: self.storage.clone(),
        }
    }
}

impl<S: Scalar> std::fmt::Debug for Tile<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("kind", &S::KIND)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("row_offset", &self.row_offset)
            .field("col_offset", &self.col_offset)
            .field("owns", &self.owns())
            .finish()
    }
}

/// A tile's buffer pinned for access.
pub struct TileHandle<S> {
    buf: Option<Arc<Buffer<S>>>,
    rows: usize,
    cols: usize,
    offset: usize,
    stride: usize,
}

impl<S: Scalar> TileHandle<S> {
    fn ptr(&self) -> *mut S {
        match &self.buf {
            // SAFETY: offset addresses inside the buffer by the view invariant.
            Some(buf) => unsafe { buf.as_ptr().add(self.offset) },
            None => NonNull::dangling().as_ptr(),
        }
    }

    pub fn as_ref(&self) -> MatRef<'_, S> {
        // SAFETY: the handle keeps the buffer alive for the borrow.
        unsafe { MatRef::from_raw_parts(self.ptr(), self.rows, self.cols, self.stride) }
    }

    /// Mutable access to the pinned region.
    ///
    /// # Safety
    ///
    /// No other live `MatRef` or `MatMut` may overlap this region for the
    /// lifetime of the returned view.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut(&self) -> MatMut<'_, S> {
        MatMut::from_raw_parts(self.ptr(), self.rows, self.cols, self.stride)
    }
}

/// Read-only strided column-major view.
#[derive(Clone, Copy)]
pub struct MatRef<'a, S> {
    ptr: *const S,
    rows: usize,
    cols: usize,
    stride: usize,
    _marker: PhantomData<&'a S>,
}

unsafe impl<S: Sync> Send for MatRef<'_, S> {}
unsafe impl<S: Sync> Sync for MatRef<'_, S> {}

/// Mutable strided column-major view.
pub struct MatMut<'a, S> {
    ptr: *mut S,
    rows: usize,
    cols: usize,
    stride: usize,
    _marker: PhantomData<&'a mut S>,
}

unsafe impl<S: Send> Send for MatMut<'_, S> {}
unsafe impl<S: Sync> Sync for MatMut<'_, S> {}

impl<'a, S: Scalar> MatRef<'a, S> {
    /// # Safety
    ///
    /// `ptr` must address `rows` x `cols` elements with column stride `stride`
    /// valid for reads during `'a`.
    pub unsafe fn from_raw_parts(ptr: *const S, rows: usize, cols: usize, stride: usize) -> Self {
        Self {
            ptr,
            rows,
            cols,
            stride,
            _marker: PhantomData,
        }
    }

    pub fn from_slice(data: &'a [S], rows: usize, cols: usize) -> Self {
        assert!(data.len() >= rows * cols);
        // SAFETY: bounds checked above.
        unsafe { Self::from_raw_parts(data.as_ptr(), rows, cols, rows.max(1)) }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> S {
        debug_assert!(i < self.rows && j < self.cols);
        // SAFETY: in bounds by the constructor contract.
        unsafe { *self.ptr.add(j * self.stride + i) }
    }

    pub fn sub(self, r0: usize, c0: usize, rows: usize, cols: usize) -> Self {
        assert!(r0 + rows <= self.rows && c0 + cols <= self.cols);
        let ptr = if rows == 0 || cols == 0 {
            self.ptr
        } else {
            // SAFETY: the window lies inside the view.
            unsafe { self.ptr.add(c0 * self.stride + r0) }
        };
        Self {
            ptr,
            rows,
            cols,
            stride: self.stride,
            _marker: PhantomData,
        }
    }

    /// Column-major copy.
    pub fn to_vec(&self) -> Vec<S> {
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for j in 0..self.cols {
            for i in 0..self.rows {
                out.push(self.get(i, j));
            }
        }
        out
    }
}

impl<'a, S: Scalar> MatMut<'a, S> {
    /// # Safety
    ///
    /// `ptr` must address `rows` x `cols` elements with column stride `stride`
    /// valid for reads and writes during `'a`, with no other access overlapping.
    pub unsafe fn from_raw_parts(ptr: *mut S, rows: usize, cols: usize, stride: usize) -> Self {
        Self {
            ptr,
            rows,
            cols,
            stride,
            _marker: PhantomData,
        }
    }

    pub fn from_slice(data: &'a mut [S], rows: usize, cols: usize) -> Self {
        assert!(data.len() >= rows * cols);
        // SAFETY: bounds checked above and the slice is borrowed exclusively.
        unsafe { Self::from_raw_parts(data.as_mut_ptr(), rows, cols, rows.max(1)) }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> S {
        debug_assert!(i < self.rows && j < self.cols);
        // SAFETY: in bounds by the constructor contract.
        unsafe { *self.ptr.add(j * self.stride + i) }
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, v: S) {
        debug_assert!(i < self.rows && j < self.cols);
        // SAFETY: in bounds by the constructor contract.
        unsafe { *self.ptr.add(j * self.stride + i) = v }
    }

    #[inline]
    pub fn add(&mut self, i: usize, j: usize, v: S) {
        let x = self.get(i, j);
        self.set(i, j, x + v);
    }

    pub fn rb(&self) -> MatRef<'_, S> {
        MatRef {
            ptr: self.ptr,
            rows: self.rows,
            cols: self.cols,
            stride: self.stride,
            _marker: PhantomData,
        }
    }

    pub fn rb_mut(&mut self) -> MatMut<'_, S> {
        MatMut {
            ptr: self.ptr,
            rows: self.rows,
            cols: self.cols,
            stride: self.stride,
            _marker: PhantomData,
        }
    }

    pub fn sub(self, r0: usize, c0: usize, rows: usize, cols: usize) -> Self {
        assert!(r0 + rows <= self.rows && c0 + cols <= self.cols);
        let ptr = if rows == 0 || cols == 0 {
            self.ptr
        } else {
            // SAFETY: the window lies inside the view.
            unsafe { self.ptr.add(c0 * self.stride + r0) }
        };
        Self {
            ptr,
            rows,
            cols,
            stride: self.stride,
            _marker: PhantomData,
        }
    }

    /// Split into rows `[0, r)` and `[r, rows)`.
    pub fn split_rows(self, r: usize) -> (Self, Self) {
        let (rows, cols) = (self.rows, self.cols);
        // SAFETY: the halves are disjoint.
        let other = unsafe { MatMut::from_raw_parts(self.ptr, rows, cols, self.stride) };
        (self.sub(0, 0, r, cols), other.sub(r, 0, rows - r, cols))
    }

    /// Split into columns `[0, c)` and `[c, cols)`.
    pub fn split_cols(self, c: usize) -> (Self, Self) {
        let (rows, cols) = (self.rows, self.cols);
        // SAFETY: the halves are disjoint.
        let other = unsafe { MatMut::from_raw_parts(self.ptr, rows, cols, self.stride) };
        (self.sub(0, 0, rows, c), other.sub(0, c, rows, cols - c))
    }

    pub fn fill(&mut self, v: S) {
        for j in 0..self.cols {
            for i in 0..self.rows {
                self.set(i, j, v);
            }
        }
    }

    pub fn copy_from(&mut self, src: MatRef<'_, S>) {
        assert!(self.rows == src.rows() && self.cols == src.cols());
        for j in 0..self.cols {
            for i in 0..self.rows {
                self.set(i, j, src.get(i, j));
            }
        }
    }

    /// `self += src`
    pub fn add_from(&mut self, src: MatRef<'_, S>) {
        assert!(self.rows == src.rows() && self.cols == src.cols());
        for j in 0..self.cols {
            for i in 0..self.rows {
                self.add(i, j, src.get(i, j));
            }
        }
    }

    pub fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for j in 0..self.cols {
            let t = self.get(a, j);
            self.set(a, j, self.get(b, j));
            self.set(b, j, t);
        }
    }
}
