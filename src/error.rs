//! Error type for tile, tree and solver operations.

use thiserror::Error;

use crate::traits::ScalarKind;

#[derive(Debug, Error)]
pub enum Error {
    /// `create` called on a tile that already holds a buffer.
    #[error("tile is already created")]
    AlreadyCreated,

    #[error("invalid scalar kind {given:?} for a tile of {expected:?}")]
    InvalidScalarKind {
        expected: ScalarKind,
        given: ScalarKind,
    },

    /// A view or sub-grid reaching past its parent.
    #[error("region {rows}x{cols}+({row_offset},{col_offset}) exceeds {parent_rows}x{parent_cols}")]
    OutOfBounds {
        rows: usize,
        cols: usize,
        row_offset: usize,
        col_offset: usize,
        parent_rows: usize,
        parent_cols: usize,
    },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("tile has no buffer")]
    NotCreated,

    /// The buffer behind a view was released by its owner.
    #[error("view outlived the buffer it aliases")]
    DanglingView,

    /// A safe write met a buffer that other tiles or handles still reach.
    #[error("tile buffer is aliased")]
    Aliased,

    #[error("hierarchical matrix cells are not contiguous in one buffer")]
    NotContiguous,

    #[error("unknown node {0}")]
    UnknownNode(usize),

    #[error("node {0} is declared twice")]
    DuplicateNode(usize),

    #[error("unknown element {0}")]
    UnknownElement(usize),

    #[error("element {element}: {message}")]
    InvalidProblem { element: usize, message: String },

    #[error("element {element} is {state}, cannot {operation}")]
    InvalidState {
        element: usize,
        state: &'static str,
        operation: &'static str,
    },

    #[error("no elimination tree has been built")]
    NoTree,

    /// A zero (or non-positive, for Cholesky) pivot was met.
    #[error("{method} breakdown at pivot {index}")]
    Breakdown { method: &'static str, index: usize },

    #[error("accelerator: {0}")]
    Accelerator(String),

    /// `code` is the backend's status, or -1 when it reports none.
    #[error("sparse backend failed with code {code}: {message}")]
    Backend { code: i32, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("thread pool: {0}")]
    ThreadPool(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
