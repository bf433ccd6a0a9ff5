//! Multifrontal sparse direct solver over hierarchically tiled dense
//! matrices.
//!
//! A problem is a [`Mesh`] of nodes (groups of unknowns) and leaf elements
//! (dense contributions over a few nodes). The [`Solver`] partitions the
//! leaves into an elimination tree, factors every element with the blocked
//! kernels in [`kernels`] and passes Schur complements up and solutions back
//! down the tree.

mod debug;

pub mod accel;
pub mod config;
pub mod error;
pub mod helper;
pub mod hier;
pub mod kernels;
pub mod matrix;
pub mod mesh;
pub mod scheduler;
pub mod solver;
pub mod sparse;
pub mod tile;
pub mod tree;
mod traits;

#[cfg(feature = "spsolve")]
pub mod spsolve;

pub use accel::{Accelerator, ComputingModel, HostAccelerator};
pub use config::{Backend, Config, Context, ContextBuilder, FactorMethod, Traversal};
pub use error::{Error, Result};
pub use helper::Helper;
pub use hier::HierMatrix;
pub use matrix::{ElementState, PerNodeMatrix, RhsKind};
pub use mesh::{ElementId, Mesh, NodeId, NodeKind};
pub use scheduler::{Direction, Scheduler};
pub use solver::{FactorReport, Solver};
pub use sparse::{CompressedMatrix, ExportOptions, GilbertPeierls, Layout, SparseBackend, Triplets};
pub use tile::{MatMut, MatRef, Tile};
pub use traits::*;
pub use tree::{Graph, GraphPartitioner, GrowingPartitioner, TreeStrategy};

#[cfg(feature = "debug")]
pub use debug::matrix_table;
