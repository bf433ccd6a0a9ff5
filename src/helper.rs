//! Index mapping between an element and its parent.
//!
//! The rows and columns a child passes up are its schur rows; in the parent
//! each of them is either a factor row (top) or a schur row (bottom). A
//! [`Helper`] records the mapping as runs of consecutive offsets so merges
//! and branches copy whole slabs at a time.

use crate::error::{Error, Result};
use crate::matrix::{PerNodeMatrix, RhsKind};
use crate::mesh::{ElementId, Mesh, NodeId, Separation};
use crate::tile::{MatMut, MatRef};
use crate::traits::{Field, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Factor rows.
    Top,
    /// Schur rows.
    Bottom,
}

impl Side {
    pub(crate) fn index(self) -> usize {
        match self {
            Side::Top => 0,
            Side::Bottom => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub child_offset: usize,
    pub side: Side,
    pub parent_offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Helper {
    mappings: Vec<Mapping>,
    rows: usize,
}

impl Helper {
    /// Map the schur rows of `child` into `parent`.
    pub fn new<S: Scalar>(mesh: &Mesh<S>, parent: ElementId, child: ElementId) -> Result<Self> {
        let (p, c) = (mesh.element(parent)?, mesh.element(child)?);
        if c.parent() != Some(parent) {
            return Err(Error::InvalidProblem {
                element: child,
                message: format!("element {} is not a child of {}", child, parent),
            });
        }
        let mut h = Helper::default();
        for &(v, offset) in c.schur_nodes() {
            let (side, at) = locate(p.separation(v), p.factor_nodes(), p.schur_nodes(), v)
                .ok_or(Error::InvalidProblem {
                    element: parent,
                    message: format!("node {} of child {} is missing", v, child),
                })?;
            h.push(offset, side, at, mesh.node(v)?.dof());
        }
        Ok(h)
    }

    /// Map the rows of a leaf contribution, in the order its nodes were
    /// given, to the leaf's own factor and schur rows.
    pub fn for_leaf<S: Scalar>(mesh: &Mesh<S>, leaf: ElementId) -> Result<Self> {
        let e = mesh.element(leaf)?;
        let mut h = Helper::default();
        let mut offset = 0;
        for &v in e.nodes() {
            let (side, at) = locate(e.separation(v), e.factor_nodes(), e.schur_nodes(), v)
                .ok_or(Error::InvalidProblem {
                    element: leaf,
                    message: format!("node {} is not arranged", v),
                })?;
            let dof = mesh.node(v)?.dof();
            h.push(offset, side, at, dof);
            offset += dof;
        }
        Ok(h)
    }

    fn push(&mut self, child_offset: usize, side: Side, parent_offset: usize, len: usize) {
        self.rows += len;
        if len == 0 {
            return;
        }
        if let Some(last) = self.mappings.last_mut() {
            if last.side == side
                && last.child_offset + last.len == child_offset
                && last.parent_offset + last.len == parent_offset
            {
                last.len += len;
                return;
            }
        }
        self.mappings.push(Mapping {
            child_offset,
            side,
            parent_offset,
            len,
        });
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Rows on the child side.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// `parent.A[side_i, side_j] += src` for every pair of runs.
    pub fn merge_a<S: Field>(&self, src: MatRef<'_, S>, parent: &mut PerNodeMatrix<S>) -> Result<()> {
        assert!(
            src.rows() == self.rows && src.cols() == self.rows,
            "merge_a: source is {}x{}, mapping covers {}",
            src.rows(),
            src.cols(),
            self.rows
        );
        let blocks = parent.block_handles()?;
        for mi in &self.mappings {
            for mj in &self.mappings {
                let h = &blocks[mi.side.index()][mj.side.index()];
                // SAFETY: `parent` is borrowed mutably and a single view is
                // alive at a time.
                let dst = unsafe { h.as_mut() };
                dst.sub(mi.parent_offset, mj.parent_offset, mi.len, mj.len)
                    .add_from(src.sub(mi.child_offset, mj.child_offset, mi.len, mj.len));
            }
        }
        Ok(())
    }

    /// `child.ABR <- parent.A[side_i, side_j]`
    pub fn branch_abr<S: Field>(&self, parent: &PerNodeMatrix<S>, child: &mut PerNodeMatrix<S>) -> Result<()> {
        let blocks = parent.block_handles()?;
        let abr = child.abr().handle()?;
        for mi in &self.mappings {
            for mj in &self.mappings {
                let src = blocks[mi.side.index()][mj.side.index()].as_ref();
                // SAFETY: `child` is borrowed mutably.
                let dst = unsafe { abr.as_mut() };
                dst.sub(mi.child_offset, mj.child_offset, mi.len, mj.len)
                    .copy_from(src.sub(mi.parent_offset, mj.parent_offset, mi.len, mj.len));
            }
        }
        Ok(())
    }

    fn merge_rhs<S: Field>(&self, kind: RhsKind, src: MatRef<'_, S>, parent: &mut PerNodeMatrix<S>) -> Result<()> {
        assert_eq!(src.rows(), self.rows, "merge_rhs: row count");
        let sides = parent.rhs_handles(kind)?;
        for m in &self.mappings {
            // SAFETY: `parent` is borrowed mutably.
            let dst = unsafe { sides[m.side.index()].as_mut() };
            let nrhs = dst.cols();
            dst.sub(m.parent_offset, 0, m.len, nrhs)
                .add_from(src.sub(m.child_offset, 0, m.len, nrhs));
        }
        Ok(())
    }

    fn branch_rhs<S: Field>(&self, kind: RhsKind, parent: &PerNodeMatrix<S>, mut dst: MatMut<'_, S>) -> Result<()> {
        assert_eq!(dst.rows(), self.rows, "branch_rhs: row count");
        let sides = parent.rhs_handles(kind)?;
        let nrhs = dst.cols();
        for m in &self.mappings {
            let src = sides[m.side.index()].as_ref();
            dst.rb_mut()
                .sub(m.child_offset, 0, m.len, nrhs)
                .copy_from(src.sub(m.parent_offset, 0, m.len, nrhs));
        }
        Ok(())
    }

    /// Parent `B` top or bottom rows `+= src`.
    pub fn merge_rhs_b<S: Field>(&self, src: MatRef<'_, S>, parent: &mut PerNodeMatrix<S>) -> Result<()> {
        self.merge_rhs(RhsKind::B, src, parent)
    }

    pub fn merge_rhs_x<S: Field>(&self, src: MatRef<'_, S>, parent: &mut PerNodeMatrix<S>) -> Result<()> {
        self.merge_rhs(RhsKind::X, src, parent)
    }

    pub fn merge_rhs_r<S: Field>(&self, src: MatRef<'_, S>, parent: &mut PerNodeMatrix<S>) -> Result<()> {
        self.merge_rhs(RhsKind::R, src, parent)
    }

    /// `dst <-` parent `B` rows, in child order.
    pub fn branch_rhs_b<S: Field>(&self, parent: &PerNodeMatrix<S>, dst: MatMut<'_, S>) -> Result<()> {
        self.branch_rhs(RhsKind::B, parent, dst)
    }

    pub fn branch_rhs_x<S: Field>(&self, parent: &PerNodeMatrix<S>, dst: MatMut<'_, S>) -> Result<()> {
        self.branch_rhs(RhsKind::X, parent, dst)
    }

    pub fn branch_rhs_r<S: Field>(&self, parent: &PerNodeMatrix<S>, dst: MatMut<'_, S>) -> Result<()> {
        self.branch_rhs(RhsKind::R, parent, dst)
    }
}

fn locate(
    sep: Separation,
    factor: &[(NodeId, usize)],
    schur: &[(NodeId, usize)],
    v: NodeId,
) -> Option<(Side, usize)> {
    let (side, list) = match sep {
        Separation::Factor => (Side::Top, factor),
        Separation::Schur => (Side::Bottom, schur),
        Separation::Unseparated => return None,
    };
    list.iter().find(|&&(n, _)| n == v).map(|&(_, at)| (side, at))
}
