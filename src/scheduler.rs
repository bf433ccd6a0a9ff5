//! Traversals of the elimination tree.

use rayon::prelude::*;

use crate::error::Result;
use crate::mesh::{ElementId, Mesh};
use crate::traits::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Children before parents.
    LeafToRoot,
    /// Parents before children.
    RootToLeaf,
}

/// Elements by generation plus the tree shape, detached from the mesh so
/// traversals can run while element data is locked elsewhere.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    levels: Vec<Vec<ElementId>>,
    leaves: Vec<ElementId>,
    roots: Vec<ElementId>,
    children: Vec<Vec<ElementId>>,
}

impl Scheduler {
    pub fn load<S: Scalar>(&mut self, mesh: &Mesh<S>) {
        self.unload();
        self.leaves = mesh.leaves().collect();
        for e in mesh.elements() {
            let g = e.generation();
            if self.levels.len() <= g {
                self.levels.resize(g + 1, Vec::new());
            }
            self.levels[g].push(e.id());
            if e.parent().is_none() {
                self.roots.push(e.id());
            }
            self.children.push(e.children().to_vec());
        }
    }

    pub fn unload(&mut self) {
        self.levels.clear();
        self.leaves.clear();
        self.roots.clear();
        self.children.clear();
    }

    pub fn is_loaded(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn levels(&self) -> &[Vec<ElementId>] {
        &self.levels
    }

    /// Every leaf in order, on the calling thread.
    pub fn execute_leaves(&self, mut op: impl FnMut(ElementId) -> Result<()>) -> Result<()> {
        self.leaves.iter().try_for_each(|&e| op(e))
    }

    /// Generation by generation; with `parallel` each element of a
    /// generation is a task and the generation joins before the next.
    pub fn execute_elements<F>(&self, op: F, direction: Direction, parallel: bool) -> Result<()>
    where
        F: Fn(ElementId) -> Result<()> + Sync,
    {
        let run = |level: &Vec<ElementId>| {
            if parallel {
                level.par_iter().try_for_each(|&e| op(e))
            } else {
                level.iter().try_for_each(|&e| op(e))
            }
        };
        match direction {
            Direction::LeafToRoot => self.levels.iter().try_for_each(run),
            Direction::RootToLeaf => self.levels.iter().rev().try_for_each(run),
        }
    }

    /// Recursive walk with one task per child subtree.
    pub fn execute_tree<F>(&self, op: F, direction: Direction) -> Result<()>
    where
        F: Fn(ElementId) -> Result<()> + Sync,
    {
        self.roots.par_iter().try_for_each(|&r| self.visit(r, &op, direction))
    }

    fn visit<F>(&self, e: ElementId, op: &F, direction: Direction) -> Result<()>
    where
        F: Fn(ElementId) -> Result<()> + Sync,
    {
        let children = &self.children[e];
        match direction {
            Direction::LeafToRoot => {
                children.par_iter().try_for_each(|&c| self.visit(c, op, direction))?;
                op(e)
            }
            Direction::RootToLeaf => {
                op(e)?;
                children.par_iter().try_for_each(|&c| self.visit(c, op, direction))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mesh::NodeKind;
    use std::sync::Mutex;

    fn tree() -> (Mesh<f64>, Scheduler) {
        let mut m = Mesh::new(1);
        for k in 0..5 {
            m.add_node(k, 1, 1, NodeKind::Interior).unwrap();
        }
        for k in 0..4 {
            m.add_element(&[k, k + 1], vec![0.0; 4], vec![0.0; 2]).unwrap();
        }
        let a = m.add_parent(vec![0, 1]);
        let b = m.add_parent(vec![2, 3]);
        let root = m.add_parent(vec![a, b]);
        m.finalize(root).unwrap();
        let mut s = Scheduler::default();
        s.load(&m);
        (m, s)
    }

    fn check_order(m: &Mesh<f64>, seen: &[ElementId], direction: Direction) {
        let pos = |e: ElementId| seen.iter().position(|&x| x == e).unwrap();
        assert_eq!(seen.len(), m.elements().len());
        for e in m.elements() {
            if let Some(p) = e.parent() {
                match direction {
                    Direction::LeafToRoot => assert!(pos(e.id()) < pos(p)),
                    Direction::RootToLeaf => assert!(pos(p) < pos(e.id())),
                }
            }
        }
    }

    #[test]
    fn traversals_respect_the_tree() {
        let (m, s) = tree();
        assert_eq!(s.levels().len(), 3);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();
        for direction in [Direction::LeafToRoot, Direction::RootToLeaf] {
            for parallel in [false, true] {
                let seen = Mutex::new(Vec::new());
                pool.install(|| {
                    s.execute_elements(
                        |e| {
                            seen.lock().unwrap().push(e);
                            Ok(())
                        },
                        direction,
                        parallel,
                    )
                })
                .unwrap();
                check_order(&m, &seen.into_inner().unwrap(), direction);
            }
            let seen = Mutex::new(Vec::new());
            pool.install(|| {
                s.execute_tree(
                    |e| {
                        seen.lock().unwrap().push(e);
                        Ok(())
                    },
                    direction,
                )
            })
            .unwrap();
            check_order(&m, &seen.into_inner().unwrap(), direction);
        }
        let mut leaves = Vec::new();
        s.execute_leaves(|e| {
            leaves.push(e);
            Ok(())
        })
        .unwrap();
        assert_eq!(leaves, vec![0, 1, 2, 3]);
    }

    #[test]
    fn first_error_stops_the_walk() {
        let (_, s) = tree();
        let err = s.execute_tree(
            |e| if e == 4 { Err(Error::UnknownElement(e)) } else { Ok(()) },
            Direction::LeafToRoot,
        );
        assert!(matches!(err, Err(Error::UnknownElement(4))));
        let visited = Mutex::new(Vec::new());
        let _ = s.execute_elements(
            |e| {
                visited.lock().unwrap().push(e);
                if e == 4 {
                    Err(Error::UnknownElement(e))
                } else {
                    Ok(())
                }
            },
            Direction::LeafToRoot,
            false,
        );
        assert!(!visited.into_inner().unwrap().contains(&6));
    }
}
