use super::lu::Matrix;

/// Depth-first-search workspace for the symbolic step of [`lu`](super::lu).
pub(crate) struct Dfs {
    root_list: Vec<usize>,
    ptr_list: Vec<(usize, usize)>,
    flag: Vec<bool>,
}

impl Dfs {
    pub fn new(n: usize) -> Self {
        Self {
            root_list: vec![0; n],
            ptr_list: vec![(0, 0); n],
            flag: vec![false; n],
        }
    }

    /// Rows reachable from the nonzeros `b_rowidx` through the columns of
    /// `L` computed so far, in topological order.
    pub fn reach<S>(&mut self, l_mat: &Matrix<S>, b_rowidx: &[usize], rperm: &[Option<usize>]) -> &[usize] {
        let n = l_mat.len();
        let mut start = n;

        for &e0 in b_rowidx {
            // Marked vertices are not searched twice.
            if self.flag[e0] {
                continue;
            }
            self.dfs(e0, l_mat, &mut start, rperm);
        }
        let found = &self.root_list[start..];
        found.iter().for_each(|&i| self.flag[i] = false);
        found
    }

    // Iterative variant of SciPy's `depth_first_directed`, resumable across
    // calls with different heads over the same partial L.
    fn dfs<S>(&mut self, head: usize, l_mat: &Matrix<S>, start: &mut usize, rperm: &[Option<usize>]) {
        // The stack grows from the front of `root_list` while finished
        // vertices are prepended at `start`; they never overlap.
        self.root_list[0] = head;
        let mut top = Some(0);

        while let Some(mut i_root) = top {
            let pnode = self.root_list[i_root];
            let pcol = rperm[pnode];

            if !self.flag[pnode] {
                self.flag[pnode] = true;
                self.ptr_list[i_root] = (pcol.unwrap_or(0), 0);
            }

            let mut no_children = true;
            if pcol.is_some() {
                let (col, offset) = self.ptr_list[i_root];
                for (k, &(cnode, _)) in l_mat[col].iter().enumerate().skip(offset) {
                    if self.flag[cnode] {
                        continue;
                    }
                    self.ptr_list[i_root] = (col, k);
                    i_root += 1;
                    top = Some(i_root);
                    self.root_list[i_root] = cnode;
                    no_children = false;
                    break;
                }
            }

            if *start == 0 {
                break;
            }

            if no_children {
                top = i_root.checked_sub(1);
                *start -= 1;
                self.root_list[*start] = pnode;
            }
        }
    }
}
