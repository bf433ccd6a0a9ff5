#![allow(dead_code)]

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rmf::{Field, GilbertPeierls, Layout, Mesh, NodeKind, Solver, SparseBackend};

pub fn rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Hermitian, strictly diagonally dominant `m x m`, column-major.
pub fn dominant<S: Field>(m: usize, rng: &mut ChaCha8Rng, entry: &impl Fn(&mut ChaCha8Rng) -> S) -> Vec<S> {
    let mut a = vec![S::zero(); m * m];
    for j in 0..m {
        for i in 0..j {
            let v = entry(rng);
            a[j * m + i] = v;
            a[i * m + j] = v.conj();
        }
        a[j * m + j] = S::from_f64(2.0 * m as f64);
    }
    a
}

pub fn real(rng: &mut ChaCha8Rng) -> f64 {
    rng.gen_range(-1.0..1.0)
}

/// `(n+1)^2` nodes of one or two DOF and one leaf per grid cell.
pub fn grid<S: Field>(n: usize, nrhs: usize, rng: &mut ChaCha8Rng, entry: impl Fn(&mut ChaCha8Rng) -> S) -> Mesh<S> {
    let mut mesh = Mesh::new(nrhs);
    let key = |i: usize, j: usize| j * (n + 1) + i;
    for k in 0..(n + 1) * (n + 1) {
        mesh.add_node(k, 1 + k % 2, 1, NodeKind::Interior).unwrap();
    }
    for j in 0..n {
        for i in 0..n {
            let keys = [key(i, j), key(i + 1, j), key(i + 1, j + 1), key(i, j + 1)];
            let m: usize = keys.iter().map(|&k| 1 + k % 2).sum();
            let a = dominant(m, rng, &entry);
            let b = (0..m * nrhs).map(|_| entry(rng)).collect();
            mesh.add_element(&keys, a, b).unwrap();
        }
    }
    mesh
}

/// Solution of the assembled problem by sparse LU.
pub fn reference<S: Field>(mesh: &Mesh<S>) -> Vec<S> {
    let a = mesh.assemble().compress::<usize>(Layout::ColumnMajor, Default::default());
    let mut b = mesh.assemble_rhs();
    GilbertPeierls::default().solve(&a, &mut b, mesh.nrhs()).unwrap();
    b
}

pub fn max_diff<S: Field>(a: &[S], b: &[S]) -> f64 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| (x - y).norm()).fold(0.0, f64::max)
}

/// Elements on the path from `e` to the root, both included.
pub fn path_len<S: Field>(solver: &Solver<S>, mut e: usize) -> usize {
    let mut len = 1;
    while let Some(p) = solver.mesh().element(e).unwrap().parent() {
        e = p;
        len += 1;
    }
    len
}
