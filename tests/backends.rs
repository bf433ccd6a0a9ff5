mod common;

use std::sync::Arc;

use common::{grid, max_diff, real, reference, rng};
use rand::Rng;
use rmf::{
    Backend, ComputingModel, Context, ElementState, ExportOptions, FactorMethod, GilbertPeierls, HostAccelerator,
    Layout, Mesh, Solver, SparseBackend, Triplets,
};

#[test]
fn out_of_core_spills_and_reloads() {
    let dir = std::env::temp_dir().join(format!("rmf-spill-{}", std::process::id()));
    let mut rng = rng(21);
    let mesh = grid(3, 2, &mut rng, real);
    let expect = reference(&mesh);
    for method in [FactorMethod::LuPiv, FactorMethod::QrInc] {
        let ctx = Context::builder()
            .threads(2)
            .block_size(2)
            .method(method)
            .reuse(true)
            .backend(Backend::OutOfCore { dir: dir.clone() })
            .build()
            .unwrap();
        let mut solver = Solver::new(ctx, grid(3, 2, &mut common::rng(21), real));
        solver.factorize().unwrap();
        let n = solver.mesh().elements().len();
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), n);
        for e in 0..n {
            assert_eq!(solver.inspect(e, |m| m.state()).unwrap(), ElementState::Finalized);
        }

        solver.solve().unwrap();
        assert!(max_diff(&solver.solution().unwrap(), &expect) < 1e-10);
        // Reloaded factors stay reusable.
        assert_eq!(solver.factorize().unwrap().reused, n);
        drop(solver);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn accelerator_runs_the_triangular_kernels() {
    let mut rng = rng(22);
    let mesh = grid(3, 1, &mut rng, real);
    let expect = reference(&mesh);
    let models = [
        (ComputingModel::Accelerator, 1),
        (ComputingModel::Mixed { accelerated_threads: 1 }, 3),
    ];
    for (model, threads) in models {
        for method in [FactorMethod::Cholesky, FactorMethod::LuPiv] {
            let acc = Arc::new(HostAccelerator::new(1 << 24));
            let ctx = Context::builder()
                .threads(threads)
                .block_size(2)
                .method(method)
                .computing_model(model)
                .accelerator(acc.clone())
                .build()
                .unwrap();
            let copy = grid(3, 1, &mut common::rng(22), real);
            let mut solver = Solver::new(ctx, copy);
            solver.factorize().unwrap();
            solver.solve().unwrap();
            assert!(max_diff(&solver.solution().unwrap(), &expect) < 1e-10);
            if model == ComputingModel::Accelerator {
                assert!(acc.launches() > 0);
            }
            assert_eq!(acc.bytes_in_use(), 0);
        }
    }
}

/// Diagonally dominant, unsymmetric, roughly `density` of the entries set.
fn random_sparse(n: usize, density: f64, seed: u64) -> Triplets<f64> {
    let mut rng = rng(seed);
    let mut t = Triplets::new(n, n);
    for i in 0..n {
        t.push(i, i, n as f64);
        for j in 0..n {
            if i != j && rng.gen_bool(density) {
                t.push(i, j, rng.gen_range(-1.0..1.0));
            }
        }
    }
    t
}

#[test]
fn star_decomposition_of_a_sparse_matrix() {
    let n = 20;
    let t = random_sparse(n, 0.15, 23);
    let mut rng = rng(24);
    let b: Vec<f64> = (0..2 * n).map(|_| real(&mut rng)).collect();
    let mut expect = b.clone();
    let a = t.compress::<i64>(Layout::ColumnMajor, ExportOptions::default());
    GilbertPeierls::default().solve(&a, &mut expect, 2).unwrap();

    let mesh = Mesh::from_csc(&a, &b, 2).unwrap();
    assert_eq!(mesh.leaves().len(), n);
    let reassembled = mesh.assemble().compress::<i64>(Layout::ColumnMajor, ExportOptions::default());
    assert_eq!(reassembled.ptr(), a.ptr());
    assert_eq!(reassembled.indices(), a.indices());

    for method in [FactorMethod::LuPiv, FactorMethod::Qr] {
        let ctx = Context::builder().threads(2).block_size(4).method(method).build().unwrap();
        let mut solver = Solver::new(ctx, Mesh::from_csc(&a, &b, 2).unwrap());
        solver.factorize().unwrap();
        solver.solve().unwrap();
        assert!(max_diff(&solver.solution().unwrap(), &expect) < 1e-10);
    }
}

#[test]
fn symmetric_upper_storage_is_mirrored() {
    let n = 12;
    let mut t = Triplets::new(n, n);
    let mut rng = rng(25);
    for i in 0..n {
        t.push(i, i, 4.0);
        for j in i + 1..n {
            if rng.gen_bool(0.3) {
                let v = real(&mut rng);
                t.push(i, j, v);
                t.push(j, i, v);
            }
        }
    }
    let upper = t.compress::<u32>(
        Layout::ColumnMajor,
        ExportOptions {
            one_based: true,
            upper_only: true,
        },
    );
    let full = t.compress::<u32>(Layout::ColumnMajor, ExportOptions::default());
    assert!(upper.nnz() < full.nnz());

    let b: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let mut expect = b.clone();
    GilbertPeierls::default().solve(&full, &mut expect, 1).unwrap();

    let ctx = Context::builder().method(FactorMethod::Cholesky).build().unwrap();
    let mut solver = Solver::new(ctx, Mesh::from_csc(&upper, &b, 1).unwrap());
    solver.factorize().unwrap();
    solver.solve().unwrap();
    assert!(max_diff(&solver.solution().unwrap(), &expect) < 1e-10);
}
