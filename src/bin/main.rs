use rmf::{Context, ContextBuilder, GilbertPeierls, Layout, Mesh, NodeKind, Solver, SparseBackend};

// Bilinear element on a square cell, corners counter-clockwise from the
// lower left.
const STIFFNESS: [[f64; 4]; 4] = [
    [4.0, -1.0, -2.0, -1.0],
    [-1.0, 4.0, -1.0, -2.0],
    [-2.0, -1.0, 4.0, -1.0],
    [-1.0, -2.0, -1.0, 4.0],
];
const MASS: [[f64; 4]; 4] = [
    [4.0, 2.0, 1.0, 2.0],
    [2.0, 4.0, 2.0, 1.0],
    [1.0, 2.0, 4.0, 2.0],
    [2.0, 1.0, 2.0, 4.0],
];

fn grid(n: usize) -> rmf::Result<Mesh<f64>> {
    let h = 1.0 / n as f64;
    let mut mesh = Mesh::new(1);
    let key = |i: usize, j: usize| j * (n + 1) + i;
    for j in 0..=n {
        for i in 0..=n {
            mesh.add_node(key(i, j), 1, 1, NodeKind::Interior)?;
        }
    }
    let mut a = vec![0.0; 16];
    for (q, row) in STIFFNESS.iter().enumerate() {
        for p in 0..4 {
            a[q * 4 + p] = row[p] / 6.0 + MASS[q][p] * h * h / 36.0;
        }
    }
    for j in 0..n {
        for i in 0..n {
            let keys = [key(i, j), key(i + 1, j), key(i + 1, j + 1), key(i, j + 1)];
            mesh.add_element(&keys, a.clone(), vec![h * h / 4.0; 4])?;
        }
    }
    Ok(mesh)
}

fn main() -> rmf::Result<()> {
    let n = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(16);

    let ctx: Context = ContextBuilder::from_env().block_size(32).reuse(true).build()?;
    let mesh = grid(n)?;
    let reference = {
        let a = mesh.assemble().compress::<usize>(Layout::ColumnMajor, Default::default());
        let mut b = mesh.assemble_rhs();
        GilbertPeierls::default().solve(&a, &mut b, 1)?;
        b
    };

    let mut solver = Solver::new(ctx, mesh);
    let report = solver.factorize()?;
    println!(
        "factored {} elements ({} kernel calls, {:.3e} flops)",
        report.factored, report.kernel_calls, report.flops_estimate
    );
    solver.solve()?;
    println!("residual {:.3e}", solver.residual_norm()?);

    let x = solver.solution()?;
    let diff = x
        .iter()
        .zip(&reference)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max);
    println!("max difference to sparse LU {:.3e}", diff);

    let again = solver.factorize()?;
    println!("refactorization reused {} of {} elements", again.reused, again.reused + again.factored);
    Ok(())
}
