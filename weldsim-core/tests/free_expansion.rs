//! Mechanical response to prescribed temperature fields.

use approx::assert_relative_eq;
use weldsim_core::config::{ClampKind, ClampSpec, NodeSelection, SolverConfig};
use weldsim_core::geometry::MeshGeometry;
use weldsim_core::mechanical::MechanicalSolver;
use weldsim_core::metallurgy::MetallurgyHistory;
use weldsim_core::{
    ElementType, Error, Material, MaterialLibrary, Mesh, Point3, PropertyCurve, PropertyKind,
    TemperatureHistory,
};

const L: f64 = 0.1;
const ALPHA: f64 = 12e-6;
const E: f64 = 200e9;
const NU: f64 = 0.3;

fn library() -> MaterialLibrary {
    let material = Material::constant(40.0, 500.0, 8000.0, E, NU, 250e6, ALPHA)
        .with_curve(PropertyKind::YieldStress, PropertyCurve::constant(1e10));
    MaterialLibrary::single(0, material).unwrap()
}

fn cube(element_type: ElementType) -> Mesh {
    Mesh::structured_box(Point3::zeros(), [L; 3], [2, 2, 2], element_type, 0).unwrap()
}

/// Node id on a 2x2x2 grid.
fn node(i: usize, j: usize, k: usize) -> usize {
    i + 3 * (j + 3 * k)
}

/// Supports removing the six rigid-body modes without restraining expansion.
fn three_two_one() -> Vec<ClampSpec> {
    vec![
        ClampSpec::fixed(vec![node(0, 0, 0)], [true, true, true]),
        ClampSpec::fixed(vec![node(2, 0, 0)], [false, true, true]),
        ClampSpec::fixed(vec![node(0, 2, 0)], [false, false, true]),
    ]
}

fn uniform_history(times: &[f64], temperatures: &[f64], n_nodes: usize) -> TemperatureHistory {
    TemperatureHistory::from_frames(
        times.to_vec(),
        temperatures.iter().map(|&t| vec![t; n_nodes]).collect(),
    )
    .unwrap()
}

fn pool() -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
}

#[test]
fn test_free_thermal_expansion_is_stress_free() {
    for element_type in [ElementType::Hex8, ElementType::Tet4] {
        let mesh = cube(element_type);
        let geometry = MeshGeometry::build(&mesh).unwrap();
        let materials = library();
        let config = SolverConfig {
            clamps: three_two_one(),
            ..SolverConfig::default()
        };
        let thermal = uniform_history(&[0.0, 1.0], &[20.0, 200.0], mesh.n_nodes());
        let metallurgy = MetallurgyHistory::untransformed(thermal.times(), mesh.n_nodes());
        let pool = pool();

        let mut solver =
            MechanicalSolver::new(&mesh, &geometry, &materials, &config, &pool, &thermal, &metallurgy)
                .unwrap();
        assert_eq!(solver.load_frames(), vec![1]);
        let record = solver.solve_frame(1).unwrap();
        assert_eq!(record.cutbacks, 0);

        // ε = α ΔT = 2.16e-3, so the far corner moves 0.216 mm along each axis
        let strain = ALPHA * 180.0;
        assert_relative_eq!(strain, 2.16e-3, max_relative = 1e-12);
        let corner = node(2, 2, 2);
        let u = solver.displacement();
        for axis in 0..3 {
            assert_relative_eq!(u[3 * corner + axis], strain * L, max_relative = 1e-8);
        }
        assert_relative_eq!(strain * L, 0.216e-3, max_relative = 1e-12);

        let output = solver.output();
        let max_vm = output.von_mises.iter().copied().fold(0.0, f64::max);
        assert!(max_vm < 1e3, "{:?}: residual stress {} Pa", element_type, max_vm);
        assert!(output.equivalent_plastic_strain.iter().all(|&p| p == 0.0));
    }
}

#[test]
fn test_fully_restrained_block_is_hydrostatic() {
    let mesh = cube(ElementType::Hex8);
    let geometry = MeshGeometry::build(&mesh).unwrap();
    let materials = library();
    let config = SolverConfig {
        clamps: vec![ClampSpec::fixed((0..mesh.n_nodes()).collect(), [true; 3])],
        ..SolverConfig::default()
    };
    let thermal = uniform_history(&[0.0, 1.0], &[20.0, 200.0], mesh.n_nodes());
    let metallurgy = MetallurgyHistory::untransformed(thermal.times(), mesh.n_nodes());
    let pool = pool();

    let mut solver =
        MechanicalSolver::new(&mesh, &geometry, &materials, &config, &pool, &thermal, &metallurgy)
            .unwrap();
    solver.solve_frame(1).unwrap();

    let expected = -E / (1.0 - 2.0 * NU) * ALPHA * 180.0;
    for stress in solver.output().stress {
        for axis in 0..3 {
            assert_relative_eq!(stress.0[axis], expected, max_relative = 1e-10);
        }
        assert!(stress.von_mises() < 1.0);
    }
}

#[test]
fn test_clamp_release_relaxes_stress() {
    let mesh = cube(ElementType::Hex8);
    let geometry = MeshGeometry::build(&mesh).unwrap();
    let materials = library();
    let face = |x: f64| NodeSelection::Region {
        min: [x, 0.0, 0.0],
        max: [x, L, L],
        tolerance: 1e-9,
    };
    let far_face = (0..3)
        .flat_map(|k| (0..3).map(move |j| node(2, j, k)))
        .collect();
    let config = SolverConfig {
        clamps: vec![
            ClampSpec {
                kind: ClampKind::Fixed,
                selection: face(0.0),
                dofs: [true, false, false],
                release_time: None,
            },
            ClampSpec::fixed(vec![node(0, 0, 0)], [false, true, true]),
            ClampSpec::fixed(vec![node(0, 2, 0)], [false, false, true]),
            ClampSpec::fixed(far_face, [true, false, false]).released_at(1.5),
        ],
        ..SolverConfig::default()
    };
    let thermal = uniform_history(&[0.0, 1.0, 2.0], &[20.0, 200.0, 200.0], mesh.n_nodes());
    let metallurgy = MetallurgyHistory::untransformed(thermal.times(), mesh.n_nodes());
    let pool = pool();

    let mut solver =
        MechanicalSolver::new(&mesh, &geometry, &materials, &config, &pool, &thermal, &metallurgy)
            .unwrap();

    // Held between two walls: uniaxial compression σ_xx = -E α ΔT
    solver.solve_frame(1).unwrap();
    for stress in solver.output().stress {
        assert_relative_eq!(stress.0[0], -E * ALPHA * 180.0, max_relative = 1e-8);
        assert!(stress.0[1].abs() < 1e3 && stress.0[2].abs() < 1e3);
    }

    // Wall removed: free expansion along x
    solver.solve_frame(2).unwrap();
    let u = solver.displacement();
    assert_relative_eq!(u[3 * node(2, 1, 1)], ALPHA * 180.0 * L, max_relative = 1e-8);
    let max_vm = solver.output().von_mises.iter().copied().fold(0.0, f64::max);
    assert!(max_vm < 1e3);
}

#[test]
fn test_springs_share_load_with_the_part() {
    let mesh = cube(ElementType::Hex8);
    let geometry = MeshGeometry::build(&mesh).unwrap();
    let materials = library();
    let mut clamps = three_two_one();
    clamps.push(ClampSpec {
        kind: ClampKind::Spring { stiffness: 1e8 },
        selection: NodeSelection::Region {
            min: [L, 0.0, 0.0],
            max: [L, L, L],
            tolerance: 1e-9,
        },
        dofs: [true, false, false],
        release_time: None,
    });
    let config = SolverConfig {
        clamps,
        ..SolverConfig::default()
    };
    let thermal = uniform_history(&[0.0, 1.0], &[20.0, 200.0], mesh.n_nodes());
    let metallurgy = MetallurgyHistory::untransformed(thermal.times(), mesh.n_nodes());
    let pool = pool();

    let mut solver =
        MechanicalSolver::new(&mesh, &geometry, &materials, &config, &pool, &thermal, &metallurgy)
            .unwrap();
    solver.solve_frame(1).unwrap();

    // The springs hold the x = L face back, so it moves less than in free expansion
    let u_face = solver.displacement()[3 * node(2, 1, 1)];
    assert!(u_face > 0.0);
    assert!(u_face < ALPHA * 180.0 * L);
    let max_vm = solver.output().von_mises.iter().copied().fold(0.0, f64::max);
    assert!(max_vm > 1e3);
}

#[test]
fn test_newton_failure_reports_mechanical_divergence() {
    let mesh = cube(ElementType::Hex8);
    let geometry = MeshGeometry::build(&mesh).unwrap();
    let soft = Material::constant(40.0, 500.0, 8000.0, E, NU, 1e6, ALPHA);
    let materials = MaterialLibrary::single(0, soft).unwrap();
    let mut config = SolverConfig {
        clamps: three_two_one(),
        ..SolverConfig::default()
    };
    config.mechanical.max_iterations = 1;
    config.mechanical.max_bisections = 1;

    // A non-linear profile is incompatible, so the soft block yields
    let heated: Vec<f64> = mesh
        .nodes()
        .iter()
        .map(|p| 20.0 + 60000.0 * p[0] * p[0])
        .collect();
    let thermal = TemperatureHistory::from_frames(
        vec![0.0, 1.0],
        vec![vec![20.0; mesh.n_nodes()], heated],
    )
    .unwrap();
    let metallurgy = MetallurgyHistory::untransformed(thermal.times(), mesh.n_nodes());
    let pool = pool();

    let mut solver =
        MechanicalSolver::new(&mesh, &geometry, &materials, &config, &pool, &thermal, &metallurgy)
            .unwrap();
    let err = solver.solve_frame(1).unwrap_err();
    assert!(matches!(err, Error::MechanicalDivergence { .. }), "{}", err);
    assert!(err.to_string().contains("1 load bisections"));
}
