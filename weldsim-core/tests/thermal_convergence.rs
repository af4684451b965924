//! Thermal solver against closed-form solutions.

use approx::assert_relative_eq;
use weldsim_core::config::SolverConfig;
use weldsim_core::geometry::MeshGeometry;
use weldsim_core::thermal::ThermalSolver;
use weldsim_core::{ElementType, HeatSource, Material, MaterialLibrary, Mesh, Point3};

const K: f64 = 40.0;
const RHO_CP: f64 = 8000.0 * 500.0;

struct Off;

impl HeatSource for Off {
    fn flux_at(&self, _point: &Point3, _time: f64) -> f64 {
        0.0
    }

    fn active_until(&self) -> f64 {
        -1.0
    }
}

fn library() -> MaterialLibrary {
    MaterialLibrary::single(0, Material::constant(K, 500.0, 8000.0, 200e9, 0.3, 300e6, 12e-6))
        .unwrap()
}

fn insulated(end_time: f64, time_step: f64) -> SolverConfig {
    let mut config = SolverConfig::default();
    config.boundary.convection_coefficient = 0.0;
    config.boundary.emissivity = 0.0;
    config.cooling_end_temp = -273.0;
    config.end_time = end_time;
    config.thermal.time_step = time_step;
    config
}

fn pool() -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
}

/// Max nodal error of a decaying cosine mode on a bar of `n` elements.
fn cosine_mode_error(n: usize) -> f64 {
    let length = 0.1;
    let amplitude = 100.0;
    let end_time = 5.0;
    let mesh = Mesh::structured_box(
        Point3::zeros(),
        [length, 0.01, 0.01],
        [n, 1, 1],
        ElementType::Hex8,
        0,
    )
    .unwrap();
    let geometry = MeshGeometry::build(&mesh).unwrap();
    let materials = library();
    let config = insulated(end_time, 0.05);
    let pool = pool();
    let wave = std::f64::consts::PI / length;

    let mut solver = ThermalSolver::new(&mesh, &geometry, &materials, &Off, &config, &pool).unwrap();
    let initial = mesh
        .nodes()
        .iter()
        .map(|p| 300.0 + amplitude * (wave * p[0]).cos())
        .collect();
    solver.set_initial_temperatures(initial).unwrap();
    while !solver.is_finished() {
        solver.step().unwrap();
    }

    let decay = (-K / RHO_CP * wave * wave * solver.time()).exp();
    mesh.nodes()
        .iter()
        .zip(solver.history().last())
        .map(|(p, t)| (t - (300.0 + amplitude * decay * (wave * p[0]).cos())).abs())
        .fold(0.0, f64::max)
}

#[test]
fn test_refinement_reduces_error() {
    let errors: Vec<f64> = [4, 8, 16].iter().map(|&n| cosine_mode_error(n)).collect();
    // Linear elements converge at second order in h
    assert!(errors[1] < errors[0] / 3.0, "errors {:?}", errors);
    assert!(errors[2] < errors[1] / 3.0, "errors {:?}", errors);
    assert!(errors[2] < 0.5, "errors {:?}", errors);
}

#[test]
fn test_newton_cooling_of_a_cube() {
    let side = 0.01;
    let h = 100.0;
    let mesh = Mesh::structured_box(Point3::zeros(), [side; 3], [1, 1, 1], ElementType::Hex8, 0)
        .unwrap();
    let geometry = MeshGeometry::build(&mesh).unwrap();
    let materials = library();
    let mut config = insulated(10.0, 1.0);
    config.boundary.convection_coefficient = h;
    config.boundary.ambient_temperature = 20.0;
    config.initial_temperature = 520.0;
    let pool = pool();

    let mut solver = ThermalSolver::new(&mesh, &geometry, &materials, &Off, &config, &pool).unwrap();
    while !solver.is_finished() {
        solver.step().unwrap();
    }

    // Crank–Nicolson amplification of dθ/dt = -a θ
    let a = h * 6.0 * side * side / (RHO_CP * side.powi(3));
    let factor = (1.0 - 0.5 * a) / (1.0 + 0.5 * a);
    let history = solver.history();
    assert_eq!(history.n_frames(), 11);
    for step in 0..history.n_frames() {
        let expected = 20.0 + 500.0 * factor.powi(step as i32);
        for &t in history.temperatures(step) {
            assert_relative_eq!(t, expected, max_relative = 1e-9);
        }
    }
}

#[test]
fn test_radiation_cools_faster_than_convection_alone() {
    let mesh = Mesh::structured_box(Point3::zeros(), [0.01; 3], [1, 1, 1], ElementType::Hex8, 0)
        .unwrap();
    let geometry = MeshGeometry::build(&mesh).unwrap();
    let materials = library();
    let pool = pool();

    let final_temperature = |emissivity: f64| {
        let mut config = insulated(5.0, 0.5);
        config.boundary.convection_coefficient = 10.0;
        config.boundary.emissivity = emissivity;
        config.initial_temperature = 1000.0;
        let mut solver =
            ThermalSolver::new(&mesh, &geometry, &materials, &Off, &config, &pool).unwrap();
        while !solver.is_finished() {
            solver.step().unwrap();
        }
        solver.history().last()[0]
    };

    let convective = final_temperature(0.0);
    let radiative = final_temperature(0.8);
    assert!(convective < 1000.0);
    assert!(radiative < convective - 1.0);
}
