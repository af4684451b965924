//! Transient nonlinear heat conduction.
//!
//! Galerkin finite elements in space and Crank–Nicolson in time:
//!
//! ```text
//! (C + Δt/2·K) Tⁿ⁺¹ = (C − Δt/2·K) Tⁿ + Δt·Fⁿ⁺½
//! ```
//!
//! C and K are reassembled every step from temperature-dependent properties.
//! Within a step, a Picard iteration evaluates the properties at the mid-step
//! temperature (Tⁿ + T*)/2 and the linearized radiation coefficient at the
//! latest iterate T*. A step that produces non-finite temperatures, exceeds the
//! overflow guard, fails to factor or does not converge is retried with half
//! the timestep; the configured timestep is used again for the next step.

use crate::assembly::{element_chunks, parallel_assemble, WorkerBuffer};
use crate::config::{CapacityScheme, SolverConfig};
use crate::element::MAX_NODES;
use crate::error::{Error, Result};
use crate::geometry::MeshGeometry;
use crate::heat_source::HeatSource;
use crate::material::{Material, MaterialLibrary};
use crate::mesh::Mesh;
use crate::results::{ConvergenceRecord, Stage};
use crate::solver::LinearSolver;
use crate::sparse::DofPattern;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rayon::ThreadPool;
use std::ops::Range;

/// Stefan–Boltzmann constant (W/m²·K⁴).
pub const STEFAN_BOLTZMANN: f64 = 5.670374419e-8;

/// Offset between °C and K.
pub const KELVIN_OFFSET: f64 = 273.15;

/// Nodal temperatures at every accepted thermal step.
///
/// Frame 0 is the initial condition. The history only grows while the thermal
/// solver runs and is read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureHistory {
    times: Vec<f64>,
    frames: Vec<Vec<f64>>,
    peak: Vec<f64>,
}

impl TemperatureHistory {
    /// History holding only the initial condition.
    pub fn new(start_time: f64, initial: Vec<f64>) -> Self {
        Self {
            times: vec![start_time],
            peak: initial.clone(),
            frames: vec![initial],
        }
    }

    /// Build a history from prescribed frames (e.g. measured or analytic traces).
    pub fn from_frames(times: Vec<f64>, frames: Vec<Vec<f64>>) -> Result<Self> {
        if times.is_empty() || times.len() != frames.len() {
            return Err(Error::InvalidState(format!(
                "history needs one frame per time ({} times, {} frames)",
                times.len(),
                frames.len()
            )));
        }
        let n_nodes = frames[0].len();
        if frames.iter().any(|f| f.len() != n_nodes) {
            return Err(Error::InvalidState(
                "history frames differ in node count".into(),
            ));
        }
        let mut frames = frames.into_iter();
        let first = frames.next().unwrap_or_default();
        let mut history = Self::new(times[0], first);
        for (time, frame) in times[1..].iter().zip(frames) {
            history.push(*time, frame);
        }
        Ok(history)
    }

    pub(crate) fn push(&mut self, time: f64, temperatures: Vec<f64>) {
        for (p, &t) in self.peak.iter_mut().zip(temperatures.iter()) {
            if t > *p {
                *p = t;
            }
        }
        self.times.push(time);
        self.frames.push(temperatures);
    }

    /// Number of frames (accepted steps plus the initial condition).
    pub fn n_frames(&self) -> usize {
        self.frames.len()
    }

    /// Number of nodes per frame.
    pub fn n_nodes(&self) -> usize {
        self.frames.first().map_or(0, |f| f.len())
    }

    /// Frame times.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Nodal temperatures of one frame.
    pub fn temperatures(&self, frame: usize) -> &[f64] {
        &self.frames[frame]
    }

    /// Most recent frame.
    pub fn last(&self) -> &[f64] {
        &self.frames[self.frames.len() - 1]
    }

    /// Highest temperature reached by each node.
    pub fn peak_temperatures(&self) -> &[f64] {
        &self.peak
    }

    /// Temperature of one node in every frame.
    pub fn node_trace(&self, node: usize) -> impl Iterator<Item = f64> + '_ {
        self.frames.iter().map(move |f| f[node])
    }
}

/// Converged result of one attempted step.
struct StepSolution {
    temperatures: Vec<f64>,
    iterations: usize,
    change: f64,
    source_power: f64,
}

/// Crank–Nicolson heat-conduction solver driven one step at a time.
pub struct ThermalSolver<'a> {
    mesh: &'a Mesh,
    geometry: &'a MeshGeometry,
    source: &'a dyn HeatSource,
    config: &'a SolverConfig,
    pool: &'a ThreadPool,
    element_materials: Vec<&'a Material>,
    pattern: DofPattern,
    chunks: Vec<Range<usize>>,
    solver: LinearSolver,
    history: TemperatureHistory,
    time: f64,
    step: usize,
    energy_input: f64,
    cooled: bool,
}

impl<'a> ThermalSolver<'a> {
    /// Prepare the solver: resolve materials, build the sparsity pattern and
    /// set the uniform initial temperature.
    pub fn new(
        mesh: &'a Mesh,
        geometry: &'a MeshGeometry,
        materials: &'a MaterialLibrary,
        source: &'a dyn HeatSource,
        config: &'a SolverConfig,
        pool: &'a ThreadPool,
    ) -> Result<Self> {
        let element_materials = mesh
            .elements()
            .iter()
            .map(|e| materials.get(e.tag))
            .collect::<Result<Vec<_>>>()?;

        let pattern = DofPattern::build(mesh, 1)?;
        let chunks = element_chunks(mesh.n_elements(), pool.current_num_threads());
        let initial = vec![config.initial_temperature; mesh.n_nodes()];

        info!(
            "thermal: {} nodes, {} elements, {} nonzeros, {} chunks",
            mesh.n_nodes(),
            mesh.n_elements(),
            pattern.nnz(),
            chunks.len()
        );

        Ok(Self {
            mesh,
            geometry,
            source,
            config,
            pool,
            element_materials,
            pattern,
            chunks,
            solver: LinearSolver::new(config.linear_solver),
            history: TemperatureHistory::new(0.0, initial),
            time: 0.0,
            step: 0,
            energy_input: 0.0,
            cooled: false,
        })
    }

    /// Replace the uniform initial temperature by a nodal field.
    ///
    /// Only allowed before the first step.
    pub fn set_initial_temperatures(&mut self, temperatures: Vec<f64>) -> Result<()> {
        if self.step > 0 {
            return Err(Error::InvalidState(
                "initial temperatures can only be set before the first step".into(),
            ));
        }
        if temperatures.len() != self.mesh.n_nodes() || temperatures.iter().any(|t| !t.is_finite()) {
            return Err(Error::Config(format!(
                "initial field needs {} finite nodal temperatures",
                self.mesh.n_nodes()
            )));
        }
        self.history = TemperatureHistory::new(self.time, temperatures);
        Ok(())
    }

    /// Current simulation time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Number of accepted steps.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Heat deposited by the source so far (J), as seen by the discrete load vector.
    pub fn energy_input(&self) -> f64 {
        self.energy_input
    }

    /// History recorded so far.
    pub fn history(&self) -> &TemperatureHistory {
        &self.history
    }

    /// Consume the solver, returning the finalized history.
    pub fn into_history(self) -> TemperatureHistory {
        self.history
    }

    /// True once the end time is reached or the part has cooled down after
    /// the source switched off.
    pub fn is_finished(&self) -> bool {
        self.cooled || self.time >= self.config.end_time - 1e-9 * self.config.thermal.time_step
    }

    /// Advance one step, halving the timestep on divergence.
    pub fn step(&mut self) -> Result<ConvergenceRecord> {
        let nominal = self
            .config
            .thermal
            .time_step
            .min(self.config.end_time - self.time);
        let mut dt = nominal;
        let mut cutbacks = 0;

        loop {
            match self.try_step(dt) {
                Ok(solution) => {
                    self.time += dt;
                    self.step += 1;
                    self.energy_input += dt * solution.source_power;

                    let max_t = solution
                        .temperatures
                        .iter()
                        .copied()
                        .fold(f64::NEG_INFINITY, f64::max);
                    if !self.source.is_active(self.time) && max_t < self.config.cooling_end_temp {
                        info!(
                            "thermal: cooled below {} °C at t = {:.3} s",
                            self.config.cooling_end_temp, self.time
                        );
                        self.cooled = true;
                    }

                    debug!(
                        "thermal step {}: t = {:.4} s, dt = {:.3e}, {} iterations, max T = {:.1}",
                        self.step, self.time, dt, solution.iterations, max_t
                    );

                    self.history.push(self.time, solution.temperatures);
                    return Ok(ConvergenceRecord {
                        stage: Stage::Thermal,
                        step: self.step,
                        time: self.time,
                        time_step: dt,
                        iterations: solution.iterations,
                        residual: solution.change,
                        cutbacks,
                    });
                }
                Err(e) if is_recoverable(&e) && cutbacks < self.config.thermal.max_retries => {
                    cutbacks += 1;
                    warn!(
                        "thermal step at t = {:.4} s failed ({}); halving dt to {:.3e}",
                        self.time,
                        e,
                        dt * 0.5
                    );
                    dt *= 0.5;
                }
                Err(e) if is_recoverable(&e) => {
                    return Err(Error::ThermalDivergence {
                        time: self.time,
                        reason: format!("{} after {} timestep reductions", e, cutbacks),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One Picard-iterated Crank–Nicolson step of size `dt`.
    fn try_step(&mut self, dt: f64) -> Result<StepSolution> {
        let previous = self.history.last().to_vec();
        let mut iterate = previous.clone();
        let t_mid = self.time + 0.5 * dt;
        let config: &'a SolverConfig = self.config;
        let thermal = &config.thermal;
        let mut change = f64::INFINITY;

        for iteration in 1..=thermal.max_iterations {
            let (matrix, rhs, source_power) = self.assemble(&previous, &iterate, dt, t_mid)?;
            let csr = self.pattern.to_csr(matrix)?;
            let next = self.solver.solve(&csr, &rhs)?;

            if let Some(bad) = next
                .iter()
                .position(|t| !t.is_finite() || t.abs() > thermal.max_temperature)
            {
                return Err(Error::ThermalDivergence {
                    time: self.time + dt,
                    reason: format!("temperature overflow at node {} ({})", bad, next[bad]),
                });
            }

            change = next
                .iter()
                .zip(iterate.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            iterate = next;

            if change < thermal.tolerance {
                return Ok(StepSolution {
                    temperatures: iterate,
                    iterations: iteration,
                    change,
                    source_power,
                });
            }
        }

        Err(Error::ThermalDivergence {
            time: self.time + dt,
            reason: format!(
                "Picard iteration did not converge in {} iterations (last change {:.3e} K)",
                thermal.max_iterations, change
            ),
        })
    }

    /// Assemble the Crank–Nicolson system for the given iterate.
    ///
    /// Returns the matrix values on the pattern, the right-hand side and the
    /// total source power Σ F.
    fn assemble(
        &self,
        previous: &[f64],
        iterate: &[f64],
        dt: f64,
        t_mid: f64,
    ) -> Result<(Vec<f64>, Vec<f64>, f64)> {
        let kernel = ElementKernel {
            mesh: self.mesh,
            geometry: self.geometry,
            source: self.source,
            materials: &self.element_materials,
            pattern: &self.pattern,
            capacity: self.config.thermal.capacity,
        };
        let states = vec![(); self.chunks.len()];
        let WorkerBuffer {
            mut matrix,
            mut vectors,
        } = parallel_assemble(
            self.pool,
            &self.pattern,
            &self.chunks,
            states,
            2,
            |range, _, buffer| {
                for e in range {
                    kernel.assemble(e, previous, iterate, dt, t_mid, buffer);
                }
                Ok(())
            },
        )?;

        let source_power: f64 = vectors[1].as_slice().iter().sum();
        let rhs = vectors.swap_remove(0);
        let mut rhs = rhs.into_vec();

        // Convection and linearized radiation on lumped boundary areas
        let boundary = &self.config.boundary;
        let ambient = boundary.ambient_temperature;
        let ambient_k = ambient + KELVIN_OFFSET;
        for (node, &area) in self.geometry.boundary_areas().iter().enumerate() {
            if area <= 0.0 {
                continue;
            }
            let t_k = iterate[node] + KELVIN_OFFSET;
            let h_rad = boundary.emissivity
                * STEFAN_BOLTZMANN
                * (t_k * t_k + ambient_k * ambient_k)
                * (t_k + ambient_k);
            let ha = (boundary.convection_coefficient + h_rad) * area;

            matrix[self.pattern.diagonal_position(node)] += 0.5 * dt * ha;
            rhs[node] += dt * ha * ambient - 0.5 * dt * ha * previous[node];
        }

        Ok((matrix, rhs, source_power))
    }
}

/// Read-only data one worker needs to integrate an element.
struct ElementKernel<'s> {
    mesh: &'s Mesh,
    geometry: &'s MeshGeometry,
    source: &'s dyn HeatSource,
    materials: &'s [&'s Material],
    pattern: &'s DofPattern,
    capacity: CapacityScheme,
}

impl ElementKernel<'_> {
    fn assemble(
        &self,
        e: usize,
        previous: &[f64],
        iterate: &[f64],
        dt: f64,
        t_mid: f64,
        buffer: &mut WorkerBuffer,
    ) {
        let nodes = &self.mesh.elements()[e].nodes;
        let n = nodes.len();
        let material = self.materials[e];

        let mut t_old = [0.0; MAX_NODES];
        let mut t_mid_nodal = [0.0; MAX_NODES];
        for (i, &node) in nodes.iter().enumerate() {
            t_old[i] = previous[node];
            t_mid_nodal[i] = 0.5 * (previous[node] + iterate[node]);
        }

        let mut conductivity = DMatrix::zeros(n, n);
        for ip in self.geometry.stiffness_points(e) {
            let t = ip.interpolate(&t_mid_nodal[..n]);
            let kw = material.conductivity.value(t) * ip.weight;
            for i in 0..n {
                for j in 0..n {
                    conductivity[(i, j)] += kw * ip.gradients[i].dot(&ip.gradients[j]);
                }
            }
        }

        let mut capacity = DMatrix::zeros(n, n);
        let mut load = vec![0.0; n];
        for ip in self.geometry.capacity_points(e) {
            let t = ip.interpolate(&t_mid_nodal[..n]);
            let rc = material.density.value(t) * material.specific_heat.value(t) * ip.weight;
            let q = self.source.flux_at(&ip.position, t_mid) * ip.weight;
            for i in 0..n {
                load[i] += q * ip.shape[i];
                for j in 0..n {
                    capacity[(i, j)] += rc * ip.shape[i] * ip.shape[j];
                }
            }
        }

        if self.capacity == CapacityScheme::Lumped {
            for i in 0..n {
                let row_sum: f64 = capacity.row(i).sum();
                capacity.row_mut(i).fill(0.0);
                capacity[(i, i)] = row_sum;
            }
        }

        let half = 0.5 * dt;
        let lhs = &capacity + &conductivity * half;
        let explicit = &capacity - &conductivity * half;
        let t_old = DVector::from_column_slice(&t_old[..n]);
        let mut rhs = explicit * t_old;
        for i in 0..n {
            rhs[i] += dt * load[i];
        }

        buffer.add_element_matrix(self.pattern.element_positions(e), &lhs);
        buffer.add_element_vector(0, nodes, rhs.as_slice());
        buffer.add_element_vector(1, nodes, &load);
    }
}

fn is_recoverable(e: &Error) -> bool {
    matches!(
        e,
        Error::ThermalDivergence { .. } | Error::SingularMatrix(_) | Error::Solver(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heat_source::{GoldakSource, HeatSourceSpec, WeldPath};
    use crate::mesh::ElementType;
    use crate::types::Point3;
    use approx::assert_relative_eq;

    /// Spatially uniform volumetric source active until `until`.
    struct UniformSource {
        q: f64,
        until: f64,
    }

    impl HeatSource for UniformSource {
        fn flux_at(&self, _point: &Point3, time: f64) -> f64 {
            if time <= self.until {
                self.q
            } else {
                0.0
            }
        }

        fn active_until(&self) -> f64 {
            self.until
        }
    }

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn insulated(config: &mut SolverConfig) {
        config.boundary.convection_coefficient = 0.0;
        config.boundary.emissivity = 0.0;
    }

    fn library() -> MaterialLibrary {
        MaterialLibrary::single(
            0,
            Material::constant(40.0, 500.0, 8000.0, 200e9, 0.3, 300e6, 12e-6),
        )
        .unwrap()
    }

    #[test]
    fn test_uniform_heating_of_insulated_block() {
        let mesh = Mesh::structured_box(
            Point3::zeros(),
            [0.02, 0.02, 0.02],
            [2, 2, 2],
            ElementType::Hex8,
            0,
        )
        .unwrap();
        let geometry = MeshGeometry::build(&mesh).unwrap();
        let materials = library();
        let source = UniformSource { q: 4.0e7, until: 1e9 };
        let mut config = SolverConfig::default();
        insulated(&mut config);
        config.end_time = 2.0;
        config.thermal.time_step = 0.5;
        let pool = pool();

        let mut solver =
            ThermalSolver::new(&mesh, &geometry, &materials, &source, &config, &pool).unwrap();
        while !solver.is_finished() {
            solver.step().unwrap();
        }

        // dT/dt = q / (ρ cp) = 10 K/s
        let history = solver.into_history();
        assert_eq!(history.n_frames(), 5);
        for &t in history.last() {
            assert_relative_eq!(t, 40.0, epsilon = 1e-8);
        }
        assert_relative_eq!(history.peak_temperatures()[0], 40.0, epsilon = 1e-8);
    }

    #[test]
    fn test_lumped_capacity_matches_consistent_for_uniform_field() {
        let mesh = Mesh::structured_box(
            Point3::zeros(),
            [0.01, 0.01, 0.01],
            [1, 1, 1],
            ElementType::Tet4,
            0,
        )
        .unwrap();
        let geometry = MeshGeometry::build(&mesh).unwrap();
        let materials = library();
        let source = UniformSource { q: 4.0e7, until: 1e9 };
        let mut config = SolverConfig::default();
        insulated(&mut config);
        config.end_time = 1.0;
        config.thermal.capacity = CapacityScheme::Lumped;
        let pool = pool();

        let mut solver =
            ThermalSolver::new(&mesh, &geometry, &materials, &source, &config, &pool).unwrap();
        while !solver.is_finished() {
            solver.step().unwrap();
        }
        for &t in solver.history().last() {
            assert_relative_eq!(t, 30.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_cooling_stops_early() {
        let mesh = Mesh::structured_box(
            Point3::zeros(),
            [0.01, 0.01, 0.01],
            [1, 1, 1],
            ElementType::Hex8,
            0,
        )
        .unwrap();
        let geometry = MeshGeometry::build(&mesh).unwrap();
        let materials = library();
        let source = UniformSource { q: 0.0, until: -1.0 };
        let mut config = SolverConfig::default();
        config.initial_temperature = 600.0;
        config.cooling_end_temp = 590.0;
        config.boundary.convection_coefficient = 500.0;
        config.end_time = 1.0e4;
        config.thermal.time_step = 1.0;
        let pool = pool();

        let mut solver =
            ThermalSolver::new(&mesh, &geometry, &materials, &source, &config, &pool).unwrap();
        while !solver.is_finished() {
            solver.step().unwrap();
        }
        assert!(solver.time() < 100.0);
        assert!(solver.history().last().iter().all(|&t| t < 590.0));
    }

    #[test]
    fn test_runaway_source_diverges_after_retries() {
        let mesh = Mesh::structured_box(
            Point3::zeros(),
            [0.01, 0.01, 0.01],
            [1, 1, 1],
            ElementType::Hex8,
            0,
        )
        .unwrap();
        let geometry = MeshGeometry::build(&mesh).unwrap();
        let materials = library();
        let source = UniformSource { q: 1.0e30, until: 1e9 };
        let mut config = SolverConfig::default();
        config.thermal.max_retries = 3;
        let pool = pool();

        let mut solver =
            ThermalSolver::new(&mesh, &geometry, &materials, &source, &config, &pool).unwrap();
        let err = solver.step().unwrap_err();
        assert!(matches!(err, Error::ThermalDivergence { .. }), "{}", err);
        assert!(err.to_string().contains("3 timestep reductions"));
        assert_eq!(solver.steps(), 0);
        assert_eq!(solver.history().n_frames(), 1);
    }

    #[test]
    fn test_discrete_energy_balance_with_moving_source() {
        let mesh = Mesh::structured_box(
            Point3::new(0.0, -0.01, -0.005),
            [0.04, 0.02, 0.005],
            [8, 4, 2],
            ElementType::Hex8,
            0,
        )
        .unwrap();
        let geometry = MeshGeometry::build(&mesh).unwrap();
        let materials = library();
        let source = GoldakSource::new(HeatSourceSpec {
            voltage: 20.0,
            current: 100.0,
            efficiency: 0.8,
            travel_speed: 0.01,
            front_length: 0.003,
            rear_length: 0.006,
            half_width: 0.003,
            depth: 0.002,
            front_fraction: None,
            rear_fraction: None,
            path: WeldPath::straight([0.01, 0.0, 0.0], [0.03, 0.0, 0.0]),
            start_time: 0.0,
            depth_direction: [0.0, 0.0, -1.0],
            corner_blend: None,
        })
        .unwrap();
        let mut config = SolverConfig::default();
        insulated(&mut config);
        config.end_time = 2.0;
        config.thermal.time_step = 0.1;
        let pool = pool();

        let mut solver =
            ThermalSolver::new(&mesh, &geometry, &materials, &source, &config, &pool).unwrap();
        while !solver.is_finished() {
            solver.step().unwrap();
        }

        // Stored heat: Σ m_j (T_j − T0) with m_j = ∫ ρ cp N_j dV
        let rho_cp = 8000.0 * 500.0;
        let mut nodal_capacity = vec![0.0; mesh.n_nodes()];
        for e in 0..mesh.n_elements() {
            for ip in geometry.capacity_points(e) {
                for (i, &node) in mesh.elements()[e].nodes.iter().enumerate() {
                    nodal_capacity[node] += rho_cp * ip.shape[i] * ip.weight;
                }
            }
        }
        let stored: f64 = solver
            .history()
            .last()
            .iter()
            .zip(nodal_capacity.iter())
            .map(|(t, m)| m * (t - 20.0))
            .sum();

        assert!(solver.energy_input() > 0.0);
        assert_relative_eq!(stored, solver.energy_input(), max_relative = 1e-6);
    }

    #[test]
    fn test_history_from_frames_tracks_peaks() {
        let history = TemperatureHistory::from_frames(
            vec![0.0, 1.0, 2.0],
            vec![vec![20.0, 20.0], vec![900.0, 300.0], vec![400.0, 350.0]],
        )
        .unwrap();
        assert_eq!(history.peak_temperatures(), &[900.0, 350.0]);
        assert_eq!(history.node_trace(1).collect::<Vec<_>>(), vec![20.0, 300.0, 350.0]);
        assert!(TemperatureHistory::from_frames(vec![0.0], vec![]).is_err());
    }
}
