//! Quasi-static thermo-elasto-plastic analysis.
//!
//! Total strain is split additively,
//!
//! ```text
//! ε = ε_e + ε_p + ε_th + ε_tr + ε_tp
//! ```
//!
//! with the thermal strain α(T)(T − T_ref) and the transformation strain
//! ε_v/3 acting on the normal components, and ε_tp the accumulated
//! transformation plasticity. Plasticity is J2 with linear isotropic hardening,
//! integrated by radial return; Newton–Raphson uses the consistent tangent.
//!
//! Each solved thermal frame is one load step. A step that fails to converge
//! is bisected: nodal temperatures and metallurgical fields are interpolated
//! between the last converged frame and the target frame.

use crate::assembly::{element_chunks, parallel_assemble, WorkerBuffer};
use crate::config::{ClampKind, ClampSpec, NodeSelection, SolverConfig};
use crate::element::{strain_displacement, MAX_NODES};
use crate::error::{Error, Result};
use crate::geometry::MeshGeometry;
use crate::material::{Material, MaterialLibrary};
use crate::mesh::Mesh;
use crate::metallurgy::{MetallurgyHistory, Phase};
use crate::results::{ConvergenceRecord, Stage};
use crate::solver::LinearSolver;
use crate::sparse::{element_dofs, DofPattern, RestrictedPattern};
use crate::thermal::TemperatureHistory;
use crate::types::{isotropic_constitutive, ConstitutiveMatrix, Point3, StrainTensor, StressTensor};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Matrix6, Vector6};
use rayon::ThreadPool;
use std::ops::Range;

/// History variables at one integration point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussPointState {
    pub stress: StressTensor,
    pub plastic_strain: StrainTensor,
    /// Accumulated equivalent plastic strain ε̄p.
    pub equivalent_plastic_strain: f64,
    /// Accumulated transformation plasticity strain.
    pub trip_strain: StrainTensor,
}

impl Default for GaussPointState {
    fn default() -> Self {
        Self {
            stress: StressTensor::zero(),
            plastic_strain: StrainTensor::zero(),
            equivalent_plastic_strain: 0.0,
            trip_strain: StrainTensor::zero(),
        }
    }
}

/// Committed and trial integration-point states, stored flat in element order.
///
/// Element `e` owns entries `offsets[e]..offsets[e + 1]` of both arenas.
#[derive(Debug, Clone)]
pub struct GaussPointStore {
    committed: Vec<GaussPointState>,
    trial: Vec<GaussPointState>,
    offsets: Vec<usize>,
}

/// The arena entries of one contiguous element chunk.
pub struct ChunkStates<'s> {
    pub committed: &'s [GaussPointState],
    pub trial: &'s mut [GaussPointState],
}

impl GaussPointStore {
    /// Zero-stress store for the given per-element offsets.
    pub fn new(offsets: &[usize]) -> Self {
        let n = offsets.last().copied().unwrap_or(0);
        Self {
            committed: vec![GaussPointState::default(); n],
            trial: vec![GaussPointState::default(); n],
            offsets: offsets.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Converged states of one element.
    pub fn committed(&self, elem: usize) -> &[GaussPointState] {
        &self.committed[self.offsets[elem]..self.offsets[elem + 1]]
    }

    /// Trial states of one element.
    pub fn trial(&self, elem: usize) -> &[GaussPointState] {
        &self.trial[self.offsets[elem]..self.offsets[elem + 1]]
    }

    /// Accept the trial states.
    pub fn commit(&mut self) {
        self.committed.copy_from_slice(&self.trial);
    }

    /// Split both arenas into disjoint per-chunk slices.
    pub fn chunk_states(&mut self, chunks: &[Range<usize>]) -> Vec<ChunkStates<'_>> {
        let mut committed: &[GaussPointState] = &self.committed;
        let mut trial: &mut [GaussPointState] = &mut self.trial;
        let mut states = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let len = self.offsets[chunk.end] - self.offsets[chunk.start];
            let (c_head, c_tail) = committed.split_at(len);
            let (t_head, t_tail) = std::mem::take(&mut trial).split_at_mut(len);
            states.push(ChunkStates {
                committed: c_head,
                trial: t_head,
            });
            committed = c_tail;
            trial = t_tail;
        }
        states
    }
}

/// Material constants at one temperature.
#[derive(Debug, Clone, Copy)]
struct PointMaterial {
    youngs_modulus: f64,
    poissons_ratio: f64,
    shear_modulus: f64,
    bulk_modulus: f64,
    yield_stress: f64,
    hardening: f64,
}

impl PointMaterial {
    fn at(material: &Material, temperature: f64) -> Self {
        Self {
            youngs_modulus: material.youngs_modulus.value(temperature),
            poissons_ratio: material.poissons_ratio.value(temperature),
            shear_modulus: material.shear_modulus(temperature),
            bulk_modulus: material.bulk_modulus(temperature),
            yield_stress: material.yield_stress.value(temperature),
            hardening: material.hardening_modulus.value(temperature),
        }
    }
}

/// Relative overshoot of the yield surface treated as elastic.
const YIELD_TOLERANCE: f64 = 1e-10;

/// Radial return from `old` for the total strain `strain`.
///
/// `inelastic` is every prescribed strain (thermal, transformation and the
/// updated transformation plasticity). Returns the new state and the
/// consistent tangent.
fn return_map(
    old: &GaussPointState,
    strain: &StrainTensor,
    inelastic: &Vector6<f64>,
    trip_strain: StrainTensor,
    props: &PointMaterial,
) -> (GaussPointState, ConstitutiveMatrix) {
    let elastic_d = isotropic_constitutive(props.youngs_modulus, props.poissons_ratio);
    let elastic = strain.0 - old.plastic_strain.0 - inelastic;
    let trial = StressTensor(elastic_d * elastic);

    let s = trial.deviatoric();
    let s_norm = s.norm();
    let q = (1.5f64).sqrt() * s_norm;
    let yield_stress = props.yield_stress + props.hardening * old.equivalent_plastic_strain;

    if q - yield_stress <= YIELD_TOLERANCE * yield_stress {
        let state = GaussPointState {
            stress: trial,
            plastic_strain: old.plastic_strain,
            equivalent_plastic_strain: old.equivalent_plastic_strain,
            trip_strain,
        };
        return (state, elastic_d);
    }

    let g = props.shear_modulus;
    let h = props.hardening;
    let dgamma = (q - yield_stress) / (3.0 * g + h);
    let n = s.0 / s_norm;
    let root = (1.5f64).sqrt();

    let stress = StressTensor(trial.0 - 2.0 * g * root * dgamma * n);
    let mut plastic = old.plastic_strain.0;
    for i in 0..6 {
        let engineering = if i < 3 { 1.0 } else { 2.0 };
        plastic[i] += engineering * root * dgamma * n[i];
    }

    let m = Vector6::new(1.0, 1.0, 1.0, 0.0, 0.0, 0.0);
    let deviatoric_projector = Matrix6::from_diagonal(&Vector6::new(1.0, 1.0, 1.0, 0.5, 0.5, 0.5))
        - m * m.transpose() / 3.0;
    let tangent = deviatoric_projector * (2.0 * g * (1.0 - 3.0 * g * dgamma / q))
        + n * n.transpose() * (6.0 * g * g * (dgamma / q - 1.0 / (3.0 * g + h)))
        + m * m.transpose() * props.bulk_modulus;

    let state = GaussPointState {
        stress,
        plastic_strain: StrainTensor(plastic),
        equivalent_plastic_strain: old.equivalent_plastic_strain + dgamma,
        trip_strain,
    };
    (state, tangent)
}

/// Transformation plasticity increment 3/2·K·s·2(1 − f_m)·Δf_m as engineering strain.
fn trip_increment(stress: &StressTensor, coefficient: f64, martensite: f64, growth: f64) -> Vector6<f64> {
    if coefficient <= 0.0 || growth <= 0.0 {
        return Vector6::zeros();
    }
    let s = stress.deviatoric().0;
    let factor = 1.5 * coefficient * 2.0 * (1.0 - martensite) * growth;
    Vector6::new(
        factor * s[0],
        factor * s[1],
        factor * s[2],
        2.0 * factor * s[3],
        2.0 * factor * s[4],
        2.0 * factor * s[5],
    )
}

/// Nodal fields that load the structure.
#[derive(Debug, Clone, PartialEq)]
struct NodalLoad {
    temperature: Vec<f64>,
    volumetric_strain: Vec<f64>,
    martensite: Vec<f64>,
}

impl NodalLoad {
    fn at_frame(thermal: &TemperatureHistory, metallurgy: &MetallurgyHistory, frame: usize) -> Self {
        Self {
            temperature: thermal.temperatures(frame).to_vec(),
            volumetric_strain: metallurgy.volumetric_strain(frame).to_vec(),
            martensite: metallurgy.phase_field(frame, Phase::Martensite),
        }
    }

    /// Linear interpolation towards `target` (λ = 0 gives `self`).
    fn blend(&self, target: &Self, lambda: f64) -> Self {
        let mix = |a: &[f64], b: &[f64]| -> Vec<f64> {
            a.iter().zip(b).map(|(x, y)| x + lambda * (y - x)).collect()
        };
        Self {
            temperature: mix(&self.temperature, &target.temperature),
            volumetric_strain: mix(&self.volumetric_strain, &target.volumetric_strain),
            martensite: mix(&self.martensite, &target.martensite),
        }
    }
}

/// A clamp with its node selection resolved.
#[derive(Debug, Clone)]
struct ResolvedClamp {
    kind: ClampKind,
    nodes: Vec<usize>,
    dofs: [bool; 3],
    release_time: Option<f64>,
}

impl ResolvedClamp {
    fn resolve(mesh: &Mesh, spec: &ClampSpec) -> Result<Self> {
        let nodes = match &spec.selection {
            NodeSelection::Nodes(nodes) => {
                if let Some(&bad) = nodes.iter().find(|&&n| n >= mesh.n_nodes()) {
                    return Err(Error::Config(format!(
                        "clamp references node {} but the mesh has {} nodes",
                        bad,
                        mesh.n_nodes()
                    )));
                }
                nodes.clone()
            }
            NodeSelection::Region { min, max, tolerance } => {
                mesh.nodes_in_region(&Point3::from(*min), &Point3::from(*max), *tolerance)
            }
        };
        if nodes.is_empty() {
            return Err(Error::Config("clamp selects no nodes".into()));
        }
        Ok(Self {
            kind: spec.kind,
            nodes,
            dofs: spec.dofs,
            release_time: spec.release_time,
        })
    }

    fn is_active(&self, time: f64) -> bool {
        self.release_time.map_or(true, |t| time < t)
    }
}

/// Mechanical state of one solved step.
#[derive(Debug, Clone, PartialEq)]
pub struct MechanicalFrame {
    /// Nodal displacements, three per node.
    pub displacement: Vec<f64>,
    /// Volume-averaged element stress.
    pub stress: Vec<StressTensor>,
    /// Von Mises stress of the averaged element stress.
    pub von_mises: Vec<f64>,
    /// Element von Mises averaged to nodes by volume.
    pub nodal_von_mises: Vec<f64>,
    /// Volume-averaged equivalent plastic strain per element.
    pub equivalent_plastic_strain: Vec<f64>,
}

/// Read-only data one worker needs to integrate an element.
struct ElementKernel<'s> {
    mesh: &'s Mesh,
    geometry: &'s MeshGeometry,
    materials: &'s [&'s Material],
    pattern: &'s DofPattern,
    reference_temperature: f64,
    start: &'s NodalLoad,
    end: &'s NodalLoad,
    displacement: &'s [f64],
}

impl ElementKernel<'_> {
    fn assemble(
        &self,
        e: usize,
        committed: &[GaussPointState],
        trial: &mut [GaussPointState],
        buffer: &mut WorkerBuffer,
    ) {
        let nodes = &self.mesh.elements()[e].nodes;
        let n = nodes.len();
        let material = self.materials[e];
        let trip_coefficient = material
            .transformation
            .as_ref()
            .map_or(0.0, |t| t.trip_coefficient);

        let dofs = element_dofs(nodes, 3);
        let ue = DVector::from_iterator(dofs.len(), dofs.iter().map(|&d| self.displacement[d]));

        let mut temperature = [0.0; MAX_NODES];
        let mut volumetric = [0.0; MAX_NODES];
        let mut martensite_start = [0.0; MAX_NODES];
        let mut martensite_end = [0.0; MAX_NODES];
        for (i, &node) in nodes.iter().enumerate() {
            temperature[i] = self.end.temperature[node];
            volumetric[i] = self.end.volumetric_strain[node];
            martensite_start[i] = self.start.martensite[node];
            martensite_end[i] = self.end.martensite[node];
        }

        let mut stiffness = DMatrix::zeros(3 * n, 3 * n);
        let mut internal = DVector::zeros(3 * n);
        let mut eigen_load = DVector::zeros(3 * n);

        for (k, ip) in self.geometry.stiffness_points(e).iter().enumerate() {
            let b = strain_displacement(&ip.gradients[..n]);
            let strain = StrainTensor(Vector6::from_iterator((&b * &ue).iter().copied()));

            let t = ip.interpolate(&temperature[..n]);
            let props = PointMaterial::at(material, t);
            let free_strain = material.thermal_expansion.value(t) * (t - self.reference_temperature)
                + ip.interpolate(&volumetric[..n]) / 3.0;
            let eigen = StrainTensor::isotropic(free_strain).0;

            let old = &committed[k];
            let f_m = ip.interpolate(&martensite_start[..n]);
            let growth = ip.interpolate(&martensite_end[..n]) - f_m;
            let trip =
                StrainTensor(old.trip_strain.0 + trip_increment(&old.stress, trip_coefficient, f_m, growth));

            let (state, tangent) = return_map(old, &strain, &(eigen + trip.0), trip, &props);
            trial[k] = state;

            let d = DMatrix::from_column_slice(6, 6, tangent.as_slice());
            let db = &d * &b;
            stiffness += b.tr_mul(&db) * ip.weight;

            let sigma = DVector::from_column_slice(state.stress.0.as_slice());
            internal += b.tr_mul(&sigma) * ip.weight;

            let elastic = isotropic_constitutive(props.youngs_modulus, props.poissons_ratio);
            let eigen_stress = DVector::from_column_slice((elastic * eigen).as_slice());
            eigen_load += b.tr_mul(&eigen_stress) * ip.weight;
        }

        buffer.add_element_matrix(self.pattern.element_positions(e), &stiffness);
        buffer.add_element_vector(0, &dofs, internal.as_slice());
        buffer.add_element_vector(1, &dofs, eigen_load.as_slice());
    }
}

fn is_recoverable(e: &Error) -> bool {
    matches!(
        e,
        Error::MechanicalDivergence { .. } | Error::SingularMatrix(_) | Error::Solver(_)
    )
}

fn norm(values: impl Iterator<Item = f64>) -> f64 {
    values.map(|v| v * v).sum::<f64>().sqrt()
}

/// Incremental quasi-static solver over a finished thermal and metallurgical history.
pub struct MechanicalSolver<'a> {
    mesh: &'a Mesh,
    geometry: &'a MeshGeometry,
    config: &'a SolverConfig,
    pool: &'a ThreadPool,
    thermal: &'a TemperatureHistory,
    metallurgy: &'a MetallurgyHistory,
    element_materials: Vec<&'a Material>,
    pattern: DofPattern,
    chunks: Vec<Range<usize>>,
    clamps: Vec<ResolvedClamp>,
    restricted: Option<RestrictedPattern>,
    springs: Vec<(usize, f64)>,
    solver: LinearSolver,
    store: GaussPointStore,
    displacement: Vec<f64>,
    load: NodalLoad,
    frame: usize,
}

impl<'a> MechanicalSolver<'a> {
    /// Prepare the solver at frame 0 of the histories.
    pub fn new(
        mesh: &'a Mesh,
        geometry: &'a MeshGeometry,
        materials: &'a MaterialLibrary,
        config: &'a SolverConfig,
        pool: &'a ThreadPool,
        thermal: &'a TemperatureHistory,
        metallurgy: &'a MetallurgyHistory,
    ) -> Result<Self> {
        if thermal.n_frames() != metallurgy.n_frames() || thermal.n_nodes() != mesh.n_nodes() {
            return Err(Error::InvalidState(
                "temperature and metallurgy histories do not match the mesh".into(),
            ));
        }
        let element_materials = mesh
            .elements()
            .iter()
            .map(|e| materials.get(e.tag))
            .collect::<Result<Vec<_>>>()?;
        let clamps = config
            .clamps
            .iter()
            .map(|c| ResolvedClamp::resolve(mesh, c))
            .collect::<Result<Vec<_>>>()?;
        if clamps.is_empty() {
            warn!("mechanical: no clamps configured; rigid-body motion is unconstrained");
        }

        let pattern = DofPattern::build(mesh, 3)?;
        let chunks = element_chunks(mesh.n_elements(), pool.current_num_threads());
        info!(
            "mechanical: {} DOFs, {} integration points, {} clamps",
            pattern.n_dofs(),
            geometry.n_points(),
            clamps.len()
        );

        Ok(Self {
            mesh,
            geometry,
            config,
            pool,
            thermal,
            metallurgy,
            element_materials,
            displacement: vec![0.0; pattern.n_dofs()],
            pattern,
            chunks,
            clamps,
            restricted: None,
            springs: Vec::new(),
            solver: LinearSolver::new(config.linear_solver),
            store: GaussPointStore::new(geometry.point_offsets()),
            load: NodalLoad::at_frame(thermal, metallurgy, 0),
            frame: 0,
        })
    }

    /// Frames solved as load steps: every `step_stride`-th plus the last.
    pub fn load_frames(&self) -> Vec<usize> {
        let last = self.thermal.n_frames().saturating_sub(1);
        let stride = self.config.mechanical.step_stride.max(1);
        (1..=last).filter(|f| f % stride == 0 || *f == last).collect()
    }

    /// Last solved frame.
    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn displacement(&self) -> &[f64] {
        &self.displacement
    }

    pub fn store(&self) -> &GaussPointStore {
        &self.store
    }

    /// Equilibrate the structure at thermal frame `frame`, bisecting the load
    /// step on failure.
    pub fn solve_frame(&mut self, frame: usize) -> Result<ConvergenceRecord> {
        if frame <= self.frame || frame >= self.thermal.n_frames() {
            return Err(Error::InvalidState(format!(
                "cannot solve frame {} after frame {}",
                frame, self.frame
            )));
        }
        let time = self.thermal.times()[frame];
        let time_step = time - self.thermal.times()[self.frame];
        self.update_supports(time)?;

        let target = NodalLoad::at_frame(self.thermal, self.metallurgy, frame);
        let origin = self.load.clone();
        let max_bisections = self.config.mechanical.max_bisections;

        let mut lambda: f64 = 0.0;
        let mut step = 1.0;
        let mut cutbacks = 0;
        let mut iterations = 0;
        let mut residual = 0.0;
        while lambda < 1.0 {
            let next = (lambda + step).min(1.0);
            let from = origin.blend(&target, lambda);
            let to = origin.blend(&target, next);
            match self.solve_increment(&from, &to, time) {
                Ok((its, res)) => {
                    self.store.commit();
                    lambda = next;
                    iterations += its;
                    residual = res;
                }
                Err(e) if is_recoverable(&e) && cutbacks < max_bisections => {
                    cutbacks += 1;
                    step *= 0.5;
                    warn!(
                        "mechanical step at t = {:.4} s failed ({}); bisecting load to {:.4}",
                        time, e, step
                    );
                }
                Err(e) if is_recoverable(&e) => {
                    return Err(Error::MechanicalDivergence {
                        time,
                        reason: format!("{} after {} load bisections", e, cutbacks),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        self.load = target;
        self.frame = frame;
        debug!(
            "mechanical frame {}: t = {:.4} s, {} iterations, residual {:.3e}",
            frame, time, iterations, residual
        );
        Ok(ConvergenceRecord {
            stage: Stage::Mechanical,
            step: frame,
            time,
            time_step,
            iterations,
            residual,
            cutbacks,
        })
    }

    /// Re-partition free and constrained DOFs for the clamps active at `time`.
    fn update_supports(&mut self, time: f64) -> Result<()> {
        let mut free = vec![true; self.pattern.n_dofs()];
        let mut springs = Vec::new();
        for clamp in self.clamps.iter().filter(|c| c.is_active(time)) {
            for &node in &clamp.nodes {
                for (dir, _) in clamp.dofs.iter().enumerate().filter(|(_, on)| **on) {
                    let dof = 3 * node + dir;
                    match clamp.kind {
                        ClampKind::Fixed => free[dof] = false,
                        ClampKind::Spring { stiffness } => springs.push((dof, stiffness)),
                    }
                }
            }
        }
        springs.retain(|(dof, _)| free[*dof]);
        self.springs = springs;

        let changed = self.restricted.as_ref().map_or(true, |r| !r.matches(&free));
        if changed {
            if self.restricted.is_some() {
                info!(
                    "mechanical: supports changed at t = {:.4} s, {} free DOFs",
                    time,
                    free.iter().filter(|f| **f).count()
                );
            }
            self.restricted = Some(self.pattern.restrict(&free)?);
            self.solver.invalidate();
        }
        Ok(())
    }

    /// Newton–Raphson from the committed state to the load `to`.
    ///
    /// Returns the number of linear solves and the final relative residual.
    fn solve_increment(&mut self, from: &NodalLoad, to: &NodalLoad, time: f64) -> Result<(usize, f64)> {
        let config: &'a SolverConfig = self.config;
        let mechanical = &config.mechanical;
        let mut u = self.displacement.clone();

        for iteration in 0..=mechanical.max_iterations {
            let (matrix, internal, eigen) = self.assemble(&u, from, to)?;

            let restricted = self.restricted.as_ref().ok_or_else(|| {
                Error::InvalidState("supports not partitioned before solve".into())
            })?;
            let residual: Vec<f64> = internal.iter().map(|f| -f).collect();
            let reduced = restricted.gather_vector(&residual);
            let residual_norm = norm(reduced.iter().copied());
            if !residual_norm.is_finite() {
                return Err(Error::MechanicalDivergence {
                    time,
                    reason: "non-finite residual".into(),
                });
            }
            let reference = norm(eigen.iter().copied()).max(norm(internal.iter().copied()));
            let relative = if reference > 0.0 {
                residual_norm / reference
            } else {
                0.0
            };

            if residual_norm <= mechanical.absolute_tolerance
                || residual_norm <= mechanical.tolerance * reference
            {
                self.displacement = u;
                return Ok((iteration, relative));
            }
            if iteration == mechanical.max_iterations {
                break;
            }

            let tangent = restricted.gather_matrix(&matrix)?;
            let du = self.solver.solve(&tangent, &reduced)?;
            if du.iter().any(|v| !v.is_finite()) {
                return Err(Error::MechanicalDivergence {
                    time,
                    reason: "non-finite displacement update".into(),
                });
            }
            restricted.scatter_add(&du, &mut u);
        }

        Err(Error::MechanicalDivergence {
            time,
            reason: format!(
                "Newton-Raphson did not converge in {} iterations",
                mechanical.max_iterations
            ),
        })
    }

    /// Tangent values, internal force and eigenstrain load at displacement `u`;
    /// fills the trial arena.
    fn assemble(
        &mut self,
        u: &[f64],
        from: &NodalLoad,
        to: &NodalLoad,
    ) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>)> {
        let kernel = ElementKernel {
            mesh: self.mesh,
            geometry: self.geometry,
            materials: &self.element_materials,
            pattern: &self.pattern,
            reference_temperature: self.config.reference_temperature,
            start: from,
            end: to,
            displacement: u,
        };
        let states = self.store.chunk_states(&self.chunks);
        let WorkerBuffer {
            mut matrix,
            vectors,
        } = parallel_assemble(
            self.pool,
            &self.pattern,
            &self.chunks,
            states,
            2,
            |range, chunk, buffer| {
                let base = kernel.geometry.point_offset(range.start);
                for e in range {
                    let lo = kernel.geometry.point_offset(e) - base;
                    let hi = kernel.geometry.point_offset(e + 1) - base;
                    kernel.assemble(e, &chunk.committed[lo..hi], &mut chunk.trial[lo..hi], buffer);
                }
                Ok(())
            },
        )?;

        let mut vectors = vectors.into_iter();
        let mut internal = vectors.next().map(|v| v.into_vec()).unwrap_or_default();
        let eigen = vectors.next().map(|v| v.into_vec()).unwrap_or_default();

        for &(dof, stiffness) in &self.springs {
            matrix[self.pattern.diagonal_position(dof)] += stiffness;
            internal[dof] += stiffness * u[dof];
        }
        Ok((matrix, internal, eigen))
    }

    /// Displacement, element stress and plastic strain of the committed state.
    pub fn output(&self) -> MechanicalFrame {
        let n_elements = self.mesh.n_elements();
        let mut stress = Vec::with_capacity(n_elements);
        let mut von_mises = Vec::with_capacity(n_elements);
        let mut plastic = Vec::with_capacity(n_elements);

        for e in 0..n_elements {
            let points = self.geometry.stiffness_points(e);
            let states = self.store.committed(e);
            let mut sum = Vector6::zeros();
            let mut eps = 0.0;
            let mut volume = 0.0;
            for (ip, state) in points.iter().zip(states) {
                sum += state.stress.0 * ip.weight;
                eps += state.equivalent_plastic_strain * ip.weight;
                volume += ip.weight;
            }
            let mean = StressTensor(sum / volume);
            von_mises.push(mean.von_mises());
            stress.push(mean);
            plastic.push(eps / volume);
        }

        let mut nodal = vec![0.0; self.mesh.n_nodes()];
        let mut weights = vec![0.0; self.mesh.n_nodes()];
        for (e, element) in self.mesh.elements().iter().enumerate() {
            let volume = self.geometry.volume(e);
            for &node in &element.nodes {
                nodal[node] += von_mises[e] * volume;
                weights[node] += volume;
            }
        }
        for (v, w) in nodal.iter_mut().zip(&weights) {
            if *w > 0.0 {
                *v /= w;
            }
        }

        MechanicalFrame {
            displacement: self.displacement.clone(),
            stress,
            von_mises,
            nodal_von_mises: nodal,
            equivalent_plastic_strain: plastic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ElementType;
    use approx::assert_relative_eq;

    fn steel() -> Material {
        Material::constant(40.0, 500.0, 8000.0, 200e9, 0.3, 250e6, 12e-6)
    }

    fn props(material: &Material) -> PointMaterial {
        PointMaterial::at(material, 20.0)
    }

    #[test]
    fn test_elastic_return_map() {
        let material = steel();
        let strain = StrainTensor::new([1e-4, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let (state, tangent) = return_map(
            &GaussPointState::default(),
            &strain,
            &Vector6::zeros(),
            StrainTensor::zero(),
            &props(&material),
        );
        let d = isotropic_constitutive(200e9, 0.3);
        assert_relative_eq!(state.stress.0, d * strain.0, max_relative = 1e-12);
        assert_eq!(state.equivalent_plastic_strain, 0.0);
        assert_relative_eq!(tangent, d, max_relative = 1e-12);
    }

    #[test]
    fn test_plastic_return_lands_on_yield_surface() {
        let material = steel().with_curve(
            crate::material::PropertyKind::HardeningModulus,
            crate::material::PropertyCurve::constant(1e9),
        );
        let p = props(&material);
        let strain = StrainTensor::new([5e-3, -1e-3, 0.0, 2e-3, 0.0, 0.0]);
        let (state, _) = return_map(
            &GaussPointState::default(),
            &strain,
            &Vector6::zeros(),
            StrainTensor::zero(),
            &p,
        );
        let yield_stress = 250e6 + 1e9 * state.equivalent_plastic_strain;
        assert!(state.equivalent_plastic_strain > 0.0);
        assert_relative_eq!(state.stress.von_mises(), yield_stress, max_relative = 1e-10);
        // Plastic flow is isochoric
        assert_relative_eq!(state.plastic_strain.volumetric(), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_consistent_tangent_matches_finite_difference() {
        let material = steel().with_curve(
            crate::material::PropertyKind::HardeningModulus,
            crate::material::PropertyCurve::constant(2e9),
        );
        let p = props(&material);
        let base = [3e-3, -1e-3, 5e-4, 1.5e-3, -4e-4, 8e-4];
        let strain = StrainTensor::new(base);
        let old = GaussPointState::default();
        let (state, tangent) = return_map(&old, &strain, &Vector6::zeros(), StrainTensor::zero(), &p);
        assert!(state.equivalent_plastic_strain > 0.0);

        let h = 1e-9;
        for j in 0..6 {
            let mut perturbed = base;
            perturbed[j] += h;
            let (forward, _) = return_map(
                &old,
                &StrainTensor::new(perturbed),
                &Vector6::zeros(),
                StrainTensor::zero(),
                &p,
            );
            let column = (forward.stress.0 - state.stress.0) / h;
            for i in 0..6 {
                assert_relative_eq!(column[i], tangent[(i, j)], epsilon = 2e-3 * 200e9);
            }
        }
    }

    #[test]
    fn test_trip_increment_is_deviatoric() {
        let stress = StressTensor::new([100e6, 50e6, 0.0, 20e6, 0.0, 0.0]);
        let inc = trip_increment(&stress, 5e-11, 0.2, 0.1);
        assert_relative_eq!(inc[0] + inc[1] + inc[2], 0.0, epsilon = 1e-18);
        // 3/2 K s 2(1 - f) df on the xx deviator (50 MPa)
        assert_relative_eq!(inc[0], 1.5 * 5e-11 * 50e6 * 2.0 * 0.8 * 0.1, max_relative = 1e-12);
        assert_eq!(trip_increment(&stress, 5e-11, 0.2, 0.0), Vector6::zeros());
    }

    #[test]
    fn test_chunk_states_are_disjoint() {
        let offsets = [0, 8, 16, 24, 32];
        let mut store = GaussPointStore::new(&offsets);
        let chunks = [0..1, 1..4];
        {
            let states = store.chunk_states(&chunks);
            assert_eq!(states.len(), 2);
            assert_eq!(states[0].trial.len(), 8);
            assert_eq!(states[1].trial.len(), 24);
            assert_eq!(states[1].committed.len(), 24);
        }
        let mut states = store.chunk_states(&chunks);
        states[1].trial[0].equivalent_plastic_strain = 0.5;
        drop(states);
        assert_eq!(store.trial(1)[0].equivalent_plastic_strain, 0.5);
        assert_eq!(store.committed(1)[0].equivalent_plastic_strain, 0.0);
        store.commit();
        assert_eq!(store.committed(1)[0].equivalent_plastic_strain, 0.5);
    }

    #[test]
    fn test_region_clamp_resolution() {
        let mesh = Mesh::structured_box(Point3::zeros(), [1.0; 3], [2, 2, 2], ElementType::Hex8, 0)
            .unwrap();
        let spec = ClampSpec {
            kind: ClampKind::Fixed,
            selection: NodeSelection::Region {
                min: [0.0, 0.0, 0.0],
                max: [0.0, 1.0, 1.0],
                tolerance: 1e-9,
            },
            dofs: [true; 3],
            release_time: Some(2.0),
        };
        let clamp = ResolvedClamp::resolve(&mesh, &spec).unwrap();
        assert_eq!(clamp.nodes.len(), 9);
        assert!(clamp.is_active(1.0));
        assert!(!clamp.is_active(2.0));

        let bad = ClampSpec::fixed(vec![1000], [true; 3]);
        assert!(matches!(ResolvedClamp::resolve(&mesh, &bad), Err(Error::Config(_))));
    }
}
