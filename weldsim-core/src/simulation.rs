//! Run orchestration.
//!
//! A [`Simulation`] owns the inputs of one run and walks through the stages
//! in a fixed order:
//!
//! ```text
//! Created → MeshLoaded → ThermalRunning → ThermalComplete → MetallurgyComplete
//!         → MechanicalRunning → MechanicalComplete → ResultsReady
//! ```
//!
//! Any stage can end in `Failed` or `Cancelled`. Calling a stage out of order
//! is an [`Error::InvalidState`]. Progress is reported over an unbounded
//! channel and cancellation is checked between steps; whatever was finished
//! before a failure is kept in the partial [`ResultSet`].

use crate::config::SolverConfig;
use crate::error::{Error, Result};
use crate::geometry::MeshGeometry;
use crate::heat_source::HeatSource;
use crate::material::MaterialLibrary;
use crate::mechanical::MechanicalSolver;
use crate::mesh::Mesh;
use crate::metallurgy::{MetallurgyHistory, MetallurgyModel};
use crate::results::{ResultAssembler, ResultSet, RunStatus};
use crate::thermal::{TemperatureHistory, ThermalSolver};
use log::{info, warn};
use rayon::ThreadPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Lifecycle state of a [`Simulation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationState {
    Created,
    MeshLoaded,
    ThermalRunning,
    ThermalComplete,
    MetallurgyComplete,
    MechanicalRunning,
    MechanicalComplete,
    ResultsReady,
    Failed,
    Cancelled,
}

/// Progress notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    StateChanged(SimulationState),
    ThermalStep {
        step: usize,
        time: f64,
        end_time: f64,
        max_temperature: f64,
    },
    MechanicalStep {
        frame: usize,
        solved: usize,
        total: usize,
        time: f64,
    },
}

/// Cooperative cancellation flag shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the run stops at the next step boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Progress sink and cancellation token handed to a run.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    progress: Option<Sender<ProgressEvent>>,
    cancel: CancelToken,
}

impl RunControl {
    /// No progress reporting, never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Control wired to a fresh progress channel.
    pub fn channel() -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self::new().with_progress(tx), rx)
    }

    pub fn with_progress(mut self, sender: Sender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fire-and-forget; a dropped receiver is ignored.
    pub fn notify(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A failed or cancelled run: the error plus everything produced before it.
#[derive(Debug, thiserror::Error)]
#[error("simulation run stopped: {error}")]
pub struct RunFailure {
    #[source]
    pub error: Error,
    pub partial: ResultSet,
}

/// One welding simulation.
pub struct Simulation {
    state: SimulationState,
    config: SolverConfig,
    materials: MaterialLibrary,
    source: Box<dyn HeatSource>,
    pool: ThreadPool,
    mesh: Option<Mesh>,
    geometry: Option<MeshGeometry>,
    temperatures: Option<TemperatureHistory>,
    metallurgy: Option<MetallurgyHistory>,
    assembler: ResultAssembler,
    results: Option<ResultSet>,
}

impl Simulation {
    /// Validate the configuration and build the run's worker pool.
    pub fn new(
        materials: MaterialLibrary,
        source: impl HeatSource + 'static,
        config: SolverConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .build()
            .map_err(|e| Error::Config(format!("cannot build worker pool: {}", e)))?;

        Ok(Self {
            state: SimulationState::Created,
            assembler: ResultAssembler::new(config.output_stride),
            config,
            materials,
            source: Box::new(source),
            pool,
            mesh: None,
            geometry: None,
            temperatures: None,
            metallurgy: None,
            results: None,
        })
    }

    pub fn state(&self) -> SimulationState {
        self.state
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn mesh(&self) -> Option<&Mesh> {
        self.mesh.as_ref()
    }

    pub fn temperature_history(&self) -> Option<&TemperatureHistory> {
        self.temperatures.as_ref()
    }

    pub fn metallurgy_history(&self) -> Option<&MetallurgyHistory> {
        self.metallurgy.as_ref()
    }

    /// Final results once [`Simulation::assemble_results`] succeeded.
    pub fn results(&self) -> Option<&ResultSet> {
        self.results.as_ref()
    }

    fn expect_state(&self, expected: SimulationState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{} requires state {:?}, simulation is {:?}",
                operation, expected, self.state
            )))
        }
    }

    fn enter(&mut self, state: SimulationState, control: &RunControl) {
        self.state = state;
        control.notify(ProgressEvent::StateChanged(state));
    }

    /// Move to `Failed` or `Cancelled` and hand the error back.
    fn fail(&mut self, error: Error, control: &RunControl) -> Error {
        let state = if matches!(error, Error::Cancelled) {
            SimulationState::Cancelled
        } else {
            SimulationState::Failed
        };
        warn!("simulation stopped in {:?}: {}", self.state, error);
        self.enter(state, control);
        error
    }

    /// Validate the mesh against the material library and precompute geometry.
    pub fn load_mesh(&mut self, mesh: Mesh, control: &RunControl) -> Result<()> {
        self.expect_state(SimulationState::Created, "load_mesh")?;
        mesh.validate()?;
        for (e, element) in mesh.elements().iter().enumerate() {
            if !self.materials.contains(element.tag) {
                return Err(Error::InvalidMaterial(format!(
                    "element {} references unknown material {}",
                    e, element.tag
                )));
            }
        }
        let geometry = MeshGeometry::build(&mesh)?;
        info!(
            "mesh loaded: {} nodes, {} elements, volume {:.6e} m³",
            mesh.n_nodes(),
            mesh.n_elements(),
            geometry.total_volume()
        );
        self.mesh = Some(mesh);
        self.geometry = Some(geometry);
        self.enter(SimulationState::MeshLoaded, control);
        Ok(())
    }

    /// Integrate the heat equation until the end time or cool-down.
    pub fn run_thermal(&mut self, control: &RunControl) -> Result<()> {
        self.expect_state(SimulationState::MeshLoaded, "run_thermal")?;
        self.enter(SimulationState::ThermalRunning, control);

        let (history, outcome) = {
            let (Some(mesh), Some(geometry)) = (self.mesh.as_ref(), self.geometry.as_ref()) else {
                return Err(Error::InvalidState("mesh missing".into()));
            };
            let solver = ThermalSolver::new(
                mesh,
                geometry,
                &self.materials,
                self.source.as_ref(),
                &self.config,
                &self.pool,
            );
            match solver {
                Ok(mut solver) => {
                    let mut outcome = Ok(());
                    while !solver.is_finished() {
                        if let Err(e) = control.check_cancelled() {
                            outcome = Err(e);
                            break;
                        }
                        match solver.step() {
                            Ok(record) => {
                                control.notify(ProgressEvent::ThermalStep {
                                    step: record.step,
                                    time: record.time,
                                    end_time: self.config.end_time,
                                    max_temperature: solver
                                        .history()
                                        .last()
                                        .iter()
                                        .copied()
                                        .fold(f64::NEG_INFINITY, f64::max),
                                });
                                self.assembler.record_convergence(record);
                            }
                            Err(e) => {
                                outcome = Err(e);
                                break;
                            }
                        }
                    }
                    self.assembler.set_energy_input(solver.energy_input());
                    (Some(solver.into_history()), outcome)
                }
                Err(e) => (None, Err(e)),
            }
        };

        if let Some(history) = history {
            self.assembler.record_temperatures(&history);
            info!(
                "thermal stage: {} steps to t = {:.3} s, peak {:.1} °C",
                history.n_frames() - 1,
                history.times().last().copied().unwrap_or(0.0),
                history
                    .peak_temperatures()
                    .iter()
                    .copied()
                    .fold(f64::NEG_INFINITY, f64::max)
            );
            self.temperatures = Some(history);
        }

        match outcome {
            Ok(()) => {
                self.enter(SimulationState::ThermalComplete, control);
                Ok(())
            }
            Err(e) => Err(self.fail(e, control)),
        }
    }

    /// Integrate phase transformations over the finished temperature history.
    pub fn run_metallurgy(&mut self, control: &RunControl) -> Result<()> {
        self.expect_state(SimulationState::ThermalComplete, "run_metallurgy")?;
        let outcome = self.integrate_metallurgy(control);
        match outcome {
            Ok(history) => {
                self.assembler.record_metallurgy(&history);
                self.metallurgy = Some(history);
                self.enter(SimulationState::MetallurgyComplete, control);
                Ok(())
            }
            Err(e) => Err(self.fail(e, control)),
        }
    }

    fn integrate_metallurgy(&self, control: &RunControl) -> Result<MetallurgyHistory> {
        control.check_cancelled()?;
        let (Some(mesh), Some(history)) = (self.mesh.as_ref(), self.temperatures.as_ref()) else {
            return Err(Error::InvalidState("temperature history missing".into()));
        };
        let model = MetallurgyModel::new(mesh, &self.materials, &self.config.metallurgy)?;
        if !model.is_transforming() {
            info!("metallurgy: no transforming material, skipping");
            return Ok(MetallurgyHistory::untransformed(history.times(), history.n_nodes()));
        }
        model.run(history, &self.pool)
    }

    /// Solve the quasi-static mechanical problem frame by frame.
    pub fn run_mechanical(&mut self, control: &RunControl) -> Result<()> {
        self.expect_state(SimulationState::MetallurgyComplete, "run_mechanical")?;
        self.enter(SimulationState::MechanicalRunning, control);

        let outcome = {
            let (Some(mesh), Some(geometry), Some(temperatures), Some(metallurgy)) = (
                self.mesh.as_ref(),
                self.geometry.as_ref(),
                self.temperatures.as_ref(),
                self.metallurgy.as_ref(),
            ) else {
                return Err(Error::InvalidState("stage inputs missing".into()));
            };
            let assembler = &mut self.assembler;

            MechanicalSolver::new(
                mesh,
                geometry,
                &self.materials,
                &self.config,
                &self.pool,
                temperatures,
                metallurgy,
            )
            .and_then(|mut solver| {
                let frames = solver.load_frames();
                let total = frames.len();
                for (solved, frame) in frames.into_iter().enumerate() {
                    control.check_cancelled()?;
                    let record = solver.solve_frame(frame)?;
                    control.notify(ProgressEvent::MechanicalStep {
                        frame,
                        solved: solved + 1,
                        total,
                        time: record.time,
                    });
                    assembler.record_convergence(record);
                    assembler.record_mechanical(frame, &solver.output());
                }
                Ok(())
            })
        };

        match outcome {
            Ok(()) => {
                self.enter(SimulationState::MechanicalComplete, control);
                Ok(())
            }
            Err(e) => Err(self.fail(e, control)),
        }
    }

    /// Close the result set.
    pub fn assemble_results(&mut self, control: &RunControl) -> Result<&ResultSet> {
        self.expect_state(SimulationState::MechanicalComplete, "assemble_results")?;
        let assembler = std::mem::take(&mut self.assembler);
        let results = assembler.finish(RunStatus::Completed);
        info!(
            "results: peak {:.1} °C, max von Mises {:.3e} Pa, max displacement {:.3e} m",
            results.summary.peak_temperature,
            results.summary.max_von_mises,
            results.summary.max_displacement
        );
        self.enter(SimulationState::ResultsReady, control);
        Ok(self.results.insert(results))
    }

    /// Run every remaining stage of a simulation whose mesh is loaded.
    pub fn run(mut self, control: &RunControl) -> std::result::Result<ResultSet, RunFailure> {
        let outcome = self.drive(control);
        match outcome {
            Ok(()) => match self.results.take() {
                Some(results) => Ok(results),
                None => Err(self.into_failure(Error::InvalidState("no results".into()))),
            },
            Err(error) => Err(self.into_failure(error)),
        }
    }

    fn drive(&mut self, control: &RunControl) -> Result<()> {
        self.run_thermal(control)?;
        self.run_metallurgy(control)?;
        self.run_mechanical(control)?;
        self.assemble_results(control)?;
        Ok(())
    }

    fn into_failure(mut self, error: Error) -> RunFailure {
        let status = match &error {
            Error::Cancelled => RunStatus::Cancelled,
            other => RunStatus::Failed {
                kind: other.kind(),
                message: other.to_string(),
            },
        };
        let partial = std::mem::take(&mut self.assembler).finish(status);
        RunFailure { error, partial }
    }
}
