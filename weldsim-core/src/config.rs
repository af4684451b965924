//! Solver configuration.
//!
//! Every field has a default, so a TOML file only lists what it changes:
//!
//! ```toml
//! end_time = 120.0
//! cooling_end_temp = 100.0
//! worker_threads = 4
//!
//! [thermal]
//! time_step = 0.25
//!
//! [[clamps]]
//! kind = { type = "fixed" }
//! selection = { region = { min = [0.0, 0.0, 0.0], max = [0.0, 0.05, 0.01] } }
//! ```

use crate::error::{Error, Result};
use crate::solver::LinearSolverKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Uniform initial temperature (°C).
    pub initial_temperature: f64,
    /// Stress-free reference temperature for thermal strain (°C).
    pub reference_temperature: f64,
    /// Hard stop of the thermal transient (s).
    pub end_time: f64,
    /// The transient stops early once every node is below this temperature
    /// and the heat source is off (°C).
    pub cooling_end_temp: f64,
    /// Keep every n-th thermal step in the result set (the last is always kept).
    pub output_stride: usize,
    /// Worker threads for assembly; 0 lets rayon decide.
    pub worker_threads: usize,
    pub linear_solver: LinearSolverKind,
    pub thermal: ThermalConfig,
    pub mechanical: MechanicalConfig,
    pub metallurgy: MetallurgyConfig,
    pub boundary: ThermalBoundary,
    pub clamps: Vec<ClampSpec>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            initial_temperature: 20.0,
            reference_temperature: 20.0,
            end_time: 600.0,
            cooling_end_temp: 50.0,
            output_stride: 1,
            worker_threads: 0,
            linear_solver: LinearSolverKind::Cholesky,
            thermal: ThermalConfig::default(),
            mechanical: MechanicalConfig::default(),
            metallurgy: MetallurgyConfig::default(),
            boundary: ThermalBoundary::default(),
            clamps: Vec::new(),
        }
    }
}

/// Capacity matrix form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityScheme {
    #[default]
    Consistent,
    /// Row-sum lumped onto the diagonal.
    Lumped,
}

/// Thermal time integration controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    /// Nominal timestep (s).
    pub time_step: f64,
    /// Picard iterations per step before the step counts as diverged.
    pub max_iterations: usize,
    /// Picard convergence threshold on max |ΔT| (K).
    pub tolerance: f64,
    /// Timestep halvings allowed for one step.
    pub max_retries: usize,
    pub capacity: CapacityScheme,
    /// Temperatures above this are treated as overflow (°C).
    pub max_temperature: f64,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            time_step: 0.5,
            max_iterations: 25,
            tolerance: 0.01,
            max_retries: 6,
            capacity: CapacityScheme::Consistent,
            max_temperature: 1.0e4,
        }
    }
}

/// Quasi-static Newton–Raphson controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MechanicalConfig {
    /// Solve every n-th thermal step (the last step is always solved).
    pub step_stride: usize,
    /// Relative residual tolerance ‖R‖ / ‖F_ref‖.
    pub tolerance: f64,
    /// Residual norm below which an increment is converged regardless of scale (N).
    pub absolute_tolerance: f64,
    pub max_iterations: usize,
    /// Load bisections allowed for one increment.
    pub max_bisections: usize,
}

impl Default for MechanicalConfig {
    fn default() -> Self {
        Self {
            step_stride: 1,
            tolerance: 1e-6,
            absolute_tolerance: 1e-8,
            max_iterations: 25,
            max_bisections: 6,
        }
    }
}

/// What to do when martensitic material is reheated below Ac3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReheatPolicy {
    /// Keep the current microstructure (no tempering model).
    #[default]
    Freeze,
    /// Report the trace as an invalid thermal history.
    Reject,
}

/// Metallurgy controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetallurgyConfig {
    pub reheat_policy: ReheatPolicy,
    /// Temperature rise above Ms tolerated before the reheat policy applies (K).
    pub reheat_tolerance: f64,
}

impl Default for MetallurgyConfig {
    fn default() -> Self {
        Self {
            reheat_policy: ReheatPolicy::Freeze,
            reheat_tolerance: 50.0,
        }
    }
}

/// Heat loss on free surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalBoundary {
    /// Convective film coefficient h (W/m²·K).
    pub convection_coefficient: f64,
    /// Ambient temperature (°C).
    pub ambient_temperature: f64,
    /// Surface emissivity ε in [0, 1].
    pub emissivity: f64,
}

impl Default for ThermalBoundary {
    fn default() -> Self {
        Self {
            convection_coefficient: 10.0,
            ambient_temperature: 20.0,
            emissivity: 0.8,
        }
    }
}

/// Clamp behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClampKind {
    /// Zero displacement on the selected DOFs.
    Fixed,
    /// Grounded linear spring of the given stiffness (N/m) per DOF.
    Spring { stiffness: f64 },
}

/// Nodes a clamp acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSelection {
    /// Explicit node indices.
    Nodes(Vec<usize>),
    /// Every node inside an axis-aligned box.
    Region {
        min: [f64; 3],
        max: [f64; 3],
        #[serde(default = "default_region_tolerance")]
        tolerance: f64,
    },
}

fn default_region_tolerance() -> f64 {
    1e-9
}

/// A time-dependent mechanical support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClampSpec {
    pub kind: ClampKind,
    pub selection: NodeSelection,
    /// Constrained directions (x, y, z).
    #[serde(default = "all_directions")]
    pub dofs: [bool; 3],
    /// The clamp is removed at this time (s); `None` keeps it for the whole run.
    #[serde(default)]
    pub release_time: Option<f64>,
}

fn all_directions() -> [bool; 3] {
    [true; 3]
}

impl ClampSpec {
    /// Fixed clamp on explicit nodes.
    pub fn fixed(nodes: Vec<usize>, dofs: [bool; 3]) -> Self {
        Self {
            kind: ClampKind::Fixed,
            selection: NodeSelection::Nodes(nodes),
            dofs,
            release_time: None,
        }
    }

    /// Remove the clamp at `time`.
    pub fn released_at(mut self, time: f64) -> Self {
        self.release_time = Some(time);
        self
    }

    /// True if the clamp acts at `time`.
    pub fn is_active(&self, time: f64) -> bool {
        self.release_time.map_or(true, |t| time < t)
    }
}

impl SolverConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SolverConfig = toml::from_str(text)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Range checks that do not need the mesh.
    pub fn validate(&self) -> Result<()> {
        fn require(ok: bool, message: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::Config(message.to_string()))
            }
        }

        let finite = [
            self.initial_temperature,
            self.reference_temperature,
            self.cooling_end_temp,
            self.boundary.ambient_temperature,
        ];
        require(finite.iter().all(|t| t.is_finite()), "temperatures must be finite")?;
        require(self.end_time > 0.0 && self.end_time.is_finite(), "end_time must be positive")?;
        require(self.output_stride >= 1, "output_stride must be at least 1")?;

        let t = &self.thermal;
        require(
            t.time_step > 0.0 && t.time_step.is_finite(),
            "thermal.time_step must be positive",
        )?;
        require(t.max_iterations >= 1, "thermal.max_iterations must be at least 1")?;
        require(t.tolerance > 0.0, "thermal.tolerance must be positive")?;
        require(
            t.max_temperature > self.initial_temperature,
            "thermal.max_temperature must exceed the initial temperature",
        )?;

        let m = &self.mechanical;
        require(m.step_stride >= 1, "mechanical.step_stride must be at least 1")?;
        require(m.tolerance > 0.0, "mechanical.tolerance must be positive")?;
        require(m.absolute_tolerance >= 0.0, "mechanical.absolute_tolerance must be non-negative")?;
        require(m.max_iterations >= 1, "mechanical.max_iterations must be at least 1")?;

        require(
            self.metallurgy.reheat_tolerance >= 0.0,
            "metallurgy.reheat_tolerance must be non-negative",
        )?;

        let b = &self.boundary;
        require(
            b.convection_coefficient >= 0.0,
            "boundary.convection_coefficient must be non-negative",
        )?;
        require(
            (0.0..=1.0).contains(&b.emissivity),
            "boundary.emissivity must lie in [0, 1]",
        )?;

        for (i, clamp) in self.clamps.iter().enumerate() {
            if let ClampKind::Spring { stiffness } = clamp.kind {
                if !(stiffness > 0.0 && stiffness.is_finite()) {
                    return Err(Error::Config(format!("clamp {}: spring stiffness must be positive", i)));
                }
            }
            if !clamp.dofs.iter().any(|&d| d) {
                return Err(Error::Config(format!("clamp {} constrains no direction", i)));
            }
            if let Some(release) = clamp.release_time {
                if !release.is_finite() {
                    return Err(Error::Config(format!("clamp {}: release_time must be finite", i)));
                }
            }
            if let NodeSelection::Region { min, max, .. } = &clamp.selection {
                if (0..3).any(|k| min[k] > max[k]) {
                    return Err(Error::Config(format!("clamp {}: region min exceeds max", i)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SolverConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            end_time = 120.0
            worker_threads = 2

            [thermal]
            time_step = 0.25
            capacity = "lumped"

            [metallurgy]
            reheat_policy = "reject"

            [[clamps]]
            kind = { type = "fixed" }
            selection = { nodes = [0, 1, 2] }

            [[clamps]]
            kind = { type = "spring", stiffness = 1.0e6 }
            selection = { region = { min = [0.0, 0.0, 0.0], max = [0.0, 0.1, 0.01] } }
            dofs = [false, false, true]
            release_time = 60.0
        "#;
        let config = SolverConfig::from_toml_str(text).unwrap();
        assert_eq!(config.end_time, 120.0);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.thermal.time_step, 0.25);
        assert_eq!(config.thermal.max_iterations, 25);
        assert_eq!(config.thermal.capacity, CapacityScheme::Lumped);
        assert_eq!(config.metallurgy.reheat_policy, ReheatPolicy::Reject);
        assert_eq!(config.clamps.len(), 2);
        assert_eq!(config.clamps[0].dofs, [true; 3]);
        assert_eq!(config.clamps[1].kind, ClampKind::Spring { stiffness: 1.0e6 });
        assert!(config.clamps[1].is_active(59.0));
        assert!(!config.clamps[1].is_active(60.0));
        match &config.clamps[1].selection {
            NodeSelection::Region { tolerance, .. } => assert_eq!(*tolerance, 1e-9),
            other => panic!("unexpected selection {:?}", other),
        }
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            SolverConfig::from_toml_str("[thermal]\ntime_step = 0.0\n"),
            Err(Error::Config(_))
        ));
        assert!(SolverConfig::from_toml_str("[boundary]\nemissivity = 1.5\n").is_err());
        assert!(SolverConfig::from_toml_str("output_stride = 0\n").is_err());
        assert!(SolverConfig::from_toml_str("end_time = \"long\"\n").is_err());
    }

    #[test]
    fn test_clamp_without_directions_rejected() {
        let mut config = SolverConfig::default();
        config.clamps.push(ClampSpec::fixed(vec![0], [false; 3]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = SolverConfig::from_file("/nonexistent/weldsim.toml");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
