//! weldsim core - coupled welding simulation
//!
//! Finite element library predicting the temperature history, phase
//! fractions, residual stress and distortion produced by a moving arc:
//! - Goldak double-ellipsoid heat source moving along a weld path
//! - Nonlinear transient conduction (Crank–Nicolson) with convection and radiation
//! - JMAK and Koistinen–Marburger phase transformations
//! - Thermo-elasto-plastic mechanics with time-dependent clamps
//! - Deterministic parallel assembly using Rayon
//!
//! # Architecture
//!
//! Data flows one way through the stages:
//!
//! ```text
//! Mesh + Material + HeatSource → ThermalSolver → TemperatureHistory
//!     → MetallurgyModel → MetallurgyHistory → MechanicalSolver → ResultSet
//! ```
//!
//! - [`Simulation`]: lifecycle state machine driving one run
//! - [`Element`] trait: shape functions and integration rules of Tet4 and Hex8
//! - [`Mesh`]: connectivity, nodal coordinates and validation
//! - [`Material`]: temperature-dependent property curves and transformation data
//! - [`HeatSource`] trait: any pure volumetric power density q(x, t)
//! - [`Solver`] trait: linear system solution strategies

pub mod assembly;
pub mod config;
pub mod element;
pub mod error;
pub mod geometry;
pub mod heat_source;
pub mod material;
pub mod mechanical;
pub mod mesh;
pub mod metallurgy;
pub mod results;
pub mod simulation;
pub mod solver;
pub mod sparse;
pub mod thermal;
pub mod types;

pub use config::{ClampKind, ClampSpec, NodeSelection, SolverConfig};
pub use element::{create_element, Element};
pub use error::{Error, FailureKind, Result};
pub use heat_source::{GoldakSource, HeatSource, HeatSourceSpec, WeldPath};
pub use material::{Material, MaterialLibrary, PropertyCurve, PropertyKind};
pub use mesh::{ElementType, Mesh};
pub use metallurgy::{MetallurgyHistory, Phase, PhaseFractions};
pub use results::{ResultSet, RunStatus};
pub use simulation::{CancelToken, ProgressEvent, RunControl, RunFailure, Simulation, SimulationState};
pub use solver::Solver;
pub use sparse::CsrMatrix;
pub use thermal::TemperatureHistory;
pub use types::{Point3, StrainTensor, StressTensor};
