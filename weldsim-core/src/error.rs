//! Error types for weldsim operations.

use thiserror::Error;

/// Result type alias using the weldsim [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or running a simulation.
#[derive(Error, Debug)]
pub enum Error {
    /// Degenerate, inverted or disconnected mesh input.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),

    /// Missing or malformed material property curve.
    #[error("invalid material: {0}")]
    InvalidMaterial(String),

    /// Malformed heat source or weld path.
    #[error("invalid heat source: {0}")]
    InvalidHeatSource(String),

    /// Out-of-range or unparsable solver configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Thermal time integration diverged despite timestep reduction.
    #[error("thermal divergence at t = {time:.6e} s: {reason}")]
    ThermalDivergence { time: f64, reason: String },

    /// The metallurgical model cannot interpret a node's temperature trace.
    #[error("invalid thermal history at node {node}: {reason}")]
    InvalidThermalHistory { node: usize, reason: String },

    /// Newton-Raphson failed to converge despite load bisection.
    #[error("mechanical divergence at t = {time:.6e} s: {reason}")]
    MechanicalDivergence { time: f64, reason: String },

    /// The run was stopped cooperatively.
    #[error("simulation cancelled")]
    Cancelled,

    /// An operation was called in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Linear solver errors.
    #[error("solver error: {0}")]
    Solver(String),

    /// Matrix singularity or conditioning issues.
    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    /// I/O errors (configuration files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`], used to tag partial results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum FailureKind {
    InvalidMesh,
    InvalidMaterial,
    InvalidHeatSource,
    Config,
    ThermalDivergence,
    InvalidThermalHistory,
    MechanicalDivergence,
    Cancelled,
    InvalidState,
    Solver,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::InvalidMesh(_) => FailureKind::InvalidMesh,
            Error::InvalidMaterial(_) => FailureKind::InvalidMaterial,
            Error::InvalidHeatSource(_) => FailureKind::InvalidHeatSource,
            Error::Config(_) | Error::Io(_) => FailureKind::Config,
            Error::ThermalDivergence { .. } => FailureKind::ThermalDivergence,
            Error::InvalidThermalHistory { .. } => FailureKind::InvalidThermalHistory,
            Error::MechanicalDivergence { .. } => FailureKind::MechanicalDivergence,
            Error::Cancelled => FailureKind::Cancelled,
            Error::InvalidState(_) => FailureKind::InvalidState,
            Error::Solver(_) | Error::SingularMatrix(_) => FailureKind::Solver,
        }
    }

    /// True for errors raised by pre-solve validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidMesh(_)
                | Error::InvalidMaterial(_)
                | Error::InvalidHeatSource(_)
                | Error::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::InvalidMesh("x".into()).kind(), FailureKind::InvalidMesh);
        assert_eq!(
            Error::ThermalDivergence { time: 1.0, reason: "nan".into() }.kind(),
            FailureKind::ThermalDivergence
        );
        assert_eq!(Error::Cancelled.kind(), FailureKind::Cancelled);
        assert_eq!(Error::SingularMatrix("p".into()).kind(), FailureKind::Solver);
    }

    #[test]
    fn test_validation_errors() {
        assert!(Error::InvalidMaterial("k".into()).is_validation());
        assert!(!Error::Cancelled.is_validation());
        assert!(!Error::MechanicalDivergence { time: 0.0, reason: String::new() }.is_validation());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::InvalidThermalHistory { node: 7, reason: "reheated".into() };
        let text = err.to_string();
        assert!(text.contains("node 7"));
        assert!(text.contains("reheated"));
    }
}
