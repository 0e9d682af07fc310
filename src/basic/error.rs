use thiserror::Error;

use super::system::network::ConverterControl;

/// Invalid input detected before any Newton iteration runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("network has no buses")]
    NoBuses,

    #[error("{what} has {got} entries, expected {expected}")]
    DimensionMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("{device} references bus {bus}, but the network has {nbus} buses")]
    UnknownBus {
        device: String,
        bus: usize,
        nbus: usize,
    },

    #[error("branch {0} connects a bus to itself")]
    SelfLoop(String),

    #[error("branch {0} has zero series impedance")]
    ZeroImpedance(String),

    #[error("VSC {vsc} declares {control:?} on both control slots")]
    DuplicateVscControl {
        vsc: String,
        control: ConverterControl,
    },

    #[error("HVDC line {0} has a non-positive rated voltage")]
    HvdcRatedVoltage(String),

    #[error("system is not square: {unknowns} unknowns for {equations} equations")]
    NotSquare { unknowns: usize, equations: usize },

    #[error("invalid sparse structure: {0}")]
    Sparse(#[from] nalgebra_sparse::SparseFormatError),

    #[error("invalid options: {0}")]
    Options(#[from] serde_json::Error),
}

/// Numerical failure inside one Newton step.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SolveError {
    #[error("linear solver failed: {0}")]
    LinearSolver(&'static str),

    #[error("Newton step is not finite")]
    NonFiniteStep,

    #[error("residual is not finite")]
    NonFiniteResidual,
}
