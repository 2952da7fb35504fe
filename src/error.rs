use thiserror::Error;

/// Errors raised by covariance estimation, SPD geometry and the centering
/// pipeline. All of them abort the current record group; there is no local
/// recovery or silent fallback.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or empty input (zero samples, empty matrix set,
    /// degenerate data that breaks the shrinkage formula).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A matrix required to be symmetric positive-definite failed the check.
    #[error("matrix is not symmetric positive-definite: {0}")]
    NotSpd(String),

    /// Inconsistent variable count across matrices in one operation.
    #[error("dimension mismatch: expected {expected}x{expected}, got {found}x{found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// Fréchet mean iteration exhausted its budget without converging.
    #[error("mean estimation did not converge after {iterations} iterations (residual {residual:e})")]
    ConvergenceFailure { iterations: usize, residual: f64 },
}

pub type Result<T> = std::result::Result<T, Error>;
