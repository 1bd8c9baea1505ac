//! Error kinds surfaced by the conquest engine.

use conquest_env::EnvError;
use thiserror::Error;

/// Attempt-scoped failures. Nothing here is fatal to the process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConquestError {
    /// Malformed coordinate, accuracy or timestamp
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Self-intersecting, collinear or near-zero-area geometry
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("A conquest attempt is already active")]
    AlreadyTracking,

    #[error("No conquest attempt is active")]
    NotTracking,

    #[error("Claim too small or degenerate")]
    TooSmallOrDegenerate,

    #[error("Claim fully contested by other territories")]
    FullyContested,

    #[error("Conquest attempt timed out")]
    AttemptTimedOut,

    /// The territory store diverged from the resolution basis
    #[error("Store conflict: {0}")]
    StoreConflict(String),

    #[error("Store error: {0}")]
    Store(String),

    /// A background resolver task panicked or was aborted
    #[error("Worker failed: {0}")]
    Worker(String),
}

impl ConquestError {
    pub fn degenerate(msg: impl Into<String>) -> Self {
        Self::DegenerateGeometry(msg.into())
    }
}

impl From<EnvError> for ConquestError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::InvalidInput(msg) => ConquestError::InvalidInput(msg),
        }
    }
}
