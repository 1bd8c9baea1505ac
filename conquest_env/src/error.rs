//! Error types for the conquest environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
///
/// Permission and provider failures are not errors here; they arrive as
/// `LocationSignal`s for the host to surface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    /// A raw input value (coordinate, timestamp) is malformed
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl EnvError {
    /// Creates an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
