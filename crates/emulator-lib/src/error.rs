//! Error taxonomy for the emulator
//!
//! Splits failures into fatal classes (bad config, unreachable control
//! plane) and recoverable per-resource classes that batch operations count
//! and continue past.

use thiserror::Error;

/// Errors produced by the emulator library
#[derive(Debug, Error)]
pub enum EmulatorError {
    /// Configuration could not be loaded or is invalid. Fatal.
    #[error("config error: {0}")]
    Config(String),

    /// The control plane could not be reached at startup. Fatal.
    #[error("control plane unavailable: {0}")]
    RemoteUnavailable(String),

    /// A single remote call timed out. Recoverable outside startup
    /// verification.
    #[error("timeout during {operation}")]
    Timeout { operation: String },

    /// A single create/patch/delete/list call failed. Counted, never aborts
    /// the enclosing batch or cycle.
    #[error("{kind} '{name}': {message}")]
    Resource {
        kind: &'static str,
        name: String,
        message: String,
    },

    /// The target resource does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Registry file could not be read or written.
    #[error("registry error: {0}")]
    Registry(String),

    /// A step of the virtual-pod creation pipeline failed. Prior steps have
    /// already been rolled back when this is returned.
    #[error("virtual pod step {step} ({description}) failed: {message}")]
    Lifecycle {
        step: usize,
        description: &'static str,
        message: String,
    },
}

impl EmulatorError {
    /// True for the error classes that must abort the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EmulatorError::Config(_) | EmulatorError::RemoteUnavailable(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EmulatorError::NotFound { .. })
    }
}

pub type Result<T, E = EmulatorError> = std::result::Result<T, E>;

impl From<std::io::Error> for EmulatorError {
    fn from(err: std::io::Error) -> Self {
        EmulatorError::Config(err.to_string())
    }
}
