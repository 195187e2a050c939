//! Stage-boundary error type.
//!
//! Components return `anyhow::Result`; a stage maps whatever escapes a step
//! onto one of these variants so the runner can log it and shut the stage
//! down.

use thiserror::Error;

/// Failures that terminate a stage.
#[derive(Debug, Error)]
pub enum StageError {
    /// Bus unreachable, publish or poll failed.
    #[error("bus error: {0:#}")]
    Bus(anyhow::Error),

    /// Database unreachable or a write failed.
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    /// Exchange feed or execution failed.
    #[error("exchange error: {0:#}")]
    Exchange(anyhow::Error),

    /// Stage could not be built from its configuration.
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),
}

impl StageError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bus(_) => "bus",
            Self::Storage(_) => "storage",
            Self::Exchange(_) => "exchange",
            Self::Config(_) => "config",
        }
    }
}
