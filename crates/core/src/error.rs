//! Error taxonomy for the simulation core.
//!
//! Every failure surfaced to callers is a [`SimError`]. The variants map to
//! distinct categories so a test harness can tell a bad hardware parameter
//! apart from a broken firmware image or a run that never terminated.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SimError>;

/// Category of a [`SimError`], for matching without inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Load,
    NotFound,
    Timeout,
    Snapshot,
}

#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid hardware parameter (zero prescaler, zero TOP, bad config value).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed or unsupported firmware image, or unknown device variant.
    #[error("load error: {0}")]
    Load(String),

    /// Unknown pin, timer, or symbol name.
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    /// The termination address was not reached within the step budget.
    #[error("no termination point reached after {steps} steps ({cycles} cycles)")]
    Timeout { steps: u64, cycles: u64 },

    /// Savestate blob is corrupt or belongs to a different device/firmware.
    #[error("savestate error: {0}")]
    Snapshot(String),
}

impl SimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SimError::Configuration(_) => ErrorKind::Configuration,
            SimError::Load(_) => ErrorKind::Load,
            SimError::NotFound { .. } => ErrorKind::NotFound,
            SimError::Timeout { .. } => ErrorKind::Timeout,
            SimError::Snapshot(_) => ErrorKind::Snapshot,
        }
    }

    pub(crate) fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        SimError::NotFound { what, name: name.into() }
    }
}
