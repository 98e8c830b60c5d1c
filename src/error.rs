//! Custom error types for the application.
//!
//! `RangeError` is the single error type surfaced by the scan controller and
//! the supporting modules. Its variants follow the three failure families a
//! scan can run into:
//!
//! - **`Validation`**: a parameter is missing or out of range. Raised while
//!   building [`ScanParameters`](crate::scan::ScanParameters), before any
//!   thread is spawned or any device is touched.
//! - **`Device`**: a positioner, VNA or rotation-stage command failed or timed
//!   out. The [`Stage`] tag produces the user-facing `"<Stage> error: ..."`
//!   string.
//! - **`Persistence`**: writing the CSV log failed (disk full, permissions).
//!
//! The remaining variants cover configuration loading and controller misuse
//! (starting a scan while one is running, pausing while idle, ...).
//!
//! Device capability traits keep using `anyhow::Result`; the scan worker tags
//! each failure with its stage through [`RangeError::device`].

use std::fmt;
use thiserror::Error;

use crate::scan::ScanState;

/// Convenience alias for results using the application error type.
pub type RangeResult<T> = std::result::Result<T, RangeError>;

/// The device family a command was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Two-axis (phi/theta) positioner
    Positioner,
    /// Vector network analyzer
    Vna,
    /// Polarization rotation stage
    RotationStage,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Positioner => write!(f, "Positioner"),
            Stage::Vna => write!(f, "VNA"),
            Stage::RotationStage => write!(f, "Rotation stage"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RangeError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{stage} error: {message}")]
    Device { stage: Stage, message: String },

    #[error("CSV error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("A scan is {0}; stop it before issuing device commands")]
    ScanActive(ScanState),

    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: ScanState,
    },

    #[error("No recorded scan is available")]
    NoRecordedScan,

    #[error("Scan worker error: {0}")]
    Worker(String),
}

impl RangeError {
    /// Tag a driver failure with the stage it came from.
    ///
    /// The alternate formatting keeps the `anyhow` context chain in the message.
    pub fn device(stage: Stage, err: &anyhow::Error) -> Self {
        RangeError::Device {
            stage,
            message: format!("{err:#}"),
        }
    }

    pub fn persistence(err: impl fmt::Display) -> Self {
        RangeError::Persistence(err.to_string())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        RangeError::Validation(message.into())
    }

    /// Whether this error was raised before any device I/O could happen.
    pub fn is_validation(&self) -> bool {
        matches!(self, RangeError::Validation(_))
    }

    /// The stage a device error belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RangeError::Device { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
