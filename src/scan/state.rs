//! Scan lifecycle states and terminal outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Status line shown after a scan ran to the end.
pub const STATUS_COMPLETE: &str = "Scan complete. Results saved.";
/// Status line shown after a user abort.
pub const STATUS_ABORTED: &str = "Scan aborted.";

/// Controller lifecycle
///
/// ```text
/// Idle -> Configuring -> Running <-> Paused
///                          |           |
///                          +-> Aborting <+
///                          +-> Failing
/// Running | Aborting | Failing -> Completing -> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    /// No mode selected, devices free for manual control
    Idle,
    /// A scan mode is selected and parameters are being edited
    Configuring,
    /// The worker is iterating the angle grid
    Running,
    /// The worker is parked in its pause-wait loop
    Paused,
    /// Abort observed; the worker is unwinding
    Aborting,
    /// A device or CSV error ended the scan; the worker is unwinding
    Failing,
    /// Cleanup finished; waiting for the controller to reap the worker
    Completing,
}

impl ScanState {
    /// A worker thread exists for this state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ScanState::Running
                | ScanState::Paused
                | ScanState::Aborting
                | ScanState::Failing
                | ScanState::Completing
        )
    }

    pub fn can_start(self) -> bool {
        self == ScanState::Configuring
    }

    pub fn can_pause(self) -> bool {
        self == ScanState::Running
    }

    pub fn can_resume(self) -> bool {
        self == ScanState::Paused
    }

    pub fn can_abort(self) -> bool {
        matches!(self, ScanState::Running | ScanState::Paused)
    }

    fn as_u8(self) -> u8 {
        match self {
            ScanState::Idle => 0,
            ScanState::Configuring => 1,
            ScanState::Running => 2,
            ScanState::Paused => 3,
            ScanState::Aborting => 4,
            ScanState::Failing => 5,
            ScanState::Completing => 6,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ScanState::Configuring,
            2 => ScanState::Running,
            3 => ScanState::Paused,
            4 => ScanState::Aborting,
            5 => ScanState::Failing,
            6 => ScanState::Completing,
            _ => ScanState::Idle,
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "idle"),
            ScanState::Configuring => write!(f, "configuring"),
            ScanState::Running => write!(f, "running"),
            ScanState::Paused => write!(f, "paused"),
            ScanState::Aborting => write!(f, "aborting"),
            ScanState::Failing => write!(f, "failing"),
            ScanState::Completing => write!(f, "completing"),
        }
    }
}

/// Lock-free publication of the current state.
///
/// While a scan runs only the worker writes it; the controller writes it
/// while idle and when reaping the worker.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new(state: ScanState) -> Self {
        Self(Arc::new(AtomicU8::new(state.as_u8())))
    }

    pub(crate) fn get(&self) -> ScanState {
        ScanState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ScanState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// How a scan attempt ended. Exactly one is produced per started scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Every polarization pass finished.
    Completed {
        /// Samples persisted across all blocks
        samples: u64,
        /// CSV blocks opened and closed
        blocks: usize,
        /// Polarization moves whose settling relied on the time estimate
        estimated_settles: usize,
    },
    /// The user aborted; the open block was closed early.
    Aborted { samples: u64 },
    /// A device or CSV error ended the scan.
    Failed {
        /// Fully rendered `"<Stage> error: <message>"` text
        message: String,
    },
}

impl ScanOutcome {
    /// The single terminal status line for the UI.
    pub fn status_message(&self) -> String {
        match self {
            ScanOutcome::Completed { .. } => STATUS_COMPLETE.to_string(),
            ScanOutcome::Aborted { .. } => STATUS_ABORTED.to_string(),
            ScanOutcome::Failed { message } => message.clone(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ScanOutcome::Completed { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ScanOutcome::Aborted { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ScanOutcome::Failed { .. })
    }
}
