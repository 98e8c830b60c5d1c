//! Process-wide session state.
//!
//! Holds the most recent scan file so the review side can offer "load last
//! test". The scan controller is the only writer (on every block open); the
//! review tool reads it on demand. A [`SessionState`] is passed explicitly to
//! both sides as an `Arc`.
//!
//! When built with [`SessionState::persistent`], every update is also written
//! to a small JSON file so a separate review process can pick it up.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

use crate::error::RangeResult;

/// What is saved in the session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub last_csv: PathBuf,
    /// Name of the scan that wrote it
    pub scan_name: String,
    pub recorded_utc: String,
}

/// Shared "last scan file" pointer.
#[derive(Debug, Default)]
pub struct SessionState {
    last: RwLock<Option<SessionSnapshot>>,
    store: Option<PathBuf>,
}

impl SessionState {
    /// In-memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backed by `store`; an existing snapshot there is loaded.
    pub fn persistent(store: impl Into<PathBuf>) -> Self {
        let store = store.into();
        let last = if store.exists() {
            match load_session(&store) {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    warn!(path = %store.display(), "ignoring unreadable session file: {err}");
                    None
                }
            }
        } else {
            None
        };
        Self {
            last: RwLock::new(last),
            store: Some(store),
        }
    }

    /// Record `path` as the most recent scan file.
    ///
    /// The in-memory pointer is always updated; a failure to write the
    /// session file is returned but leaves the pointer in place.
    pub fn record_csv(&self, path: &Path, scan_name: &str) -> RangeResult<()> {
        let snapshot = SessionSnapshot {
            last_csv: path.to_path_buf(),
            scan_name: scan_name.to_string(),
            recorded_utc: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        };
        *self.last.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        debug!(path = %path.display(), "last scan file updated");

        match &self.store {
            Some(store) => save_session(&snapshot, store),
            None => Ok(()),
        }
    }

    pub fn last_csv(&self) -> Option<PathBuf> {
        self.snapshot().map(|snapshot| snapshot.last_csv)
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.last
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_deref()
    }
}

/// Saves a snapshot as pretty JSON, creating parent directories.
pub fn save_session(snapshot: &SessionSnapshot, path: &Path) -> RangeResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| crate::error::RangeError::Configuration(e.to_string()))?;
    fs::write(path, json)?;
    Ok(())
}

/// Loads a snapshot from a file.
pub fn load_session(path: &Path) -> RangeResult<SessionSnapshot> {
    let json = fs::read_to_string(path)?;
    serde_json::from_str(&json)
        .map_err(|e| crate::error::RangeError::Configuration(format!("{}: {e}", path.display())))
}
