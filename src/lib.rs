//! # Antenna Range Core Library
//!
//! Scan orchestration for an anechoic-chamber antenna test range. A two-axis
//! positioner points the antenna under test, a vector network analyzer
//! records a frequency trace at every angle, and an optional rotation stage
//! switches the probe polarization between passes. Every pass is appended to a
//! CSV file as a self-describing block.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-layered `RangeConfig` (TOML file, then environment).
//! - **`error`**: the `RangeError` enum and `RangeResult` alias.
//! - **`hardware`**: capability traits (`Positioner`, `NetworkAnalyzer`,
//!   `RotationStage`), the GRBL, HP 8720 and Arduino drivers, and simulated
//!   devices for tests and demos.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`review`**: reads recorded scan files back, block by block.
//! - **`scan`**: parameters, angle grid, CSV block writer, live plot sink and
//!   the `ScanController` state machine with its worker thread.
//! - **`session`**: the shared "last recorded scan" pointer.
//! - **`ui_bridge`**: cancellable task queue from worker threads to the UI thread.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod review;
pub mod scan;
pub mod session;
pub mod ui_bridge;

pub use config::RangeConfig;
pub use error::{RangeError, RangeResult, Stage};
pub use scan::{ScanController, ScanDevices, ScanOutcome, ScanParameters, ScanState, ScanView};
pub use session::SessionState;
