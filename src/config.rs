//! Configuration System using Figment
//!
//! Configuration is layered from:
//! 1. `config/range.toml` (base configuration)
//! 2. Environment variables prefixed with `ANTENNA_RANGE_`, with `__`
//!    separating nested keys (`ANTENNA_RANGE_SCAN__PAUSE_POLL_MS=50`)
//!
//! Every section carries serde defaults, so a partial file (or no file at
//! all) still yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use antenna_range::config::RangeConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RangeConfig::load()?;
//! config.validate()?;
//! println!("CSV directory: {}", config.storage.csv_dir.display());
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RangeError, RangeResult};

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/range.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "ANTENNA_RANGE_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where scan results and session state are written
    #[serde(default)]
    pub storage: StorageConfig,
    /// Scan loop timing
    #[serde(default)]
    pub scan: ScanSettings,
    /// GRBL positioner connection
    #[serde(default)]
    pub positioner: PositionerConfig,
    /// Network analyzer connection
    #[serde(default)]
    pub vna: VnaConfig,
    /// Polarization rotation stage connection
    #[serde(default)]
    pub rotation_stage: RotationStageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory bare CSV names are resolved against
    #[serde(default = "default_csv_dir")]
    pub csv_dir: PathBuf,
    /// JSON file holding the last recorded scan path
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
}

/// Timing knobs for the scan worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Upper bound on a single positioner move (seconds)
    #[serde(default = "default_motion_timeout")]
    pub motion_timeout_secs: u64,
    /// Upper bound on the rotation stage busy/idle handshake (seconds)
    #[serde(default = "default_rotation_timeout")]
    pub rotation_timeout_secs: u64,
    /// Upper bound on the end-of-scan return moves (seconds)
    #[serde(default = "default_restore_timeout")]
    pub restore_timeout_secs: u64,
    /// Pause flag polling interval (milliseconds)
    #[serde(default = "default_pause_poll")]
    pub pause_poll_ms: u64,
    /// Number of 3D points buffered before a redraw is requested
    #[serde(default = "default_plot_batch")]
    pub plot_batch_size: usize,
    /// VNA channel read for every trace
    #[serde(default = "default_channel")]
    pub vna_channel: String,
}

/// GRBL positioner connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionerConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
    #[serde(default = "default_positioner_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Network analyzer connection (SCPI over TCP)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnaConfig {
    #[serde(default = "default_vna_host")]
    pub host: String,
    #[serde(default = "default_vna_port")]
    pub port: u16,
    /// GPIB address behind a Prologix-style GPIB-LAN gateway; `None` for a
    /// native LAN instrument
    #[serde(default)]
    pub gpib_address: Option<u8>,
    /// Reply timeout in milliseconds
    #[serde(default = "default_vna_timeout")]
    pub timeout_ms: u64,
}

/// Polarization rotation stage connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationStageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rotation_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Motor steps per degree of rotation
    #[serde(default = "default_steps_per_deg")]
    pub steps_per_deg: f64,
}

// Default value functions
fn default_app_name() -> String {
    "Antenna Range".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_csv_dir() -> PathBuf {
    PathBuf::from("csv")
}

fn default_session_file() -> PathBuf {
    PathBuf::from("csv/.last_session.json")
}

fn default_motion_timeout() -> u64 {
    60
}

fn default_rotation_timeout() -> u64 {
    30
}

fn default_restore_timeout() -> u64 {
    30
}

fn default_pause_poll() -> u64 {
    100
}

fn default_plot_batch() -> usize {
    10
}

fn default_channel() -> String {
    "CHAN1".to_string()
}

fn default_positioner_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud() -> u32 {
    115_200
}

fn default_vna_host() -> String {
    "192.168.0.50".to_string()
}

fn default_vna_port() -> u16 {
    1234
}

fn default_vna_timeout() -> u64 {
    5000
}

fn default_rotation_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_steps_per_deg() -> f64 {
    800.0
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            csv_dir: default_csv_dir(),
            session_file: default_session_file(),
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            motion_timeout_secs: default_motion_timeout(),
            rotation_timeout_secs: default_rotation_timeout(),
            restore_timeout_secs: default_restore_timeout(),
            pause_poll_ms: default_pause_poll(),
            plot_batch_size: default_plot_batch(),
            vna_channel: default_channel(),
        }
    }
}

impl Default for PositionerConfig {
    fn default() -> Self {
        Self {
            port: default_positioner_port(),
            baud: default_baud(),
        }
    }
}

impl Default for VnaConfig {
    fn default() -> Self {
        Self {
            host: default_vna_host(),
            port: default_vna_port(),
            gpib_address: Some(16),
            timeout_ms: default_vna_timeout(),
        }
    }
}

impl Default for RotationStageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_rotation_port(),
            baud: default_baud(),
            steps_per_deg: default_steps_per_deg(),
        }
    }
}

impl RangeConfig {
    /// Load configuration from `config/range.toml` and environment variables
    ///
    /// Example override: `ANTENNA_RANGE_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> RangeResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> RangeResult<Self> {
        let config = Figment::from(Serialized::defaults(RangeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> RangeResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(RangeError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let scan = &self.scan;
        if scan.motion_timeout_secs == 0
            || scan.rotation_timeout_secs == 0
            || scan.restore_timeout_secs == 0
        {
            return Err(RangeError::Configuration(
                "scan timeouts must be greater than zero".to_string(),
            ));
        }
        if scan.pause_poll_ms == 0 || scan.pause_poll_ms > 1000 {
            return Err(RangeError::Configuration(format!(
                "pause_poll_ms must be within 1..=1000, got {}",
                scan.pause_poll_ms
            )));
        }
        if scan.plot_batch_size == 0 {
            return Err(RangeError::Configuration(
                "plot_batch_size must be at least 1".to_string(),
            ));
        }
        if scan.vna_channel.trim().is_empty() {
            return Err(RangeError::Configuration(
                "vna_channel must not be empty".to_string(),
            ));
        }

        if !(self.rotation_stage.steps_per_deg.is_finite() && self.rotation_stage.steps_per_deg > 0.0)
        {
            return Err(RangeError::Configuration(format!(
                "rotation_stage.steps_per_deg must be positive, got {}",
                self.rotation_stage.steps_per_deg
            )));
        }

        if self.storage.csv_dir.as_os_str().is_empty() {
            return Err(RangeError::Configuration(
                "storage.csv_dir must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Scan timing derived from the `[scan]` section.
    pub fn timing(&self) -> ScanTiming {
        ScanTiming::from(&self.scan)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> RangeResult<String> {
        toml::to_string_pretty(self).map_err(|e| RangeError::Configuration(e.to_string()))
    }
}

/// Durations the scan worker runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTiming {
    pub motion_timeout: Duration,
    pub rotation_timeout: Duration,
    pub restore_timeout: Duration,
    pub pause_poll: Duration,
    pub plot_batch_size: usize,
    pub vna_channel: String,
}

impl Default for ScanTiming {
    fn default() -> Self {
        ScanTiming::from(&ScanSettings::default())
    }
}

impl From<&ScanSettings> for ScanTiming {
    fn from(settings: &ScanSettings) -> Self {
        Self {
            motion_timeout: Duration::from_secs(settings.motion_timeout_secs),
            rotation_timeout: Duration::from_secs(settings.rotation_timeout_secs),
            restore_timeout: Duration::from_secs(settings.restore_timeout_secs),
            pause_poll: Duration::from_millis(settings.pause_poll_ms),
            plot_batch_size: settings.plot_batch_size.max(1),
            vna_channel: settings.vna_channel.clone(),
        }
    }
}
