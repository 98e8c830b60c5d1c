//! Multi-block CSV log
//!
//! Every polarization pass appends one self-delimited block to the scan file:
//!
//! ```text
//! # --- TEST-START ---
//! # CONFIG_JSON: {"name":...,"mode":...,"sweep":{...},"grid":{...},...}
//! # META: vna=<identity>
//! # META: positioner=<identity>
//! # META: polarization=<label>
//! Phi (deg),Theta (deg),Frequency (GHz),<format label>
//! <phi>,<theta>,<freq_ghz>,<value>
//! # --- TEST-END ---
//! ```
//!
//! Files are only ever appended to. Each data row is written with its own
//! open/append/close cycle so an interrupted process loses at most the row in
//! flight; a block left without its end marker is still readable line by line.

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::params::{GridConfig, PlotOptions, PolarizationStep, ScanMode, ScanParameters, SweepConfig};
use super::ScanSample;
use crate::error::{RangeError, RangeResult};

pub const BLOCK_START: &str = "# --- TEST-START ---";
pub const BLOCK_END: &str = "# --- TEST-END ---";
pub const CONFIG_PREFIX: &str = "# CONFIG_JSON: ";
pub const META_PREFIX: &str = "# META: ";

pub const PHI_COLUMN: &str = "Phi (deg)";
pub const THETA_COLUMN: &str = "Theta (deg)";
pub const FREQUENCY_COLUMN: &str = "Frequency (GHz)";

/// Decimal places kept for measured values.
pub const VALUE_DECIMALS: i32 = 2;

/// The `CONFIG_JSON` object written at the top of each block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub name: String,
    pub mode: ScanMode,
    pub polarization: String,
    #[serde(default)]
    pub polarization_angle_deg: Option<f64>,
    /// Shared by every block of one scan attempt
    #[serde(default)]
    pub run_uid: Option<String>,
    pub sweep: SweepConfig,
    pub grid: GridConfig,
    #[serde(default)]
    pub plot_options: PlotOptions,
    /// `%Y-%m-%d %H:%M:%S` in local time
    pub created_local: String,
    /// ISO-8601 UTC with a trailing `Z`
    pub created_utc: String,
}

impl BlockMetadata {
    /// Metadata for one polarization pass, stamped with the current time.
    pub fn for_pass(params: &ScanParameters, step: &PolarizationStep, run_uid: &str) -> Self {
        Self {
            name: params.name().to_string(),
            mode: params.mode(),
            polarization: step.label.clone(),
            polarization_angle_deg: Some(step.angle_deg),
            run_uid: Some(run_uid.to_string()),
            sweep: params.sweep().clone(),
            grid: params.grid().clone(),
            plot_options: params.plot().clone(),
            created_local: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            created_utc: format!("{}Z", Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f")),
        }
    }

    pub fn value_label(&self) -> &'static str {
        self.sweep.format.axis_label()
    }
}

/// Best-effort identity strings written as `META` lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceIdentities {
    pub vna: Option<String>,
    pub positioner: Option<String>,
    pub rotation_stage: Option<String>,
}

/// Column header for a block.
pub fn header_row(value_label: &str) -> [&str; 4] {
    [PHI_COLUMN, THETA_COLUMN, FREQUENCY_COLUMN, value_label]
}

/// Round a measured value to the stored precision.
pub fn round_value(value: f64) -> f64 {
    let scale = 10f64.powi(VALUE_DECIMALS);
    normalize_zero((value * scale).round() / scale)
}

fn normalize_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

/// Shortest decimal text, always with a fractional part (`90.0`, `-3.25`).
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn trim_noise(value: f64, scale: f64) -> f64 {
    normalize_zero((value * scale).round() / scale)
}

/// Render one data row; angles and frequency are cleaned of float noise.
pub fn format_row(sample: &ScanSample) -> [String; 4] {
    [
        format_number(trim_noise(sample.phi_deg, 1e6)),
        format_number(trim_noise(sample.theta_deg, 1e6)),
        format_number(trim_noise(sample.freq_ghz, 1e9)),
        format_number(round_value(sample.value)),
    ]
}

/// Append-only writer for one scan file.
#[derive(Debug)]
pub struct CsvBlockWriter {
    path: PathBuf,
    open: bool,
    rows_in_block: u64,
}

impl CsvBlockWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            open: false,
            rows_in_block: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn rows_in_block(&self) -> u64 {
        self.rows_in_block
    }

    /// Start a block: marker, metadata JSON, `META` lines, column header.
    ///
    /// `extra_meta` lines follow the identity lines, e.g. a degraded settle flag.
    pub fn open_block(
        &mut self,
        metadata: &BlockMetadata,
        identities: &DeviceIdentities,
        extra_meta: &[(&str, String)],
    ) -> RangeResult<()> {
        if self.open {
            warn!(path = %self.path.display(), "previous block still open; closing it first");
            self.close_block()?;
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(RangeError::persistence)?;
        }

        let config_json = serde_json::to_string(metadata).map_err(RangeError::persistence)?;
        let mut preamble = format!("{BLOCK_START}\n{CONFIG_PREFIX}{config_json}\n");
        let identity_lines = [
            ("vna", &identities.vna),
            ("positioner", &identities.positioner),
            ("rotation_stage", &identities.rotation_stage),
        ];
        for (key, value) in identity_lines {
            if let Some(value) = value {
                preamble.push_str(&meta_line(key, value));
            }
        }
        preamble.push_str(&meta_line("polarization", &metadata.polarization));
        for (key, value) in extra_meta {
            preamble.push_str(&meta_line(key, value));
        }

        let mut file = self.append_handle()?;
        // Any byte of the start marker may reach the file from here on, so a
        // failed write still leaves the block for `close_block` to end.
        self.open = true;
        self.rows_in_block = 0;
        file.write_all(preamble.as_bytes())
            .map_err(RangeError::persistence)?;

        let mut writer = row_writer(file);
        writer
            .write_record(header_row(metadata.value_label()))
            .map_err(RangeError::persistence)?;
        writer.flush().map_err(RangeError::persistence)?;

        debug!(path = %self.path.display(), polarization = %metadata.polarization, "CSV block opened");
        Ok(())
    }

    /// Append one data row with an independent open/append/close.
    pub fn append_row(&mut self, sample: &ScanSample) -> RangeResult<()> {
        if !self.open {
            return Err(RangeError::Persistence(format!(
                "no open block in {}",
                self.path.display()
            )));
        }
        let mut writer = row_writer(self.append_handle()?);
        writer
            .write_record(format_row(sample))
            .map_err(RangeError::persistence)?;
        writer.flush().map_err(RangeError::persistence)?;
        self.rows_in_block += 1;
        Ok(())
    }

    /// Write the end marker. A no-op when no block is open.
    pub fn close_block(&mut self) -> RangeResult<()> {
        if !self.open {
            return Ok(());
        }
        let mut file = self.append_handle()?;
        writeln!(file, "{BLOCK_END}").map_err(RangeError::persistence)?;
        self.open = false;
        debug!(path = %self.path.display(), rows = self.rows_in_block, "CSV block closed");
        Ok(())
    }

    fn append_handle(&self) -> RangeResult<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RangeError::Persistence(format!("{}: {e}", self.path.display())))
    }
}

fn row_writer(file: File) -> csv::Writer<File> {
    csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(file)
}

fn meta_line(key: &str, value: &str) -> String {
    // Identity strings come from instruments; keep each on a single line.
    let value = value.replace(['\r', '\n'], " ");
    format!("{META_PREFIX}{key}={}\n", value.trim())
}
