//! Scan parameters
//!
//! [`ScanParameters`] is the immutable, fully validated description of one
//! scan. The only way to obtain one is [`ScanParametersBuilder::build`], so an
//! invalid parameter set can never reach the worker thread.
//!
//! ```
//! use antenna_range::scan::{ScanMode, ScanParametersBuilder};
//!
//! let params = ScanParametersBuilder::new(ScanMode::XySlice)
//!     .phi_step(90.0)
//!     .sweep(8.0, 8.0, 1)
//!     .modify_vna(false)
//!     .csv_path("csv/xy_cut")
//!     .build()
//!     .unwrap();
//! assert_eq!(params.csv_path().to_str(), Some("csv/xy_cut.csv"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{RangeError, RangeResult};

/// Sweep point counts the analyzer accepts when it is being configured.
pub const VNA_POINT_CHOICES: [u32; 10] = [3, 11, 21, 26, 51, 101, 201, 401, 801, 1601];

/// Lowest source power the range hardware tolerates (dBm).
pub const MIN_POWER_DBM: f64 = -70.0;
/// Highest source power the range hardware tolerates (dBm).
pub const MAX_POWER_DBM: f64 = 5.0;

/// Shape of the angle grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanMode {
    /// theta over [0, 180], phi over [0, 360)
    #[serde(rename = "full")]
    FullSpherical,
    /// theta fixed at 90, phi swept
    #[serde(rename = "xy")]
    XySlice,
    /// phi fixed at 0, theta swept over [0, 360)
    #[serde(rename = "phi0")]
    Phi0Slice,
    /// phi fixed at 90, theta swept over [0, 360)
    #[serde(rename = "phi90")]
    Phi90Slice,
    /// one axis fixed at a user angle, the other swept over [0, 360)
    #[serde(rename = "custom")]
    CustomSlice,
}

impl ScanMode {
    pub const ALL: [ScanMode; 5] = [
        ScanMode::FullSpherical,
        ScanMode::XySlice,
        ScanMode::Phi0Slice,
        ScanMode::Phi90Slice,
        ScanMode::CustomSlice,
    ];

    /// Short token stored in CSV metadata.
    pub fn token(self) -> &'static str {
        match self {
            ScanMode::FullSpherical => "full",
            ScanMode::XySlice => "xy",
            ScanMode::Phi0Slice => "phi0",
            ScanMode::Phi90Slice => "phi90",
            ScanMode::CustomSlice => "custom",
        }
    }

    /// Human-readable test name.
    pub fn label(self) -> &'static str {
        match self {
            ScanMode::FullSpherical => "Full Spherical Scan",
            ScanMode::XySlice => "XY Slice (theta = 90)",
            ScanMode::Phi0Slice => "Phi = 0 Slice",
            ScanMode::Phi90Slice => "Phi = 90 Slice",
            ScanMode::CustomSlice => "Custom 2D Slice",
        }
    }

    /// Full-sphere scans feed the 3D view; slices feed the 2D view.
    pub fn is_spherical(self) -> bool {
        self == ScanMode::FullSpherical
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for ScanMode {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScanMode::ALL
            .into_iter()
            .find(|mode| mode.token().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                RangeError::validation(format!(
                    "unknown scan mode '{s}' (expected full, xy, phi0, phi90 or custom)"
                ))
            })
    }
}

/// Positioner axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Phi,
    Theta,
}

impl Axis {
    pub fn other(self) -> Axis {
        match self {
            Axis::Phi => Axis::Theta,
            Axis::Theta => Axis::Phi,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Phi => write!(f, "phi"),
            Axis::Theta => write!(f, "theta"),
        }
    }
}

impl FromStr for Axis {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "phi" => Ok(Axis::Phi),
            "theta" => Ok(Axis::Theta),
            other => Err(RangeError::validation(format!(
                "fixed axis must be 'phi' or 'theta', got '{other}'"
            ))),
        }
    }
}

/// Analyzer display format; the token is sent verbatim as a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeasurementFormat {
    Logm,
    Phas,
    Smic,
    Pola,
    Linm,
    Swr,
    Real,
    Imag,
}

impl MeasurementFormat {
    pub const ALL: [MeasurementFormat; 8] = [
        MeasurementFormat::Logm,
        MeasurementFormat::Phas,
        MeasurementFormat::Smic,
        MeasurementFormat::Pola,
        MeasurementFormat::Linm,
        MeasurementFormat::Swr,
        MeasurementFormat::Real,
        MeasurementFormat::Imag,
    ];

    pub fn token(self) -> &'static str {
        match self {
            MeasurementFormat::Logm => "LOGM",
            MeasurementFormat::Phas => "PHAS",
            MeasurementFormat::Smic => "SMIC",
            MeasurementFormat::Pola => "POLA",
            MeasurementFormat::Linm => "LINM",
            MeasurementFormat::Swr => "SWR",
            MeasurementFormat::Real => "REAL",
            MeasurementFormat::Imag => "IMAG",
        }
    }

    /// Column header and plot axis label for this format.
    pub fn axis_label(self) -> &'static str {
        match self {
            MeasurementFormat::Logm => "Magnitude (dB)",
            MeasurementFormat::Phas => "Phase (deg)",
            MeasurementFormat::Smic => "Smith Chart (complex)",
            MeasurementFormat::Pola => "Polar (complex)",
            MeasurementFormat::Linm => "Magnitude (linear)",
            MeasurementFormat::Swr => "SWR",
            MeasurementFormat::Real => "Real Part",
            MeasurementFormat::Imag => "Imaginary Part",
        }
    }
}

impl fmt::Display for MeasurementFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for MeasurementFormat {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MeasurementFormat::ALL
            .into_iter()
            .find(|format| format.token().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RangeError::validation(format!("unknown measurement format '{s}'")))
    }
}

/// One polarization pass: a label and the absolute rotation-stage angle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolarizationStep {
    pub label: String,
    pub angle_deg: f64,
}

impl PolarizationStep {
    pub fn new(label: impl Into<String>, angle_deg: f64) -> Self {
        Self {
            label: label.into(),
            angle_deg,
        }
    }

    pub fn vertical() -> Self {
        Self::new("vertical", 0.0)
    }

    pub fn horizontal() -> Self {
        Self::new("horizontal", 90.0)
    }
}

/// Ordered polarization passes; each produces its own CSV block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolarizationPlan(Vec<PolarizationStep>);

impl PolarizationPlan {
    pub fn vertical() -> Self {
        Self(vec![PolarizationStep::vertical()])
    }

    pub fn horizontal() -> Self {
        Self(vec![PolarizationStep::horizontal()])
    }

    pub fn both() -> Self {
        Self(vec![
            PolarizationStep::vertical(),
            PolarizationStep::horizontal(),
        ])
    }

    pub fn from_steps(steps: Vec<PolarizationStep>) -> Self {
        Self(steps)
    }

    pub fn steps(&self) -> &[PolarizationStep] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Any pass needs the rotation stage away from its 0 degree reference.
    pub fn needs_rotation(&self) -> bool {
        self.0.iter().any(|step| step.angle_deg != 0.0)
    }
}

impl Default for PolarizationPlan {
    fn default() -> Self {
        Self::vertical()
    }
}

impl FromStr for PolarizationPlan {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vertical" | "v" => Ok(Self::vertical()),
            "horizontal" | "h" => Ok(Self::horizontal()),
            "both" => Ok(Self::both()),
            other => Err(RangeError::validation(format!(
                "polarization must be vertical, horizontal or both, got '{other}'"
            ))),
        }
    }
}

/// Frequency sweep, as persisted in block metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub start_ghz: f64,
    pub stop_ghz: f64,
    pub points: u32,
    pub format: MeasurementFormat,
    pub power_dbm: f64,
}

/// Angle grid settings, as persisted in block metadata.
///
/// Fields that do not apply to the scan mode are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub phi_step_deg: Option<f64>,
    pub theta_step_deg: Option<f64>,
    pub custom_axis: Option<Axis>,
    pub custom_angle_deg: Option<f64>,
    pub custom_step_deg: Option<f64>,
}

/// Presentation hints saved with each block for later reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlotOptions {
    pub title: Option<String>,
    #[serde(default)]
    pub show_grid: bool,
    pub y_limits: Option<(f64, f64)>,
}

/// Validated, immutable scan configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanParameters {
    name: String,
    mode: ScanMode,
    sweep: SweepConfig,
    grid: GridConfig,
    polarization: PolarizationPlan,
    csv_path: PathBuf,
    modify_vna: bool,
    plot: PlotOptions,
}

impl ScanParameters {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn sweep(&self) -> &SweepConfig {
        &self.sweep
    }

    pub fn grid(&self) -> &GridConfig {
        &self.grid
    }

    pub fn polarization(&self) -> &PolarizationPlan {
        &self.polarization
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// When false the analyzer is only read, never configured.
    pub fn modify_vna(&self) -> bool {
        self.modify_vna
    }

    pub fn plot(&self) -> &PlotOptions {
        &self.plot
    }

    /// The axis the 2D view plots against, `None` for spherical scans.
    pub fn swept_axis(&self) -> Option<Axis> {
        match self.mode {
            ScanMode::FullSpherical => None,
            ScanMode::XySlice => Some(Axis::Phi),
            ScanMode::Phi0Slice | ScanMode::Phi90Slice => Some(Axis::Theta),
            ScanMode::CustomSlice => self.grid.custom_axis.map(Axis::other),
        }
    }
}

/// Place a bare file name under `csv_dir`; paths with a directory are kept.
pub fn resolve_csv_path(csv_dir: &Path, name: &str) -> PathBuf {
    let candidate = Path::new(name.trim());
    let has_dir = candidate
        .parent()
        .map(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(false);
    if has_dir || candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        csv_dir.join(candidate)
    }
}

fn with_csv_extension(path: &Path) -> PathBuf {
    let is_csv = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    if is_csv {
        path.to_path_buf()
    } else {
        let mut raw = path.as_os_str().to_os_string();
        raw.push(".csv");
        PathBuf::from(raw)
    }
}

fn positive_step(value: Option<f64>, what: &str) -> RangeResult<f64> {
    match value {
        None => Err(RangeError::validation(format!("{what} is required"))),
        Some(step) if !step.is_finite() || step <= 0.0 => Err(RangeError::validation(format!(
            "{what} must be > 0, got {step}"
        ))),
        Some(step) => Ok(step),
    }
}

/// Collects raw user input; [`build`](Self::build) validates all of it.
#[derive(Debug, Clone)]
pub struct ScanParametersBuilder {
    mode: ScanMode,
    name: Option<String>,
    phi_step: Option<f64>,
    theta_step: Option<f64>,
    custom_axis: Option<Axis>,
    custom_angle: Option<f64>,
    custom_step: Option<f64>,
    start_ghz: Option<f64>,
    stop_ghz: Option<f64>,
    points: Option<u32>,
    power_dbm: f64,
    format: MeasurementFormat,
    polarization: PolarizationPlan,
    csv_path: Option<PathBuf>,
    modify_vna: bool,
    plot: PlotOptions,
}

impl ScanParametersBuilder {
    pub fn new(mode: ScanMode) -> Self {
        Self {
            mode,
            name: None,
            phi_step: None,
            theta_step: None,
            custom_axis: None,
            custom_angle: None,
            custom_step: None,
            start_ghz: None,
            stop_ghz: None,
            points: None,
            power_dbm: 0.0,
            format: MeasurementFormat::Logm,
            polarization: PolarizationPlan::default(),
            csv_path: None,
            modify_vna: true,
            plot: PlotOptions::default(),
        }
    }

    /// Test name recorded in metadata; defaults to the mode label.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn phi_step(mut self, step_deg: f64) -> Self {
        self.phi_step = Some(step_deg);
        self
    }

    pub fn theta_step(mut self, step_deg: f64) -> Self {
        self.theta_step = Some(step_deg);
        self
    }

    pub fn custom_slice(mut self, fixed_axis: Axis, fixed_angle_deg: f64, step_deg: f64) -> Self {
        self.custom_axis = Some(fixed_axis);
        self.custom_angle = Some(fixed_angle_deg);
        self.custom_step = Some(step_deg);
        self
    }

    pub fn sweep(mut self, start_ghz: f64, stop_ghz: f64, points: u32) -> Self {
        self.start_ghz = Some(start_ghz);
        self.stop_ghz = Some(stop_ghz);
        self.points = Some(points);
        self
    }

    pub fn power_dbm(mut self, power: f64) -> Self {
        self.power_dbm = power;
        self
    }

    pub fn format(mut self, format: MeasurementFormat) -> Self {
        self.format = format;
        self
    }

    pub fn polarization(mut self, plan: PolarizationPlan) -> Self {
        self.polarization = plan;
        self
    }

    /// Destination file; `.csv` is appended when missing.
    pub fn csv_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.csv_path = Some(path.into());
        self
    }

    pub fn modify_vna(mut self, enabled: bool) -> Self {
        self.modify_vna = enabled;
        self
    }

    pub fn plot_options(mut self, plot: PlotOptions) -> Self {
        self.plot = plot;
        self
    }

    pub fn build(self) -> RangeResult<ScanParameters> {
        let grid = self.grid_config()?;
        super::grid::grid_size(self.mode, &grid)?;
        let sweep = self.sweep_config()?;

        if self.polarization.is_empty() {
            return Err(RangeError::validation(
                "polarization plan must contain at least one pass",
            ));
        }
        if let Some(step) = self
            .polarization
            .steps()
            .iter()
            .find(|step| !step.angle_deg.is_finite() || step.label.trim().is_empty())
        {
            return Err(RangeError::validation(format!(
                "invalid polarization pass '{}' at {} deg",
                step.label, step.angle_deg
            )));
        }

        let csv_path = match &self.csv_path {
            Some(path) if !path.as_os_str().is_empty() => with_csv_extension(path),
            _ => return Err(RangeError::validation("a CSV file name is required")),
        };

        if let Some((low, high)) = self.plot.y_limits {
            if !(low.is_finite() && high.is_finite() && low < high) {
                return Err(RangeError::validation(format!(
                    "y-axis limits must satisfy min < max, got ({low}, {high})"
                )));
            }
        }

        Ok(ScanParameters {
            name: self
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| self.mode.label().to_string()),
            mode: self.mode,
            sweep,
            grid,
            polarization: self.polarization,
            csv_path,
            modify_vna: self.modify_vna,
            plot: self.plot,
        })
    }

    fn grid_config(&self) -> RangeResult<GridConfig> {
        let grid = match self.mode {
            ScanMode::FullSpherical => GridConfig {
                phi_step_deg: Some(positive_step(self.phi_step, "Phi step")?),
                theta_step_deg: Some(positive_step(self.theta_step, "Theta step")?),
                ..GridConfig::default()
            },
            ScanMode::XySlice => GridConfig {
                phi_step_deg: Some(positive_step(self.phi_step, "Phi step")?),
                ..GridConfig::default()
            },
            ScanMode::Phi0Slice | ScanMode::Phi90Slice => GridConfig {
                theta_step_deg: Some(positive_step(self.theta_step, "Theta step")?),
                ..GridConfig::default()
            },
            ScanMode::CustomSlice => {
                let axis = self
                    .custom_axis
                    .ok_or_else(|| RangeError::validation("fixed axis is required"))?;
                let angle = match self.custom_angle {
                    Some(angle) if angle.is_finite() => angle,
                    _ => return Err(RangeError::validation("fixed angle is required")),
                };
                GridConfig {
                    custom_axis: Some(axis),
                    custom_angle_deg: Some(angle),
                    custom_step_deg: Some(positive_step(self.custom_step, "Step size")?),
                    ..GridConfig::default()
                }
            }
        };
        Ok(grid)
    }

    fn sweep_config(&self) -> RangeResult<SweepConfig> {
        let (start, stop) = match (self.start_ghz, self.stop_ghz) {
            (Some(start), Some(stop)) if start.is_finite() && stop.is_finite() => (start, stop),
            _ => return Err(RangeError::validation("start and stop frequency are required")),
        };
        if start <= 0.0 {
            return Err(RangeError::validation(format!(
                "start frequency must be positive, got {start} GHz"
            )));
        }
        let points = match self.points {
            Some(points) if points > 0 => points,
            _ => return Err(RangeError::validation("number of points must be at least 1")),
        };
        // A single-point sweep is a CW measurement and may use start == stop.
        if start > stop || (start == stop && points != 1) {
            return Err(RangeError::validation(format!(
                "start frequency must be below stop frequency ({start} >= {stop} GHz)"
            )));
        }
        if self.modify_vna && !VNA_POINT_CHOICES.contains(&points) {
            return Err(RangeError::validation(format!(
                "number of points must be one of {VNA_POINT_CHOICES:?}, got {points}"
            )));
        }
        if !(MIN_POWER_DBM..=MAX_POWER_DBM).contains(&self.power_dbm) {
            return Err(RangeError::validation(format!(
                "Power must be between {MIN_POWER_DBM} and {MAX_POWER_DBM} dBm."
            )));
        }
        Ok(SweepConfig {
            start_ghz: start,
            stop_ghz: stop,
            points,
            format: self.format,
            power_dbm: self.power_dbm,
        })
    }
}
