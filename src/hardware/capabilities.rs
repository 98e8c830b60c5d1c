//! Device contracts consumed by the scan controller.
//!
//! Three narrow traits, one per instrument on the range:
//!
//! - [`Positioner`]: two-axis (phi/theta) motion plus homing and origin save
//! - [`NetworkAnalyzer`]: SCPI write/query and trace read
//! - [`RotationStage`]: polarization angle with a busy/idle handshake
//!
//! # Design
//!
//! Each trait:
//! - Is async (uses #[async_trait])
//! - Is `Send` but not `Sync`: a proxy belongs to exactly one thread at a
//!   time, so methods take `&mut self` and need no interior locking
//! - Uses anyhow::Result for errors; the controller tags failures with the
//!   device stage
//! - Exposes identity as an optional capability (`None` when unsupported)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::scan::params::{MeasurementFormat, SweepConfig};

/// Poll interval of the rotation-stage busy/idle handshake.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shortest time-based settle applied when the handshake is unavailable.
pub const MIN_ESTIMATED_SETTLE: Duration = Duration::from_millis(500);

/// Time-based settle allowance per degree of rotation.
pub const ESTIMATED_SETTLE_PER_DEG: Duration = Duration::from_millis(50);

/// Axes accepted by [`Positioner::home`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HomeAxes {
    X,
    Y,
    Z,
    A,
    All,
}

impl fmt::Display for HomeAxes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HomeAxes::X => write!(f, "X"),
            HomeAxes::Y => write!(f, "Y"),
            HomeAxes::Z => write!(f, "Z"),
            HomeAxes::A => write!(f, "A"),
            HomeAxes::All => write!(f, "all"),
        }
    }
}

impl FromStr for HomeAxes {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "x" | "phi" => Ok(HomeAxes::X),
            "y" | "theta" => Ok(HomeAxes::Y),
            "z" => Ok(HomeAxes::Z),
            "a" => Ok(HomeAxes::A),
            "all" => Ok(HomeAxes::All),
            other => bail!("unknown axis '{other}'"),
        }
    }
}

/// One VNA sweep: parallel frequency (GHz) and value arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    freqs_ghz: Vec<f64>,
    values: Vec<f64>,
}

impl Trace {
    /// Fails if the arrays differ in length.
    pub fn new(freqs_ghz: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        if freqs_ghz.len() != values.len() {
            bail!(
                "trace has {} frequencies but {} values",
                freqs_ghz.len(),
                values.len()
            );
        }
        Ok(Self { freqs_ghz, values })
    }

    /// Single-frequency (CW) trace.
    pub fn single(freq_ghz: f64, value: f64) -> Self {
        Self {
            freqs_ghz: vec![freq_ghz],
            values: vec![value],
        }
    }

    pub fn freqs_ghz(&self) -> &[f64] {
        &self.freqs_ghz
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Index of the sample used for coarse plotting: `len / 2`.
    pub fn mid_index(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.len() / 2)
        }
    }

    /// `(freq, value)` at [`mid_index`](Self::mid_index).
    pub fn mid_band(&self) -> Option<(f64, f64)> {
        self.mid_index()
            .map(|i| (self.freqs_ghz[i], self.values[i]))
    }

    /// `(freq, value)` pairs in sweep order.
    pub fn samples(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.freqs_ghz
            .iter()
            .copied()
            .zip(self.values.iter().copied())
    }
}

/// Capability: two-axis positioner
///
/// Axis 1 (x) carries phi, axis 2 (y) carries theta, both in degrees.
///
/// # Contract
/// - `move_to` issues the motion and may return before it completes
/// - `wait_for_idle` returns once motion has stopped and errors on timeout
/// - `query_position` returns six coordinates; missing axes read as 0
#[async_trait]
pub trait Positioner: Send {
    async fn move_to(&mut self, x: f64, y: f64, z: f64, a: f64) -> Result<()>;

    /// Move the two scan axes, leaving z and a at 0.
    async fn move_xy(&mut self, x: f64, y: f64) -> Result<()> {
        self.move_to(x, y, 0.0, 0.0).await
    }

    async fn wait_for_idle(&mut self, timeout: Duration) -> Result<()>;

    async fn home(&mut self, axes: HomeAxes) -> Result<()>;

    async fn query_position(&mut self) -> Result<[f64; 6]>;

    /// Store the current position as the work-coordinate origin.
    async fn save_origin(&mut self) -> Result<()>;

    fn identity(&self) -> Option<String> {
        None
    }
}

/// Scattering parameter shown on the analyzer's active channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SParameter {
    S11,
    S12,
    S21,
    S22,
}

impl SParameter {
    pub const ALL: [SParameter; 4] = [
        SParameter::S11,
        SParameter::S12,
        SParameter::S21,
        SParameter::S22,
    ];

    pub fn token(self) -> &'static str {
        match self {
            SParameter::S11 => "S11",
            SParameter::S12 => "S12",
            SParameter::S21 => "S21",
            SParameter::S22 => "S22",
        }
    }
}

impl fmt::Display for SParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for SParameter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        SParameter::ALL
            .into_iter()
            .find(|sparam| sparam.token().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown S-parameter '{s}'"))
    }
}

/// Capability: vector network analyzer
///
/// # Contract
/// - `write` sends one command; `query` returns the trimmed reply
/// - `read_trace` returns equal-length frequency and value arrays for the
///   current sweep of `channel`
/// - configuration commands are only sent through
///   [`configure_sweep`](Self::configure_sweep)
#[async_trait]
pub trait NetworkAnalyzer: Send {
    async fn write(&mut self, command: &str) -> Result<()>;

    async fn query(&mut self, command: &str) -> Result<String>;

    async fn read_trace(&mut self, channel: &str) -> Result<Trace>;

    /// Show `sparam` on the active channel.
    async fn select_sparam(&mut self, sparam: SParameter) -> Result<()> {
        self.write(sparam.token()).await
    }

    /// Switch the display format, e.g. `LOGM;`.
    async fn set_format(&mut self, format: MeasurementFormat) -> Result<()> {
        self.write(&format!("{};", format.token())).await
    }

    /// Full instrument reset.
    async fn reset(&mut self) -> Result<()> {
        self.write("*RST").await
    }

    /// Reset the instrument and program an S21 sweep.
    async fn configure_sweep(&mut self, sweep: &SweepConfig) -> Result<()> {
        for command in sweep_commands(sweep) {
            self.write(&command).await?;
        }
        Ok(())
    }

    fn identity(&self) -> Option<String> {
        None
    }
}

/// Command sequence programming a sweep, in send order.
pub fn sweep_commands(sweep: &SweepConfig) -> Vec<String> {
    vec![
        "ABORT 7".to_string(),
        "CLEAR 716".to_string(),
        "PRES".to_string(),
        "S21".to_string(),
        format!("STAR {}GHZ", sweep.start_ghz),
        format!("STOP {}GHZ", sweep.stop_ghz),
        format!("POWE {}", sweep.power_dbm),
        format!("POIN {}", sweep.points),
        format!("{};", sweep.format.token()),
        "CONT".to_string(),
    ]
}

/// Reply of the rotation-stage status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Busy,
    Idle,
}

impl StageStatus {
    /// Parse `BUSY` / `IDLE`; anything else is unknown.
    pub fn parse(reply: &str) -> Option<Self> {
        match reply.trim().to_uppercase().as_str() {
            "BUSY" => Some(StageStatus::Busy),
            "IDLE" => Some(StageStatus::Idle),
            _ => None,
        }
    }
}

/// How a rotation move was confirmed complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// The stage reported idle
    Confirmed,
    /// The handshake failed; a time-based wait was applied instead
    Estimated,
}

/// Time-based settle allowance for a rotation of `delta_deg`.
pub fn estimated_settle_time(delta_deg: f64) -> Duration {
    let proportional = ESTIMATED_SETTLE_PER_DEG.mul_f64(delta_deg.abs().min(3600.0));
    proportional.max(MIN_ESTIMATED_SETTLE)
}

/// Capability: polarization rotation stage
///
/// # Contract
/// - Angles are degrees; `move_abs_deg` is relative to the stage origin
/// - `query_status` returns `Ok(None)` when the stage does not answer or
///   does not support the status query
/// - a failed handshake never means "not moved": callers fall back to
///   [`wait_estimate`](Self::wait_estimate)
#[async_trait]
pub trait RotationStage: Send {
    async fn move_abs_deg(&mut self, angle_deg: f64) -> Result<()>;

    async fn move_rel_deg(&mut self, delta_deg: f64) -> Result<()>;

    /// Declare the current angle to be 0.
    async fn reset_origin(&mut self) -> Result<()>;

    async fn query_status(&mut self) -> Result<Option<StageStatus>>;

    /// Poll the status until idle. `Ok(false)` on timeout or missing status.
    async fn wait_until_done(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.query_status().await? {
                Some(StageStatus::Idle) => return Ok(true),
                Some(StageStatus::Busy) => {}
                None => return Ok(false),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    /// Sleep long enough for a rotation of `delta_deg` to finish.
    async fn wait_estimate(&mut self, delta_deg: f64) -> Result<()> {
        sleep(estimated_settle_time(delta_deg)).await;
        Ok(())
    }

    /// Wait for a move from `from_deg` to finish: handshake first, estimate
    /// as fallback.
    async fn settle(&mut self, from_deg: f64, to_deg: f64, timeout: Duration) -> Result<Settle> {
        if self.wait_until_done(timeout).await? {
            return Ok(Settle::Confirmed);
        }
        let delta = to_deg - from_deg;
        warn!(
            from_deg,
            to_deg,
            "rotation stage handshake unavailable; applying estimated settle time"
        );
        self.wait_estimate(delta).await?;
        Ok(Settle::Estimated)
    }

    fn identity(&self) -> Option<String> {
        None
    }
}
