//! Mock Hardware Implementations
//!
//! Simulated range devices for tests and `--simulate` runs. All mocks use
//! async-safe waits (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockPositioner` - two-axis positioner with optional motion delay
//! - `MockVna` - analyzer returning a constant or dipole-like trace
//! - `MockRotationStage` - polarization stage with a switchable handshake
//! - `MockRange` - the three above sharing one [`CallLog`] and one pose
//!
//! Every mock records each call it receives, in order, into the shared log,
//! and supports failure injection so error paths can be driven without
//! hardware.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

use super::capabilities::{
    HomeAxes, NetworkAnalyzer, Positioner, RotationStage, StageStatus, Trace,
};
use super::hp8720::linspace;
use crate::scan::ScanDevices;

/// One call received by a mock device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    Move { x: f64, y: f64, z: f64, a: f64 },
    WaitIdle,
    Home(HomeAxes),
    QueryPosition,
    SaveOrigin,
    VnaWrite(String),
    VnaQuery(String),
    ReadTrace { channel: String },
    RotateAbs(f64),
    RotateRel(f64),
    RotateReset,
    StatusQuery,
    /// Time-based settle applied instead of the handshake
    RotateEstimate(f64),
}

impl DeviceCall {
    pub fn is_move(&self) -> bool {
        matches!(self, DeviceCall::Move { .. })
    }

    pub fn is_trace_read(&self) -> bool {
        matches!(self, DeviceCall::ReadTrace { .. })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered record of every mock call, shared across devices.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<DeviceCall>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: DeviceCall) {
        lock(&self.0).push(call);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        lock(&self.0).clone()
    }

    /// Calls recorded after the first `mark` entries.
    pub fn calls_since(&self, mark: usize) -> Vec<DeviceCall> {
        lock(&self.0).iter().skip(mark).cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.0).is_empty()
    }

    pub fn count(&self, predicate: impl Fn(&DeviceCall) -> bool) -> usize {
        lock(&self.0).iter().filter(|call| predicate(call)).count()
    }

    /// Positioner targets `(x, y)` in command order.
    pub fn moves(&self) -> Vec<(f64, f64)> {
        lock(&self.0)
            .iter()
            .filter_map(|call| match call {
                DeviceCall::Move { x, y, .. } => Some((*x, *y)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.0).clear();
    }
}

/// Where the simulated antenna currently points.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pose {
    pub phi_deg: f64,
    pub theta_deg: f64,
    pub polarization_deg: f64,
}

/// Pose shared between the simulated devices.
pub type SharedPose = Arc<Mutex<Pose>>;

// =============================================================================
// MockPositioner
// =============================================================================

/// Simulated GRBL-style positioner.
pub struct MockPositioner {
    log: CallLog,
    pose: SharedPose,
    move_delay: Duration,
    fail_on_move: Option<usize>,
    moves: usize,
}

impl MockPositioner {
    pub fn new(log: CallLog, pose: SharedPose) -> Self {
        Self {
            log,
            pose,
            move_delay: Duration::ZERO,
            fail_on_move: None,
            moves: 0,
        }
    }

    /// Sleep this long inside every `move_to`.
    pub fn with_move_delay(mut self, delay: Duration) -> Self {
        self.move_delay = delay;
        self
    }

    /// Fail the `n`th move (1-based).
    pub fn fail_on_move(mut self, n: usize) -> Self {
        self.fail_on_move = Some(n);
        self
    }
}

#[async_trait]
impl Positioner for MockPositioner {
    async fn move_to(&mut self, x: f64, y: f64, z: f64, a: f64) -> Result<()> {
        self.log.record(DeviceCall::Move { x, y, z, a });
        self.moves += 1;
        if self.fail_on_move == Some(self.moves) {
            bail!("simulated limit switch hit moving to ({x}, {y})");
        }
        if !self.move_delay.is_zero() {
            sleep(self.move_delay).await;
        }
        let mut pose = lock(&self.pose);
        pose.phi_deg = x;
        pose.theta_deg = y;
        Ok(())
    }

    async fn wait_for_idle(&mut self, _timeout: Duration) -> Result<()> {
        self.log.record(DeviceCall::WaitIdle);
        Ok(())
    }

    async fn home(&mut self, axes: HomeAxes) -> Result<()> {
        self.log.record(DeviceCall::Home(axes));
        let mut pose = lock(&self.pose);
        if matches!(axes, HomeAxes::X | HomeAxes::All) {
            pose.phi_deg = 0.0;
        }
        if matches!(axes, HomeAxes::Y | HomeAxes::All) {
            pose.theta_deg = 0.0;
        }
        Ok(())
    }

    async fn query_position(&mut self) -> Result<[f64; 6]> {
        self.log.record(DeviceCall::QueryPosition);
        let pose = lock(&self.pose);
        Ok([pose.phi_deg, pose.theta_deg, 0.0, 0.0, 0.0, 0.0])
    }

    async fn save_origin(&mut self) -> Result<()> {
        self.log.record(DeviceCall::SaveOrigin);
        let mut pose = lock(&self.pose);
        pose.phi_deg = 0.0;
        pose.theta_deg = 0.0;
        Ok(())
    }

    fn identity(&self) -> Option<String> {
        Some("Mock positioner".to_string())
    }
}

// =============================================================================
// MockVna
// =============================================================================

/// What the simulated analyzer measures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraceModel {
    /// Every frequency reads the same value
    Constant(f64),
    /// Short dipole along z: `20 log10 |sin theta|`, cross-polar 20 dB down
    Dipole,
}

impl TraceModel {
    fn value(self, pose: Pose, freq_ghz: f64, center_ghz: f64) -> f64 {
        match self {
            TraceModel::Constant(value) => value,
            TraceModel::Dipole => {
                let pattern = pose.theta_deg.to_radians().sin().abs().max(1e-3);
                let cross_pol = pose.polarization_deg.to_radians().sin().powi(2) * 20.0;
                20.0 * pattern.log10() - cross_pol - 0.5 * (freq_ghz - center_ghz).powi(2)
            }
        }
    }
}

/// Simulated network analyzer.
///
/// Sweep commands written to it (`STAR`, `STOP`, `POIN`) change the
/// frequency axis of later traces, as on the real instrument.
pub struct MockVna {
    log: CallLog,
    pose: SharedPose,
    model: TraceModel,
    start_ghz: f64,
    stop_ghz: f64,
    points: usize,
    fail_on_read: Option<usize>,
    fail_writes: bool,
    reads: usize,
    identity: Option<String>,
}

impl MockVna {
    pub fn new(log: CallLog, pose: SharedPose) -> Self {
        Self {
            log,
            pose,
            model: TraceModel::Dipole,
            start_ghz: 8.0,
            stop_ghz: 12.0,
            points: 5,
            fail_on_read: None,
            fail_writes: false,
            reads: 0,
            identity: Some("Mock VNA,8720D-SIM".to_string()),
        }
    }

    pub fn with_model(mut self, model: TraceModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_sweep(mut self, start_ghz: f64, stop_ghz: f64, points: usize) -> Self {
        self.start_ghz = start_ghz;
        self.stop_ghz = stop_ghz;
        self.points = points;
        self
    }

    /// Fail the `n`th trace read (1-based).
    pub fn fail_on_read(mut self, n: usize) -> Self {
        self.fail_on_read = Some(n);
        self
    }

    /// Reject every write, as an analyzer that went off the bus.
    pub fn fail_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn with_identity(mut self, identity: Option<&str>) -> Self {
        self.identity = identity.map(str::to_string);
        self
    }

    fn apply_setting(&mut self, command: &str) {
        let ghz = |arg: &str| arg.trim_end_matches("GHZ").trim().parse::<f64>().ok();
        if let Some(arg) = command.strip_prefix("STAR ") {
            self.start_ghz = ghz(arg).unwrap_or(self.start_ghz);
        } else if let Some(arg) = command.strip_prefix("STOP ") {
            self.stop_ghz = ghz(arg).unwrap_or(self.stop_ghz);
        } else if let Some(arg) = command.strip_prefix("POIN ") {
            self.points = arg.trim().parse().unwrap_or(self.points);
        }
    }
}

#[async_trait]
impl NetworkAnalyzer for MockVna {
    async fn write(&mut self, command: &str) -> Result<()> {
        self.log.record(DeviceCall::VnaWrite(command.to_string()));
        if self.fail_writes {
            bail!("simulated GPIB timeout writing '{command}'");
        }
        self.apply_setting(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.log.record(DeviceCall::VnaQuery(command.to_string()));
        match command.trim() {
            "STAR?" => Ok(format!("{:E}", self.start_ghz * 1e9)),
            "STOP?" => Ok(format!("{:E}", self.stop_ghz * 1e9)),
            "POIN?" => Ok(self.points.to_string()),
            "*IDN?" => self
                .identity
                .clone()
                .ok_or_else(|| anyhow!("identity not supported")),
            other => Err(anyhow!("unsupported query '{other}'")),
        }
    }

    async fn read_trace(&mut self, channel: &str) -> Result<Trace> {
        self.log.record(DeviceCall::ReadTrace {
            channel: channel.to_string(),
        });
        self.reads += 1;
        if self.fail_on_read == Some(self.reads) {
            bail!("simulated trace transfer timeout");
        }
        let pose = *lock(&self.pose);
        let freqs = linspace(self.start_ghz, self.stop_ghz, self.points);
        let center = (self.start_ghz + self.stop_ghz) / 2.0;
        let values = freqs
            .iter()
            .map(|&f| self.model.value(pose, f, center))
            .collect();
        Trace::new(freqs, values)
    }

    fn identity(&self) -> Option<String> {
        self.identity.clone()
    }
}

// =============================================================================
// MockRotationStage
// =============================================================================

/// Simulated polarization stage.
///
/// With the handshake enabled each move reports `BUSY` for a configurable
/// number of polls before `IDLE`; with it disabled the status query goes
/// unanswered, like firmware without status support.
pub struct MockRotationStage {
    log: CallLog,
    pose: SharedPose,
    handshake: bool,
    busy_polls: usize,
    busy_remaining: usize,
}

impl MockRotationStage {
    pub fn new(log: CallLog, pose: SharedPose) -> Self {
        Self {
            log,
            pose,
            handshake: true,
            busy_polls: 1,
            busy_remaining: 0,
        }
    }

    pub fn without_handshake(mut self) -> Self {
        self.handshake = false;
        self
    }

    pub fn with_busy_polls(mut self, polls: usize) -> Self {
        self.busy_polls = polls;
        self
    }

    fn set_angle(&mut self, angle_deg: f64) {
        lock(&self.pose).polarization_deg = angle_deg;
        self.busy_remaining = self.busy_polls;
    }
}

#[async_trait]
impl RotationStage for MockRotationStage {
    async fn move_abs_deg(&mut self, angle_deg: f64) -> Result<()> {
        self.log.record(DeviceCall::RotateAbs(angle_deg));
        self.set_angle(angle_deg);
        Ok(())
    }

    async fn move_rel_deg(&mut self, delta_deg: f64) -> Result<()> {
        self.log.record(DeviceCall::RotateRel(delta_deg));
        let current = lock(&self.pose).polarization_deg;
        self.set_angle(current + delta_deg);
        Ok(())
    }

    async fn reset_origin(&mut self) -> Result<()> {
        self.log.record(DeviceCall::RotateReset);
        lock(&self.pose).polarization_deg = 0.0;
        Ok(())
    }

    async fn query_status(&mut self) -> Result<Option<StageStatus>> {
        self.log.record(DeviceCall::StatusQuery);
        if !self.handshake {
            return Ok(None);
        }
        if self.busy_remaining > 0 {
            self.busy_remaining -= 1;
            Ok(Some(StageStatus::Busy))
        } else {
            Ok(Some(StageStatus::Idle))
        }
    }

    async fn wait_estimate(&mut self, delta_deg: f64) -> Result<()> {
        // Recorded instead of slept so fallback paths stay fast under test.
        self.log.record(DeviceCall::RotateEstimate(delta_deg));
        Ok(())
    }

    fn identity(&self) -> Option<String> {
        Some("Mock rotation stage".to_string())
    }
}

// =============================================================================
// MockRange
// =============================================================================

/// A complete simulated range sharing one call log and one pose.
pub struct MockRange {
    pub log: CallLog,
    pub pose: SharedPose,
    pub positioner: MockPositioner,
    pub vna: MockVna,
    pub rotation: Option<MockRotationStage>,
}

impl MockRange {
    /// Positioner and analyzer, no rotation stage.
    pub fn new() -> Self {
        let log = CallLog::new();
        let pose = SharedPose::default();
        Self {
            positioner: MockPositioner::new(log.clone(), Arc::clone(&pose)),
            vna: MockVna::new(log.clone(), Arc::clone(&pose)),
            rotation: None,
            log,
            pose,
        }
    }

    /// Add a rotation stage with a working handshake.
    pub fn with_rotation_stage(mut self) -> Self {
        self.rotation = Some(MockRotationStage::new(
            self.log.clone(),
            Arc::clone(&self.pose),
        ));
        self
    }

    pub fn map_positioner(mut self, f: impl FnOnce(MockPositioner) -> MockPositioner) -> Self {
        self.positioner = f(self.positioner);
        self
    }

    pub fn map_vna(mut self, f: impl FnOnce(MockVna) -> MockVna) -> Self {
        self.vna = f(self.vna);
        self
    }

    pub fn map_rotation(
        mut self,
        f: impl FnOnce(MockRotationStage) -> MockRotationStage,
    ) -> Self {
        self.rotation = self.rotation.map(f);
        self
    }

    /// Hand the devices to a controller, keeping the log for inspection.
    pub fn into_devices(self) -> (ScanDevices, CallLog) {
        let devices = ScanDevices {
            positioner: Box::new(self.positioner),
            vna: Box::new(self.vna),
            rotation: self
                .rotation
                .map(|stage| Box::new(stage) as Box<dyn RotationStage>),
        };
        (devices, self.log)
    }
}

impl Default for MockRange {
    fn default() -> Self {
        Self::new()
    }
}
