//! Scan controller: the UI-thread half of the scan state machine.
//!
//! ```text
//! Idle -> Configuring -> Running <-> Paused
//!                          |  \
//!                          |   Aborting / Failing
//!                          v          |
//!                     Completing <----+
//!                          |
//!                         Idle
//! ```
//!
//! The controller validates, optionally programs the analyzer, then moves the
//! device proxies onto a `scan-worker` thread. While the worker runs the
//! controller only flips the pause/abort flags; manual device commands are
//! refused until the worker has been reaped with
//! [`poll_finished`](ScanController::poll_finished) or
//! [`wait`](ScanController::wait) and the proxies are back.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use super::csv_block::DeviceIdentities;
use super::grid::AngleGrid;
use super::live_sink::LiveSampleSink;
use super::params::{MeasurementFormat, ScanMode, ScanParameters};
use super::state::{ScanOutcome, ScanState, StateCell};
use super::view::{ControlState, ScanView};
use super::worker::{self, ScanFlags, ScanJob, WorkerExit, STATUS_PAUSED, STATUS_RESUMED};
use crate::config::ScanTiming;
use crate::error::{RangeError, RangeResult, Stage};
use crate::hardware::{
    HomeAxes, NetworkAnalyzer, Positioner, RotationStage, SParameter, Trace,
};
use crate::session::SessionState;
use crate::ui_bridge::{UiQueue, UiScheduler};

/// Interval at which [`ScanController::wait_timeout`] checks the worker.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The device proxies a scan needs, owned by exactly one thread at a time.
pub struct ScanDevices {
    pub positioner: Box<dyn Positioner>,
    pub vna: Box<dyn NetworkAnalyzer>,
    /// Absent on ranges without a polarization stage
    pub rotation: Option<Box<dyn RotationStage>>,
}

impl ScanDevices {
    pub fn new(positioner: Box<dyn Positioner>, vna: Box<dyn NetworkAnalyzer>) -> Self {
        Self {
            positioner,
            vna,
            rotation: None,
        }
    }

    pub fn with_rotation_stage(mut self, stage: Box<dyn RotationStage>) -> Self {
        self.rotation = Some(stage);
        self
    }

    /// Identity strings for the CSV `META` lines.
    pub fn identities(&self) -> DeviceIdentities {
        DeviceIdentities {
            vna: self.vna.identity(),
            positioner: self.positioner.identity(),
            rotation_stage: self.rotation.as_ref().and_then(|stage| stage.identity()),
        }
    }
}

/// UI-thread owner of the scan lifecycle.
pub struct ScanController {
    devices: Option<ScanDevices>,
    state: StateCell,
    selected_mode: Option<ScanMode>,
    flags: Arc<ScanFlags>,
    session: Arc<SessionState>,
    ui: UiScheduler<dyn ScanView>,
    timing: ScanTiming,
    worker: Option<JoinHandle<WorkerExit>>,
    /// Device I/O runtime, shared with the worker through its handle
    runtime: Runtime,
    sink: Option<LiveSampleSink>,
    last_outcome: Option<ScanOutcome>,
}

impl ScanController {
    /// Must not be called from inside an async runtime: the controller blocks
    /// on its own runtime for UI-thread device calls.
    pub fn new(
        devices: ScanDevices,
        session: Arc<SessionState>,
        ui: UiScheduler<dyn ScanView>,
        timing: ScanTiming,
    ) -> RangeResult<Self> {
        Ok(Self::with_runtime(
            devices,
            io_runtime()?,
            session,
            ui,
            timing,
        ))
    }

    /// Use `runtime` for all device I/O. Devices holding sockets or serial
    /// streams must have been opened on this same runtime.
    pub fn with_runtime(
        devices: ScanDevices,
        runtime: Runtime,
        session: Arc<SessionState>,
        ui: UiScheduler<dyn ScanView>,
        timing: ScanTiming,
    ) -> Self {
        Self {
            devices: Some(devices),
            state: StateCell::new(ScanState::Idle),
            selected_mode: None,
            flags: Arc::new(ScanFlags::default()),
            session,
            ui,
            timing,
            worker: None,
            runtime,
            sink: None,
            last_outcome: None,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn selected_mode(&self) -> Option<ScanMode> {
        self.selected_mode
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    /// Outcome of the most recently reaped scan.
    pub fn last_outcome(&self) -> Option<&ScanOutcome> {
        self.last_outcome.as_ref()
    }

    /// Live plot buffers of the current or last scan.
    pub fn sink(&self) -> Option<&LiveSampleSink> {
        self.sink.as_ref()
    }

    fn ensure_inactive(&self) -> RangeResult<()> {
        let state = self.state();
        if state.is_active() {
            Err(RangeError::ScanActive(state))
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: ScanState) {
        self.state.set(state);
        self.ui.safe_update(move |view| view.state_changed(state));
    }

    /// Pick a scan mode; no device I/O happens yet.
    pub fn select_mode(&mut self, mode: ScanMode) -> RangeResult<()> {
        self.ensure_inactive()?;
        self.selected_mode = Some(mode);
        self.set_state(ScanState::Configuring);
        debug!(%mode, "scan mode selected");
        Ok(())
    }

    /// Leave the parameter form and return to mode selection.
    pub fn back(&mut self) -> RangeResult<()> {
        self.ensure_inactive()?;
        self.selected_mode = None;
        if self.state() != ScanState::Idle {
            self.set_state(ScanState::Idle);
        }
        Ok(())
    }

    /// Validate, optionally program the analyzer, and spawn the worker.
    ///
    /// On error nothing has been spawned and the state is unchanged.
    pub fn start(&mut self, params: ScanParameters) -> RangeResult<()> {
        let state = self.state();
        if state.is_active() {
            return Err(RangeError::ScanActive(state));
        }
        if !state.can_start() {
            return Err(RangeError::InvalidState {
                action: "start a scan",
                state,
            });
        }
        if self.selected_mode != Some(params.mode()) {
            return Err(RangeError::validation(format!(
                "parameters are for {} but the selected mode is {}",
                params.mode(),
                self.selected_mode
                    .map(|mode| mode.to_string())
                    .unwrap_or_else(|| "none".to_string())
            )));
        }

        let grid = AngleGrid::from_params(&params)?;
        if grid.is_empty() {
            return Err(RangeError::validation("the angle grid is empty"));
        }

        let mut devices = self.devices.take().ok_or_else(lost_devices)?;
        if params.polarization().needs_rotation() && devices.rotation.is_none() {
            self.devices = Some(devices);
            return Err(RangeError::validation(
                "the polarization plan needs a rotation stage, but none is configured",
            ));
        }

        if params.modify_vna() {
            let configured = self
                .runtime
                .block_on(devices.vna.configure_sweep(params.sweep()));
            if let Err(err) = configured {
                self.devices = Some(devices);
                let err = RangeError::device(Stage::Vna, &err);
                error!("analyzer configuration failed: {err}");
                return Err(err);
            }
            info!(
                start_ghz = params.sweep().start_ghz,
                stop_ghz = params.sweep().stop_ghz,
                points = params.sweep().points,
                "analyzer configured"
            );
        }

        self.flags.reset();
        let sink = LiveSampleSink::for_scan(&params, self.timing.plot_batch_size);
        self.sink = Some(sink.clone());

        let job = ScanJob {
            params,
            grid,
            devices,
            flags: Arc::clone(&self.flags),
            state: self.state.clone(),
            session: Arc::clone(&self.session),
            ui: self.ui.clone(),
            sink,
            timing: self.timing.clone(),
            run_uid: uuid::Uuid::new_v4().to_string(),
            runtime: self.runtime.handle().clone(),
        };

        self.set_state(ScanState::Running);
        let spawned = std::thread::Builder::new()
            .name("scan-worker".to_string())
            .spawn(move || worker::run(job));
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.set_state(ScanState::Configuring);
                Err(RangeError::Worker(format!(
                    "failed to spawn scan worker: {err}"
                )))
            }
        }
    }

    /// Ask the worker to park at its next checkpoint.
    pub fn pause(&mut self) -> RangeResult<()> {
        let state = self.state();
        if !(state.can_pause() || state.can_resume()) {
            return Err(RangeError::InvalidState {
                action: "pause",
                state,
            });
        }
        if self.flags.pause_requested() {
            return Ok(());
        }
        self.flags.set_pause(true);
        info!("pause requested");
        self.ui.safe_update(|view| {
            view.set_status(STATUS_PAUSED);
            view.set_controls(ControlState::paused());
        });
        Ok(())
    }

    pub fn resume(&mut self) -> RangeResult<()> {
        let state = self.state();
        if !self.flags.pause_requested() || !state.can_abort() {
            return Err(RangeError::InvalidState {
                action: "resume",
                state,
            });
        }
        self.flags.set_pause(false);
        info!("resume requested");
        self.ui.safe_update(|view| {
            view.set_status(STATUS_RESUMED);
            view.set_controls(ControlState::running());
        });
        Ok(())
    }

    /// Pause if running, resume if paused. Returns whether the scan is now paused.
    pub fn toggle_pause(&mut self) -> RangeResult<bool> {
        if self.flags.pause_requested() {
            self.resume().map(|()| false)
        } else {
            self.pause().map(|()| true)
        }
    }

    /// Request cooperative termination. A no-op while already unwinding.
    pub fn abort(&mut self) -> RangeResult<()> {
        let state = self.state();
        if !state.is_active() {
            return Err(RangeError::InvalidState {
                action: "abort",
                state,
            });
        }
        if state.can_abort() {
            self.flags.request_abort();
            info!(%state, "abort requested");
        }
        Ok(())
    }

    /// Reap the worker if it has finished. Call regularly from the UI loop.
    pub fn poll_finished(&mut self) -> Option<ScanOutcome> {
        if self.worker.as_ref()?.is_finished() {
            let handle = self.worker.take()?;
            Some(self.reap(handle))
        } else {
            None
        }
    }

    /// Block until the worker finishes.
    pub fn wait(&mut self) -> Option<ScanOutcome> {
        let handle = self.worker.take()?;
        Some(self.reap(handle))
    }

    /// Block until the worker finishes or `limit` elapses.
    pub fn wait_timeout(&mut self, limit: Duration) -> Option<ScanOutcome> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(outcome) = self.poll_finished() {
                return Some(outcome);
            }
            if self.worker.is_none() || Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }
    }

    fn reap(&mut self, handle: JoinHandle<WorkerExit>) -> ScanOutcome {
        let outcome = match handle.join() {
            Ok(exit) => {
                self.devices = Some(exit.devices);
                exit.outcome
            }
            Err(_) => {
                // The worker guards its own body, so only a panic while
                // reporting can land here; the proxies went down with it.
                let err = RangeError::Worker("scan worker thread panicked".to_string());
                error!("{err}");
                let outcome = ScanOutcome::Failed {
                    message: err.to_string(),
                };
                let reported = outcome.clone();
                self.ui.safe_update(move |view| {
                    view.set_status(&reported.status_message());
                    view.show_progress(false);
                    view.set_controls(ControlState::idle());
                    view.scan_finished(&reported);
                });
                outcome
            }
        };

        self.flags.reset();
        self.selected_mode = None;
        self.set_state(ScanState::Idle);
        debug!(?outcome, "scan worker reaped");
        self.last_outcome = Some(outcome.clone());
        outcome
    }

    /// Tear down the UI side: stop UI updates, cancel pending UI tasks, abort
    /// any scan and join the worker for at most the restore timeout.
    pub fn shutdown(&mut self, queue: &mut UiQueue<dyn ScanView>) -> Option<ScanOutcome> {
        self.ui.mark_dead();
        if self.state().can_abort() {
            self.flags.request_abort();
        }
        let canceled = queue.teardown();
        debug!(canceled, "pending UI tasks canceled");

        if self.worker.is_none() {
            return None;
        }
        let outcome = self.wait_timeout(self.timing.restore_timeout);
        if outcome.is_none() {
            warn!("scan worker did not stop in time; detaching it");
            self.worker = None;
        }
        outcome
    }

    /// Make `freq_ghz` the plotted 2D series and redraw it.
    pub fn select_frequency(&mut self, freq_ghz: f64) -> bool {
        let Some(sink) = self.sink.clone() else {
            return false;
        };
        if !sink.select_frequency(freq_ghz) {
            return false;
        }
        self.ui.safe_update(move |view| {
            if let Some((freq, series)) = sink.active_series() {
                view.render_slice(freq, &series);
            }
        });
        true
    }

    /// Move both axes by a relative amount and wait for the move to finish.
    ///
    /// Returns the position reported afterwards.
    pub fn jog(&mut self, dphi_deg: f64, dtheta_deg: f64) -> RangeResult<[f64; 6]> {
        let position = self.position()?;
        self.goto(position[0] + dphi_deg, position[1] + dtheta_deg)?;
        self.position()
    }

    /// Move to an absolute `(phi, theta)` and wait for the move to finish.
    pub fn goto(&mut self, phi_deg: f64, theta_deg: f64) -> RangeResult<()> {
        self.ensure_inactive()?;
        let timeout = self.timing.motion_timeout;
        let positioner = &mut idle_devices(&mut self.devices)?.positioner;
        info!(phi_deg, theta_deg, "manual move");
        self.runtime
            .block_on(async {
                positioner.move_xy(phi_deg, theta_deg).await?;
                positioner.wait_for_idle(timeout).await
            })
            .map_err(|e| RangeError::device(Stage::Positioner, &e))
    }

    pub fn home(&mut self, axes: HomeAxes) -> RangeResult<()> {
        self.ensure_inactive()?;
        let timeout = self.timing.motion_timeout;
        let positioner = &mut idle_devices(&mut self.devices)?.positioner;
        info!(%axes, "manual homing");
        self.runtime
            .block_on(async {
                positioner.home(axes).await?;
                positioner.wait_for_idle(timeout).await
            })
            .map_err(|e| RangeError::device(Stage::Positioner, &e))
    }

    /// Store the current position as the work-coordinate origin.
    pub fn save_origin(&mut self) -> RangeResult<()> {
        self.ensure_inactive()?;
        let positioner = &mut idle_devices(&mut self.devices)?.positioner;
        info!("saving positioner origin");
        self.runtime
            .block_on(positioner.save_origin())
            .map_err(|e| RangeError::device(Stage::Positioner, &e))
    }

    pub fn position(&mut self) -> RangeResult<[f64; 6]> {
        self.ensure_inactive()?;
        let positioner = &mut idle_devices(&mut self.devices)?.positioner;
        self.runtime
            .block_on(positioner.query_position())
            .map_err(|e| RangeError::device(Stage::Positioner, &e))
    }

    /// Switch the analyzer's display format.
    pub fn vna_format(&mut self, format: MeasurementFormat) -> RangeResult<()> {
        self.ensure_inactive()?;
        let vna = &mut idle_devices(&mut self.devices)?.vna;
        info!(%format, "manual VNA format");
        self.runtime
            .block_on(vna.set_format(format))
            .map_err(|e| RangeError::device(Stage::Vna, &e))
    }

    pub fn vna_sparam(&mut self, sparam: SParameter) -> RangeResult<()> {
        self.ensure_inactive()?;
        let vna = &mut idle_devices(&mut self.devices)?.vna;
        info!(%sparam, "manual S-parameter selection");
        self.runtime
            .block_on(vna.select_sparam(sparam))
            .map_err(|e| RangeError::device(Stage::Vna, &e))
    }

    /// Read the current trace of the configured channel.
    pub fn vna_trace(&mut self) -> RangeResult<Trace> {
        self.ensure_inactive()?;
        let channel = self.timing.vna_channel.clone();
        let vna = &mut idle_devices(&mut self.devices)?.vna;
        self.runtime
            .block_on(vna.read_trace(&channel))
            .map_err(|e| RangeError::device(Stage::Vna, &e))
    }

    pub fn vna_reset(&mut self) -> RangeResult<()> {
        self.ensure_inactive()?;
        let vna = &mut idle_devices(&mut self.devices)?.vna;
        info!("resetting VNA");
        self.runtime
            .block_on(vna.reset())
            .map_err(|e| RangeError::device(Stage::Vna, &e))
    }

    /// Send a raw command.
    pub fn vna_write(&mut self, command: &str) -> RangeResult<()> {
        self.ensure_inactive()?;
        let vna = &mut idle_devices(&mut self.devices)?.vna;
        self.runtime
            .block_on(vna.write(command))
            .map_err(|e| RangeError::device(Stage::Vna, &e))
    }

    pub fn vna_query(&mut self, command: &str) -> RangeResult<String> {
        self.ensure_inactive()?;
        let vna = &mut idle_devices(&mut self.devices)?.vna;
        self.runtime
            .block_on(vna.query(command))
            .map_err(|e| RangeError::device(Stage::Vna, &e))
    }
}

/// Runtime that owns device I/O. Multi-threaded so the worker thread can
/// drive it through a [`tokio::runtime::Handle`].
pub fn io_runtime() -> RangeResult<Runtime> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("range-io")
        .enable_all()
        .build()?;
    Ok(runtime)
}

fn idle_devices(devices: &mut Option<ScanDevices>) -> RangeResult<&mut ScanDevices> {
    devices.as_mut().ok_or_else(lost_devices)
}

fn lost_devices() -> RangeError {
    RangeError::Worker("device proxies were lost with a previous scan worker".to_string())
}

impl Drop for ScanController {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.flags.request_abort();
        }
    }
}
