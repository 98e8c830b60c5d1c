//! Scan worker thread body.
//!
//! Runs on a dedicated `scan-worker` thread that blocks on the controller's
//! I/O runtime, so device streams stay bound to the runtime they were opened
//! on. Owns the device proxies for the duration of the scan and
//! hands them back through [`WorkerExit`]. All UI effects go through the
//! [`UiScheduler`]; the only state shared with the controller is the
//! [`ScanFlags`] pair and the published [`ScanState`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::controller::ScanDevices;
use super::csv_block::{BlockMetadata, CsvBlockWriter};
use super::grid::{AngleGrid, AnglePoint};
use super::live_sink::{LiveSampleSink, SinkSignal};
use super::params::{PolarizationStep, ScanParameters};
use super::state::{ScanOutcome, ScanState, StateCell};
use super::view::{ControlState, ScanView};
use super::ScanSample;
use crate::config::ScanTiming;
use crate::error::{RangeError, Stage};
use crate::hardware::Settle;
use crate::session::SessionState;
use crate::ui_bridge::UiScheduler;

/// Status shown while the grid is being measured.
pub(crate) const STATUS_SCANNING: &str = "Scanning...";
pub(crate) const STATUS_PAUSED: &str = "Scan paused.";
pub(crate) const STATUS_RESUMED: &str = "Scan resumed.";

/// Rotation angles closer than this are treated as equal.
const ANGLE_EPSILON: f64 = 1e-9;

/// The two flags the UI thread may flip while a scan runs.
#[derive(Debug, Default)]
pub(crate) struct ScanFlags {
    pause: AtomicBool,
    abort: AtomicBool,
}

impl ScanFlags {
    pub(crate) fn reset(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.abort.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_pause(&self, paused: bool) {
        self.pause.store(paused, Ordering::SeqCst);
    }

    pub(crate) fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub(crate) fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// Everything the worker needs, moved onto its thread.
pub(crate) struct ScanJob {
    pub(crate) params: ScanParameters,
    pub(crate) grid: AngleGrid,
    pub(crate) devices: ScanDevices,
    pub(crate) flags: Arc<ScanFlags>,
    pub(crate) state: StateCell,
    pub(crate) session: Arc<SessionState>,
    pub(crate) ui: UiScheduler<dyn ScanView>,
    pub(crate) sink: LiveSampleSink,
    pub(crate) timing: ScanTiming,
    pub(crate) run_uid: String,
    pub(crate) runtime: Handle,
}

/// What the worker thread returns when joined.
pub(crate) struct WorkerExit {
    pub(crate) devices: ScanDevices,
    pub(crate) outcome: ScanOutcome,
}

/// Why the scan loop stopped early.
enum Halt {
    /// Abort observed at a checkpoint; `paused` if it came from the pause loop
    Aborted { paused: bool },
    Failed(RangeError),
}

impl From<RangeError> for Halt {
    fn from(err: RangeError) -> Self {
        Halt::Failed(err)
    }
}

struct ScanRun {
    job: ScanJob,
    writer: CsvBlockWriter,
    samples: u64,
    blocks: usize,
    estimated_settles: usize,
    done_points: usize,
    /// Last commanded rotation-stage angle; the stage starts at its origin
    stage_angle: f64,
}

/// Thread entry point: never panics, always produces an outcome.
pub(crate) fn run(job: ScanJob) -> WorkerExit {
    let writer = CsvBlockWriter::new(job.params.csv_path());
    let mut scan = ScanRun {
        job,
        writer,
        samples: 0,
        blocks: 0,
        estimated_settles: 0,
        done_points: 0,
        stage_angle: 0.0,
    };

    let runtime = scan.job.runtime.clone();
    let result = panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(scan.scan())));
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(payload) => scan.recover_from_panic(payload.as_ref()),
    };

    scan.job.state.set(ScanState::Completing);
    scan.report_terminal(&outcome);
    WorkerExit {
        devices: scan.job.devices,
        outcome,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ScanRun {
    async fn scan(&mut self) -> ScanOutcome {
        info!(
            name = self.job.params.name(),
            mode = %self.job.params.mode(),
            points = self.job.grid.len(),
            passes = self.job.params.polarization().len(),
            run_uid = %self.job.run_uid,
            "scan started"
        );
        self.job.ui.safe_update(|view| {
            view.set_status(STATUS_SCANNING);
            view.set_progress(0.0);
            view.show_progress(true);
            view.set_controls(ControlState::running());
        });

        let outcome = match self.execute().await {
            Ok(()) => ScanOutcome::Completed {
                samples: self.samples,
                blocks: self.blocks,
                estimated_settles: self.estimated_settles,
            },
            Err(Halt::Aborted { paused }) => {
                self.publish_state(ScanState::Aborting);
                info!(samples = self.samples, paused, "scan aborted");
                ScanOutcome::Aborted {
                    samples: self.samples,
                }
            }
            Err(Halt::Failed(err)) => {
                self.publish_state(ScanState::Failing);
                error!(samples = self.samples, "scan failed: {err}");
                ScanOutcome::Failed {
                    message: err.to_string(),
                }
            }
        };

        self.cleanup().await;
        outcome
    }

    async fn execute(&mut self) -> Result<(), Halt> {
        let timing = self.job.timing.clone();
        self.checkpoint().await?;
        self.move_positioner(AnglePoint::new(0.0, 0.0), timing.motion_timeout)
            .await?;

        let steps: Vec<PolarizationStep> = self.job.params.polarization().steps().to_vec();
        let identities = self.job.devices.identities();
        for step in &steps {
            self.checkpoint().await?;
            let settle = self.set_polarization(step).await?;

            let metadata = BlockMetadata::for_pass(&self.job.params, step, &self.job.run_uid);
            let extra_meta: Vec<(&str, String)> = match settle {
                Some(Settle::Estimated) => vec![("rotation_settle", "estimated".to_string())],
                _ => Vec::new(),
            };
            self.writer
                .open_block(&metadata, &identities, &extra_meta)?;
            self.blocks += 1;
            if let Err(err) = self
                .job
                .session
                .record_csv(self.writer.path(), self.job.params.name())
            {
                warn!("could not persist session state: {err}");
            }

            let points = self.job.grid.points().to_vec();
            for (index, point) in points.into_iter().enumerate() {
                self.checkpoint().await?;
                self.measure(point).await?;
                self.done_points += 1;
                self.report_progress();
                if self.job.grid.ends_phi_row(index) {
                    self.report_frequency_choices();
                }
            }

            self.writer.close_block()?;
            debug!(polarization = %step.label, rows = self.samples, "polarization pass finished");
        }
        Ok(())
    }

    /// Abort check, then the pause-wait loop.
    async fn checkpoint(&mut self) -> Result<(), Halt> {
        if self.job.flags.abort_requested() {
            return Err(Halt::Aborted { paused: false });
        }
        if !self.job.flags.pause_requested() {
            return Ok(());
        }

        self.publish_state(ScanState::Paused);
        info!(done = self.done_points, "scan paused");
        while self.job.flags.pause_requested() {
            if self.job.flags.abort_requested() {
                return Err(Halt::Aborted { paused: true });
            }
            sleep(self.job.timing.pause_poll).await;
        }
        if self.job.flags.abort_requested() {
            return Err(Halt::Aborted { paused: true });
        }
        self.publish_state(ScanState::Running);
        info!("scan resumed");
        Ok(())
    }

    async fn move_positioner(
        &mut self,
        target: AnglePoint,
        timeout: std::time::Duration,
    ) -> Result<(), RangeError> {
        let positioner = &mut self.job.devices.positioner;
        positioner
            .move_xy(target.phi_deg, target.theta_deg)
            .await
            .map_err(|e| RangeError::device(Stage::Positioner, &e))?;
        positioner
            .wait_for_idle(timeout)
            .await
            .map_err(|e| RangeError::device(Stage::Positioner, &e))
    }

    /// Rotate to the pass angle; `None` when no move was needed.
    async fn set_polarization(
        &mut self,
        step: &PolarizationStep,
    ) -> Result<Option<Settle>, RangeError> {
        let Some(stage) = self.job.devices.rotation.as_mut() else {
            return Ok(None);
        };
        if (step.angle_deg - self.stage_angle).abs() < ANGLE_EPSILON {
            return Ok(None);
        }

        let from = self.stage_angle;
        stage
            .move_abs_deg(step.angle_deg)
            .await
            .map_err(|e| RangeError::device(Stage::RotationStage, &e))?;
        self.stage_angle = step.angle_deg;
        let settle = stage
            .settle(from, step.angle_deg, self.job.timing.rotation_timeout)
            .await
            .map_err(|e| RangeError::device(Stage::RotationStage, &e))?;
        if settle == Settle::Estimated {
            self.estimated_settles += 1;
        }
        info!(polarization = %step.label, angle_deg = step.angle_deg, ?settle, "polarization set");
        Ok(Some(settle))
    }

    async fn measure(&mut self, point: AnglePoint) -> Result<(), RangeError> {
        self.move_positioner(point, self.job.timing.motion_timeout)
            .await?;

        let channel = self.job.timing.vna_channel.clone();
        let trace = self
            .job
            .devices
            .vna
            .read_trace(&channel)
            .await
            .map_err(|e| RangeError::device(Stage::Vna, &e))?;

        // The mid-band sample picks the active slice before this trace is
        // cached, so the first angle is already drawn.
        let mut redraw = false;
        if let Some((freq_ghz, value)) = trace.mid_band() {
            let mid = ScanSample::new(point.phi_deg, point.theta_deg, freq_ghz, value);
            match self.job.sink.note_mid_band(&mid) {
                SinkSignal::FlushPoints => self.flush_points(),
                SinkSignal::RedrawSlice => redraw = true,
                SinkSignal::Idle => {}
            }
        }

        for (freq_ghz, value) in trace.samples() {
            let sample = ScanSample::new(point.phi_deg, point.theta_deg, freq_ghz, value);
            self.writer.append_row(&sample)?;
            self.samples += 1;
            redraw |= self.job.sink.record(&sample) == SinkSignal::RedrawSlice;
        }
        if redraw {
            self.redraw_slice();
        }
        Ok(())
    }

    /// Best-effort unwinding: every step logs and swallows its own failure.
    async fn cleanup(&mut self) {
        if let Err(err) = self.writer.close_block() {
            warn!("failed to close CSV block during cleanup: {err}");
        }
        if self.job.sink.pending_points() > 0 {
            self.flush_points();
        }
        let timeout = self.job.timing.restore_timeout;
        if let Err(err) = self
            .move_positioner(AnglePoint::new(0.0, 0.0), timeout)
            .await
        {
            warn!("failed to return positioner to reference: {err}");
        }

        if self.stage_angle.abs() >= ANGLE_EPSILON {
            if let Some(stage) = self.job.devices.rotation.as_mut() {
                let from = self.stage_angle;
                let restored = match stage.move_abs_deg(0.0).await {
                    Ok(()) => stage.settle(from, 0.0, timeout).await.map(|_| ()),
                    Err(err) => Err(err),
                };
                match restored {
                    Ok(()) => self.stage_angle = 0.0,
                    Err(err) => warn!("failed to restore rotation stage to 0 deg: {err:#}"),
                }
            }
        }
    }

    fn recover_from_panic(&mut self, payload: &(dyn Any + Send)) -> ScanOutcome {
        let message = panic_message(payload);
        error!("scan worker panicked: {message}");
        if let Err(err) = self.writer.close_block() {
            warn!("failed to close CSV block after panic: {err}");
        }
        ScanOutcome::Failed {
            message: RangeError::Worker(message).to_string(),
        }
    }

    fn publish_state(&self, state: ScanState) {
        self.job.state.set(state);
        self.job
            .ui
            .safe_update(move |view| view.state_changed(state));
    }

    fn report_progress(&self) {
        let total = self.job.grid.len() * self.job.params.polarization().len();
        let fraction = if total == 0 {
            1.0
        } else {
            self.done_points as f64 / total as f64
        };
        self.job
            .ui
            .safe_update(move |view| view.set_progress(fraction));
    }

    fn report_frequency_choices(&self) {
        let freqs = self.job.sink.frequencies();
        if freqs.is_empty() {
            return;
        }
        self.job
            .ui
            .safe_update(move |view| view.set_frequency_choices(&freqs));
    }

    fn flush_points(&self) {
        let sink = self.job.sink.clone();
        self.job.ui.safe_update(move |view| {
            let points = sink.take_points();
            if !points.is_empty() {
                view.render_points(&points);
            }
        });
    }

    fn redraw_slice(&self) {
        let sink = self.job.sink.clone();
        self.job.ui.safe_update(move |view| {
            if let Some((freq_ghz, series)) = sink.active_series() {
                view.render_slice(freq_ghz, &series);
            }
        });
    }

    fn report_terminal(&self, outcome: &ScanOutcome) {
        if outcome.is_failed() {
            error!("{}", outcome.status_message());
        } else {
            info!("{}", outcome.status_message());
        }
        let outcome = outcome.clone();
        self.job.ui.safe_update(move |view| {
            view.set_status(&outcome.status_message());
            view.show_progress(false);
            view.set_controls(ControlState::idle());
            view.state_changed(ScanState::Completing);
            view.scan_finished(&outcome);
        });
    }
}
