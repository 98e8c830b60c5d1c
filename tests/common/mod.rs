//! Shared harness for the scan integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use antenna_range::config::ScanTiming;
use antenna_range::hardware::mock::{CallLog, MockRange};
use antenna_range::scan::{
    CartesianPoint, ControlState, PolarizationPlan, ScanController, ScanMode, ScanOutcome,
    ScanParameters, ScanParametersBuilder, ScanState, ScanView, SliceSeries,
};
use antenna_range::session::SessionState;
use antenna_range::ui_bridge::{create_bridge, UiQueue};

/// Everything the UI thread was told, in order.
#[derive(Debug, Default)]
pub struct RecordingView {
    pub statuses: Vec<String>,
    pub progress: Vec<f64>,
    pub controls: Vec<ControlState>,
    pub states: Vec<ScanState>,
    pub points: Vec<CartesianPoint>,
    pub slices: Vec<(f64, usize)>,
    pub frequency_choices: Vec<Vec<f64>>,
    pub finished: Vec<ScanOutcome>,
}

impl ScanView for RecordingView {
    fn set_status(&mut self, text: &str) {
        self.statuses.push(text.to_string());
    }

    fn set_progress(&mut self, fraction: f64) {
        self.progress.push(fraction);
    }

    fn show_progress(&mut self, _visible: bool) {}

    fn set_controls(&mut self, controls: ControlState) {
        self.controls.push(controls);
    }

    fn state_changed(&mut self, state: ScanState) {
        self.states.push(state);
    }

    fn render_points(&mut self, points: &[CartesianPoint]) {
        self.points.extend_from_slice(points);
    }

    fn render_slice(&mut self, freq_ghz: f64, series: &SliceSeries) {
        self.slices.push((freq_ghz, series.len()));
    }

    fn set_frequency_choices(&mut self, freqs_ghz: &[f64]) {
        self.frequency_choices.push(freqs_ghz.to_vec());
    }

    fn scan_finished(&mut self, outcome: &ScanOutcome) {
        self.finished.push(outcome.clone());
    }
}

pub struct Harness {
    pub controller: ScanController,
    pub queue: UiQueue<dyn ScanView>,
    pub view: RecordingView,
    pub log: CallLog,
    pub session: Arc<SessionState>,
    pub dir: tempfile::TempDir,
}

pub fn fast_timing() -> ScanTiming {
    ScanTiming {
        pause_poll: Duration::from_millis(5),
        restore_timeout: Duration::from_secs(5),
        ..ScanTiming::default()
    }
}

impl Harness {
    pub fn new(range: MockRange) -> Self {
        let (devices, log) = range.into_devices();
        let session = Arc::new(SessionState::new());
        let (scheduler, queue) = create_bridge::<dyn ScanView>();
        let controller =
            ScanController::new(devices, Arc::clone(&session), scheduler, fast_timing())
                .unwrap();
        Self {
            controller,
            queue,
            view: RecordingView::default(),
            log,
            session,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn csv(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn pump(&mut self) -> usize {
        self.queue.pump(&mut self.view)
    }

    /// Select the mode, start, and block until the worker is reaped.
    pub fn run(&mut self, params: ScanParameters) -> ScanOutcome {
        self.controller.select_mode(params.mode()).unwrap();
        self.controller.start(params).unwrap();
        let outcome = self.controller.wait().unwrap();
        self.pump();
        outcome
    }

    /// Poll until `condition` holds, pumping the UI queue meanwhile.
    pub fn wait_until(&mut self, limit: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            self.pump();
            if condition(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }
}

/// XY slice at 90 degree phi steps: four grid points.
pub fn xy_params(csv: &Path, points: u32) -> ScanParametersBuilder {
    ScanParametersBuilder::new(ScanMode::XySlice)
        .name("horn XY")
        .phi_step(90.0)
        .sweep(8.0, 12.0, points)
        .power_dbm(-10.0)
        .polarization(PolarizationPlan::vertical())
        .csv_path(csv)
}
