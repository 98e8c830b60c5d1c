//! UI shell contract.
//!
//! Every method is invoked on the UI thread, from tasks pumped out of the
//! [`UiQueue`](crate::ui_bridge::UiQueue). Implementations own their widgets;
//! the controller and the worker never touch them directly.

use super::live_sink::{CartesianPoint, SliceSeries};
use super::state::{ScanOutcome, ScanState};

/// Which controls are usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    pub start: bool,
    pub pause: bool,
    pub abort: bool,
    pub back: bool,
    /// Manual jog/home/goto affordances
    pub manual: bool,
    /// Pause button reads "Resume"
    pub paused: bool,
}

impl ControlState {
    pub fn idle() -> Self {
        Self {
            start: true,
            pause: false,
            abort: false,
            back: true,
            manual: true,
            paused: false,
        }
    }

    pub fn running() -> Self {
        Self {
            start: false,
            pause: true,
            abort: true,
            back: false,
            manual: false,
            paused: false,
        }
    }

    pub fn paused() -> Self {
        Self {
            paused: true,
            ..Self::running()
        }
    }
}

/// Rendering surface driven by the scan controller.
pub trait ScanView {
    fn set_status(&mut self, text: &str);

    /// `fraction` in `[0, 1]` across all polarization passes.
    fn set_progress(&mut self, fraction: f64);

    fn show_progress(&mut self, visible: bool);

    fn set_controls(&mut self, controls: ControlState);

    fn state_changed(&mut self, _state: ScanState) {}

    fn render_points(&mut self, _points: &[CartesianPoint]) {}

    fn render_slice(&mut self, _freq_ghz: f64, _series: &SliceSeries) {}

    fn set_frequency_choices(&mut self, _freqs_ghz: &[f64]) {}

    fn scan_finished(&mut self, _outcome: &ScanOutcome) {}
}
