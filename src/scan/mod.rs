//! Scan orchestration
//!
//! - [`params`]: validated scan configuration
//! - [`grid`]: ordered `(phi, theta)` targets
//! - [`csv_block`]: multi-block CSV log
//! - [`live_sink`]: live plot buffers
//! - [`controller`]: UI-thread state machine owning the worker thread
//! - [`view`]: what the controller expects from a UI shell

pub mod controller;
pub mod csv_block;
pub mod grid;
pub mod live_sink;
pub mod params;
pub mod state;
pub mod view;
mod worker;

pub use controller::{io_runtime, ScanController, ScanDevices};
pub use csv_block::{BlockMetadata, CsvBlockWriter, DeviceIdentities};
pub use grid::{build_grid, AngleGrid, AnglePoint};
pub use live_sink::{CartesianPoint, LiveSampleSink, SinkSignal, SliceSeries};
pub use params::{
    Axis, GridConfig, MeasurementFormat, PlotOptions, PolarizationPlan, PolarizationStep,
    ScanMode, ScanParameters, ScanParametersBuilder, SweepConfig,
};
pub use state::{ScanOutcome, ScanState};
pub use view::{ControlState, ScanView};

/// One measurement: a single frequency point of a trace at one angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSample {
    pub phi_deg: f64,
    pub theta_deg: f64,
    pub freq_ghz: f64,
    pub value: f64,
}

impl ScanSample {
    pub fn new(phi_deg: f64, theta_deg: f64, freq_ghz: f64, value: f64) -> Self {
        Self {
            phi_deg,
            theta_deg,
            freq_ghz,
            value,
        }
    }

    pub fn angle(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Phi => self.phi_deg,
            Axis::Theta => self.theta_deg,
        }
    }
}
