//! Live plot data, decoupled from rendering.
//!
//! The worker thread mutates the sink; the UI thread consumes it inside a
//! scheduled task. The sink never holds a view handle, it only tells the
//! worker (through [`SinkSignal`]) when a hop to the UI thread is worth
//! scheduling.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::params::{Axis, ScanParameters};
use super::ScanSample;

/// A 3D point of the coarse radiation pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CartesianPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl CartesianPoint {
    /// Convert a dB value at `(phi, theta)` into a point at radius `10^(dB/20)`.
    ///
    /// theta is the polar angle from +z, phi the azimuth from +x.
    pub fn from_db(phi_deg: f64, theta_deg: f64, value_db: f64) -> Self {
        let r = 10f64.powf(value_db / 20.0);
        let (phi, theta) = (phi_deg.to_radians(), theta_deg.to_radians());
        Self {
            x: r * theta.sin() * phi.cos(),
            y: r * theta.sin() * phi.sin(),
            z: r * theta.cos(),
        }
    }
}

/// One 2D series: swept angle against value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceSeries {
    pub angles: Vec<f64>,
    pub values: Vec<f64>,
}

impl SliceSeries {
    pub fn push(&mut self, angle: f64, value: f64) {
        self.angles.push(angle);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.angles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.angles.is_empty()
    }
}

/// What the worker should schedule on the UI thread after a sink update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSignal {
    /// Nothing visible changed
    Idle,
    /// A batch of 3D points is ready for [`LiveSampleSink::take_points`]
    FlushPoints,
    /// The active 2D series grew
    RedrawSlice,
}

/// Frequencies are keyed in kHz so float noise does not split a series.
fn freq_key(freq_ghz: f64) -> i64 {
    (freq_ghz * 1e6).round() as i64
}

fn key_to_ghz(key: i64) -> f64 {
    key as f64 / 1e6
}

#[derive(Debug)]
struct SphericalBuffer {
    pending: Vec<CartesianPoint>,
    batch_size: usize,
}

#[derive(Debug, Default)]
struct SliceCache {
    swept: Option<Axis>,
    series: BTreeMap<i64, SliceSeries>,
    active: Option<i64>,
}

#[derive(Debug)]
enum Layout {
    Spherical(SphericalBuffer),
    Slice(SliceCache),
}

#[derive(Debug)]
struct SinkState {
    layout: Layout,
    samples_recorded: u64,
}

/// Shared accumulation buffer for live plots.
///
/// Cloning yields another handle to the same buffers.
#[derive(Debug, Clone)]
pub struct LiveSampleSink {
    inner: Arc<Mutex<SinkState>>,
}

impl LiveSampleSink {
    /// Batched 3D buffer flushed every `batch_size` points.
    pub fn spherical(batch_size: usize) -> Self {
        Self::with_layout(Layout::Spherical(SphericalBuffer {
            pending: Vec::new(),
            batch_size: batch_size.max(1),
        }))
    }

    /// Per-frequency 2D cache plotted against `swept`.
    pub fn slice(swept: Axis) -> Self {
        Self::with_layout(Layout::Slice(SliceCache {
            swept: Some(swept),
            ..SliceCache::default()
        }))
    }

    /// Layout matching the scan shape.
    pub fn for_scan(params: &ScanParameters, batch_size: usize) -> Self {
        match params.swept_axis() {
            None => Self::spherical(batch_size),
            Some(axis) => Self::slice(axis),
        }
    }

    fn with_layout(layout: Layout) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkState {
                layout,
                samples_recorded: 0,
            })),
        }
    }

    // A panicked holder leaves plot buffers, not invariants; keep using them.
    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_spherical(&self) -> bool {
        matches!(self.lock().layout, Layout::Spherical(_))
    }

    /// Record one measured sample (every frequency of every trace).
    pub fn record(&self, sample: &ScanSample) -> SinkSignal {
        let mut state = self.lock();
        state.samples_recorded += 1;
        match &mut state.layout {
            Layout::Spherical(_) => SinkSignal::Idle,
            Layout::Slice(cache) => {
                let Some(axis) = cache.swept else {
                    return SinkSignal::Idle;
                };
                let key = freq_key(sample.freq_ghz);
                cache
                    .series
                    .entry(key)
                    .or_default()
                    .push(sample.angle(axis), sample.value);
                if cache.active == Some(key) {
                    SinkSignal::RedrawSlice
                } else {
                    SinkSignal::Idle
                }
            }
        }
    }

    /// Feed the mid-band sample of a trace to the coarse view.
    ///
    /// For 3D scans this buffers one point; for slices the first mid-band
    /// frequency becomes the active series.
    pub fn note_mid_band(&self, sample: &ScanSample) -> SinkSignal {
        let mut state = self.lock();
        match &mut state.layout {
            Layout::Spherical(buffer) => {
                buffer.pending.push(CartesianPoint::from_db(
                    sample.phi_deg,
                    sample.theta_deg,
                    sample.value,
                ));
                if buffer.pending.len() >= buffer.batch_size {
                    SinkSignal::FlushPoints
                } else {
                    SinkSignal::Idle
                }
            }
            Layout::Slice(cache) => {
                if cache.active.is_none() {
                    cache.active = Some(freq_key(sample.freq_ghz));
                }
                SinkSignal::Idle
            }
        }
    }

    /// Drain buffered 3D points (UI thread).
    pub fn take_points(&self) -> Vec<CartesianPoint> {
        match &mut self.lock().layout {
            Layout::Spherical(buffer) => std::mem::take(&mut buffer.pending),
            Layout::Slice(_) => Vec::new(),
        }
    }

    pub fn pending_points(&self) -> usize {
        match &self.lock().layout {
            Layout::Spherical(buffer) => buffer.pending.len(),
            Layout::Slice(_) => 0,
        }
    }

    /// The selected frequency and a copy of its series.
    pub fn active_series(&self) -> Option<(f64, SliceSeries)> {
        match &self.lock().layout {
            Layout::Slice(cache) => {
                let key = cache.active?;
                let series = cache.series.get(&key).cloned().unwrap_or_default();
                Some((key_to_ghz(key), series))
            }
            Layout::Spherical(_) => None,
        }
    }

    /// Frequencies with a cached series, ascending.
    pub fn frequencies(&self) -> Vec<f64> {
        match &self.lock().layout {
            Layout::Slice(cache) => cache.series.keys().copied().map(key_to_ghz).collect(),
            Layout::Spherical(_) => Vec::new(),
        }
    }

    /// Make `freq_ghz` the rendered series. Returns false for unknown frequencies.
    pub fn select_frequency(&self, freq_ghz: f64) -> bool {
        match &mut self.lock().layout {
            Layout::Slice(cache) => {
                let key = freq_key(freq_ghz);
                if cache.series.contains_key(&key) {
                    cache.active = Some(key);
                    true
                } else {
                    false
                }
            }
            Layout::Spherical(_) => false,
        }
    }

    /// Samples passed to [`record`](Self::record) so far.
    pub fn samples_recorded(&self) -> u64 {
        self.lock().samples_recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cartesian_conversion() {
        let top = CartesianPoint::from_db(0.0, 0.0, 0.0);
        assert!((top.z - 1.0).abs() < 1e-12);
        let side = CartesianPoint::from_db(90.0, 90.0, 20.0);
        assert!((side.y - 10.0).abs() < 1e-9);
        assert!(side.x.abs() < 1e-9 && side.z.abs() < 1e-9);
    }

    #[test]
    fn test_spherical_batches() {
        let sink = LiveSampleSink::spherical(3);
        let mut signals = Vec::new();
        for i in 0..7 {
            let sample = ScanSample::new(i as f64 * 10.0, 45.0, 10.0, -3.0);
            assert_eq!(sink.record(&sample), SinkSignal::Idle);
            signals.push(sink.note_mid_band(&sample));
            if signals.last() == Some(&SinkSignal::FlushPoints) {
                assert_eq!(sink.take_points().len(), 3);
            }
        }
        let flushes = signals
            .iter()
            .filter(|s| **s == SinkSignal::FlushPoints)
            .count();
        assert_eq!(flushes, 2);
        assert_eq!(sink.pending_points(), 1);
        assert_eq!(sink.take_points().len(), 1);
        assert_eq!(sink.samples_recorded(), 7);
    }

    #[test]
    fn test_slice_cache_by_frequency() {
        let sink = LiveSampleSink::slice(Axis::Phi);
        for phi in [0.0, 90.0] {
            let mid = ScanSample::new(phi, 90.0, 9.0, -1.0);
            sink.note_mid_band(&mid);
            let mut redraws = 0;
            for (f, v) in [(8.0, -2.0), (9.0, -1.0), (10.0, -4.0)] {
                if sink.record(&ScanSample::new(phi, 90.0, f, v)) == SinkSignal::RedrawSlice {
                    redraws += 1;
                }
            }
            // Only the active (mid-band) series triggers a redraw.
            assert_eq!(redraws, 1);
        }

        assert_eq!(sink.frequencies(), vec![8.0, 9.0, 10.0]);
        let (freq, series) = sink.active_series().unwrap();
        assert_eq!(freq, 9.0);
        assert_eq!(series.angles, vec![0.0, 90.0]);
        assert_eq!(series.values, vec![-1.0, -1.0]);

        assert!(sink.select_frequency(10.0));
        assert_eq!(sink.active_series().unwrap().1.values, vec![-4.0, -4.0]);
        assert!(!sink.select_frequency(11.0));
        assert_eq!(sink.samples_recorded(), 6);
    }

    #[test]
    fn test_clones_share_buffers() {
        let sink = LiveSampleSink::spherical(10);
        let ui_side = sink.clone();
        sink.note_mid_band(&ScanSample::new(0.0, 0.0, 1.0, 0.0));
        assert_eq!(ui_side.take_points().len(), 1);
        assert_eq!(sink.pending_points(), 0);
    }
}
