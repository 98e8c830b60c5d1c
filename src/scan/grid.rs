//! Angle grid construction.
//!
//! The grid is built once per scan and reused for every polarization pass.
//! Ordering is phi-major: all theta samples for one phi are contiguous, which
//! the CSV layout and the per-row frequency refresh depend on.
//!
//! Axis conventions:
//! - theta over `[0, 180]` includes the pole at 180,
//! - any axis swept over a full turn covers `[0, 360)` without the wrap-around
//!   duplicate.

use serde::{Deserialize, Serialize};

use super::params::{Axis, GridConfig, ScanMode, ScanParameters};
use crate::error::{RangeError, RangeResult};

/// Absorbs float error in `span / step` so 180/0.1 counts 1801 points.
const COUNT_EPSILON: f64 = 1e-9;

/// Largest number of positioner targets a single pass may contain.
pub const MAX_GRID_POINTS: usize = 1_000_000;

/// One positioner target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnglePoint {
    pub phi_deg: f64,
    pub theta_deg: f64,
}

impl AnglePoint {
    pub fn new(phi_deg: f64, theta_deg: f64) -> Self {
        Self { phi_deg, theta_deg }
    }

    pub fn angle(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Phi => self.phi_deg,
            Axis::Theta => self.theta_deg,
        }
    }
}

/// Ordered positioner targets for one polarization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AngleGrid {
    points: Vec<AnglePoint>,
    phi_count: usize,
    theta_count: usize,
}

impl AngleGrid {
    /// Grid for a validated parameter set.
    pub fn from_params(params: &ScanParameters) -> RangeResult<Self> {
        build_grid(params.mode(), params.grid())
    }

    pub fn points(&self) -> &[AnglePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn phi_count(&self) -> usize {
        self.phi_count
    }

    pub fn theta_count(&self) -> usize {
        self.theta_count
    }

    /// True when `index` is the last theta sample of its phi row.
    pub fn ends_phi_row(&self, index: usize) -> bool {
        self.theta_count > 0 && (index + 1) % self.theta_count == 0
    }
}

/// Number of targets [`build_grid`] would produce, computed without
/// allocating. Fails when it exceeds [`MAX_GRID_POINTS`].
pub fn grid_size(mode: ScanMode, grid: &GridConfig) -> RangeResult<usize> {
    let (phi_count, theta_count) = match mode {
        ScanMode::FullSpherical => (
            full_turn_count(required(grid.phi_step_deg, "Phi step")?)?,
            half_turn_count(required(grid.theta_step_deg, "Theta step")?)?,
        ),
        ScanMode::XySlice => (full_turn_count(required(grid.phi_step_deg, "Phi step")?)?, 1),
        ScanMode::Phi0Slice | ScanMode::Phi90Slice => {
            (1, full_turn_count(required(grid.theta_step_deg, "Theta step")?)?)
        }
        ScanMode::CustomSlice => (
            1,
            full_turn_count(required(grid.custom_step_deg, "Step size")?)?,
        ),
    };
    phi_count
        .checked_mul(theta_count)
        .filter(|&total| total <= MAX_GRID_POINTS)
        .ok_or_else(|| {
            RangeError::validation(format!(
                "angle grid of {phi_count} x {theta_count} points exceeds the limit of \
                 {MAX_GRID_POINTS}; increase the step size"
            ))
        })
}

/// Build the ordered `(phi, theta)` grid for a scan mode.
pub fn build_grid(mode: ScanMode, grid: &GridConfig) -> RangeResult<AngleGrid> {
    grid_size(mode, grid)?;
    let (phi, theta) = match mode {
        ScanMode::FullSpherical => (
            full_turn(required(grid.phi_step_deg, "Phi step")?)?,
            half_turn_inclusive(required(grid.theta_step_deg, "Theta step")?)?,
        ),
        ScanMode::XySlice => (full_turn(required(grid.phi_step_deg, "Phi step")?)?, vec![90.0]),
        ScanMode::Phi0Slice => (
            vec![0.0],
            full_turn(required(grid.theta_step_deg, "Theta step")?)?,
        ),
        ScanMode::Phi90Slice => (
            vec![90.0],
            full_turn(required(grid.theta_step_deg, "Theta step")?)?,
        ),
        ScanMode::CustomSlice => {
            let axis = grid
                .custom_axis
                .ok_or_else(|| RangeError::validation("fixed axis is required"))?;
            let fixed = required(grid.custom_angle_deg, "Fixed angle")?;
            let swept = full_turn(required(grid.custom_step_deg, "Step size")?)?;
            match axis {
                Axis::Phi => (vec![fixed], swept),
                Axis::Theta => (swept, vec![fixed]),
            }
        }
    };

    let points = phi
        .iter()
        .flat_map(|&p| theta.iter().map(move |&t| AnglePoint::new(p, t)))
        .collect();

    Ok(AngleGrid {
        points,
        phi_count: phi.len(),
        theta_count: theta.len(),
    })
}

fn required(value: Option<f64>, what: &str) -> RangeResult<f64> {
    value.ok_or_else(|| RangeError::validation(format!("{what} is required")))
}

fn check_step(step: f64) -> RangeResult<()> {
    if step.is_finite() && step > 0.0 {
        Ok(())
    } else {
        Err(RangeError::validation(format!("step must be > 0, got {step}")))
    }
}

fn bounded_count(count: f64, step: f64) -> RangeResult<usize> {
    if count > MAX_GRID_POINTS as f64 {
        return Err(RangeError::validation(format!(
            "step of {step} deg gives more than {MAX_GRID_POINTS} points on one axis"
        )));
    }
    Ok(count as usize)
}

/// Length of [`full_turn`] at `step`.
pub fn full_turn_count(step: f64) -> RangeResult<usize> {
    check_step(step)?;
    bounded_count((360.0 / step - COUNT_EPSILON).ceil().max(1.0), step)
}

/// Length of [`half_turn_inclusive`] at `step`.
pub fn half_turn_count(step: f64) -> RangeResult<usize> {
    check_step(step)?;
    bounded_count((180.0 / step + COUNT_EPSILON).floor() + 1.0, step)
}

/// `[0, 360)` at `step`.
pub fn full_turn(step: f64) -> RangeResult<Vec<f64>> {
    Ok(axis_values(step, full_turn_count(step)?))
}

/// `[0, 180]` at `step`.
pub fn half_turn_inclusive(step: f64) -> RangeResult<Vec<f64>> {
    Ok(axis_values(step, half_turn_count(step)?))
}

fn axis_values(step: f64, count: usize) -> Vec<f64> {
    (0..count)
        .map(|i| ((i as f64 * step) * 1e9).round() / 1e9)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(phi: Option<f64>, theta: Option<f64>) -> GridConfig {
        GridConfig {
            phi_step_deg: phi,
            theta_step_deg: theta,
            ..GridConfig::default()
        }
    }

    #[test]
    fn test_xy_slice_quarter_turns() {
        let g = build_grid(ScanMode::XySlice, &grid(Some(90.0), None)).unwrap();
        let expected: Vec<AnglePoint> = [0.0, 90.0, 180.0, 270.0]
            .iter()
            .map(|&p| AnglePoint::new(p, 90.0))
            .collect();
        assert_eq!(g.points(), expected.as_slice());
        assert_eq!(g.phi_count(), 4);
        assert_eq!(g.theta_count(), 1);
    }

    #[test]
    fn test_full_sphere_includes_pole_excludes_wrap() {
        let g = build_grid(ScanMode::FullSpherical, &grid(Some(90.0), Some(90.0))).unwrap();
        assert_eq!(g.len(), 4 * 3);
        assert_eq!(g.points()[0], AnglePoint::new(0.0, 0.0));
        assert_eq!(g.points()[2], AnglePoint::new(0.0, 180.0));
        assert_eq!(g.points()[3], AnglePoint::new(90.0, 0.0));
        assert!(g.points().iter().all(|p| p.phi_deg < 360.0));
    }

    #[test]
    fn test_phi_major_ordering() {
        let g = build_grid(ScanMode::FullSpherical, &grid(Some(120.0), Some(60.0))).unwrap();
        for (row, chunk) in g.points().chunks(g.theta_count()).enumerate() {
            assert!(chunk.iter().all(|p| p.phi_deg == row as f64 * 120.0));
        }
        assert!(g.ends_phi_row(3));
        assert!(!g.ends_phi_row(4));
    }

    #[test]
    fn test_counts_match_half_open_ranges() {
        assert_eq!(full_turn(7.0).unwrap().len(), 52);
        assert_eq!(half_turn_inclusive(7.0).unwrap().len(), 26);
        assert_eq!(half_turn_inclusive(0.1).unwrap().len(), 1801);
        assert_eq!(full_turn(0.1).unwrap().len(), 3600);
        assert_eq!(full_turn(500.0).unwrap(), vec![0.0]);
        assert_eq!(full_turn(0.1).unwrap()[3], 0.3);
    }

    #[test]
    fn test_fixed_axis_slices() {
        let g = build_grid(ScanMode::Phi90Slice, &grid(None, Some(45.0))).unwrap();
        assert_eq!(g.len(), 8);
        assert!(g.points().iter().all(|p| p.phi_deg == 90.0));
        assert_eq!(g.points().last().unwrap().theta_deg, 315.0);

        let custom = GridConfig {
            custom_axis: Some(Axis::Theta),
            custom_angle_deg: Some(30.0),
            custom_step_deg: Some(120.0),
            ..GridConfig::default()
        };
        let g = build_grid(ScanMode::CustomSlice, &custom).unwrap();
        assert_eq!(
            g.points(),
            &[
                AnglePoint::new(0.0, 30.0),
                AnglePoint::new(120.0, 30.0),
                AnglePoint::new(240.0, 30.0)
            ]
        );
    }

    #[test]
    fn test_non_positive_step_is_validation_error() {
        let err = build_grid(ScanMode::XySlice, &grid(Some(0.0), None)).unwrap_err();
        assert!(err.is_validation());
        assert!(build_grid(ScanMode::Phi0Slice, &grid(None, Some(-1.0))).is_err());
        assert!(build_grid(ScanMode::FullSpherical, &grid(Some(10.0), None)).is_err());
    }

    #[test]
    fn test_oversized_grid_rejected_before_allocation() {
        let tiny = grid(Some(1e-7), Some(1e-7));
        let err = build_grid(ScanMode::FullSpherical, &tiny).unwrap_err();
        assert!(err.is_validation());
        assert!(full_turn(1e-7).is_err());

        // 0.25 deg on both axes is 1440 x 721 targets.
        let dense = grid(Some(0.25), Some(0.25));
        assert!(grid_size(ScanMode::FullSpherical, &dense).unwrap_err().is_validation());
        assert_eq!(grid_size(ScanMode::XySlice, &dense).unwrap(), 1440);
        assert_eq!(
            grid_size(ScanMode::FullSpherical, &grid(Some(1.0), Some(1.0))).unwrap(),
            360 * 181
        );
    }

    #[test]
    fn test_deterministic() {
        let config = grid(Some(15.0), Some(15.0));
        let a = build_grid(ScanMode::FullSpherical, &config).unwrap();
        let b = build_grid(ScanMode::FullSpherical, &config).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), a.phi_count() * a.theta_count());
    }
}
