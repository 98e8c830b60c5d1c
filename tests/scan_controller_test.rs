//! End-to-end scan tests against the simulated range.

mod common;

use std::time::Duration;

use antenna_range::hardware::mock::{DeviceCall, MockRange, TraceModel};
use antenna_range::hardware::SParameter;
use antenna_range::review::parse_pattern_file;
use antenna_range::scan::state::{STATUS_ABORTED, STATUS_COMPLETE};
use antenna_range::scan::{
    ControlState, MeasurementFormat, PolarizationPlan, ScanMode, ScanOutcome, ScanState,
};
use antenna_range::{RangeError, Stage};

use common::{xy_params, Harness};

const CONFIGURE_SEQUENCE: [&str; 10] = [
    "ABORT 7", "CLEAR 716", "PRES", "S21", "STAR 8GHZ", "STOP 12GHZ", "POWE -10", "POIN 11",
    "LOGM;", "CONT",
];

#[test]
fn test_xy_scan_writes_one_block_and_returns_home() {
    let mut h = Harness::new(MockRange::new());
    let csv = h.csv("xy");
    let params = xy_params(&csv, 11).build().unwrap();
    let csv = params.csv_path().to_path_buf();

    let outcome = h.run(params);
    assert_eq!(
        outcome,
        ScanOutcome::Completed {
            samples: 44,
            blocks: 1,
            estimated_settles: 0
        }
    );
    assert_eq!(h.controller.state(), ScanState::Idle);
    assert_eq!(h.controller.last_outcome(), Some(&outcome));

    // Analyzer configured before the first move.
    let calls = h.log.calls();
    let writes: Vec<&str> = calls
        .iter()
        .filter_map(|call| match call {
            DeviceCall::VnaWrite(cmd) => Some(cmd.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(writes, CONFIGURE_SEQUENCE);
    let first_move = calls.iter().position(DeviceCall::is_move).unwrap();
    let last_write = calls
        .iter()
        .rposition(|call| matches!(call, DeviceCall::VnaWrite(_)))
        .unwrap();
    assert!(last_write < first_move);

    assert_eq!(
        h.log.moves(),
        vec![
            (0.0, 0.0),
            (0.0, 90.0),
            (90.0, 90.0),
            (180.0, 90.0),
            (270.0, 90.0),
            (0.0, 0.0)
        ]
    );
    assert_eq!(h.log.count(DeviceCall::is_trace_read), 4);

    let blocks = parse_pattern_file(&csv).unwrap();
    assert_eq!(blocks.len(), 1);
    let block = &blocks[0];
    assert!(block.complete);
    assert_eq!(block.rows.len(), 44);
    assert_eq!(block.skipped_rows, 0);
    assert_eq!(block.meta("vna"), Some("Mock VNA,8720D-SIM"));
    assert_eq!(block.meta("positioner"), Some("Mock positioner"));
    assert_eq!(block.polarization(), Some("vertical"));
    assert_eq!(block.value_label(), Some("Magnitude (dB)"));
    let metadata = block.metadata.as_ref().unwrap();
    assert_eq!(metadata.mode, ScanMode::XySlice);
    assert_eq!(metadata.name, "horn XY");
    assert!(metadata.run_uid.is_some());
    assert_eq!(block.frequencies().len(), 11);

    // Rows are grouped per angle, in grid order.
    let phis: Vec<f64> = block.rows.iter().step_by(11).map(|row| row.phi_deg).collect();
    assert_eq!(phis, vec![0.0, 90.0, 180.0, 270.0]);
    assert!(block.rows.iter().all(|row| row.theta_deg == 90.0));

    assert_eq!(h.session.last_csv(), Some(csv));
    assert_eq!(h.view.statuses.last().map(String::as_str), Some(STATUS_COMPLETE));
    assert_eq!(h.view.controls.last(), Some(&ControlState::idle()));
    assert_eq!(h.view.progress.last(), Some(&1.0));
    assert_eq!(h.view.finished, vec![outcome]);
    assert!(!h.view.slices.is_empty());
}

#[test]
fn test_both_polarizations_write_two_blocks() {
    let mut h = Harness::new(MockRange::new().with_rotation_stage());
    let params = xy_params(&h.csv("dual.csv"), 11)
        .polarization(PolarizationPlan::both())
        .build()
        .unwrap();
    let csv = params.csv_path().to_path_buf();

    let outcome = h.run(params);
    assert_eq!(
        outcome,
        ScanOutcome::Completed {
            samples: 88,
            blocks: 2,
            estimated_settles: 0
        }
    );

    let calls = h.log.calls();
    let rotations: Vec<f64> = calls
        .iter()
        .filter_map(|call| match call {
            DeviceCall::RotateAbs(angle) => Some(*angle),
            _ => None,
        })
        .collect();
    // No move for the first (0 deg) pass; restored to 0 at the end.
    assert_eq!(rotations, vec![90.0, 0.0]);

    let to_horizontal = calls
        .iter()
        .position(|call| *call == DeviceCall::RotateAbs(90.0))
        .unwrap();
    let reads_before = calls[..to_horizontal]
        .iter()
        .filter(|call| call.is_trace_read())
        .count();
    assert_eq!(reads_before, 4);

    let blocks = parse_pattern_file(&csv).unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].polarization(), Some("vertical"));
    assert_eq!(blocks[1].polarization(), Some("horizontal"));
    assert!(blocks.iter().all(|block| block.complete && block.rows.len() == 44));
    assert_eq!(blocks[1].meta("rotation_stage"), Some("Mock rotation stage"));
    assert_eq!(blocks[1].meta("rotation_settle"), None);
    assert_eq!(
        blocks[0].metadata.as_ref().unwrap().run_uid,
        blocks[1].metadata.as_ref().unwrap().run_uid
    );

    // Same angles in both blocks, cross-polar reads lower.
    for (co, cross) in blocks[0].rows.iter().zip(&blocks[1].rows) {
        assert_eq!(
            (co.phi_deg, co.theta_deg, co.freq_ghz),
            (cross.phi_deg, cross.theta_deg, cross.freq_ghz)
        );
        assert!(cross.value < co.value);
    }
}

#[test]
fn test_handshake_fallback_is_flagged_in_block() {
    let range = MockRange::new()
        .with_rotation_stage()
        .map_rotation(|stage| stage.without_handshake());
    let mut h = Harness::new(range);
    let params = xy_params(&h.csv("fallback.csv"), 11)
        .polarization(PolarizationPlan::horizontal())
        .build()
        .unwrap();
    let csv = params.csv_path().to_path_buf();

    let outcome = h.run(params);
    assert_eq!(
        outcome,
        ScanOutcome::Completed {
            samples: 44,
            blocks: 1,
            estimated_settles: 1
        }
    );
    // One estimate for the pass, one for the restore.
    assert_eq!(
        h.log.count(|call| matches!(call, DeviceCall::RotateEstimate(_))),
        2
    );
    assert!(h.log.calls().contains(&DeviceCall::RotateEstimate(90.0)));

    let blocks = parse_pattern_file(&csv).unwrap();
    assert_eq!(blocks[0].meta("rotation_settle"), Some("estimated"));
}

#[test]
fn test_abort_stops_scan_and_restores_reference() {
    let range = MockRange::new()
        .map_positioner(|positioner| positioner.with_move_delay(Duration::from_millis(20)));
    let mut h = Harness::new(range);
    let params = xy_params(&h.csv("abort.csv"), 11)
        .phi_step(5.0)
        .build()
        .unwrap();
    let csv = params.csv_path().to_path_buf();

    h.controller.select_mode(ScanMode::XySlice).unwrap();
    h.controller.start(params).unwrap();
    assert!(h.wait_until(Duration::from_secs(5), |h| h.log.count(DeviceCall::is_trace_read) >= 2));
    h.controller.abort().unwrap();

    let outcome = h.controller.wait().unwrap();
    h.pump();
    assert!(outcome.is_aborted());
    assert_eq!(h.controller.state(), ScanState::Idle);

    let reads = h.log.count(DeviceCall::is_trace_read);
    assert!(reads < 72, "scan ran to completion ({reads} reads)");
    assert_eq!(h.log.moves().last(), Some(&(0.0, 0.0)));

    let blocks = parse_pattern_file(&csv).unwrap();
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].complete);
    assert_eq!(blocks[0].rows.len(), reads * 11);
    assert_eq!(outcome, ScanOutcome::Aborted { samples: (reads * 11) as u64 });

    assert_eq!(h.view.statuses.last().map(String::as_str), Some(STATUS_ABORTED));
    assert!(h.view.states.contains(&ScanState::Aborting));
    assert_eq!(h.view.controls.last(), Some(&ControlState::idle()));
}

#[test]
fn test_pause_holds_worker_until_resume() {
    let range = MockRange::new()
        .map_positioner(|positioner| positioner.with_move_delay(Duration::from_millis(10)));
    let mut h = Harness::new(range);
    let params = xy_params(&h.csv("pause.csv"), 11)
        .phi_step(30.0)
        .build()
        .unwrap();

    h.controller.select_mode(ScanMode::XySlice).unwrap();
    h.controller.start(params).unwrap();
    // Let the worker announce itself before pausing.
    assert!(h.wait_until(Duration::from_secs(5), |h| h.log.count(DeviceCall::is_move) >= 1));
    assert!(h.controller.toggle_pause().unwrap());
    assert!(h.wait_until(Duration::from_secs(5), |h| h.controller.state() == ScanState::Paused));

    let frozen = h.log.len();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(h.log.len(), frozen, "worker kept issuing commands while paused");
    assert!(h.view.statuses.iter().any(|s| s == "Scan paused."));
    assert_eq!(h.view.controls.last(), Some(&ControlState::paused()));

    // A second pause is a no-op.
    h.controller.pause().unwrap();
    assert!(!h.controller.toggle_pause().unwrap());

    let outcome = h.controller.wait().unwrap();
    h.pump();
    assert_eq!(
        outcome,
        ScanOutcome::Completed {
            samples: 12 * 11,
            blocks: 1,
            estimated_settles: 0
        }
    );
    assert!(h.view.statuses.iter().any(|s| s == "Scan resumed."));
}

#[test]
fn test_abort_while_paused() {
    let range = MockRange::new()
        .map_positioner(|positioner| positioner.with_move_delay(Duration::from_millis(10)));
    let mut h = Harness::new(range);
    let params = xy_params(&h.csv("paused_abort.csv"), 11).build().unwrap();

    h.controller.select_mode(ScanMode::XySlice).unwrap();
    h.controller.start(params).unwrap();
    h.controller.pause().unwrap();
    assert!(h.wait_until(Duration::from_secs(5), |h| h.controller.state() == ScanState::Paused));
    let reads = h.log.count(DeviceCall::is_trace_read);

    h.controller.abort().unwrap();
    let outcome = h.controller.wait().unwrap();
    assert!(outcome.is_aborted());
    assert_eq!(h.log.count(DeviceCall::is_trace_read), reads);
    assert_eq!(h.log.moves().last(), Some(&(0.0, 0.0)));
}

#[test]
fn test_validation_failure_touches_no_device() {
    let mut h = Harness::new(MockRange::new());

    let err = xy_params(&h.csv("bad.csv"), 11)
        .phi_step(0.0)
        .build()
        .unwrap_err();
    assert!(err.is_validation());

    // Needs a rotation stage the range does not have.
    let params = xy_params(&h.csv("bad.csv"), 11)
        .polarization(PolarizationPlan::both())
        .build()
        .unwrap();
    h.controller.select_mode(ScanMode::XySlice).unwrap();
    let err = h.controller.start(params).unwrap_err();
    assert!(err.is_validation(), "{err}");

    assert!(h.log.is_empty());
    assert_eq!(h.controller.state(), ScanState::Configuring);
    assert!(!h.csv("bad.csv").exists());
}

#[test]
fn test_start_requires_matching_mode() {
    let mut h = Harness::new(MockRange::new());
    let params = xy_params(&h.csv("mode.csv"), 11).build().unwrap();

    let err = h.controller.start(params.clone()).unwrap_err();
    assert!(matches!(err, RangeError::InvalidState { .. }));

    h.controller.select_mode(ScanMode::FullSpherical).unwrap();
    let err = h.controller.start(params).unwrap_err();
    assert!(err.is_validation());

    h.controller.back().unwrap();
    assert_eq!(h.controller.state(), ScanState::Idle);
    assert!(h.log.is_empty());
}

#[test]
fn test_controls_rejected_while_idle() {
    let mut h = Harness::new(MockRange::new());
    assert!(matches!(
        h.controller.pause(),
        Err(RangeError::InvalidState { .. })
    ));
    assert!(h.controller.resume().is_err());
    assert!(h.controller.abort().is_err());
    assert!(h.controller.poll_finished().is_none());
}

#[test]
fn test_vna_configuration_failure_does_not_spawn() {
    let mut h = Harness::new(MockRange::new().map_vna(|vna| vna.fail_writes()));
    let params = xy_params(&h.csv("novna.csv"), 11).build().unwrap();

    h.controller.select_mode(ScanMode::XySlice).unwrap();
    let err = h.controller.start(params).unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Vna));
    assert!(err.to_string().starts_with("VNA error:"));
    assert_eq!(h.controller.state(), ScanState::Configuring);
    assert_eq!(h.log.count(DeviceCall::is_move), 0);
    assert!(!h.csv("novna.csv").exists());

    // Reading the analyzer as-is still works.
    let params = xy_params(&h.csv("novna.csv"), 11)
        .modify_vna(false)
        .build()
        .unwrap();
    h.controller.start(params).unwrap();
    let outcome = h.controller.wait().unwrap();
    // The analyzer kept its own 5-point sweep.
    assert_eq!(
        outcome,
        ScanOutcome::Completed {
            samples: 20,
            blocks: 1,
            estimated_settles: 0
        }
    );
}

#[test]
fn test_positioner_failure_reports_stage() {
    let mut h = Harness::new(MockRange::new().map_positioner(|p| p.fail_on_move(3)));
    let params = xy_params(&h.csv("stall.csv"), 11).build().unwrap();
    let csv = params.csv_path().to_path_buf();

    let outcome = h.run(params);
    let ScanOutcome::Failed { message } = &outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.starts_with("Positioner error:"), "{message}");
    assert!(message.contains("limit switch"));
    assert_eq!(h.controller.state(), ScanState::Idle);

    // Home, first point, the failing move, then the best-effort return.
    assert_eq!(h.log.moves().len(), 4);
    assert_eq!(h.log.moves().last(), Some(&(0.0, 0.0)));

    let blocks = parse_pattern_file(&csv).unwrap();
    assert!(blocks[0].complete);
    assert_eq!(blocks[0].rows.len(), 11);

    assert_eq!(h.view.statuses.last(), Some(message));
    assert!(h.view.states.contains(&ScanState::Failing));
    assert_eq!(h.view.controls.last(), Some(&ControlState::idle()));
}

#[test]
fn test_vna_read_failure_reports_stage() {
    let mut h = Harness::new(MockRange::new().map_vna(|vna| vna.fail_on_read(2)));
    let params = xy_params(&h.csv("vnafail.csv"), 11).build().unwrap();

    let outcome = h.run(params);
    assert_eq!(
        outcome,
        ScanOutcome::Failed {
            message: "VNA error: simulated trace transfer timeout".to_string()
        }
    );
}

#[test]
fn test_manual_commands_refused_while_scanning() {
    let range = MockRange::new()
        .map_positioner(|positioner| positioner.with_move_delay(Duration::from_millis(10)));
    let mut h = Harness::new(range);
    let params = xy_params(&h.csv("manual.csv"), 11).build().unwrap();

    h.controller.select_mode(ScanMode::XySlice).unwrap();
    h.controller.start(params).unwrap();
    assert!(matches!(
        h.controller.goto(10.0, 20.0),
        Err(RangeError::ScanActive(_))
    ));
    assert!(h.controller.select_mode(ScanMode::FullSpherical).is_err());
    h.controller.wait().unwrap();

    h.controller.goto(10.0, 20.0).unwrap();
    assert_eq!(h.controller.position().unwrap()[..2], [10.0, 20.0]);
    let position = h.controller.jog(5.0, -5.0).unwrap();
    assert_eq!(position[..2], [15.0, 15.0]);
    h.controller.save_origin().unwrap();
    assert_eq!(h.controller.position().unwrap()[..2], [0.0, 0.0]);
}

#[test]
fn test_shutdown_aborts_running_scan() {
    let range = MockRange::new()
        .map_positioner(|positioner| positioner.with_move_delay(Duration::from_millis(20)));
    let mut h = Harness::new(range);
    let params = xy_params(&h.csv("shutdown.csv"), 11)
        .phi_step(5.0)
        .build()
        .unwrap();

    h.controller.select_mode(ScanMode::XySlice).unwrap();
    h.controller.start(params).unwrap();
    assert!(h.wait_until(Duration::from_secs(5), |h| h.log.count(DeviceCall::is_trace_read) >= 1));

    let outcome = h.controller.shutdown(&mut h.queue).unwrap();
    assert!(outcome.is_aborted());
    assert!(!h.queue.is_alive());
    // Nothing scheduled after teardown reaches the view.
    assert_eq!(h.pump(), 0);
    assert_eq!(h.controller.state(), ScanState::Idle);
}

#[test]
fn test_single_frequency_scan_on_preset_analyzer() {
    let range = MockRange::new().map_vna(|vna| {
        vna.with_model(TraceModel::Constant(-3.0))
            .with_sweep(8.0, 8.0, 1)
    });
    let mut h = Harness::new(range);
    let params = xy_params(&h.csv("cw.csv"), 1)
        .sweep(8.0, 8.0, 1)
        .modify_vna(false)
        .build()
        .unwrap();
    let csv = params.csv_path().to_path_buf();

    let outcome = h.run(params);
    assert_eq!(
        outcome,
        ScanOutcome::Completed {
            samples: 4,
            blocks: 1,
            estimated_settles: 0
        }
    );
    assert_eq!(h.log.count(|call| matches!(call, DeviceCall::VnaWrite(_))), 0);

    let text = std::fs::read_to_string(&csv).unwrap();
    let rows: Vec<&str> = text.lines().filter(|line| !line.starts_with('#')).skip(1).collect();
    assert_eq!(
        rows,
        [
            "0.0,90.0,8.0,-3.0",
            "90.0,90.0,8.0,-3.0",
            "180.0,90.0,8.0,-3.0",
            "270.0,90.0,8.0,-3.0"
        ]
    );
}

#[test]
fn test_every_sample_reaches_the_live_sink() {
    let mut h = Harness::new(MockRange::new());
    let params = xy_params(&h.csv("sink.csv"), 11).build().unwrap();
    let csv = params.csv_path().to_path_buf();

    h.run(params);
    let rows = parse_pattern_file(&csv).unwrap()[0].rows.len() as u64;
    assert_eq!(rows, 44);
    let sink = h.controller.sink().unwrap();
    assert_eq!(sink.samples_recorded(), rows);
    assert_eq!(sink.frequencies().len(), 11);
}

#[test]
fn test_slice_drawn_from_the_first_angle() {
    let mut h = Harness::new(MockRange::new());
    let params = xy_params(&h.csv("slice.csv"), 11).build().unwrap();

    h.run(params);
    // One redraw per angle, all of the mid-band series.
    assert_eq!(h.view.slices.len(), 4);
    assert!(h.view.slices.iter().all(|(freq, _)| *freq == 10.0));
}

#[test]
fn test_manual_analyzer_commands() {
    let range = MockRange::new()
        .map_positioner(|positioner| positioner.with_move_delay(Duration::from_millis(10)));
    let mut h = Harness::new(range);
    let params = xy_params(&h.csv("panel.csv"), 11).build().unwrap();

    h.controller.select_mode(ScanMode::XySlice).unwrap();
    h.controller.start(params).unwrap();
    assert!(matches!(
        h.controller.vna_format(MeasurementFormat::Phas),
        Err(RangeError::ScanActive(_))
    ));
    assert!(matches!(
        h.controller.vna_trace(),
        Err(RangeError::ScanActive(_))
    ));
    h.controller.wait().unwrap();
    h.log.clear();

    h.controller.vna_format(MeasurementFormat::Phas).unwrap();
    h.controller.vna_sparam(SParameter::S11).unwrap();
    h.controller.vna_reset().unwrap();
    h.controller.vna_write("CONT").unwrap();
    let writes: Vec<String> = h
        .log
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            DeviceCall::VnaWrite(cmd) => Some(cmd),
            _ => None,
        })
        .collect();
    assert_eq!(writes, ["PHAS;", "S11", "*RST", "CONT"]);

    assert_eq!(h.controller.vna_query("POIN?").unwrap(), "11");
    let trace = h.controller.vna_trace().unwrap();
    assert_eq!(trace.len(), 11);
    assert_eq!(trace.freqs_ghz().first(), Some(&8.0));

    let err = h.controller.vna_query("BOGUS?").unwrap_err();
    assert!(err.to_string().starts_with("VNA error:"));
}
