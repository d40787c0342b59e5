//! Scan orchestrator runs on simulated hardware.

mod common;

use common::{assert_within, focus_rig, CancelAfter};
use microscope_daq::core::{CancelToken, Displacement, Position};
use microscope_daq::experiment::{
    dz_array, AutofocusRequest, ExitStatus, PlanKind, ScanOrchestrator, ScanPlan,
};
use microscope_daq::hardware::mock::{SimulatedSensor, SimulatedStage};
use microscope_daq::hardware::Stage;
use microscope_daq::MicroscopeError;

#[test]
fn test_raster_of_five() {
    let (mut stage, mut sensor) = focus_rig(Position::origin(), 0);

    let result = ScanOrchestrator::new(&mut stage, &mut sensor)
        .run(&ScanPlan::raster(5, 40, 0))
        .unwrap();

    let positions: Vec<(i64, i64)> = result.positions().iter().map(|p| (p.x, p.y)).collect();
    assert_eq!(positions, vec![(0, 0), (40, 0), (80, 0), (120, 0), (160, 0)]);
    assert_eq!(result.kind, PlanKind::Raster);
    assert_eq!(result.exit_status, ExitStatus::Success);
    assert!(result.finished_at.is_some());

    let frame_numbers: Vec<u64> = result.frames().map(|f| f.metadata().frame_number).collect();
    assert_eq!(frame_numbers, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_capture_failure_keeps_earlier_frames() {
    let (mut stage, sensor) = focus_rig(Position::origin(), 0);
    let mut sensor = sensor.fail_on_capture(3);

    let err = ScanOrchestrator::new(&mut stage, &mut sensor)
        .run(&ScanPlan::raster(5, 40, 0))
        .unwrap_err();

    match err {
        MicroscopeError::PlanAborted {
            step,
            partial,
            source,
        } => {
            assert_eq!(step, 2);
            assert_eq!(partial.len(), 2);
            assert_eq!(partial.exit_status, ExitStatus::Abort);
            assert!(matches!(*source, MicroscopeError::Sensor(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    // Nothing after the failed step ran
    assert_eq!(stage.position().unwrap().x, 80);
}

#[test]
fn test_edge_scan_images_three_sites() {
    let (mut stage, mut sensor) = focus_rig(Position::origin(), 30);
    let offsets = dz_array(20, 5);
    let plan = ScanPlan::edge_scan(
        Some((500, 0)),
        &offsets,
        AutofocusRequest::with_search(100, 10),
    );
    assert_eq!(plan.len(), 3 * offsets.len());

    let result = ScanOrchestrator::new(&mut stage, &mut sensor).run(&plan).unwrap();

    assert_eq!(result.len(), 15);
    let positions = result.positions();
    for (site, chunk) in positions.chunks(offsets.len()).enumerate() {
        let x = [-500, 0, 500][site];
        assert!(chunk.iter().all(|p| p.x == x && p.y == 0), "site {site}: {chunk:?}");

        // Stack is centred on the focus found at this site
        let focus = chunk[offsets.len() / 2].z;
        assert_within(focus, 30, 10, "site focus");
        let relative: Vec<i64> = chunk.iter().map(|p| p.z - focus).collect();
        assert_eq!(relative, offsets);
    }
}

#[test]
fn test_autofocus_step_refocuses_before_capture() {
    let (mut stage, mut sensor) = focus_rig(Position::origin(), -60);
    let request = AutofocusRequest::with_search(200, 20);
    let plan = ScanPlan::new(
        "focus_then_offset",
        PlanKind::Custom,
        vec![microscope_daq::experiment::ScanStep::focus_then_move(
            request,
            Displacement::along(microscope_daq::core::Axis::Z, 15),
        )],
    );

    let result = ScanOrchestrator::new(&mut stage, &mut sensor).run(&plan).unwrap();

    let z = result.positions()[0].z;
    assert_within(z - 15, -60, 10, "focus before offset");
    assert_eq!(stage.position().unwrap().z, z);
}

#[test]
fn test_cancel_before_run_aborts_at_first_step() {
    let (mut stage, mut sensor) = focus_rig(Position::origin(), 0);
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = ScanOrchestrator::new(&mut stage, &mut sensor)
        .with_cancel_token(cancel)
        .run(&ScanPlan::z_stack(4, 10))
        .unwrap_err();

    match err {
        MicroscopeError::PlanAborted { step, partial, source } => {
            assert_eq!(step, 0);
            assert!(partial.is_empty());
            assert!(matches!(*source, MicroscopeError::Cancelled));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sensor.frames_captured(), 0);
}

#[test]
fn test_cancel_after_two_steps_keeps_two_entries() {
    let (mut stage, sensor) = focus_rig(Position::origin(), 0);
    let cancel = CancelToken::new();
    let mut sensor = CancelAfter::new(sensor, cancel.clone(), 2);

    let err = ScanOrchestrator::new(&mut stage, &mut sensor)
        .with_cancel_token(cancel)
        .run(&ScanPlan::raster(5, 40, 0))
        .unwrap_err();

    match err {
        MicroscopeError::PlanAborted { step, partial, source } => {
            assert_eq!(step, 2);
            assert_eq!(partial.len(), 2);
            assert_eq!(partial.exit_status, ExitStatus::Abort);
            let xs: Vec<i64> = partial.positions().iter().map(|p| p.x).collect();
            assert_eq!(xs, vec![0, 40]);
            assert!(matches!(*source, MicroscopeError::Cancelled));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sensor.captured(), 2);
    assert_eq!(stage.position().unwrap().x, 40);
}

#[test]
fn test_cancel_during_step_autofocus_reports_sweep() {
    let (mut stage, sensor) = focus_rig(Position::origin(), 0);
    let cancel = CancelToken::new();
    let mut sensor = CancelAfter::new(sensor, cancel.clone(), 3);
    let plan = ScanPlan::edge_scan(None, &dz_array(20, 3), AutofocusRequest::with_search(100, 10));

    let err = ScanOrchestrator::new(&mut stage, &mut sensor)
        .with_cancel_token(cancel)
        .run(&plan)
        .unwrap_err();

    assert!(err.is_cancellation());
    match err {
        MicroscopeError::PlanAborted { step, partial, source } => {
            assert_eq!(step, 0);
            assert!(partial.is_empty());
            match *source {
                MicroscopeError::FocusCancelled { partial } => assert_eq!(partial.samples.len(), 3),
                other => panic!("unexpected source: {other}"),
            }
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_stage_slip_is_detected() {
    let stage = SimulatedStage::new().slip_on_move(2, 5);
    let mut sensor = SimulatedSensor::new(16, 16, stage.position_handle());
    let mut stage = stage;

    let err = ScanOrchestrator::new(&mut stage, &mut sensor)
        .run(&ScanPlan::z_stack(4, 10))
        .unwrap_err();

    assert!(err.is_hardware_fault());
    assert_eq!(err.partial_result().map(|p| p.len()), Some(2));
}

#[test]
fn test_summary_serializes_without_pixels() {
    let (mut stage, mut sensor) = focus_rig(Position::new(10, 20, 30), 0);
    let result = ScanOrchestrator::new(&mut stage, &mut sensor)
        .run(&ScanPlan::z_stack(3, 25))
        .unwrap();

    let json = serde_json::to_value(result.summary()).unwrap();
    let entries = json["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(json["plan_name"], "z_stack");
    assert!(json.to_string().len() < 4096);
}
