//! End-to-end tests of the table worker against a scripted stage.
//!
//! Time is paused, so the 1 s settle polls and the 180-retry budgets run
//! instantly on virtual time.

use std::time::Duration;

use probe_core::{Position, StationError};
use probe_table::{
    Axis, CalibrationPhase, MockStage, TableConfig, TableController, TableEvent, TableHandle,
};

const WAIT: Duration = Duration::from_secs(600);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn spawn_mock(stage: MockStage) -> (TableHandle, std::sync::Arc<parking_lot::Mutex<probe_table::mock::MockState>>) {
    init_tracing();
    let state = stage.state();
    let (handle, _join) = TableController::spawn(stage, TableConfig::default());
    (handle, state)
}

async fn next_matching(
    rx: &mut tokio::sync::broadcast::Receiver<TableEvent>,
    mut pred: impl FnMut(&TableEvent) -> bool,
) -> TableEvent {
    loop {
        match rx.recv().await {
            Ok(event) if pred(&event) => return event,
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(err) => panic!("event stream closed: {err}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn safe_absolute_move_retracts_z_before_moving_xy() {
    let stage = MockStage::new();
    let state = stage.state();
    state.lock().position = (1_000, 2_000, 3_000);
    state.lock().limit_switch_errors = true;
    let (handle, _join) = TableController::spawn(stage, TableConfig::default());

    handle
        .safe_absolute_move(10.0, 20.0, 0.5)
        .wait(WAIT)
        .await
        .unwrap();

    let commands = state.lock().commands.clone();
    let retract = commands
        .iter()
        .position(|c| c == "rmove 0 0 -2000000000")
        .expect("Z retract issued");
    let xy_move = commands
        .iter()
        .position(|c| c == "move 10000 20000 0")
        .expect("X/Y move issued");
    let z_raise = commands
        .iter()
        .position(|c| c == "rmove 0 0 500")
        .expect("Z raise issued");
    assert!(retract < xy_move, "Z must be retracted before X/Y move");
    assert!(xy_move < z_raise, "Z must be raised last");

    assert_eq!(state.lock().position, (10_000, 20_000, 500));
    // The limit-switch code left behind by the retract was consumed.
    assert_eq!(state.lock().error, 0);
}

#[tokio::test(start_paused = true)]
async fn safe_absolute_move_clamps_z_to_soft_limit() {
    let (handle, state) = spawn_mock(MockStage::new());

    handle
        .safe_absolute_move(1.0, 1.0, 50.0)
        .wait(WAIT)
        .await
        .unwrap();

    // Soft limit defaults to 23.8 mm, well below the requested 50 mm.
    assert_eq!(state.lock().position.2, 23_800);
}

#[tokio::test(start_paused = true)]
async fn moves_require_valid_calibration() {
    let (handle, _state) = spawn_mock(MockStage::uncalibrated());

    let err = handle
        .safe_absolute_move(1.0, 1.0, 1.0)
        .wait(WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, StationError::TableCalibration));
}

#[tokio::test(start_paused = true)]
async fn worker_survives_a_failed_request() {
    let (handle, state) = spawn_mock(MockStage::uncalibrated());

    let err = handle.relative_move(1.0, 0.0, 0.0).wait(WAIT).await;
    assert!(err.is_err());

    state.lock().caldone = (3, 3, 3);
    handle
        .relative_move(1.0, 0.0, 0.0)
        .wait(WAIT)
        .await
        .unwrap();
    assert_eq!(state.lock().position.0, 1_000);
}

#[tokio::test(start_paused = true)]
async fn pending_device_error_fails_the_move() {
    let (handle, state) = spawn_mock(MockStage::new());
    state.lock().error = 1003;

    let err = handle
        .relative_move(1.0, 0.0, 0.0)
        .wait(WAIT)
        .await
        .unwrap_err();
    match err {
        StationError::Table { code, message } => {
            assert_eq!(code, 1003);
            assert_eq!(message, "Valid range of parameter is exceeded.");
        }
        other => panic!("expected table error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn stop_request_aborts_between_poll_iterations() {
    let (handle, state) = spawn_mock(MockStage::new());
    state.lock().moving_ticks = 100_000;

    let mut events = handle.subscribe();
    let pending = handle.relative_move(5.0, 0.0, 0.0);

    // Let the settle loop run at least one full iteration first.
    next_matching(&mut events, |e| matches!(e, TableEvent::PositionChanged(_))).await;
    handle.stop_current_action();

    let err = pending.wait(WAIT).await.unwrap_err();
    assert!(matches!(err, StationError::Stopped));
    next_matching(&mut events, |e| matches!(e, TableEvent::Stopped)).await;
}

#[tokio::test(start_paused = true)]
async fn calibration_runs_all_phases_in_order() {
    let (handle, state) = spawn_mock(MockStage::uncalibrated());

    handle.calibrate().wait(WAIT).await.unwrap();

    let commands = state.lock().commands.clone();
    let axis_steps: Vec<&str> = commands
        .iter()
        .filter(|c| c.starts_with("ncal") || c.starts_with("nrm"))
        .map(String::as_str)
        .collect();
    assert_eq!(
        axis_steps,
        vec!["ncal Z", "ncal Y", "ncal X", "nrm X", "nrm Y", "ncal Z", "nrm Z"]
    );

    assert_eq!(handle.calibration_phase(), CalibrationPhase::Done);
    assert_eq!(state.lock().caldone, (3, 3, 3));
    // The final homing move parks the table at the origin.
    assert_eq!(state.lock().position, (0, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn calibration_failure_stops_before_subsequent_axes() {
    let stage = MockStage::uncalibrated();
    let state = stage.state();
    state.lock().position = (0, 5_000, 0);
    state.lock().stuck_axes = vec![Axis::Y];
    let (handle, _join) = TableController::spawn(stage, TableConfig::default());

    let before = state.lock().position_queries;
    let err = handle.calibrate().wait(WAIT).await.unwrap_err();
    match &err {
        StationError::Timeout { operation, .. } => {
            assert!(operation.contains("Y axis calibration"), "{operation}");
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    // One settled poll for the Z retract, then the full 181-attempt budget
    // (180 retries + 1 initial) on the stuck Y axis.
    let polls = state.lock().position_queries - before;
    assert_eq!(polls, 1 + 181);

    assert_eq!(handle.calibration_phase(), CalibrationPhase::Failed);
    let commands = state.lock().commands.clone();
    assert!(!commands.iter().any(|c| c == "ncal X"));
    assert!(!commands.iter().any(|c| c.starts_with("nrm")));
}

#[tokio::test(start_paused = true)]
async fn enable_joystick_applies_limits_first() {
    let (handle, state) = spawn_mock(MockStage::new());

    handle.enable_joystick(true).wait(WAIT).await.unwrap();

    let commands = state.lock().commands.clone();
    let setlimit = commands
        .iter()
        .position(|c| c.starts_with("setlimit"))
        .expect("limits applied");
    let joystick = commands
        .iter()
        .position(|c| c == "joystick 1")
        .expect("joystick enabled");
    assert!(setlimit < joystick);
    assert!(state.lock().joystick);
}

#[tokio::test(start_paused = true)]
async fn status_refreshes_cached_position() {
    let (handle, state) = spawn_mock(MockStage::new());
    state.lock().position = (12_000, 5_000, 0);

    assert!(!handle.cached_position().is_valid());

    let status = handle.status().wait(WAIT).await.unwrap();
    assert_eq!(status.position, Position::new(12.0, 5.0, 0.0));
    assert!(status.caldone.is_valid());
    assert_eq!(handle.cached_position(), Position::new(12.0, 5.0, 0.0));
}

#[tokio::test(start_paused = true)]
async fn idle_worker_broadcasts_status() {
    let (handle, state) = spawn_mock(MockStage::new());
    state.lock().position = (7_000, 0, 0);

    let mut events = handle.subscribe();
    let event = next_matching(&mut events, |e| matches!(e, TableEvent::PositionChanged(_))).await;
    if let TableEvent::PositionChanged(position) = event {
        assert_eq!(position, Position::new(7.0, 0.0, 0.0));
    }
}
