//! End-to-end engine tests against mock instruments and a mock stage.
//!
//! Time is paused, so contact delays, settle polls and move timeouts all
//! run on virtual time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use probe_core::{AbortFlag, Position, RunConfig, StationResult};
use probe_sequence::{
    Electrometer, ItemState, IvRamp, MeasurementContext, MeasurementData, MeasurementDriver,
    MeasurementError, MeasurementRegistry, RunNode, SequenceEvent, SequenceTree, SequenceWorker,
    SourceMeter, Station, SwitchingMatrix,
};
use probe_sequence::{ContactItem, MeasurementItem, SampleItem};
use probe_table::{MockStage, TableConfig, TableController};

// ---------------------------------------------------------------------
// Instrument mocks
// ---------------------------------------------------------------------

#[derive(Debug)]
struct SourceState {
    output: bool,
    voltage: f64,
    compliance: bool,
    log: Vec<String>,
}

struct MockSource {
    state: Arc<Mutex<SourceState>>,
}

impl MockSource {
    fn new(output: bool, voltage: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState {
                output,
                voltage,
                compliance: false,
                log: Vec::new(),
            })),
        }
    }

    fn state(&self) -> Arc<Mutex<SourceState>> {
        self.state.clone()
    }
}

#[async_trait]
impl SourceMeter for MockSource {
    async fn output_enabled(&self) -> StationResult<bool> {
        Ok(self.state.lock().output)
    }

    async fn set_output_enabled(&self, enabled: bool) -> StationResult<()> {
        let mut state = self.state.lock();
        state.output = enabled;
        state
            .log
            .push(format!("output {}", if enabled { "on" } else { "off" }));
        Ok(())
    }

    async fn source_voltage(&self) -> StationResult<f64> {
        Ok(self.state.lock().voltage)
    }

    async fn set_source_voltage(&self, voltage: f64) -> StationResult<()> {
        let mut state = self.state.lock();
        state.voltage = voltage;
        state.log.push(format!("set {voltage}"));
        Ok(())
    }

    async fn compliance_tripped(&self) -> StationResult<bool> {
        Ok(self.state.lock().compliance)
    }
}

struct MockMatrix {
    stubborn: bool,
    closed: Mutex<Vec<String>>,
    opens: AtomicU32,
}

impl MockMatrix {
    fn new(closed: Vec<String>, stubborn: bool) -> Self {
        Self {
            stubborn,
            closed: Mutex::new(closed),
            opens: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl SwitchingMatrix for MockMatrix {
    async fn open_all_channels(&self) -> StationResult<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.stubborn {
            self.closed.lock().clear();
        }
        Ok(())
    }

    async fn closed_channels(&self) -> StationResult<Vec<String>> {
        Ok(self.closed.lock().clone())
    }
}

struct MockElectrometer {
    current: f64,
}

#[async_trait]
impl Electrometer for MockElectrometer {
    async fn read_current(&self) -> StationResult<f64> {
        Ok(self.current)
    }
}

// ---------------------------------------------------------------------
// Scripted measurement driver
// ---------------------------------------------------------------------

enum Behavior {
    Succeed,
    FailAnalysis,
    /// Fail analysis for the first N runs, then succeed.
    FailAnalysisTimes(u32),
}

struct ScriptedDriver {
    behavior: Behavior,
    runs: AtomicU32,
    /// When set, request a sequence stop at the end of the first run.
    stop_on_first_run: Mutex<Option<AbortFlag>>,
}

impl ScriptedDriver {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            runs: AtomicU32::new(0),
            stop_on_first_run: Mutex::new(None),
        })
    }

    fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MeasurementDriver for ScriptedDriver {
    fn measurement_type(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, _ctx: &MeasurementContext<'_>) -> Result<MeasurementData, MeasurementError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if run == 1 {
            if let Some(flag) = self.stop_on_first_run.lock().as_ref() {
                flag.set();
            }
        }
        let fail = match self.behavior {
            Behavior::Succeed => false,
            Behavior::FailAnalysis => true,
            Behavior::FailAnalysisTimes(n) => run <= n,
        };
        if fail {
            Err(MeasurementError::Analysis("no valid fit".into()))
        } else {
            let mut data = MeasurementData::default();
            data.append_reading("iv", 1.0, 1e-9);
            Ok(data)
        }
    }
}

// ---------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------

fn two_contact_tree() -> SequenceTree {
    let mut tree = SequenceTree::new("wafer-17");
    let mut sample = SampleItem::new("s1", "HPK VPX-17");
    sample.sample_type = "PQC".into();
    for (index, z) in [(1, 1.0), (2, 1.5)] {
        let mut contact = ContactItem::new(format!("c{index}"), format!("Flute {index}"));
        contact.position = Position::new(10.0 * index as f64, 20.0, z);
        contact
            .measurements
            .push(MeasurementItem::new(format!("m{index}"), "IV", "scripted"));
        sample.contacts.push(contact);
    }
    tree.samples.push(sample);
    tree
}

fn test_config() -> RunConfig {
    RunConfig {
        serialize_json: false,
        ..RunConfig::default()
    }
}

fn spawn_table() -> (probe_table::TableHandle, Arc<Mutex<probe_table::mock::MockState>>) {
    let stage = MockStage::new();
    let state = stage.state();
    let (handle, _join) = TableController::spawn(stage, TableConfig::default());
    (handle, state)
}

fn absolute_moves(state: &Arc<Mutex<probe_table::mock::MockState>>) -> Vec<String> {
    state
        .lock()
        .commands
        .iter()
        .filter(|c| c.starts_with("move "))
        .cloned()
        .collect()
}

fn z_raises(state: &Arc<Mutex<probe_table::mock::MockState>>) -> Vec<String> {
    state
        .lock()
        .commands
        .iter()
        .filter(|c| c.starts_with("rmove 0 0 ") && !c.ends_with("-2000000000"))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn initialize_ramps_live_source_to_zero_before_output_off() {
    let (table, _stage) = spawn_table();
    let hvsrc = MockSource::new(true, 100.0);
    let source_state = hvsrc.state();
    let station = Station::new(table).with_hvsrc(Arc::new(hvsrc));

    let worker = SequenceWorker::new(station, test_config(), MeasurementRegistry::new());
    let mut tree = SequenceTree::new("empty");
    worker.run(&mut tree, RunNode::Sequence).await;

    let log = source_state.lock().log.clone();
    let setpoints: Vec<f64> = log
        .iter()
        .filter_map(|entry| entry.strip_prefix("set "))
        .map(|v| v.parse().unwrap())
        .collect();

    assert_eq!(setpoints.first().copied(), Some(100.0));
    assert_eq!(setpoints.last().copied(), Some(0.0));
    for pair in setpoints.windows(2) {
        assert!(pair[0] > pair[1], "ramp must be strictly decreasing");
        assert!(pair[0] - pair[1] <= 25.0 + 1e-9, "ramp step must be bounded");
    }

    // Output is disabled only after the ramp has reached zero.
    let last_set = log.iter().rposition(|e| e.starts_with("set ")).unwrap();
    let output_off = log.iter().position(|e| e == "output off").unwrap();
    assert!(output_off > last_set);
    assert!(!source_state.lock().output);
}

#[tokio::test(start_paused = true)]
async fn sample_walk_moves_measures_and_succeeds() {
    let (table, stage) = spawn_table();
    let station = Station::new(table);
    let driver = ScriptedDriver::new(Behavior::Succeed);
    let mut registry = MeasurementRegistry::new();
    registry.register(driver.clone());

    let worker = SequenceWorker::new(station, test_config(), registry);
    let mut tree = two_contact_tree();
    worker.run(&mut tree, RunNode::Sample(0)).await;

    assert_eq!(absolute_moves(&stage).len(), 2);
    assert_eq!(driver.runs(), 2);

    let sample = &tree.samples[0];
    assert_eq!(sample.state, ItemState::Success);
    for contact in &sample.contacts {
        assert_eq!(contact.state, ItemState::Success);
        assert_eq!(contact.measurements[0].state, ItemState::Success);
        assert!(!contact.measurements[0].readings["iv"].is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn failing_measurement_triggers_recontact_with_overdrive() {
    let (table, stage) = spawn_table();
    let station = Station::new(table);
    let driver = ScriptedDriver::new(Behavior::FailAnalysis);
    let mut registry = MeasurementRegistry::new();
    registry.register(driver.clone());

    let config = RunConfig {
        retry_contact_count: 2,
        retry_contact_overdrive: 0.005,
        ..test_config()
    };

    let mut tree = two_contact_tree();
    tree.samples[0].contacts.truncate(1);
    let worker = SequenceWorker::new(station, config, registry);
    worker.run(&mut tree, RunNode::Sample(0)).await;

    // Initial contact plus two retries, each one pressing 5 µm harder.
    assert_eq!(absolute_moves(&stage).len(), 3);
    assert_eq!(
        z_raises(&stage),
        vec!["rmove 0 0 1000", "rmove 0 0 1005", "rmove 0 0 1005"]
    );
    assert_eq!(driver.runs(), 3);

    let contact = &tree.samples[0].contacts[0];
    assert_eq!(contact.recontact_count, 2);
    assert_eq!(contact.state, ItemState::Error);
    assert_eq!(contact.measurements[0].state, ItemState::AnalysisError);
}

#[tokio::test(start_paused = true)]
async fn analysis_failure_is_remeasured_before_recontact() {
    let (table, stage) = spawn_table();
    let station = Station::new(table);
    let driver = ScriptedDriver::new(Behavior::FailAnalysisTimes(1));
    let mut registry = MeasurementRegistry::new();
    registry.register(driver.clone());

    let config = RunConfig {
        retry_measurement_count: 1,
        ..test_config()
    };

    let mut tree = two_contact_tree();
    tree.samples[0].contacts.truncate(1);
    let worker = SequenceWorker::new(station, config, registry);
    worker.run(&mut tree, RunNode::Sample(0)).await;

    // The re-measure succeeds in place; no second contact move happens.
    assert_eq!(absolute_moves(&stage).len(), 1);
    assert_eq!(driver.runs(), 2);

    let contact = &tree.samples[0].contacts[0];
    assert_eq!(contact.recontact_count, 0);
    assert_eq!(contact.state, ItemState::Success);
    assert_eq!(contact.measurements[0].state, ItemState::Success);
    assert_eq!(contact.measurements[0].remeasure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn stop_between_contacts_leaves_remaining_idle() {
    let (table, stage) = spawn_table();
    let station = Station::new(table);
    let driver = ScriptedDriver::new(Behavior::Succeed);
    let mut registry = MeasurementRegistry::new();
    registry.register(driver.clone());

    let worker = SequenceWorker::new(station, test_config(), registry);
    *driver.stop_on_first_run.lock() = Some(worker.stop_flag());

    let mut tree = two_contact_tree();
    worker.run(&mut tree, RunNode::Sample(0)).await;

    // The in-progress contact completed normally: its measurement ran to
    // the end with a Success outcome, and the contact records where the
    // stop landed...
    let sample = &tree.samples[0];
    assert_eq!(sample.contacts[0].state, ItemState::Stopped);
    assert_eq!(sample.contacts[0].measurements[0].state, ItemState::Success);
    // ...the remaining one was never visited.
    assert_eq!(sample.contacts[1].state, ItemState::Idle);
    assert_eq!(sample.contacts[1].measurements[0].state, ItemState::Idle);
    assert_eq!(sample.state, ItemState::Stopped);

    assert_eq!(absolute_moves(&stage).len(), 1);
    assert_eq!(driver.runs(), 1);
}

#[tokio::test(start_paused = true)]
async fn move_timeout_marks_contact_and_continues_with_siblings() {
    let (table, stage) = spawn_table();
    // The stage never reaches its Z retract target, so every safe move
    // exceeds the caller's 120 s budget.
    stage.lock().position = (0, 0, 500);
    stage.lock().frozen = true;

    let station = Station::new(table);
    let driver = ScriptedDriver::new(Behavior::Succeed);
    let mut registry = MeasurementRegistry::new();
    registry.register(driver.clone());

    let worker = SequenceWorker::new(station, test_config(), registry);
    let mut tree = two_contact_tree();
    worker.run(&mut tree, RunNode::Sample(0)).await;

    let sample = &tree.samples[0];
    assert_eq!(sample.contacts[0].state, ItemState::Timeout);
    assert_eq!(sample.contacts[1].state, ItemState::Timeout);
    assert_eq!(sample.state, ItemState::Error);
    assert_eq!(driver.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn contact_without_position_is_marked_error_and_skipped() {
    let (table, stage) = spawn_table();
    let station = Station::new(table);
    let driver = ScriptedDriver::new(Behavior::Succeed);
    let mut registry = MeasurementRegistry::new();
    registry.register(driver.clone());

    let mut tree = two_contact_tree();
    tree.samples[0].contacts[0].position = Position::unset();

    let worker = SequenceWorker::new(station, test_config(), registry);
    worker.run(&mut tree, RunNode::Sample(0)).await;

    let sample = &tree.samples[0];
    assert_eq!(sample.contacts[0].state, ItemState::Error);
    assert_eq!(sample.contacts[1].state, ItemState::Success);
    assert_eq!(sample.state, ItemState::Error);
    assert_eq!(absolute_moves(&stage).len(), 1);
    assert_eq!(driver.runs(), 1);
}

#[tokio::test(start_paused = true)]
async fn matrix_verification_failure_fails_the_run_but_finalize_still_runs() {
    let (table, _stage) = spawn_table();
    let matrix = Arc::new(MockMatrix::new(vec!["1A01".into()], true));
    let station = Station::new(table).with_matrix(matrix.clone());
    let driver = ScriptedDriver::new(Behavior::Succeed);
    let mut registry = MeasurementRegistry::new();
    registry.register(driver.clone());

    let worker = SequenceWorker::new(station, test_config(), registry);
    let mut events = worker.subscribe();
    let mut tree = two_contact_tree();
    worker.run(&mut tree, RunNode::Sample(0)).await;

    // Initialization failed before any item was processed.
    assert_eq!(tree.samples[0].state, ItemState::Idle);
    assert_eq!(driver.runs(), 0);
    // The matrix was still recovered (best effort) during finalize.
    assert_eq!(matrix.opens.load(Ordering::SeqCst), 2);

    let mut saw_failed = false;
    let mut saw_finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SequenceEvent::Failed(message) => {
                saw_failed = true;
                assert!(message.contains("Matrix"));
            }
            SequenceEvent::Finished => saw_finished = true,
            _ => {}
        }
    }
    assert!(saw_failed);
    assert!(saw_finished);
}

#[tokio::test(start_paused = true)]
async fn successful_measurement_is_exported_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let (table, _stage) = spawn_table();
    let station = Station::new(table);
    let driver = ScriptedDriver::new(Behavior::Succeed);
    let mut registry = MeasurementRegistry::new();
    registry.register(driver);

    let config = RunConfig {
        serialize_json: true,
        output_dir: dir.path().to_path_buf(),
        operator: "Monty".into(),
        ..RunConfig::default()
    };

    let mut tree = two_contact_tree();
    tree.samples[0].contacts.truncate(1);
    let worker = SequenceWorker::new(station, config, registry);
    worker.run(&mut tree, RunNode::Sample(0)).await;

    let sample_dir = dir.path().join("HPK_VPX-17");
    let entries: Vec<_> = std::fs::read_dir(&sample_dir).unwrap().collect();
    assert_eq!(entries.len(), 1);
    let path = entries[0].as_ref().unwrap().path();
    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(value["meta"]["operator"], "Monty");
    assert_eq!(value["meta"]["sample_name"], "HPK VPX-17");
    assert_eq!(value["series"]["iv"][0][0], 1.0);
}

#[tokio::test(start_paused = true)]
async fn iv_ramp_records_one_reading_per_step() {
    let (table, _stage) = spawn_table();
    let vsrc = MockSource::new(false, 0.0);
    let source_state = vsrc.state();
    let station = Station::new(table)
        .with_vsrc(Arc::new(vsrc))
        .with_electrometer(Arc::new(MockElectrometer { current: 1e-9 }));

    let mut item = MeasurementItem::new("m1", "IV", "iv_ramp");
    item.parameters
        .insert("voltage_stop".into(), serde_json::json!(-10.0));
    item.parameters
        .insert("voltage_step".into(), serde_json::json!(2.0));

    let stop = AbortFlag::new();
    let ctx = MeasurementContext {
        station: &station,
        parameters: &item.parameters,
        stop: &stop,
    };
    let data = IvRamp.run(&ctx).await.unwrap();

    // 0, -2, -4, -6, -8, -10: one reading per setpoint.
    assert_eq!(data.series["iv"].len(), 6);
    assert_eq!(data.series["iv"].last().unwrap().0, -10.0);
    assert_eq!(data.analysis["i_spot"], serde_json::json!(1e-9));

    // The source ends ramped back to zero with its output disabled.
    let state = source_state.lock();
    assert_eq!(state.voltage, 0.0);
    assert!(!state.output);
}

#[tokio::test(start_paused = true)]
async fn iv_ramp_stops_on_compliance() {
    let (table, _stage) = spawn_table();
    let vsrc = MockSource::new(false, 0.0);
    let source_state = vsrc.state();
    source_state.lock().compliance = true;
    let station = Station::new(table)
        .with_vsrc(Arc::new(vsrc))
        .with_electrometer(Arc::new(MockElectrometer { current: 1e-9 }));

    let mut item = MeasurementItem::new("m1", "IV", "iv_ramp");
    item.parameters
        .insert("voltage_stop".into(), serde_json::json!(-10.0));

    let stop = AbortFlag::new();
    let ctx = MeasurementContext {
        station: &station,
        parameters: &item.parameters,
        stop: &stop,
    };
    let err = IvRamp.run(&ctx).await.unwrap_err();
    assert!(matches!(err, MeasurementError::Compliance));
    assert!(!source_state.lock().output);
}
