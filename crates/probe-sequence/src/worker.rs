//! Sequence execution engine.
//!
//! One [`SequenceWorker`] executes one run: safe-initialize the
//! instruments, walk the selected subtree in document order, and finalize
//! the hardware no matter how the walk ended. Per-item failures become item
//! states and the walk continues with siblings; run-level failures surface
//! once through a `Failed` event. The stop flag is observed at loop
//! boundaries only; an in-flight measurement always completes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use probe_core::{
    recovery_step, AbortFlag, LinearRange, Position, RunConfig, StationError, StationResult,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::events::{MeasurementSummary, SequenceEvent};
use crate::export::{safe_filename, write_json, write_txt, MeasurementExport};
use crate::instruments::SourceMeter;
use crate::measurement::{MeasurementContext, MeasurementError, MeasurementRegistry};
use crate::station::Station;
use crate::tree::{ContactItem, ItemState, MeasurementItem, RunNode, SampleItem, SequenceTree};

/// Number of slices the contact dwell delay is broken into so progress can
/// be reported smoothly.
const CONTACT_DELAY_STEPS: u32 = 25;

/// Sample context carried down the tree walk.
struct SampleInfo {
    path: String,
    name: String,
    sample_type: String,
    position_label: String,
    comment: String,
}

impl SampleInfo {
    fn new(sample: &SampleItem) -> Self {
        Self {
            path: sample.id.clone(),
            name: sample.name.clone(),
            sample_type: sample.sample_type.clone(),
            position_label: sample.position_label.clone(),
            comment: sample.comment.clone(),
        }
    }
}

/// Executes one sequence run against a station.
pub struct SequenceWorker {
    station: Station,
    config: RunConfig,
    registry: MeasurementRegistry,
    stop: AbortFlag,
    events: broadcast::Sender<SequenceEvent>,
}

impl SequenceWorker {
    pub fn new(station: Station, config: RunConfig, registry: MeasurementRegistry) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            station,
            config,
            registry,
            stop: AbortFlag::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.events.subscribe()
    }

    /// Request the run to stop at the next loop boundary.
    pub fn abort(&self) {
        self.stop.set();
    }

    /// Shared stop flag, e.g. for wiring a GUI stop button.
    pub fn stop_flag(&self) -> AbortFlag {
        self.stop.clone()
    }

    /// Execute the subtree selected by `node` end to end.
    ///
    /// `finalize` always runs, regardless of where a failure originated;
    /// run-level failures are logged and surfaced through a single
    /// [`SequenceEvent::Failed`].
    pub async fn run(&self, tree: &mut SequenceTree, node: RunNode) {
        self.stop.clear();

        let result = self.execute(tree, node).await;

        self.finalize().await;

        match result {
            Ok(()) => self.message("Sequence done."),
            Err(err) => {
                error!(%err, "sequence run failed");
                self.message("Sequence failed.");
                self.emit(SequenceEvent::Failed(err.to_string()));
            }
        }
        self.emit(SequenceEvent::Finished);
    }

    async fn execute(&self, tree: &mut SequenceTree, node: RunNode) -> StationResult<()> {
        self.initialize().await?;
        self.process(tree, node).await
    }

    // -------------------------------------------------------------------
    // Tree walk
    // -------------------------------------------------------------------

    /// Single entry point: resolve the node and dispatch on its kind.
    async fn process(&self, tree: &mut SequenceTree, node: RunNode) -> StationResult<()> {
        match node {
            RunNode::Sequence => self.process_sequence(tree).await,
            RunNode::Sample(s) => {
                let sample = tree
                    .samples
                    .get_mut(s)
                    .ok_or_else(|| StationError::Config(format!("no sample at index {s}")))?;
                self.process_sample(sample).await?;
                Ok(())
            }
            RunNode::Contact(s, c) => {
                let sample = tree
                    .samples
                    .get_mut(s)
                    .ok_or_else(|| StationError::Config(format!("no sample at index {s}")))?;
                let info = SampleInfo::new(sample);
                let contact = sample
                    .contacts
                    .get_mut(c)
                    .ok_or_else(|| StationError::Config(format!("no contact at index {c}")))?;
                match self.process_contact(&info, contact).await {
                    Ok(_) => Ok(()),
                    Err(err) => {
                        let state = contact_failure_state(&err);
                        self.set_contact_state(&info, contact, state);
                        Err(err)
                    }
                }
            }
            RunNode::Measurement(s, c, m) => {
                let sample = tree
                    .samples
                    .get_mut(s)
                    .ok_or_else(|| StationError::Config(format!("no sample at index {s}")))?;
                let info = SampleInfo::new(sample);
                let contact = sample
                    .contacts
                    .get_mut(c)
                    .ok_or_else(|| StationError::Config(format!("no contact at index {c}")))?;
                let contact_id = contact.id.clone();
                let contact_name = contact.name.clone();
                let item = contact
                    .measurements
                    .get_mut(m)
                    .ok_or_else(|| StationError::Config(format!("no measurement at index {m}")))?;
                self.process_measurement(&info, &contact_id, &contact_name, item)
                    .await;
                Ok(())
            }
        }
    }

    /// Walk enabled samples in document order. A stop request between
    /// samples leaves the remaining ones untouched in `Idle`.
    async fn process_sequence(&self, tree: &mut SequenceTree) -> StationResult<()> {
        self.message("Process samples...");
        for sample in &mut tree.samples {
            if self.stop.is_set() {
                break;
            }
            if !sample.enabled {
                continue;
            }
            self.process_sample(sample).await?;
        }
        if self.stop.is_set() {
            return Ok(());
        }
        self.final_movement().await
    }

    /// Walk one sample's enabled contacts. Per-contact failures become
    /// contact states; siblings keep running.
    async fn process_sample(&self, sample: &mut SampleItem) -> StationResult<ItemState> {
        self.message("Process sample...");
        self.set_sample_state(sample, ItemState::Processing);
        let info = SampleInfo::new(sample);

        let mut failed = false;
        for contact in &mut sample.contacts {
            if self.stop.is_set() {
                break;
            }
            if !contact.enabled {
                continue;
            }
            if !contact.has_position() {
                warn!(contact = %contact.name, "no contact position assigned");
                self.set_contact_state(&info, contact, ItemState::Error);
                failed = true;
                continue;
            }
            match self.process_contact(&info, contact).await {
                Ok(state) => {
                    if state != ItemState::Success {
                        failed = true;
                    }
                }
                Err(err) => {
                    error!(contact = %contact.name, %err, "contact failed");
                    let state = contact_failure_state(&err);
                    self.set_contact_state(&info, contact, state);
                    failed = true;
                    if matches!(err, StationError::Stopped) {
                        break;
                    }
                }
            }
        }

        let state = if self.stop.is_set() {
            ItemState::Stopped
        } else if failed {
            ItemState::Error
        } else {
            ItemState::Success
        };
        self.set_sample_state(sample, state);

        if !self.stop.is_set() {
            self.final_movement().await?;
        }
        Ok(state)
    }

    /// Process one contact: move, dwell, run measurements, and re-contact
    /// with overdrive while measurements keep ending in `Error` or
    /// `AnalysisError`.
    async fn process_contact(
        &self,
        info: &SampleInfo,
        contact: &mut ContactItem,
    ) -> StationResult<ItemState> {
        let retry_contact_count = self.config.retry_contact_count;
        let contact_id = contact.id.clone();
        let contact_name = contact.name.clone();

        let mut pending: Vec<usize> = contact
            .measurements
            .iter()
            .enumerate()
            .filter(|(_, m)| m.enabled)
            .map(|(index, _)| index)
            .collect();

        let mut state = ItemState::Success;
        for attempt in 0..=retry_contact_count {
            if pending.is_empty() {
                break;
            }
            if attempt > 0 {
                info!("Retry contact {attempt}/{retry_contact_count}...");
                contact.recontact_count += 1;
                self.emit(SequenceEvent::RecontactChanged {
                    item: format!("{}/{}", info.path, contact_id),
                    count: contact.recontact_count,
                });
            }
            self.message("Process contact...");
            self.set_contact_state(info, contact, ItemState::Processing);
            info!(contact = %contact_name, "processing contact");

            self.move_to_contact(contact, attempt > 0).await?;

            let mut still_failing = Vec::new();
            for &index in &pending {
                if self.stop.is_set() {
                    break;
                }
                let item = &mut contact.measurements[index];
                let outcome = self
                    .process_measurement(info, &contact_id, &contact_name, item)
                    .await;
                if matches!(outcome, ItemState::Error | ItemState::AnalysisError) {
                    still_failing.push(index);
                }
            }
            pending = still_failing;

            state = if self.stop.is_set() {
                ItemState::Stopped
            } else if pending.is_empty() {
                ItemState::Success
            } else {
                ItemState::Error
            };
            self.set_contact_state(info, contact, state);
            if self.stop.is_set() {
                break;
            }
        }
        Ok(state)
    }

    /// Run one measurement, retrying on `AnalysisError`/`Compliance` up to
    /// the configured re-measure budget, and settle on the last outcome.
    async fn process_measurement(
        &self,
        info: &SampleInfo,
        contact_id: &str,
        contact_name: &str,
        item: &mut MeasurementItem,
    ) -> ItemState {
        let retry_measurement_count = self.config.retry_measurement_count;
        let mut state = ItemState::Error;
        for attempt in 0..=retry_measurement_count {
            if attempt > 0 {
                info!("Retry measurement {attempt}/{retry_measurement_count}...");
                item.remeasure_count += 1;
                self.emit(SequenceEvent::RemeasureChanged {
                    item: format!("{}/{}/{}", info.path, contact_id, item.id),
                    count: item.remeasure_count,
                });
            }
            state = self
                .run_measurement_once(info, contact_id, contact_name, item)
                .await;
            match state {
                ItemState::AnalysisError | ItemState::Compliance
                    if attempt < retry_measurement_count => {}
                _ => break,
            }
        }
        state
    }

    /// One measurement attempt: reset attempt-local data, run the driver,
    /// classify the outcome, record data and export it.
    async fn run_measurement_once(
        &self,
        info: &SampleInfo,
        contact_id: &str,
        contact_name: &str,
        item: &mut MeasurementItem,
    ) -> ItemState {
        self.message("Process measurement...");
        item.clear_attempt();
        self.set_measurement_state(info, contact_id, item, ItemState::Active);

        if !self.config.before_measurement_delay.is_zero() {
            tokio::time::sleep(self.config.before_measurement_delay).await;
        }

        item.timestamp = Some(Utc::now());

        let Some(driver) = self.registry.get(&item.item_type) else {
            error!(measurement_type = %item.item_type, "no driver registered");
            self.message("Process... failed.");
            self.set_measurement_state(info, contact_id, item, ItemState::Error);
            return ItemState::Error;
        };

        let result = driver
            .run(&MeasurementContext {
                station: &self.station,
                parameters: &item.parameters,
                stop: &self.stop,
            })
            .await;

        let state = match &result {
            Ok(_) => {
                self.message("Process... done.");
                ItemState::Success
            }
            Err(MeasurementError::Compliance) => {
                self.message("Process... failed.");
                ItemState::Compliance
            }
            Err(MeasurementError::Analysis(_)) => {
                self.message("Process... analysis failed.");
                ItemState::AnalysisError
            }
            Err(MeasurementError::Station(StationError::Stopped)) => {
                self.message("Process... stopped.");
                ItemState::Stopped
            }
            Err(MeasurementError::Station(StationError::Timeout { .. })) => {
                self.message("Process... failed.");
                ItemState::Timeout
            }
            Err(_) => {
                self.message("Process... failed.");
                ItemState::Error
            }
        };
        if let Err(err) = &result {
            error!(measurement = %item.name, %err, "measurement failed");
        }

        if let Ok(data) = result {
            item.readings = data.series;
            item.analysis = data.analysis;
        }

        self.set_measurement_state(info, contact_id, item, state);
        self.emit(SequenceEvent::MeasurementFinished(MeasurementSummary {
            timestamp: item.timestamp,
            sample_name: info.name.clone(),
            sample_type: info.sample_type.clone(),
            contact_name: contact_name.to_string(),
            measurement_name: item.name.clone(),
            measurement_state: state,
        }));

        // Export failures must not change the measurement outcome.
        if let Err(err) = self.export_measurement(info, contact_id, contact_name, item) {
            error!(%err, "measurement export failed");
        }

        state
    }

    // -------------------------------------------------------------------
    // Table coordination
    // -------------------------------------------------------------------

    /// Move to the contact's position, with extra Z overdrive on
    /// re-contact attempts, then apply the dwell delay.
    async fn move_to_contact(&self, contact: &ContactItem, overdrive: bool) -> StationResult<()> {
        if !(self.config.move_to_contact && contact.has_position()) {
            return Ok(());
        }
        let mut position = contact.position;
        if overdrive {
            let extra = self.config.retry_contact_overdrive.abs();
            info!(overdrive_mm = extra, "applying re-contact overdrive");
            position.z += extra;
        }
        self.safe_move_table(position).await?;
        self.apply_contact_delay().await;
        Ok(())
    }

    /// Queue a safe absolute move and block on it with the configured
    /// timeout; an elapsed wait surfaces as a typed timeout error.
    async fn safe_move_table(&self, position: Position) -> StationResult<()> {
        info!(%position, "safe move table");
        self.message("Moving table...");
        self.station
            .table
            .safe_absolute_move(position.x, position.y, position.z)
            .wait(self.config.table_move_timeout)
            .await?;
        self.message("Moving table... done.");
        Ok(())
    }

    /// Dwell after contact, in 25 slices so progress reads smoothly.
    async fn apply_contact_delay(&self) {
        let delay = self.config.table_contact_delay;
        if delay.is_zero() {
            return;
        }
        info!(delay_s = delay.as_secs_f64(), "applying contact delay");
        self.message(format!(
            "Applying contact delay of {:.1} s...",
            delay.as_secs_f64()
        ));
        let slice = delay / CONTACT_DELAY_STEPS;
        for step in 0..CONTACT_DELAY_STEPS {
            self.progress(step + 1, CONTACT_DELAY_STEPS);
            tokio::time::sleep(slice).await;
        }
    }

    /// Park the table once a sequence or sample walk has completed.
    async fn final_movement(&self) -> StationResult<()> {
        if let Some(position) = self.config.move_to_after_position {
            self.safe_move_table(position).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Instrument initialization / finalization
    // -------------------------------------------------------------------

    async fn initialize(&self) -> StationResult<()> {
        self.message("Initialize...");
        match self.safe_initialize().await {
            Ok(()) => {
                self.message("Initialize... done.");
                Ok(())
            }
            Err(err) => {
                self.message("Initialize... failed.");
                Err(err)
            }
        }
    }

    /// Bring every instrument to a safe idle state before the walk.
    ///
    /// Failure policy follows hardware criticality: HV source and matrix
    /// failures abort the run; test LED, V source and discharge failures
    /// are logged and tolerated.
    async fn safe_initialize(&self) -> StationResult<()> {
        if self.config.use_environ {
            if let Some(environment) = &self.station.environment {
                if let Err(err) = environment.set_test_led(true).await {
                    error!(%err, "unable to switch test LED on");
                }
            }
        }
        if let Some(hvsrc) = &self.station.hvsrc {
            self.safe_recover_source("HV Source", hvsrc.as_ref())
                .await
                .map_err(|err| {
                    error!(%err, "unable to recover HV Source");
                    StationError::Instrument("failed to recover HV Source".into())
                })?;
        }
        if let Some(vsrc) = &self.station.vsrc {
            if let Err(err) = self.safe_recover_source("V Source", vsrc.as_ref()).await {
                error!(%err, "unable to recover V Source");
            }
        }
        if self.config.use_environ {
            if let Err(err) = self.discharge_decoupling().await {
                error!(%err, "unable to discharge decoupling box");
            }
        }
        if self.station.matrix.is_some() {
            self.safe_recover_matrix().await.map_err(|err| {
                error!(%err, "unable to recover Matrix");
                StationError::Instrument("failed to recover Matrix".into())
            })?;
        }
        Ok(())
    }

    /// Mirror of initialization, best-effort: leave the hardware idle no
    /// matter how the run ended, log failures without masking the result.
    async fn finalize(&self) {
        self.message("Finalize...");
        if let Some(hvsrc) = &self.station.hvsrc {
            if let Err(err) = self.safe_recover_source("HV Source", hvsrc.as_ref()).await {
                error!(%err, "unable to recover HV Source");
            }
        }
        if let Some(vsrc) = &self.station.vsrc {
            if let Err(err) = self.safe_recover_source("V Source", vsrc.as_ref()).await {
                error!(%err, "unable to recover V Source");
            }
        }
        if self.station.matrix.is_some() {
            if let Err(err) = self.safe_recover_matrix().await {
                error!(%err, "unable to recover Matrix");
            }
        }
        if self.config.use_environ {
            if let Some(environment) = &self.station.environment {
                if let Err(err) = environment.set_test_led(false).await {
                    error!(%err, "unable to switch test LED off");
                }
            }
        }
        self.stop.clear();
        self.message("Finalize... done.");
    }

    /// If the source output is live, ramp its voltage to zero in bounded
    /// steps before disabling the output.
    async fn safe_recover_source(
        &self,
        label: &str,
        source: &dyn SourceMeter,
    ) -> StationResult<()> {
        if source.output_enabled().await? {
            self.message(format!("Ramping down {label}..."));
            let voltage = source.source_voltage().await?;
            for setpoint in LinearRange::new(voltage, 0.0, recovery_step(voltage)) {
                source.set_source_voltage(setpoint).await?;
            }
            self.message(format!("Disable output {label}..."));
            source.set_output_enabled(false).await?;
        }
        self.message(format!("Initialized {label}."));
        Ok(())
    }

    async fn discharge_decoupling(&self) -> StationResult<()> {
        if let Some(environment) = &self.station.environment {
            self.message("Auto-discharging decoupling box...");
            environment.discharge_decoupling().await?;
            self.message("Auto-discharged decoupling box.");
        }
        Ok(())
    }

    /// Open all matrix channels and verify none stayed closed.
    async fn safe_recover_matrix(&self) -> StationResult<()> {
        let Some(matrix) = &self.station.matrix else {
            return Ok(());
        };
        self.message("Open all matrix channels...");
        matrix.open_all_channels().await?;
        let channels = matrix.closed_channels().await?;
        info!(?channels, "matrix channels");
        if !channels.is_empty() {
            return Err(StationError::Instrument(format!(
                "unable to open matrix channels: {channels:?}"
            )));
        }
        self.message("Opened all matrix channels.");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Export
    // -------------------------------------------------------------------

    fn export_measurement(
        &self,
        info: &SampleInfo,
        contact_id: &str,
        contact_name: &str,
        item: &MeasurementItem,
    ) -> StationResult<()> {
        if !(self.config.serialize_json || self.config.serialize_txt) {
            return Ok(());
        }

        let mut meta = BTreeMap::new();
        meta.insert(
            "uuid".to_string(),
            serde_json::json!(uuid::Uuid::new_v4().to_string()),
        );
        meta.insert("sample_name".to_string(), serde_json::json!(info.name));
        meta.insert(
            "sample_type".to_string(),
            serde_json::json!(info.sample_type),
        );
        meta.insert(
            "sample_position".to_string(),
            serde_json::json!(info.position_label),
        );
        meta.insert(
            "sample_comment".to_string(),
            serde_json::json!(info.comment),
        );
        meta.insert("contact_name".to_string(), serde_json::json!(contact_name));
        meta.insert("measurement_name".to_string(), serde_json::json!(item.name));
        meta.insert(
            "measurement_type".to_string(),
            serde_json::json!(item.item_type),
        );
        meta.insert(
            "start_timestamp".to_string(),
            serde_json::json!(item
                .timestamp
                .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())),
        );
        meta.insert(
            "operator".to_string(),
            serde_json::json!(self.config.operator),
        );
        let table_position = self.station.table.cached_position();
        if table_position.is_valid() {
            meta.insert(
                "table_position".to_string(),
                serde_json::json!([table_position.x, table_position.y, table_position.z]),
            );
        }

        let export = MeasurementExport {
            meta,
            series: item.readings.clone(),
            analysis: item.analysis.clone(),
        };

        let basename = self.export_basename(info, contact_id, item);
        let directory: PathBuf = self
            .config
            .output_dir
            .join(safe_filename(&info.name));
        if self.config.serialize_json {
            write_json(&directory.join(format!("{basename}.json")), &export)?;
        }
        if self.config.serialize_txt {
            write_txt(&directory.join(format!("{basename}.txt")), &export)?;
        }
        Ok(())
    }

    fn export_basename(
        &self,
        info: &SampleInfo,
        contact_id: &str,
        item: &MeasurementItem,
    ) -> String {
        let timestamp = item
            .timestamp
            .map(|t| t.format("%Y-%m-%dT%H-%M-%S").to_string())
            .unwrap_or_default();
        safe_filename(&format!(
            "{}_{}_{}_{}_{}",
            info.name.trim(),
            info.sample_type.trim(),
            contact_id,
            item.id,
            timestamp
        ))
    }

    // -------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------

    fn emit(&self, event: SequenceEvent) {
        // Send errors just mean nobody is subscribed.
        let _ = self.events.send(event);
    }

    fn message(&self, message: impl Into<String>) {
        self.emit(SequenceEvent::Message(message.into()));
    }

    fn progress(&self, value: u32, maximum: u32) {
        self.emit(SequenceEvent::Progress { value, maximum });
    }

    fn set_sample_state(&self, sample: &mut SampleItem, state: ItemState) {
        sample.state = state;
        self.emit(SequenceEvent::ItemState {
            item: sample.id.clone(),
            state,
        });
    }

    fn set_contact_state(&self, info: &SampleInfo, contact: &mut ContactItem, state: ItemState) {
        contact.state = state;
        self.emit(SequenceEvent::ItemState {
            item: format!("{}/{}", info.path, contact.id),
            state,
        });
    }

    fn set_measurement_state(
        &self,
        info: &SampleInfo,
        contact_id: &str,
        item: &mut MeasurementItem,
        state: ItemState,
    ) {
        item.state = state;
        self.emit(SequenceEvent::ItemState {
            item: format!("{}/{}/{}", info.path, contact_id, item.id),
            state,
        });
    }
}

/// Map a contact-level failure to the recorded item state.
fn contact_failure_state(err: &StationError) -> ItemState {
    match err {
        StationError::Timeout { .. } => ItemState::Timeout,
        StationError::Stopped => ItemState::Stopped,
        _ => ItemState::Error,
    }
}
