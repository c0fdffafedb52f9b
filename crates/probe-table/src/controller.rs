//! Table motion controller: request queue, single worker, event stream.
//!
//! The worker spawned by [`TableController::spawn`] is the only owner of the
//! stage connection. All callers enqueue requests through a [`TableHandle`];
//! requests are served strictly in submission order, at most one in flight.
//! A failed request is fatal to that request only; the worker keeps
//! draining the queue.
//!
//! While the queue is idle the worker periodically broadcasts position,
//! calibration and joystick status so subscribers stay current without
//! polling the device themselves.

use std::sync::Arc;

use parking_lot::Mutex;
use probe_core::{
    from_table_unit, AbortFlag, CalibrationState, Position, StationError, StationResult,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::calibrate::CalibrationPhase;
use crate::codes::{error_message, machine_error_message};
use crate::config::TableConfig;
use crate::events::TableEvent;
use crate::request::{Reply, RequestHandle};
use crate::stage::Stage;

/// Snapshot returned by a status request.
#[derive(Debug, Clone, Copy)]
pub struct TableStatus {
    pub position: Position,
    pub caldone: CalibrationState,
    pub joystick: bool,
}

/// Queued command objects. Owned exclusively by the worker once dequeued.
pub(crate) enum TableRequest {
    Identify {
        reply: Reply<String>,
    },
    Status {
        reply: Reply<TableStatus>,
    },
    RelativeMove {
        delta: Position,
        reply: Reply<()>,
    },
    SafeAbsoluteMove {
        target: Position,
        reply: Reply<()>,
    },
    Calibrate {
        reply: Reply<()>,
    },
    EnableJoystick {
        enabled: bool,
        reply: Reply<()>,
    },
}

#[derive(Debug)]
struct Cached {
    position: Position,
    caldone: CalibrationState,
    calibration_phase: CalibrationPhase,
}

impl Default for Cached {
    fn default() -> Self {
        Self {
            position: Position::unset(),
            caldone: CalibrationState::default(),
            calibration_phase: CalibrationPhase::Idle,
        }
    }
}

/// Cloneable front end of the table worker.
///
/// Enqueue operations never block; each returns a [`RequestHandle`] the
/// caller can wait on with a timeout.
#[derive(Clone)]
pub struct TableHandle {
    tx: mpsc::UnboundedSender<TableRequest>,
    abort: AbortFlag,
    events: broadcast::Sender<TableEvent>,
    cached: Arc<Mutex<Cached>>,
}

impl TableHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<TableEvent> {
        self.events.subscribe()
    }

    /// Abort whichever operation is currently in flight.
    ///
    /// Advisory: the operation observes the flag between poll iterations
    /// and terminates with [`StationError::Stopped`]. A partially issued
    /// device command is not undone.
    pub fn stop_current_action(&self) {
        self.abort.set();
    }

    /// Last position observed by the worker (mm). NaN axes until the first
    /// successful poll.
    pub fn cached_position(&self) -> Position {
        self.cached.lock().position
    }

    /// Last calibration state observed by the worker.
    pub fn cached_caldone(&self) -> CalibrationState {
        self.cached.lock().caldone
    }

    /// Current phase of the calibration state machine.
    pub fn calibration_phase(&self) -> CalibrationPhase {
        self.cached.lock().calibration_phase
    }

    pub fn identify(&self) -> RequestHandle<String> {
        let (reply, handle) = RequestHandle::new("Table identification");
        self.enqueue(TableRequest::Identify { reply }, handle)
    }

    pub fn status(&self) -> RequestHandle<TableStatus> {
        let (reply, handle) = RequestHandle::new("Table status");
        self.enqueue(TableRequest::Status { reply }, handle)
    }

    /// Relative move in millimeters.
    pub fn relative_move(&self, dx: f64, dy: f64, dz: f64) -> RequestHandle<()> {
        let (reply, handle) = RequestHandle::new("Table relative move");
        self.enqueue(
            TableRequest::RelativeMove {
                delta: Position::new(dx, dy, dz),
                reply,
            },
            handle,
        )
    }

    /// Collision-safe absolute move in millimeters (retract Z, move X/Y,
    /// raise Z clamped to the soft limit).
    pub fn safe_absolute_move(&self, x: f64, y: f64, z: f64) -> RequestHandle<()> {
        let (reply, handle) = RequestHandle::new("Table move");
        self.enqueue(
            TableRequest::SafeAbsoluteMove {
                target: Position::new(x, y, z),
                reply,
            },
            handle,
        )
    }

    /// Run the full calibration sequence on all three axes.
    pub fn calibrate(&self) -> RequestHandle<()> {
        let (reply, handle) = RequestHandle::new("Table calibration");
        self.enqueue(TableRequest::Calibrate { reply }, handle)
    }

    pub fn enable_joystick(&self, enabled: bool) -> RequestHandle<()> {
        let (reply, handle) = RequestHandle::new("Table joystick");
        self.enqueue(TableRequest::EnableJoystick { enabled, reply }, handle)
    }

    fn enqueue<T>(&self, request: TableRequest, handle: RequestHandle<T>) -> RequestHandle<T> {
        if let Err(mpsc::error::SendError(request)) = self.tx.send(request) {
            // Worker is gone; fail the request immediately instead of
            // leaving the caller to run into its timeout.
            let message = "table worker is not running";
            warn!(operation = handle.operation(), message);
            match request {
                TableRequest::Identify { reply } => {
                    let _ = reply.send(Err(StationError::Instrument(message.into())));
                }
                TableRequest::Status { reply } => {
                    let _ = reply.send(Err(StationError::Instrument(message.into())));
                }
                TableRequest::RelativeMove { reply, .. }
                | TableRequest::SafeAbsoluteMove { reply, .. }
                | TableRequest::Calibrate { reply }
                | TableRequest::EnableJoystick { reply, .. } => {
                    let _ = reply.send(Err(StationError::Instrument(message.into())));
                }
            }
        }
        handle
    }
}

/// Spawns the table worker task.
pub struct TableController;

impl TableController {
    /// Hand the stage to a dedicated worker task and return the queue
    /// front end plus the worker's join handle.
    pub fn spawn<S: Stage + 'static>(stage: S, config: TableConfig) -> (TableHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let abort = AbortFlag::new();
        let cached = Arc::new(Mutex::new(Cached::default()));

        let worker = TableWorker {
            stage,
            config,
            abort: abort.clone(),
            events: events.clone(),
            cached: cached.clone(),
        };
        let join = tokio::spawn(worker.run(rx));

        (
            TableHandle {
                tx,
                abort,
                events,
                cached,
            },
            join,
        )
    }
}

/// The single owner of the stage connection.
pub(crate) struct TableWorker<S> {
    pub(crate) stage: S,
    pub(crate) config: TableConfig,
    pub(crate) abort: AbortFlag,
    pub(crate) events: broadcast::Sender<TableEvent>,
    cached: Arc<Mutex<Cached>>,
}

impl<S: Stage> TableWorker<S> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TableRequest>) {
        info!("table worker started");
        if let Err(error) = self.stage.configure().await {
            warn!(%error, "stage configuration failed");
        }

        let start = tokio::time::Instant::now() + self.config.update_interval;
        let mut tick = tokio::time::interval_at(start, self.config.update_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    self.serve(request).await;
                }
                _ = tick.tick() => {
                    if let Err(error) = self.publish_status().await {
                        debug!(%error, "idle status poll failed");
                    }
                }
            }
        }
        info!("table worker stopped");
    }

    async fn serve(&mut self, request: TableRequest) {
        match request {
            TableRequest::Identify { reply } => {
                let result = self.stage.identify().await;
                self.finish(result, reply);
            }
            TableRequest::Status { reply } => {
                let result = self.publish_status().await;
                self.finish(result, reply);
            }
            TableRequest::RelativeMove { delta, reply } => {
                self.abort.clear();
                let result = self.relative_move(delta).await;
                self.finish(result, reply);
            }
            TableRequest::SafeAbsoluteMove { target, reply } => {
                self.abort.clear();
                let result = self.safe_absolute_move(target).await;
                self.finish(result, reply);
            }
            TableRequest::Calibrate { reply } => {
                self.abort.clear();
                let result = self.calibrate().await;
                self.finish(result, reply);
            }
            TableRequest::EnableJoystick { enabled, reply } => {
                let result = self.enable_joystick(enabled).await;
                self.finish(result, reply);
            }
        }
    }

    /// Emit terminal events for a finished request and deliver the result.
    fn finish<T>(&self, result: StationResult<T>, reply: Reply<T>) {
        match &result {
            Err(StationError::Stopped) => {
                self.message("Stopped.");
                self.emit(TableEvent::Stopped);
            }
            Err(error) => {
                self.message(error.to_string());
                self.emit(TableEvent::Failed(error.to_string()));
            }
            Ok(_) => {}
        }
        let _ = reply.send(result);
    }

    pub(crate) fn emit(&self, event: TableEvent) {
        // Send errors just mean nobody is subscribed.
        let _ = self.events.send(event);
    }

    pub(crate) fn message(&self, message: impl Into<String>) {
        self.emit(TableEvent::Message(message.into()));
    }

    pub(crate) fn progress(&self, value: u32, maximum: u32) {
        self.emit(TableEvent::Progress { value, maximum });
    }

    /// Read the position, refresh the cache and broadcast it.
    pub(crate) async fn read_position(&mut self) -> StationResult<(i64, i64, i64)> {
        let (x, y, z) = self.stage.position().await?;
        let position = Position::new(from_table_unit(x), from_table_unit(y), from_table_unit(z));
        self.cached.lock().position = position;
        self.emit(TableEvent::PositionChanged(position));
        Ok((x, y, z))
    }

    pub(crate) fn set_calibration_phase(&self, phase: CalibrationPhase) {
        self.cached.lock().calibration_phase = phase;
    }

    /// Read the calibration state, refresh the cache and broadcast it.
    pub(crate) async fn read_caldone(&mut self) -> StationResult<CalibrationState> {
        let (x, y, z) = self.stage.caldone().await?;
        let caldone = CalibrationState::from_raw(x, y, z);
        self.cached.lock().caldone = caldone;
        self.emit(TableEvent::CaldoneChanged(caldone));
        Ok(caldone)
    }

    /// Raise a pending system error, unless its code is listed in `ignore`.
    ///
    /// Reading the register clears it on the device, so an ignored code is
    /// consumed as a side effect.
    pub(crate) async fn check_error(&mut self, ignore: &[i32]) -> StationResult<()> {
        let code = self.stage.error_code().await?;
        if code != 0 && !ignore.contains(&code) {
            return Err(StationError::Table {
                code,
                message: error_message(code).into(),
            });
        }
        Ok(())
    }

    /// Raise a pending machine error, unless its code is listed in `ignore`.
    pub(crate) async fn check_machine_error(&mut self, ignore: &[i32]) -> StationResult<()> {
        let code = self.stage.machine_error_code().await?;
        if code != 0 && !ignore.contains(&code) {
            return Err(StationError::TableMachine {
                code,
                message: machine_error_message(code).into(),
            });
        }
        Ok(())
    }

    /// Motion precondition: all axes calibrated and range-measured.
    pub(crate) async fn check_calibration(&mut self) -> StationResult<()> {
        let caldone = self.read_caldone().await?;
        if !caldone.is_valid() {
            return Err(StationError::TableCalibration);
        }
        Ok(())
    }

    /// Bounded settle loop shared by all motion operations.
    ///
    /// Polls the position until `settled` returns true, re-polling up to the
    /// configured retry budget with one `poll_interval` between polls. The
    /// abort flag is observed between iterations. Returns the last observed
    /// position and whether the predicate was satisfied.
    pub(crate) async fn poll_position_until(
        &mut self,
        settled: impl Fn((i64, i64, i64)) -> bool,
    ) -> StationResult<(bool, (i64, i64, i64))> {
        let mut current = (0, 0, 0);
        for _ in 0..=self.config.retries {
            self.abort.check()?;
            current = self.read_position().await?;
            if settled(current) {
                return Ok((true, current));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        Ok((false, current))
    }

    /// Bounded wait for the stage to report standstill.
    pub(crate) async fn poll_until_stopped(&mut self) -> StationResult<bool> {
        for _ in 0..=self.config.retries {
            tokio::time::sleep(self.config.poll_interval).await;
            if !self.stage.is_moving().await? {
                return Ok(true);
            }
            self.abort.check()?;
            self.read_position().await?;
        }
        Ok(false)
    }

    /// Turn an unsettled motion step into the most specific error
    /// available: a decoded device fault when one is pending, otherwise a
    /// retry-budget timeout.
    pub(crate) async fn settle_failure(&mut self, operation: &str) -> StationError {
        match self.stage.error_code().await {
            Ok(code) if code != 0 => StationError::Table {
                code,
                message: error_message(code).into(),
            },
            _ => StationError::timeout(
                operation,
                self.config.poll_interval * (self.config.retries + 1),
            ),
        }
    }

    /// Broadcast a full status snapshot (used by status requests and the
    /// idle tick).
    pub(crate) async fn publish_status(&mut self) -> StationResult<TableStatus> {
        let (x, y, z) = self.read_position().await?;
        let caldone = self.read_caldone().await?;
        let joystick = self.stage.joystick_enabled().await?;
        self.emit(TableEvent::JoystickChanged(joystick));
        Ok(TableStatus {
            position: Position::new(from_table_unit(x), from_table_unit(y), from_table_unit(z)),
            caldone,
            joystick,
        })
    }
}
