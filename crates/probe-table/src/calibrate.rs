//! Table calibration state machine.
//!
//! Calibration walks a strict linear order: retract Z to its origin, then
//! per axis an `ncal` (seek origin and zero) followed by an `nrm` (seek
//! maximum and settle), with X/Y retracted out of the way before the Z
//! range measurement. Each step re-polls up to the configured retry budget;
//! the first step that fails moves the machine to `Failed` and no further
//! axis is attempted.

use probe_core::{StationError, StationResult};
use tracing::{error, info};

use crate::codes::LIMIT_SWITCH_ERROR;
use crate::controller::TableWorker;
use crate::events::TableEvent;
use crate::motion::AXIS_OFFSET_UM;
use crate::stage::{Axis, Stage};

/// X park offset (µm) applied before Z calibration so the probe card has
/// clearance while Z seeks its range.
const X_SAFE_OFFSET_UM: i64 = 52_000;

/// Phases of the calibration sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Idle,
    RetractZ,
    CalY,
    CalX,
    RangeX,
    RangeY,
    RetractXy,
    CalZMin,
    RangeZMax,
    Done,
    Failed,
}

impl CalibrationPhase {
    /// Successor in the linear order. `Done` and `Failed` are terminal.
    pub fn next(self) -> CalibrationPhase {
        use CalibrationPhase::*;
        match self {
            Idle => RetractZ,
            RetractZ => CalY,
            CalY => CalX,
            CalX => RangeX,
            RangeX => RangeY,
            RangeY => RetractXy,
            RetractXy => CalZMin,
            CalZMin => RangeZMax,
            RangeZMax => Done,
            Done => Done,
            Failed => Failed,
        }
    }

    /// Coarse progress step out of 7 for operator feedback.
    fn progress(self) -> Option<u32> {
        use CalibrationPhase::*;
        match self {
            RetractZ => Some(0),
            CalY => Some(1),
            CalX => Some(2),
            RangeX => Some(3),
            RangeY => Some(4),
            CalZMin => Some(5),
            RangeZMax => Some(6),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        use CalibrationPhase::*;
        match self {
            RetractZ => "Retracting Z axis...",
            CalY => "Calibrating Y axis...",
            CalX => "Calibrating X axis...",
            RangeX => "Range measuring X axis...",
            RangeY => "Range measuring Y axis...",
            RetractXy => "Retracting X and Y axes...",
            CalZMin => "Calibrating Z axis minimum...",
            RangeZMax => "Range measuring Z axis maximum...",
            _ => "",
        }
    }
}

fn axis_component(pos: (i64, i64, i64), axis: Axis) -> i64 {
    match axis {
        Axis::X => pos.0,
        Axis::Y => pos.1,
        Axis::Z => pos.2,
    }
}

impl<S: Stage> TableWorker<S> {
    /// Run the full calibration sequence on all three axes.
    pub(crate) async fn calibrate(&mut self) -> StationResult<()> {
        let result = self.calibrate_inner().await;
        if result.is_err() {
            self.set_calibration_phase(CalibrationPhase::Failed);
        }
        result
    }

    async fn calibrate_inner(&mut self) -> StationResult<()> {
        self.message("Calibrating...");

        let mut phase = CalibrationPhase::RetractZ;
        while phase != CalibrationPhase::Done {
            self.set_calibration_phase(phase);
            if let Err(err) = self.run_calibration_phase(phase).await {
                error!(?phase, %err, "calibration failed");
                return Err(err);
            }
            phase = phase.next();
        }

        // Lower Z while still at the X park offset, then home.
        self.abort.check()?;
        self.read_caldone().await?;
        self.check_machine_error(&[]).await?;
        self.check_error(&[]).await?;

        self.stage.move_absolute(X_SAFE_OFFSET_UM, 0, 0).await?;
        if !self.poll_until_stopped().await? {
            return Err(self.settle_failure("Z axis park move").await);
        }
        let current = self.read_position().await?;
        if current.2 != 0 {
            return Err(self.settle_failure("Z axis park move").await);
        }

        self.stage.move_absolute(0, 0, 0).await?;
        if !self.poll_until_stopped().await? {
            return Err(self.settle_failure("Homing move").await);
        }
        let current = self.read_position().await?;
        if current != (0, 0, 0) {
            return Err(self.settle_failure("Homing move").await);
        }

        self.read_caldone().await?;
        self.check_machine_error(&[]).await?;
        self.check_error(&[]).await?;

        self.set_calibration_phase(CalibrationPhase::Done);
        self.progress(7, 7);
        self.message("Calibration successful.");
        self.emit(TableEvent::CalibrationFinished);
        Ok(())
    }

    async fn run_calibration_phase(&mut self, phase: CalibrationPhase) -> StationResult<()> {
        self.abort.check()?;
        self.read_caldone().await?;
        self.check_machine_error(&[]).await?;
        self.check_error(&[]).await?;

        if let Some(step) = phase.progress() {
            self.progress(step, 7);
        }
        self.message(phase.label());

        match phase {
            CalibrationPhase::RetractZ | CalibrationPhase::CalZMin => {
                self.ncal_axis(Axis::Z).await
            }
            CalibrationPhase::CalY => self.ncal_axis(Axis::Y).await,
            CalibrationPhase::CalX => self.ncal_axis(Axis::X).await,
            CalibrationPhase::RangeX => self.nrm_axis(Axis::X).await,
            CalibrationPhase::RangeY => self.nrm_axis(Axis::Y).await,
            CalibrationPhase::RangeZMax => self.nrm_axis(Axis::Z).await,
            CalibrationPhase::RetractXy => self.retract_xy().await,
            CalibrationPhase::Idle | CalibrationPhase::Done | CalibrationPhase::Failed => Ok(()),
        }
    }

    /// Seek an axis to its origin and wait for the zero to be confirmed.
    async fn ncal_axis(&mut self, axis: Axis) -> StationResult<()> {
        info!(%axis, "ncal...");
        self.stage.ncal(axis).await?;

        let (settled, _) = self
            .poll_position_until(|pos| axis_component(pos, axis) == 0)
            .await?;
        if !settled {
            return Err(StationError::timeout(
                format!("{axis} axis calibration"),
                self.config.poll_interval * (self.config.retries + 1),
            ));
        }
        info!(%axis, "ncal... done");

        tokio::time::sleep(self.config.poll_interval).await;
        Ok(())
    }

    /// Seek an axis to its maximum; settled once two consecutive polls
    /// report the same coordinate.
    async fn nrm_axis(&mut self, axis: Axis) -> StationResult<()> {
        info!(%axis, "nrm...");
        self.stage.nrm(axis).await?;

        let mut reference = self.read_position().await?;
        tokio::time::sleep(self.config.poll_interval).await;

        let mut settled = false;
        for _ in 0..=self.config.retries {
            self.abort.check()?;
            let current = self.read_position().await?;
            if axis_component(current, axis) == axis_component(reference, axis) {
                settled = true;
                break;
            }
            reference = current;
            tokio::time::sleep(self.config.poll_interval).await;
        }
        if !settled {
            return Err(StationError::timeout(
                format!("{axis} axis range measurement"),
                self.config.poll_interval * (self.config.retries + 1),
            ));
        }
        info!(%axis, "nrm... done");

        tokio::time::sleep(self.config.poll_interval).await;
        Ok(())
    }

    /// Drive X and Y into their limit switches, then park X at a Z-safe
    /// offset. The limit-switch error code is expected here.
    async fn retract_xy(&mut self) -> StationResult<()> {
        self.stage
            .move_relative(-AXIS_OFFSET_UM, -AXIS_OFFSET_UM, 0)
            .await?;
        if !self.poll_until_stopped().await? {
            return Err(self.settle_failure("X/Y axes retract").await);
        }
        let current = self.read_position().await?;
        if (current.0, current.1) != (0, 0) {
            return Err(self.settle_failure("X/Y axes retract").await);
        }
        self.check_error(&[LIMIT_SWITCH_ERROR]).await?;

        self.stage.move_relative(X_SAFE_OFFSET_UM, 0, 0).await?;
        if !self.poll_until_stopped().await? {
            return Err(self.settle_failure("X axis park move").await);
        }
        let current = self.read_position().await?;
        if (current.0, current.1) != (X_SAFE_OFFSET_UM, 0) {
            return Err(self.settle_failure("X axis park move").await);
        }
        Ok(())
    }
}
