//! Motion operations executed by the table worker.
//!
//! Every operation follows the same discipline: verify pending device
//! errors and the calibration precondition, issue the command, then settle
//! through the shared bounded poll loop. Positions cross the mm/µm boundary
//! exactly here.

use probe_core::{to_table_unit, Position, StationResult};
use tracing::info;

use crate::codes::LIMIT_SWITCH_ERROR;
use crate::controller::TableWorker;
use crate::events::TableEvent;
use crate::stage::{AxisLimits, Stage};

/// Relative offset large enough to drive any axis into its limit switch,
/// used to fully retract an axis regardless of current position.
pub(crate) const AXIS_OFFSET_UM: i64 = 2_000_000_000;

impl<S: Stage> TableWorker<S> {
    /// Plain relative move with settle polling.
    pub(crate) async fn relative_move(&mut self, delta: Position) -> StationResult<()> {
        self.message(format!(
            "Moving table relative by x={:.3}, y={:.3}, z={:.3} mm",
            delta.x, delta.y, delta.z
        ));

        self.check_machine_error(&[]).await?;
        self.check_error(&[]).await?;
        self.check_calibration().await?;

        self.stage
            .move_relative(
                to_table_unit(delta.x),
                to_table_unit(delta.y),
                to_table_unit(delta.z),
            )
            .await?;

        if !self.poll_until_stopped().await? {
            return Err(self.settle_failure("Table relative move").await);
        }

        self.check_machine_error(&[]).await?;
        self.check_error(&[]).await?;

        self.read_position().await?;
        self.emit(TableEvent::RelativeMoveFinished);
        self.message("Ready");
        Ok(())
    }

    /// Collision-safe absolute move.
    ///
    /// Phases, each settle-polled and abortable:
    /// 1. fully retract Z (the limit-switch code is expected here),
    /// 2. move X/Y at zero Z,
    /// 3. raise Z to the target, clamped to the soft limit,
    /// 4. re-confirm calibration and final position.
    pub(crate) async fn safe_absolute_move(&mut self, target: Position) -> StationResult<()> {
        self.message("Moving...");

        self.check_machine_error(&[]).await?;
        self.check_error(&[]).await?;
        self.check_calibration().await?;

        let x = to_table_unit(target.x);
        let y = to_table_unit(target.y);
        let z = to_table_unit(target.z.min(self.config.z_limit));

        self.abort.check()?;

        self.progress(1, 4);
        self.message("Retracting Z axis...");
        self.stage.move_relative(0, 0, -AXIS_OFFSET_UM).await?;
        let (settled, current) = self.poll_position_until(|pos| pos.2 == 0).await?;
        if !settled {
            info!(?current, "Z retract did not settle");
            return Err(self.settle_failure("Z axis retract").await);
        }
        // Driving into the limit switch left its expected error behind.
        self.check_error(&[LIMIT_SWITCH_ERROR]).await?;

        self.abort.check()?;
        self.read_caldone().await?;
        self.check_machine_error(&[]).await?;
        self.check_error(&[]).await?;

        self.progress(2, 4);
        self.message("Moving X and Y axes...");
        self.stage.move_absolute(x, y, 0).await?;
        let (settled, current) = self
            .poll_position_until(|pos| (pos.0, pos.1) == (x, y))
            .await?;
        if !settled {
            info!(?current, x, y, "X/Y move did not settle");
            return Err(self.settle_failure("X/Y axes move").await);
        }

        self.progress(3, 4);
        self.message("Raising Z axis...");
        self.stage.move_relative(0, 0, z).await?;
        let (settled, current) = self.poll_position_until(|pos| pos.2 >= z).await?;
        if !settled || current != (x, y, z) {
            info!(?current, x, y, z, "Z raise did not settle on target");
            return Err(self.settle_failure("Z axis move").await);
        }

        self.progress(4, 4);
        self.abort.check()?;
        self.read_caldone().await?;
        self.read_position().await?;
        self.check_machine_error(&[]).await?;
        self.check_error(&[]).await?;

        self.message("Movement successful.");
        self.emit(TableEvent::AbsoluteMoveFinished);
        Ok(())
    }

    /// Toggle joystick control, applying the matching axis limit set first
    /// so manual driving can never exceed probe-card clearance.
    pub(crate) async fn enable_joystick(&mut self, enabled: bool) -> StationResult<()> {
        let maxima = if enabled {
            self.config.joystick_limits
        } else {
            self.config.probecard_limits
        };
        let limits = AxisLimits::from_maxima(
            to_table_unit(maxima[0]),
            to_table_unit(maxima[1]),
            to_table_unit(maxima[2]),
        );
        self.stage.set_limits(limits).await?;
        self.stage.set_joystick_enabled(enabled).await?;

        let state = self.stage.joystick_enabled().await?;
        info!(enabled = state, ?maxima, "updated table limits");
        self.emit(TableEvent::JoystickChanged(state));
        Ok(())
    }
}
