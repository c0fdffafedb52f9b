//! In-memory stage for tests and offline development.
//!
//! Moves settle instantly, commands are logged, and failure modes can be
//! scripted: axes that never reach their origin during `ncal`, the benign
//! limit-switch error left behind by retract moves, or pending fault codes.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use probe_core::StationResult;

use crate::stage::{Axis, AxisLimits, Stage};

/// Travel reported by `nrm` range measurements (µm).
const AXIS_RANGE_UM: i64 = 100_000;

/// Scriptable state shared between the stage and the test.
#[derive(Debug)]
pub struct MockState {
    pub position: (i64, i64, i64),
    pub caldone: (u8, u8, u8),
    pub error: i32,
    pub machine_error: i32,
    pub joystick: bool,
    pub limits: Option<AxisLimits>,
    /// `is_moving` reports true for this many more polls.
    pub moving_ticks: u32,
    /// Ignore all motion commands (the table never reaches any target).
    pub frozen: bool,
    /// Axes that never reach their origin on `ncal`.
    pub stuck_axes: Vec<Axis>,
    /// Leave the limit-switch code behind when a relative move clamps at 0.
    pub limit_switch_errors: bool,
    /// Every issued command, oldest first.
    pub commands: Vec<String>,
    /// Number of `pos` queries served.
    pub position_queries: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            position: (0, 0, 0),
            caldone: (3, 3, 3),
            error: 0,
            machine_error: 0,
            joystick: false,
            limits: None,
            moving_ticks: 0,
            frozen: false,
            stuck_axes: Vec::new(),
            limit_switch_errors: false,
            commands: Vec::new(),
            position_queries: 0,
        }
    }
}

impl MockState {
    fn component_mut(&mut self, axis: Axis) -> &mut i64 {
        match axis {
            Axis::X => &mut self.position.0,
            Axis::Y => &mut self.position.1,
            Axis::Z => &mut self.position.2,
        }
    }

    fn caldone_mut(&mut self, axis: Axis) -> &mut u8 {
        match axis {
            Axis::X => &mut self.caldone.0,
            Axis::Y => &mut self.caldone.1,
            Axis::Z => &mut self.caldone.2,
        }
    }
}

/// Instantly-settling scripted stage.
pub struct MockStage {
    state: Arc<Mutex<MockState>>,
}

impl MockStage {
    /// Fully calibrated stage at the origin.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Stage reporting no calibration bits at all.
    pub fn uncalibrated() -> Self {
        let stage = Self::new();
        stage.state.lock().caldone = (0, 0, 0);
        stage
    }

    /// Shared view of the scripted state, kept valid after the stage has
    /// been handed to a worker.
    pub fn state(&self) -> Arc<Mutex<MockState>> {
        self.state.clone()
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for MockStage {
    async fn identify(&mut self) -> StationResult<String> {
        self.state.lock().commands.push("identify".into());
        Ok("Corvus 1 462 1 380".into())
    }

    async fn configure(&mut self) -> StationResult<()> {
        self.state.lock().commands.push("configure".into());
        Ok(())
    }

    async fn position(&mut self) -> StationResult<(i64, i64, i64)> {
        let mut state = self.state.lock();
        state.position_queries += 1;
        Ok(state.position)
    }

    async fn move_absolute(&mut self, x: i64, y: i64, z: i64) -> StationResult<()> {
        let mut state = self.state.lock();
        state.commands.push(format!("move {x} {y} {z}"));
        if !state.frozen {
            state.position = (x.max(0), y.max(0), z.max(0));
        }
        Ok(())
    }

    async fn move_relative(&mut self, dx: i64, dy: i64, dz: i64) -> StationResult<()> {
        let mut state = self.state.lock();
        state.commands.push(format!("rmove {dx} {dy} {dz}"));
        if state.frozen {
            return Ok(());
        }
        let target = (
            state.position.0 + dx,
            state.position.1 + dy,
            state.position.2 + dz,
        );
        let clamped = target.0 < 0 || target.1 < 0 || target.2 < 0;
        state.position = (target.0.max(0), target.1.max(0), target.2.max(0));
        if clamped && state.limit_switch_errors {
            state.error = crate::codes::LIMIT_SWITCH_ERROR;
        }
        Ok(())
    }

    async fn caldone(&mut self) -> StationResult<(u8, u8, u8)> {
        Ok(self.state.lock().caldone)
    }

    async fn ncal(&mut self, axis: Axis) -> StationResult<()> {
        let mut state = self.state.lock();
        state.commands.push(format!("ncal {axis}"));
        if !state.stuck_axes.contains(&axis) {
            *state.component_mut(axis) = 0;
            *state.caldone_mut(axis) |= 0x1;
        }
        Ok(())
    }

    async fn nrm(&mut self, axis: Axis) -> StationResult<()> {
        let mut state = self.state.lock();
        state.commands.push(format!("nrm {axis}"));
        if !state.stuck_axes.contains(&axis) {
            *state.component_mut(axis) = AXIS_RANGE_UM;
            *state.caldone_mut(axis) |= 0x2;
        }
        Ok(())
    }

    async fn error_code(&mut self) -> StationResult<i32> {
        let mut state = self.state.lock();
        Ok(std::mem::take(&mut state.error))
    }

    async fn machine_error_code(&mut self) -> StationResult<i32> {
        let mut state = self.state.lock();
        Ok(std::mem::take(&mut state.machine_error))
    }

    async fn is_moving(&mut self) -> StationResult<bool> {
        let mut state = self.state.lock();
        if state.moving_ticks > 0 {
            state.moving_ticks -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn joystick_enabled(&mut self) -> StationResult<bool> {
        Ok(self.state.lock().joystick)
    }

    async fn set_joystick_enabled(&mut self, enabled: bool) -> StationResult<()> {
        let mut state = self.state.lock();
        state.commands.push(format!("joystick {}", u8::from(enabled)));
        state.joystick = enabled;
        Ok(())
    }

    async fn set_limits(&mut self, limits: AxisLimits) -> StationResult<()> {
        let mut state = self.state.lock();
        state.commands.push(format!(
            "setlimit {} {} {}",
            limits.x.1, limits.y.1, limits.z.1
        ));
        state.limits = Some(limits);
        Ok(())
    }
}
