//! Table controller event stream.
//!
//! Every state change observed by the worker is broadcast so any number of
//! subscribers (GUI, logger, tests) can attach without overwriting each
//! other. Events are emitted after each poll, so subscribers always observe
//! monotonically fresh knowledge.

use probe_core::{CalibrationState, Position};

/// Broadcast notifications from the table worker.
#[derive(Debug, Clone)]
pub enum TableEvent {
    /// Operator-facing status line.
    Message(String),
    /// Step progress within the current operation.
    Progress { value: u32, maximum: u32 },
    /// Fresh position reading (mm).
    PositionChanged(Position),
    /// Fresh calibration status reading.
    CaldoneChanged(CalibrationState),
    /// Joystick enable state changed.
    JoystickChanged(bool),
    RelativeMoveFinished,
    AbsoluteMoveFinished,
    CalibrationFinished,
    /// The in-flight operation observed a stop request and terminated.
    Stopped,
    /// The in-flight operation failed; the worker keeps serving the queue.
    Failed(String),
}
