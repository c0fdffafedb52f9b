//! Table controller configuration.

use std::time::Duration;

use serde::Deserialize;

/// Static configuration of the table worker.
///
/// The retry count and poll interval govern every settle loop (moves and
/// calibration steps alike): up to `retries` re-polls, one `poll_interval`
/// apart, before the operation is declared failed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableConfig {
    /// Software Z ceiling in millimeters, always at or below the stage's
    /// mechanical maximum. Absolute moves clamp their Z target to this.
    pub z_limit: f64,

    /// Settle-poll retry budget per motion step.
    pub retries: u32,

    /// Delay between settle polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Idle status broadcast interval (position/caldone/joystick).
    #[serde(with = "humantime_serde")]
    pub update_interval: Duration,

    /// Axis maxima (mm) applied while the joystick is enabled.
    pub joystick_limits: [f64; 3],

    /// Axis maxima (mm) applied in probe-card mode (joystick off).
    pub probecard_limits: [f64; 3],
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            z_limit: 23.8,
            retries: 180,
            poll_interval: Duration::from_secs(1),
            update_interval: Duration::from_secs(1),
            joystick_limits: [200.0, 200.0, 23.8],
            probecard_limits: [200.0, 200.0, 23.8],
        }
    }
}
