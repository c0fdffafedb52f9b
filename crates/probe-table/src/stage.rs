//! Stage controller abstraction.
//!
//! [`Stage`] is the narrow command surface of the three-axis stage
//! controller, in the device's native integer micrometer units. The table
//! worker is the only component that ever holds a `Stage`; everything else
//! goes through the request queue.

use async_trait::async_trait;
use probe_core::StationResult;

/// Stage axis, in the device's 1-based channel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Zero-based index into position tuples.
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    /// One-based axis number used on the wire.
    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
            Axis::Z => write!(f, "Z"),
        }
    }
}

/// Per-axis travel limits in micrometers, `(min, max)` per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisLimits {
    pub x: (i64, i64),
    pub y: (i64, i64),
    pub z: (i64, i64),
}

impl AxisLimits {
    /// Limits spanning from the origin up to the given maxima.
    pub fn from_maxima(x: i64, y: i64, z: i64) -> Self {
        Self {
            x: (0, x),
            y: (0, y),
            z: (0, z),
        }
    }
}

/// Command surface of the stage controller.
///
/// All coordinates are whole micrometers. Error queries are destructive
/// reads: fetching a code clears it on the device.
#[async_trait]
pub trait Stage: Send {
    /// Controller identification string.
    async fn identify(&mut self) -> StationResult<String>;

    /// One-time connection setup: host mode, micrometer units, joystick off.
    async fn configure(&mut self) -> StationResult<()>;

    /// Current position `(x, y, z)`.
    async fn position(&mut self) -> StationResult<(i64, i64, i64)>;

    async fn move_absolute(&mut self, x: i64, y: i64, z: i64) -> StationResult<()>;

    async fn move_relative(&mut self, dx: i64, dy: i64, dz: i64) -> StationResult<()>;

    /// Raw per-axis calibration status `(x, y, z)`, each 0..=3.
    async fn caldone(&mut self) -> StationResult<(u8, u8, u8)>;

    /// Seek the axis to its origin and zero it.
    async fn ncal(&mut self, axis: Axis) -> StationResult<()>;

    /// Seek the axis to its maximum and measure the range.
    async fn nrm(&mut self, axis: Axis) -> StationResult<()>;

    /// Pending system error code, 0 when none.
    async fn error_code(&mut self) -> StationResult<i32>;

    /// Pending machine (firmware/motor) error code, 0 when none.
    async fn machine_error_code(&mut self) -> StationResult<i32>;

    async fn is_moving(&mut self) -> StationResult<bool>;

    async fn joystick_enabled(&mut self) -> StationResult<bool>;

    async fn set_joystick_enabled(&mut self, enabled: bool) -> StationResult<()>;

    async fn set_limits(&mut self, limits: AxisLimits) -> StationResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_numbering() {
        assert_eq!(Axis::X.number(), 1);
        assert_eq!(Axis::Y.number(), 2);
        assert_eq!(Axis::Z.number(), 3);
        assert_eq!(Axis::Z.index(), 2);
    }

    #[test]
    fn limits_from_maxima_start_at_origin() {
        let limits = AxisLimits::from_maxima(1000, 2000, 3000);
        assert_eq!(limits.x, (0, 1000));
        assert_eq!(limits.z, (0, 3000));
    }
}
