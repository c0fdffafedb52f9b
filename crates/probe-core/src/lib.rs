//! Core types for the probe station control stack.
//!
//! This crate holds the leaf value types and plumbing shared by the table
//! motion controller (`probe-table`) and the sequence execution engine
//! (`probe-sequence`): table coordinates and unit conversion, calibration
//! state decoding, the error taxonomy, the cooperative stop flag, linear
//! setpoint ramps, per-run configuration, and the async device-link
//! abstractions.

pub mod abort;
pub mod calibration;
pub mod config;
pub mod error;
pub mod link;
pub mod position;
pub mod ramp;
pub mod units;

pub use abort::AbortFlag;
pub use calibration::{AxisCal, CalibrationState};
pub use config::RunConfig;
pub use error::{StationError, StationResult};
pub use position::Position;
pub use ramp::{recovery_step, LinearRange};
pub use units::{from_table_unit, to_table_unit};
