//! Sequence execution engine for probe station measurements.
//!
//! Consumes a tree of samples, contacts and measurements and executes it
//! end to end: safe instrument initialization, collision-safe table moves
//! through `probe-table`, contact dwell, measurement drivers with
//! re-measure and re-contact retry policies, and best-effort finalization
//! that always runs.

pub mod events;
pub mod export;
pub mod instruments;
pub mod ivramp;
pub mod measurement;
pub mod station;
pub mod tree;
pub mod worker;

pub use events::{MeasurementSummary, SequenceEvent};
pub use instruments::{Electrometer, EnvironmentBox, SourceMeter, SwitchingMatrix};
pub use ivramp::IvRamp;
pub use measurement::{
    MeasurementContext, MeasurementData, MeasurementDriver, MeasurementError, MeasurementRegistry,
};
pub use station::Station;
pub use tree::{ContactItem, ItemState, MeasurementItem, RunNode, SampleItem, SequenceTree};
pub use worker::SequenceWorker;
