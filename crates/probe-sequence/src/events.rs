//! Sequence engine event stream.
//!
//! Every item state transition is broadcast so the host application can
//! render live status; tests subscribe to the same stream.

use chrono::{DateTime, Utc};

use crate::tree::ItemState;

/// Slash-separated item path (`sample/contact/measurement` ids).
pub type ItemPath = String;

/// Summary pushed after every measurement attempt.
#[derive(Debug, Clone)]
pub struct MeasurementSummary {
    pub timestamp: Option<DateTime<Utc>>,
    pub sample_name: String,
    pub sample_type: String,
    pub contact_name: String,
    pub measurement_name: String,
    pub measurement_state: ItemState,
}

/// Broadcast notifications from a sequence run.
#[derive(Debug, Clone)]
pub enum SequenceEvent {
    /// Operator-facing status line.
    Message(String),
    /// Step progress within the current operation.
    Progress { value: u32, maximum: u32 },
    /// A tree item changed state.
    ItemState { item: ItemPath, state: ItemState },
    /// A contact was re-approached.
    RecontactChanged { item: ItemPath, count: u32 },
    /// A measurement was re-run.
    RemeasureChanged { item: ItemPath, count: u32 },
    MeasurementFinished(MeasurementSummary),
    /// The run failed at run level (per-item failures stay item states).
    Failed(String),
    /// The run is over, regardless of outcome. Always the last event.
    Finished,
}
