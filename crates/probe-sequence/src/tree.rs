//! Sequence tree model.
//!
//! A sequence is a strict tree: samples own contacts, contacts own
//! measurements. Items are created when a sequence configuration is loaded
//! and re-used across runs; the engine is the only mutator while a run is
//! active, and [`SequenceTree::reset`] returns everything to `Idle` between
//! runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use probe_core::Position;
use serde::{Deserialize, Serialize};

/// Processing state of a tree item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Idle,
    Processing,
    Active,
    Success,
    Compliance,
    Timeout,
    Error,
    Stopped,
    AnalysisError,
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ItemState::Idle => "idle",
            ItemState::Processing => "processing",
            ItemState::Active => "active",
            ItemState::Success => "success",
            ItemState::Compliance => "compliance",
            ItemState::Timeout => "timeout",
            ItemState::Error => "error",
            ItemState::Stopped => "stopped",
            ItemState::AnalysisError => "analysis_error",
        };
        write!(f, "{label}")
    }
}

/// Reading series: named lists of `(x, y)` pairs.
pub type ReadingSeries = BTreeMap<String, Vec<(f64, f64)>>;

/// One measurement leaf.
#[derive(Debug, Clone)]
pub struct MeasurementItem {
    pub id: String,
    pub name: String,
    /// Registry key selecting the measurement driver.
    pub item_type: String,
    pub enabled: bool,
    pub state: ItemState,
    /// How often this measurement was re-run within the current run.
    pub remeasure_count: u32,
    /// Driver parameters, opaque to the engine.
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Reading series of the latest attempt.
    pub readings: ReadingSeries,
    /// Analysis results of the latest attempt.
    pub analysis: BTreeMap<String, serde_json::Value>,
    /// Start of the latest attempt.
    pub timestamp: Option<DateTime<Utc>>,
}

impl MeasurementItem {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        item_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            item_type: item_type.into(),
            enabled: true,
            state: ItemState::Idle,
            remeasure_count: 0,
            parameters: serde_json::Map::new(),
            readings: ReadingSeries::new(),
            analysis: BTreeMap::new(),
            timestamp: None,
        }
    }

    /// Clear attempt-local data so retries never see stale readings.
    pub fn clear_attempt(&mut self) {
        self.readings.clear();
        self.analysis.clear();
    }

    fn reset(&mut self) {
        self.state = ItemState::Idle;
        self.remeasure_count = 0;
        self.clear_attempt();
        self.timestamp = None;
    }
}

/// One contact pad on a sample.
#[derive(Debug, Clone)]
pub struct ContactItem {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub state: ItemState,
    /// Table position of the pad; NaN axes until assigned.
    pub position: Position,
    /// How often this contact was re-approached within the current run.
    pub recontact_count: u32,
    pub measurements: Vec<MeasurementItem>,
}

impl ContactItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            state: ItemState::Idle,
            position: Position::unset(),
            recontact_count: 0,
            measurements: Vec::new(),
        }
    }

    pub fn has_position(&self) -> bool {
        self.position.is_valid()
    }

    fn reset(&mut self) {
        self.state = ItemState::Idle;
        self.recontact_count = 0;
        for measurement in &mut self.measurements {
            measurement.reset();
        }
    }
}

/// One sample on the chuck.
#[derive(Debug, Clone)]
pub struct SampleItem {
    pub id: String,
    pub name: String,
    pub sample_type: String,
    pub position_label: String,
    pub comment: String,
    pub enabled: bool,
    pub state: ItemState,
    pub contacts: Vec<ContactItem>,
}

impl SampleItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            sample_type: String::new(),
            position_label: String::new(),
            comment: String::new(),
            enabled: true,
            state: ItemState::Idle,
            contacts: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.state = ItemState::Idle;
        for contact in &mut self.contacts {
            contact.reset();
        }
    }
}

/// Root of a sequence.
#[derive(Debug, Clone, Default)]
pub struct SequenceTree {
    pub name: String,
    pub samples: Vec<SampleItem>,
}

impl SequenceTree {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            samples: Vec::new(),
        }
    }

    /// Return every item to `Idle` and clear retry counters and readings.
    pub fn reset(&mut self) {
        for sample in &mut self.samples {
            sample.reset();
        }
    }
}

/// Selector for the subtree a run starts at.
///
/// Indexes into the tree in document order; the engine resolves the node
/// once at its single entry point and dispatches on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunNode {
    Sequence,
    Sample(usize),
    Contact(usize, usize),
    Measurement(usize, usize, usize),
}
