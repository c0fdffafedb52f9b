//! Measurement driver interface and registry.
//!
//! Concrete measurements (IV ramps, CV ramps, ...) implement
//! [`MeasurementDriver`] and are looked up by the tree item's type key, the
//! same way hardware drivers are resolved from a factory registry. The
//! engine classifies a driver's error into the terminal item states that
//! feed the retry policy.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use probe_core::{AbortFlag, StationError};
use thiserror::Error;

use crate::station::Station;
use crate::tree::ReadingSeries;

/// Measurement failure modes, mapped to terminal item states by the engine.
#[derive(Error, Debug)]
pub enum MeasurementError {
    /// The source instrument reached its protection limit.
    #[error("Compliance tripped")]
    Compliance,

    /// The measurement ran but its data failed analysis.
    #[error("Analysis failed: {0}")]
    Analysis(String),

    /// Table or instrument failure underneath the measurement.
    #[error(transparent)]
    Station(#[from] StationError),

    /// Anything else a driver wants to surface.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Data produced by one measurement attempt.
#[derive(Debug, Clone, Default)]
pub struct MeasurementData {
    pub series: ReadingSeries,
    pub analysis: BTreeMap<String, serde_json::Value>,
}

impl MeasurementData {
    pub fn append_reading(&mut self, series: &str, x: f64, y: f64) {
        self.series.entry(series.to_string()).or_default().push((x, y));
    }
}

/// Everything a driver gets to see for one attempt.
pub struct MeasurementContext<'a> {
    pub station: &'a Station,
    /// Driver parameters from the tree item, opaque to the engine.
    pub parameters: &'a serde_json::Map<String, serde_json::Value>,
    /// Run-level stop flag; drivers check it between protocol steps.
    pub stop: &'a AbortFlag,
}

/// One measurement protocol.
#[async_trait]
pub trait MeasurementDriver: Send + Sync {
    /// Registry key, matches `MeasurementItem::item_type`.
    fn measurement_type(&self) -> &'static str;

    async fn run(&self, ctx: &MeasurementContext<'_>) -> Result<MeasurementData, MeasurementError>;
}

/// Driver lookup by measurement type.
#[derive(Default, Clone)]
pub struct MeasurementRegistry {
    drivers: HashMap<String, Arc<dyn MeasurementDriver>>,
}

impl MeasurementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its type key. The last registration wins.
    pub fn register(&mut self, driver: Arc<dyn MeasurementDriver>) {
        self.drivers
            .insert(driver.measurement_type().to_string(), driver);
    }

    pub fn get(&self, measurement_type: &str) -> Option<Arc<dyn MeasurementDriver>> {
        self.drivers.get(measurement_type).cloned()
    }

    pub fn types(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }
}
