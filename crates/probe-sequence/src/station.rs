//! Assembled station: the table handle plus the instruments a run needs.

use std::sync::Arc;

use probe_table::TableHandle;

use crate::instruments::{Electrometer, EnvironmentBox, SourceMeter, SwitchingMatrix};

/// Hardware surface handed to a sequence run.
///
/// All instruments are optional except the table; the engine skips
/// initialization/finalization steps for absent instruments.
#[derive(Clone)]
pub struct Station {
    pub table: TableHandle,
    pub hvsrc: Option<Arc<dyn SourceMeter>>,
    pub vsrc: Option<Arc<dyn SourceMeter>>,
    pub matrix: Option<Arc<dyn SwitchingMatrix>>,
    pub environment: Option<Arc<dyn EnvironmentBox>>,
    pub electrometer: Option<Arc<dyn Electrometer>>,
}

impl Station {
    pub fn new(table: TableHandle) -> Self {
        Self {
            table,
            hvsrc: None,
            vsrc: None,
            matrix: None,
            environment: None,
            electrometer: None,
        }
    }

    pub fn with_hvsrc(mut self, hvsrc: Arc<dyn SourceMeter>) -> Self {
        self.hvsrc = Some(hvsrc);
        self
    }

    pub fn with_vsrc(mut self, vsrc: Arc<dyn SourceMeter>) -> Self {
        self.vsrc = Some(vsrc);
        self
    }

    pub fn with_matrix(mut self, matrix: Arc<dyn SwitchingMatrix>) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentBox>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_electrometer(mut self, electrometer: Arc<dyn Electrometer>) -> Self {
        self.electrometer = Some(electrometer);
        self
    }
}
