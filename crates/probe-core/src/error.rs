//! Error types shared across the probe station stack.
//!
//! [`StationError`] consolidates the failure modes of table motion and
//! instrument I/O using `thiserror`. Device-reported numeric faults carry
//! both the raw code and the decoded human-readable message; unknown codes
//! degrade gracefully at the lookup site rather than failing here.

use thiserror::Error;

/// Convenience alias for results using the station error type.
pub type StationResult<T> = std::result::Result<T, StationError>;

/// Primary error type for table and instrument operations.
#[derive(Error, Debug)]
pub enum StationError {
    /// The stage controller reported a numbered system fault.
    ///
    /// `message` is resolved through the static code table; codes the table
    /// does not know are reported as "Unknown error code."
    #[error("Table error {code}: {message}")]
    Table { code: i32, message: String },

    /// The stage controller reported a firmware/motor fault.
    #[error("Table machine error {code}: {message}")]
    TableMachine { code: i32, message: String },

    /// Motion was attempted while the stage is not fully calibrated.
    ///
    /// Precondition violation, not a device fault: run a table calibration
    /// and retry.
    #[error("Table requires calibration")]
    TableCalibration,

    /// A bounded wait (move settle, calibration step, request completion)
    /// exceeded its retry or time budget.
    #[error("{operation} timed out after {seconds:.1} s")]
    Timeout { operation: String, seconds: f64 },

    /// The current operation was aborted by a stop request.
    ///
    /// Observed only between discrete steps; a partially issued device
    /// command is not undone.
    #[error("Operation stopped")]
    Stopped,

    /// Instrument communication or protocol failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Standard I/O failure on the device link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Semantically invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StationError {
    /// Build a timeout error from an operation label and its budget.
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds: timeout.as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn display_formats() {
        let err = StationError::Table {
            code: 1001,
            message: "Invalid parameter.".into(),
        };
        assert_eq!(err.to_string(), "Table error 1001: Invalid parameter.");

        let err = StationError::timeout("Table move", Duration::from_secs(120));
        assert_eq!(err.to_string(), "Table move timed out after 120.0 s");
    }
}
