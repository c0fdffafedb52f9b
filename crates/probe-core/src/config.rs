//! Per-run configuration.
//!
//! A [`RunConfig`] is constructed once per sequence run from whatever opaque
//! settings source the host application uses, then passed by reference into
//! the engine. There is no process-wide mutable settings state.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::position::Position;

/// Configuration consumed by one sequence run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Upper bound on a single queued table move, end to end.
    #[serde(with = "humantime_serde")]
    pub table_move_timeout: Duration,

    /// Dwell time after probe contact before measuring.
    #[serde(with = "humantime_serde")]
    pub table_contact_delay: Duration,

    /// Settling delay applied ahead of every measurement.
    #[serde(with = "humantime_serde")]
    pub before_measurement_delay: Duration,

    /// Re-contact attempts for a contact whose measurements keep failing.
    pub retry_contact_count: u32,

    /// Re-measure attempts for a single failing measurement.
    pub retry_measurement_count: u32,

    /// Extra downward Z travel (mm) applied on each re-contact attempt.
    pub retry_contact_overdrive: f64,

    /// Whether contacts trigger table moves at all.
    pub move_to_contact: bool,

    /// Park position approached after a completed sequence or sample.
    pub move_to_after_position: Option<Position>,

    /// Environment box present and controlled.
    pub use_environ: bool,

    /// Operator name recorded in measurement metadata.
    pub operator: String,

    /// Root directory for measurement output.
    pub output_dir: PathBuf,

    pub serialize_json: bool,
    pub serialize_txt: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            table_move_timeout: Duration::from_secs(120),
            table_contact_delay: Duration::ZERO,
            before_measurement_delay: Duration::ZERO,
            retry_contact_count: 0,
            retry_measurement_count: 0,
            retry_contact_overdrive: 0.0,
            move_to_contact: true,
            move_to_after_position: None,
            use_environ: false,
            operator: String::new(),
            output_dir: PathBuf::from("."),
            serialize_json: true,
            serialize_txt: false,
        }
    }
}

impl RunConfig {
    /// Validate values that parse fine but are semantically wrong.
    pub fn validate(&self) -> Result<(), crate::error::StationError> {
        if !self.retry_contact_overdrive.is_finite() || self.retry_contact_overdrive < 0.0 {
            return Err(crate::error::StationError::Config(format!(
                "retry_contact_overdrive must be a non-negative length, got {}",
                self.retry_contact_overdrive
            )));
        }
        if let Some(position) = self.move_to_after_position {
            if !position.is_valid() {
                return Err(crate::error::StationError::Config(
                    "move_to_after_position must have all axes set".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_station_conventions() {
        let config = RunConfig::default();
        assert_eq!(config.table_move_timeout, Duration::from_secs(120));
        assert_eq!(config.retry_contact_count, 0);
        assert!(config.serialize_json);
        assert!(!config.serialize_txt);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserializes_from_toml_fragment() {
        let config: RunConfig = toml::from_str(
            r#"
            table_move_timeout = "90s"
            table_contact_delay = "1s 500ms"
            retry_contact_count = 2
            retry_contact_overdrive = 0.005
            operator = "Monty"
            "#,
        )
        .unwrap();
        assert_eq!(config.table_move_timeout, Duration::from_secs(90));
        assert_eq!(config.table_contact_delay, Duration::from_millis(1500));
        assert_eq!(config.retry_contact_count, 2);
        assert_eq!(config.retry_contact_overdrive, 0.005);
        assert_eq!(config.operator, "Monty");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_negative_overdrive() {
        let config = RunConfig {
            retry_contact_overdrive: -0.1,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_partial_park_position() {
        let config = RunConfig {
            move_to_after_position: Some(Position::new(1.0, 2.0, f64::NAN)),
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
