//! IV ramp measurement.
//!
//! Steps the source voltage linearly from `voltage_start` to `voltage_stop`
//! and records one electrometer current reading per step. The ramp stops on
//! compliance; the source is always ramped back to zero and disabled before
//! the driver returns.
//!
//! Parameters (all optional unless noted):
//! - `voltage_start` (V, default 0)
//! - `voltage_stop` (V, required)
//! - `voltage_step` (V, default 1)
//! - `waiting_time` (s, default 1)

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use probe_core::{recovery_step, LinearRange};
use tracing::{debug, info, warn};

use crate::instruments::{Electrometer, SourceMeter};
use crate::measurement::{
    MeasurementContext, MeasurementData, MeasurementDriver, MeasurementError,
};

pub struct IvRamp;

fn param_f64(
    parameters: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<f64> {
    parameters.get(key).and_then(serde_json::Value::as_f64)
}

impl IvRamp {
    /// Walk the source back to zero volts and disable its output.
    async fn ramp_to_zero(source: &dyn SourceMeter) -> Result<(), MeasurementError> {
        let voltage = source.source_voltage().await?;
        for setpoint in LinearRange::new(voltage, 0.0, recovery_step(voltage)) {
            source.set_source_voltage(setpoint).await?;
        }
        source.set_output_enabled(false).await?;
        Ok(())
    }
}

#[async_trait]
impl MeasurementDriver for IvRamp {
    fn measurement_type(&self) -> &'static str {
        "iv_ramp"
    }

    async fn run(&self, ctx: &MeasurementContext<'_>) -> Result<MeasurementData, MeasurementError> {
        let source = ctx
            .station
            .vsrc
            .as_ref()
            .ok_or_else(|| anyhow!("iv_ramp requires a V source"))?;
        let electrometer: &dyn Electrometer = ctx
            .station
            .electrometer
            .as_ref()
            .ok_or_else(|| anyhow!("iv_ramp requires an electrometer"))?
            .as_ref();

        let start = param_f64(ctx.parameters, "voltage_start").unwrap_or(0.0);
        let stop = param_f64(ctx.parameters, "voltage_stop")
            .ok_or_else(|| anyhow!("iv_ramp requires parameter 'voltage_stop'"))?;
        let step = param_f64(ctx.parameters, "voltage_step")
            .unwrap_or(1.0)
            .abs();
        if step == 0.0 || !step.is_finite() {
            return Err(anyhow!("iv_ramp parameter 'voltage_step' must be non-zero").into());
        }
        let waiting_time =
            Duration::from_secs_f64(param_f64(ctx.parameters, "waiting_time").unwrap_or(1.0));

        info!(start, stop, step, "iv_ramp");

        // Bring the output up at its present level and walk to the start
        // voltage before taking data.
        if !source.output_enabled().await? {
            source.set_source_voltage(0.0).await?;
            source.set_output_enabled(true).await?;
        }
        let present = source.source_voltage().await?;
        for setpoint in LinearRange::new(present, start, step) {
            source.set_source_voltage(setpoint).await?;
        }

        let mut data = MeasurementData::default();
        for voltage in LinearRange::new(start, stop, step) {
            if let Err(err) = ctx.stop.check() {
                let _ = Self::ramp_to_zero(source.as_ref()).await;
                return Err(err.into());
            }

            source.set_source_voltage(voltage).await?;
            tokio::time::sleep(waiting_time).await;

            if source.compliance_tripped().await? {
                warn!(voltage, "compliance tripped, aborting ramp");
                let _ = Self::ramp_to_zero(source.as_ref()).await;
                return Err(MeasurementError::Compliance);
            }

            let current = electrometer.read_current().await?;
            debug!(voltage, current, "reading");
            data.append_reading("iv", voltage, current);
        }

        Self::ramp_to_zero(source.as_ref()).await?;

        let spot = data
            .series
            .get("iv")
            .and_then(|series| series.last())
            .copied()
            .ok_or_else(|| MeasurementError::Analysis("no readings acquired".into()))?;
        if !spot.1.is_finite() {
            return Err(MeasurementError::Analysis(format!(
                "spot current at {} V is not finite",
                spot.0
            )));
        }
        data.analysis
            .insert("v_spot".into(), serde_json::json!(spot.0));
        data.analysis
            .insert("i_spot".into(), serde_json::json!(spot.1));

        Ok(data)
    }
}
