//! Narrow instrument command surfaces consumed by the engine.
//!
//! Full SCPI drivers live outside this crate; the engine only needs the
//! handful of operations below. Implementations manage their own connection
//! state and serialize access internally (acquire-use-release per call).

use async_trait::async_trait;
use probe_core::StationResult;

/// Voltage source (SMU) surface used for safe recovery and ramps.
#[async_trait]
pub trait SourceMeter: Send + Sync {
    async fn output_enabled(&self) -> StationResult<bool>;

    async fn set_output_enabled(&self, enabled: bool) -> StationResult<()>;

    /// Programmed source voltage in volts.
    async fn source_voltage(&self) -> StationResult<f64>;

    async fn set_source_voltage(&self, voltage: f64) -> StationResult<()>;

    /// Whether the protection limit was reached.
    async fn compliance_tripped(&self) -> StationResult<bool>;
}

/// Switching matrix surface.
#[async_trait]
pub trait SwitchingMatrix: Send + Sync {
    async fn open_all_channels(&self) -> StationResult<()>;

    /// Channels still reported closed, empty when fully open.
    async fn closed_channels(&self) -> StationResult<Vec<String>>;
}

/// Environment box surface.
#[async_trait]
pub trait EnvironmentBox: Send + Sync {
    /// Trigger the decoupling-box auto-discharge.
    async fn discharge_decoupling(&self) -> StationResult<()>;

    /// Test LED signalling an active measurement.
    async fn set_test_led(&self, enabled: bool) -> StationResult<()>;
}

/// Electrometer surface.
#[async_trait]
pub trait Electrometer: Send + Sync {
    /// Single current reading in amperes.
    async fn read_current(&self) -> StationResult<f64>;
}
