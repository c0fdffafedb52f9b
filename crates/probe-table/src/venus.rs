//! Corvus-style stage controller client.
//!
//! Protocol overview:
//! - ASCII command/response over RS-232 or a TCP serial bridge
//! - Postfix syntax: parameters first, then the command word
//! - Examples: `"pos"` → `"12.0 5.0 0.0"`, `"100 200 0 move"`, `"3 ncal"`
//! - Positions are exchanged in micrometers
//!
//! Error registers (`geterror`, `getmerror`) are destructive reads: the
//! device clears a code once it has been fetched.

use std::time::Duration;

use async_trait::async_trait;
use probe_core::link::SharedLink;
use probe_core::{StationError, StationResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::debug;

use crate::stage::{Axis, AxisLimits, Stage};

const UNIT_MICROMETER: u8 = 1;

/// Client for a Corvus/Venus stage controller.
pub struct VenusStage {
    link: SharedLink,
    timeout: Duration,
}

impl VenusStage {
    /// Wrap an already-open link with the default 5 s reply timeout.
    pub fn new(link: SharedLink) -> Self {
        Self::with_timeout(link, Duration::from_secs(5))
    }

    pub fn with_timeout(link: SharedLink, timeout: Duration) -> Self {
        Self { link, timeout }
    }

    /// Open a serial port and validate that a Corvus controller answers.
    #[cfg(feature = "serial")]
    pub async fn open_serial(port_path: &str, baud_rate: u32) -> StationResult<Self> {
        let port = probe_core::link::open_serial_async(port_path, baud_rate, "Corvus").await?;
        let mut stage = Self::new(probe_core::link::wrap_shared(Box::new(port)));
        let identity = stage.identify().await?;
        if !identity.to_uppercase().contains("CORVUS") {
            return Err(StationError::Instrument(format!(
                "controller identification '{identity}' does not indicate a Corvus stage"
            )));
        }
        tracing::info!(%identity, "stage validated");
        Ok(stage)
    }

    /// Send a command that produces no reply.
    async fn command(&self, command: &str) -> StationResult<()> {
        let mut link = self.link.lock().await;
        debug!(command, "stage write");
        let line = format!("{command}\r\n");
        let writer = link.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a query and read the single-line reply.
    async fn query(&self, command: &str) -> StationResult<String> {
        let mut link = self.link.lock().await;
        debug!(command, "stage query");
        let line = format!("{command}\r\n");
        let writer = link.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        let mut reply = String::new();
        tokio::time::timeout(self.timeout, link.read_line(&mut reply))
            .await
            .map_err(|_| StationError::timeout(format!("stage query '{command}'"), self.timeout))?
            .map_err(StationError::Io)?;
        Ok(reply.trim().to_string())
    }

    async fn query_int(&self, command: &str) -> StationResult<i64> {
        let reply = self.query(command).await?;
        // Replies are float-formatted even for integral values.
        let value: f64 = reply.parse().map_err(|_| {
            StationError::Instrument(format!("unparsable reply '{reply}' to '{command}'"))
        })?;
        Ok(value.round() as i64)
    }
}

#[async_trait]
impl Stage for VenusStage {
    async fn identify(&mut self) -> StationResult<String> {
        self.query("identify").await
    }

    async fn configure(&mut self) -> StationResult<()> {
        // Host mode, micrometer units on every axis, joystick released.
        self.command("0 mode").await?;
        for axis in Axis::ALL {
            self.command(&format!("{} {} setunit", UNIT_MICROMETER, axis.number()))
                .await?;
        }
        self.command("0 joystick").await?;
        Ok(())
    }

    async fn position(&mut self) -> StationResult<(i64, i64, i64)> {
        let reply = self.query("pos").await?;
        let mut fields = reply.split_whitespace();
        let mut next = || -> StationResult<i64> {
            let field = fields
                .next()
                .ok_or_else(|| StationError::Instrument(format!("short pos reply '{reply}'")))?;
            let value: f64 = field.parse().map_err(|_| {
                StationError::Instrument(format!("unparsable pos field '{field}'"))
            })?;
            Ok(value.round() as i64)
        };
        Ok((next()?, next()?, next()?))
    }

    async fn move_absolute(&mut self, x: i64, y: i64, z: i64) -> StationResult<()> {
        self.command(&format!("{x} {y} {z} move")).await
    }

    async fn move_relative(&mut self, dx: i64, dy: i64, dz: i64) -> StationResult<()> {
        self.command(&format!("{dx} {dy} {dz} rmove")).await
    }

    async fn caldone(&mut self) -> StationResult<(u8, u8, u8)> {
        let mut raw = [0u8; 3];
        for axis in Axis::ALL {
            let value = self
                .query_int(&format!("{} getcaldone", axis.number()))
                .await?;
            raw[axis.index()] = value.clamp(0, 3) as u8;
        }
        Ok((raw[0], raw[1], raw[2]))
    }

    async fn ncal(&mut self, axis: Axis) -> StationResult<()> {
        self.command(&format!("{} ncal", axis.number())).await
    }

    async fn nrm(&mut self, axis: Axis) -> StationResult<()> {
        self.command(&format!("{} nrm", axis.number())).await
    }

    async fn error_code(&mut self) -> StationResult<i32> {
        Ok(self.query_int("geterror").await? as i32)
    }

    async fn machine_error_code(&mut self) -> StationResult<i32> {
        Ok(self.query_int("getmerror").await? as i32)
    }

    async fn is_moving(&mut self) -> StationResult<bool> {
        let status = self.query_int("status").await?;
        Ok(status & 0x1 == 0x1)
    }

    async fn joystick_enabled(&mut self) -> StationResult<bool> {
        Ok(self.query_int("getjoystick").await? != 0)
    }

    async fn set_joystick_enabled(&mut self, enabled: bool) -> StationResult<()> {
        self.command(&format!("{} joystick", u8::from(enabled)))
            .await
    }

    async fn set_limits(&mut self, limits: AxisLimits) -> StationResult<()> {
        self.command(&format!(
            "{} {} {} {} {} {} setlimit",
            limits.x.0, limits.y.0, limits.z.0, limits.x.1, limits.y.1, limits.z.1
        ))
        .await
    }
}
