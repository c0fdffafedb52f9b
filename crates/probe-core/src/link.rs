//! Async device-link abstractions.
//!
//! The stage controller speaks a line-oriented ASCII protocol over RS-232 or
//! a TCP socket bridge. Everything above the transport only needs
//! `AsyncRead + AsyncWrite`, so the link is type-erased: production code
//! opens a serial port (behind the `serial` feature), tests substitute a
//! `tokio::io::duplex` pair.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Mutex;

/// Trait alias for async link I/O.
pub trait LinkIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkIO for T {}

/// Type-erased boxed device link.
pub type DynLink = Box<dyn LinkIO>;

/// Shared, buffered device link.
///
/// `BufReader` gives `read_line` for the reply-per-line protocols the
/// station instruments use.
pub type SharedLink = Arc<Mutex<BufReader<DynLink>>>;

/// Wrap a type-erased link for shared buffered access.
pub fn wrap_shared(link: DynLink) -> SharedLink {
    Arc::new(Mutex::new(BufReader::new(link)))
}

/// Open a serial port with the station's standard settings (8N1, no flow
/// control), off the async runtime.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> crate::error::StationResult<tokio_serial::SerialStream> {
    use crate::error::StationError;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path = port_path.to_string();
    let device_name = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                StationError::Instrument(format!(
                    "failed to open {device_name} serial port {port_path}: {e}"
                ))
            })
    })
    .await
    .map_err(|e| StationError::Instrument(format!("serial open task failed: {e}")))?
}

/// Read and discard whatever is immediately available on the link.
///
/// Returns the number of discarded bytes. Used before a fresh exchange when
/// a previous command may have left an unread reply behind.
pub async fn drain_link<R: AsyncRead + Unpin>(link: &mut R, timeout: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + timeout;
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, link.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    if total > 0 {
        tracing::debug!(total, "discarded stale link bytes");
    }
    total
}
