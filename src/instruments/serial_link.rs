//! ETX-framed serial transport for total station protocols.
//!
//! The wire dialect spoken by the supported instruments terminates every
//! frame with an ETX control byte. [`FrameLink`] is the narrow transport
//! seam the protocol drivers talk through; [`SerialFrameLink`] implements
//! it over a real serial port, and [`ScriptedLink`] is a canned-frame
//! double for protocol tests.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// End-of-text control byte terminating every frame.
pub const ETX: u8 = 0x03;

/// A byte transport carrying ETX-terminated frames.
#[async_trait]
pub trait FrameLink: Send + Sync {
    /// Writes the payload followed by ETX, then drops anything still
    /// pending in the port buffers.
    async fn write_frame(&self, payload: &[u8]) -> Result<()>;

    /// Reads until an ETX arrives or the timeout elapses, returning
    /// whatever bytes came in (possibly none). A timeout is not an error;
    /// the protocol layer decides whether a short frame matters.
    async fn read_frame(&self, timeout: Duration) -> Result<Vec<u8>>;
}

#[cfg(feature = "instrument_serial")]
pub use hardware::SerialFrameLink;

#[cfg(feature = "instrument_serial")]
mod hardware {
    use super::{FrameLink, ETX};
    use anyhow::{anyhow, Context, Result};
    use async_trait::async_trait;
    use log::debug;
    use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::Mutex;

    /// [`FrameLink`] over a physical serial port.
    ///
    /// The port lives behind `Arc<Mutex<…>>` and all blocking I/O runs on
    /// Tokio's blocking executor, so driver futures stay cancel-safe.
    #[derive(Clone)]
    pub struct SerialFrameLink {
        port_name: String,
        port: Arc<Mutex<Box<dyn SerialPort>>>,
    }

    impl SerialFrameLink {
        /// Opens `port_name` with 7 data bits, even parity, and one stop
        /// bit, the framing used by the supported Topcon instruments.
        pub fn open_7e1(port_name: &str, baud_rate: u32) -> Result<Self> {
            let port = serialport::new(port_name, baud_rate)
                .data_bits(DataBits::Seven)
                .parity(Parity::Even)
                .stop_bits(StopBits::One)
                .timeout(Duration::from_millis(50))
                .open()
                .with_context(|| {
                    format!("Serial port {port_name} could not be opened. Check your serial adapter and cable connections before proceeding.")
                })?;
            debug!("Serial port '{port_name}' opened at {baud_rate} baud (7E1)");
            Ok(Self {
                port_name: port_name.to_string(),
                port: Arc::new(Mutex::new(port)),
            })
        }

        pub fn port_name(&self) -> &str {
            &self.port_name
        }
    }

    #[async_trait]
    impl FrameLink for SerialFrameLink {
        async fn write_frame(&self, payload: &[u8]) -> Result<()> {
            let port = self.port.clone();
            let mut frame = payload.to_vec();
            frame.push(ETX);
            tokio::task::spawn_blocking(move || {
                use std::io::Write;
                let mut guard = port.blocking_lock();
                guard
                    .write_all(&frame)
                    .context("Failed to write to serial port")?;
                guard.flush().context("Failed to flush serial port")?;
                // The instrument paces itself; stale bytes in either buffer
                // belong to an abandoned exchange.
                guard
                    .clear(ClearBuffer::All)
                    .context("Failed to clear serial port buffers")?;
                Ok(())
            })
            .await
            .context("Serial I/O task panicked")?
        }

        async fn read_frame(&self, timeout: Duration) -> Result<Vec<u8>> {
            let port = self.port.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                use std::io::Read;
                let mut guard = port.blocking_lock();
                let deadline = Instant::now() + timeout;
                let mut frame = Vec::new();
                let mut byte = [0u8; 1];
                loop {
                    if Instant::now() >= deadline {
                        return Ok(frame);
                    }
                    match guard.read(&mut byte) {
                        Ok(1) => {
                            frame.push(byte[0]);
                            if byte[0] == ETX {
                                return Ok(frame);
                            }
                        }
                        Ok(0) => return Err(anyhow!("Unexpected EOF from serial port")),
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(anyhow!("Serial read error: {e}")),
                        Ok(_) => unreachable!("single-byte read returned more than one byte"),
                    }
                }
            })
            .await
            .context("Serial I/O task panicked")?
        }
    }
}

/// Scripted [`FrameLink`] for protocol tests: pops canned response frames
/// in order and records every frame written to it. An exhausted script
/// reads as a timeout (empty frame), which is how a silent instrument
/// looks to the driver.
#[derive(Default)]
pub struct ScriptedLink {
    responses: StdMutex<VecDeque<Vec<u8>>>,
    written: StdMutex<Vec<Vec<u8>>>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response frame; ETX is appended if missing.
    pub fn push_response(&self, payload: &[u8]) {
        let mut frame = payload.to_vec();
        if frame.last() != Some(&ETX) {
            frame.push(ETX);
        }
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(frame);
        }
    }

    /// Every payload written so far, ETX stripped.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written
            .lock()
            .map(|written| written.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FrameLink for ScriptedLink {
    async fn write_frame(&self, payload: &[u8]) -> Result<()> {
        if let Ok(mut written) = self.written.lock() {
            written.push(payload.to_vec());
        }
        Ok(())
    }

    async fn read_frame(&self, _timeout: Duration) -> Result<Vec<u8>> {
        // Yield so cancellation tests get a chance to interleave.
        tokio::task::yield_now().await;
        Ok(self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front())
            .unwrap_or_default())
    }
}
