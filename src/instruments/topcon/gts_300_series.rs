//! Driver for Topcon GTS-300 series total stations.
//!
//! All GTS-300 series stations speak the same dialect over 1200 baud 7E1:
//! ASCII command mnemonics terminated by ETX, acknowledged with an
//! `<ACK>006<ETX>` frame. An azimuth upload is a two-frame exchange
//! (`J074`, then `J+{packed}d` carrying a three-digit XOR block check
//! character); a measurement is a trigger/read pair (`Z64088`, `C067`)
//! answered by a fixed-width record:
//!
//! ```text
//! /___________ ___________ ___________m<ETX>
//! ^ format     north       east        ^ unit marker
//!   marker     (three 11-char signed fields, value / 10 000 meters)
//! ```
//!
//! The driver polls for acknowledgments a bounded number of times and
//! checks a cancellation flag on every iteration, so an operator cancel
//! returns promptly instead of waiting out the retry budget. The cancel
//! path's own mode-reset write is issued by the in-flight call *after* its
//! wait has returned, keeping a single writer on the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::Instant;

use crate::error::{Result, SurveyError};
use crate::geodesy::round_mm;
use crate::instruments::serial_link::{FrameLink, ETX};
use crate::instruments::{validate_angle, MeasurementOutcome, RawMeasurement, TotalStation};

/// Communication rate dictated by the instrument.
pub const BAUD_RATE: u32 = 1200;

/// Acknowledgment frame: ACK control byte, literal "006", ETX.
const ACK_FRAME: &[u8] = b"\x06006\x03";
/// Payload we send to acknowledge receipt of a measurement record.
const ACK_REPLY: &[u8] = b"\x06006";
/// V/H mode with Horizontal Right.
const MODE_HR_CMD: &[u8] = b"Z12089";
/// Announces an azimuth upload.
const AZIMUTH_PREFIX_CMD: &[u8] = b"J074";
/// Starts a distance measurement.
const MEASURE_TRIGGER_CMD: &[u8] = b"Z64088";
/// Requests the measurement record.
const MEASURE_READ_CMD: &[u8] = b"C067";

const COMMUNICATION_ERROR: &str = "A communication error occurred.";

enum AckWait {
    Acked,
    TimedOut,
    Canceled,
}

pub struct Gts300Series {
    link: Box<dyn FrameLink>,
    canceled: AtomicBool,
    ack_attempts: u32,
    ack_read_timeout: Duration,
    response_timeout: Duration,
}

impl Gts300Series {
    pub fn new(link: Box<dyn FrameLink>) -> Self {
        Self::with_timings(
            link,
            10,
            Duration::from_millis(500),
            Duration::from_secs(10),
        )
    }

    /// Driver with explicit retry budget and timeouts, for tests and for
    /// bench setups with a fast simulated wire.
    pub fn with_timings(
        link: Box<dyn FrameLink>,
        ack_attempts: u32,
        ack_read_timeout: Duration,
        response_timeout: Duration,
    ) -> Self {
        Self {
            link,
            canceled: AtomicBool::new(false),
            ack_attempts,
            ack_read_timeout,
            response_timeout,
        }
    }

    /// Block check character: successive XOR of the command's character
    /// codes, zero-padded to three decimal digits.
    fn bcc(command: &str) -> String {
        let bcc = command.bytes().fold(0u8, |acc, byte| acc ^ byte);
        format!("{bcc:03}")
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        self.link
            .write_frame(payload)
            .await
            .map_err(|e| SurveyError::Communication(format!("{e:#}")))
    }

    /// Polls for the acknowledgment frame, observing the cancellation flag
    /// on every iteration.
    async fn wait_for_ack(&self) -> Result<AckWait> {
        for _ in 0..self.ack_attempts {
            if self.canceled.load(Ordering::SeqCst) {
                return Ok(AckWait::Canceled);
            }
            let frame = self
                .link
                .read_frame(self.ack_read_timeout)
                .await
                .map_err(|e| SurveyError::Communication(format!("{e:#}")))?;
            if frame == ACK_FRAME {
                return Ok(AckWait::Acked);
            }
        }
        Ok(AckWait::TimedOut)
    }

    /// Accumulates the measurement record in bounded slices so the
    /// cancellation flag stays observable while the instrument measures.
    /// Returns `None` when canceled; a timeout returns the partial frame
    /// and lets the parse decide.
    async fn read_response(&self) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + self.response_timeout;
        let mut frame = Vec::new();
        loop {
            if self.canceled.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if Instant::now() >= deadline {
                return Ok(Some(frame));
            }
            let chunk = self
                .link
                .read_frame(self.ack_read_timeout)
                .await
                .map_err(|e| SurveyError::Communication(format!("{e:#}")))?;
            frame.extend_from_slice(&chunk);
            if frame.last() == Some(&ETX) {
                return Ok(Some(frame));
            }
        }
    }

    /// Completes a cancellation observed by one of the wait loops: issues
    /// the harmless mode-reset that interrupts the instrument, then clears
    /// the flag. Runs on the in-flight call, never on the canceling one.
    async fn finish_cancel(&self) -> Result<MeasurementOutcome> {
        debug!("Measurement canceled by user; interrupting instrument");
        if let Err(e) = self.link.write_frame(MODE_HR_CMD).await {
            warn!("Mode reset after cancel failed: {e:#}");
        }
        self.canceled.store(false, Ordering::SeqCst);
        Ok(MeasurementOutcome::Canceled)
    }

    fn parse_measurement(frame: &[u8]) -> std::result::Result<RawMeasurement, String> {
        let payload = frame.strip_suffix(&[ETX]).unwrap_or(frame);
        let text = std::str::from_utf8(payload).map_err(|_| "Measurement failed.".to_string())?;
        if text.len() < 35 {
            return Err("Measurement failed.".to_string());
        }
        let format_marker = &text[0..1];
        let unit_marker = &text[34..35];
        if format_marker != "/" || unit_marker != "m" {
            return Err(format!("Unexpected data format: {text}."));
        }
        let parse_field = |field: &str| -> std::result::Result<f64, String> {
            field
                .trim()
                .parse::<f64>()
                .map(|value| round_mm(value / 10_000.0))
                .map_err(|_| "Measurement failed.".to_string())
        };
        Ok(RawMeasurement {
            delta_n: parse_field(&text[1..12])?,
            delta_e: parse_field(&text[12..23])?,
            delta_z: parse_field(&text[23..34])?,
        })
    }
}

#[async_trait]
impl TotalStation for Gts300Series {
    fn name(&self) -> &str {
        "Topcon GTS-300 Series"
    }

    async fn set_mode_hr(&self) -> Result<()> {
        self.write(MODE_HR_CMD).await?;
        match self.wait_for_ack().await? {
            AckWait::Acked => {
                debug!("Mode set to Horizontal Right");
                Ok(())
            }
            AckWait::TimedOut | AckWait::Canceled => {
                Err(SurveyError::Communication(COMMUNICATION_ERROR.to_string()))
            }
        }
    }

    async fn set_azimuth(&self, degrees: u32, minutes: u32, seconds: u32) -> Result<()> {
        validate_angle(degrees, minutes, seconds)?;
        self.set_mode_hr().await?;
        let packed = degrees * 10_000 + minutes * 100 + seconds;
        let command = format!("J+{packed}d");
        let bcc = Self::bcc(&command);
        self.write(AZIMUTH_PREFIX_CMD).await?;
        if !matches!(self.wait_for_ack().await?, AckWait::Acked) {
            return Err(SurveyError::Communication(COMMUNICATION_ERROR.to_string()));
        }
        self.write(format!("{command}{bcc}").as_bytes()).await?;
        if !matches!(self.wait_for_ack().await?, AckWait::Acked) {
            return Err(SurveyError::Communication(COMMUNICATION_ERROR.to_string()));
        }
        debug!("Azimuth set to {degrees}° {minutes}' {seconds}\"");
        Ok(())
    }

    async fn take_measurement(&self) -> Result<MeasurementOutcome> {
        self.write(MEASURE_TRIGGER_CMD).await?;
        match self.wait_for_ack().await? {
            AckWait::Canceled => return self.finish_cancel().await,
            AckWait::TimedOut => {
                return Err(SurveyError::Communication(COMMUNICATION_ERROR.to_string()))
            }
            AckWait::Acked => {}
        }
        self.write(MEASURE_READ_CMD).await?;
        match self.wait_for_ack().await? {
            AckWait::Canceled => return self.finish_cancel().await,
            AckWait::TimedOut => {
                return Err(SurveyError::Communication(COMMUNICATION_ERROR.to_string()))
            }
            AckWait::Acked => {}
        }
        let frame = match self.read_response().await? {
            None => return self.finish_cancel().await,
            Some(frame) => frame,
        };
        self.write(ACK_REPLY).await?;
        match Self::parse_measurement(&frame) {
            Ok(measurement) => Ok(MeasurementOutcome::Measured(measurement)),
            Err(problem) => {
                if self.canceled.load(Ordering::SeqCst) {
                    return self.finish_cancel().await;
                }
                // Leave the instrument in a known mode before reporting.
                if let Err(e) = self.link.write_frame(MODE_HR_CMD).await {
                    warn!("Mode reset after parse failure failed: {e:#}");
                }
                Err(SurveyError::Communication(problem))
            }
        }
    }

    fn cancel_measurement(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}
