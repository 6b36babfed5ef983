//! Simulated total station for running without hardware.
//!
//! The demo station validates inputs exactly like the real drivers, sleeps
//! through a cancelable "measuring" delay, and returns jittered readings
//! around a fixed point, so the whole workflow can be exercised end to end
//! with `port = "demo"`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;

use crate::error::Result;
use crate::geodesy::round_mm;
use crate::instruments::{validate_angle, MeasurementOutcome, RawMeasurement, TotalStation};

pub struct DemoTotalStation {
    canceled: AtomicBool,
    measuring_delay: Duration,
}

impl Default for DemoTotalStation {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoTotalStation {
    pub fn new() -> Self {
        Self::with_delay(Duration::from_secs(4))
    }

    /// Demo station with a custom measuring delay, for tests.
    pub fn with_delay(measuring_delay: Duration) -> Self {
        Self {
            canceled: AtomicBool::new(false),
            measuring_delay,
        }
    }
}

#[async_trait]
impl TotalStation for DemoTotalStation {
    fn name(&self) -> &str {
        "Demo"
    }

    async fn set_mode_hr(&self) -> Result<()> {
        debug!("Demo: mode set to Horizontal Right");
        Ok(())
    }

    async fn set_azimuth(&self, degrees: u32, minutes: u32, seconds: u32) -> Result<()> {
        validate_angle(degrees, minutes, seconds)?;
        debug!("Demo: azimuth set to {degrees}° {minutes}' {seconds}\"");
        Ok(())
    }

    async fn take_measurement(&self) -> Result<MeasurementOutcome> {
        // Consume the hardware delay in slices so a cancel lands promptly.
        let slice = Duration::from_millis(50).min(self.measuring_delay);
        let slices = (self.measuring_delay.as_millis() / slice.as_millis().max(1)).max(1);
        for _ in 0..slices {
            if self.canceled.swap(false, Ordering::SeqCst) {
                debug!("Demo: measurement canceled by user");
                return Ok(MeasurementOutcome::Canceled);
            }
            tokio::time::sleep(slice).await;
        }
        let mut rng = rand::thread_rng();
        let measurement = RawMeasurement {
            delta_n: round_mm((496_337.0 + rng.gen_range(-50_000.0..=50_000.0)) / 10_000.0),
            delta_e: round_mm((311_930.0 + rng.gen_range(-50_000.0..=50_000.0)) / 10_000.0),
            delta_z: round_mm((95_802.0 + rng.gen_range(-10_000.0..=10_000.0)) / 10_000.0),
        };
        Ok(MeasurementOutcome::Measured(measurement))
    }

    fn cancel_measurement(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}
