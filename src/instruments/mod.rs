//! Total station drivers.
//!
//! The [`TotalStation`] trait is the seam between the survey workflow and
//! the instrument on the other end of the serial cable. Concrete drivers
//! (the Topcon GTS-300 series, the demo simulator) are chosen at startup
//! through an [`InstrumentRegistry`] keyed by make and model strings; there
//! is no runtime module loading.
//!
//! The physical instrument accepts one command at a time, so every driver
//! method takes `&self` with interior mutability and callers are expected
//! to serialize access, with the one deliberate exception of
//! [`TotalStation::cancel_measurement`], which only raises a flag and is
//! safe to call while a measurement is in flight.

pub mod demo;
pub mod serial_link;
pub mod topcon;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{Result, SurveyError};

/// Raw instrument deltas relative to the instrument at the origin, in
/// meters, rounded to millimeters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurement {
    pub delta_n: f64,
    pub delta_e: f64,
    pub delta_z: f64,
}

/// The result of a measurement request.
///
/// Cancellation is not an error: the operator asked for it, the driver is
/// ready for the next command, and the caller simply gets no reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MeasurementOutcome {
    Measured(RawMeasurement),
    Canceled,
}

/// A survey total station.
#[async_trait]
pub trait TotalStation: Send + Sync {
    /// Human-readable driver name, e.g. `"Topcon GTS-300 Series"`.
    fn name(&self) -> &str;

    /// Puts the instrument in V/H mode with Horizontal Right.
    async fn set_mode_hr(&self) -> Result<()>;

    /// Sets the azimuth reading on the horizontal circle.
    async fn set_azimuth(&self, degrees: u32, minutes: u32, seconds: u32) -> Result<()>;

    /// Triggers a distance measurement and reads the result. Suspends for
    /// the instrument's measuring delay (several seconds) and returns
    /// [`MeasurementOutcome::Canceled`] promptly if the operator cancels.
    async fn take_measurement(&self) -> Result<MeasurementOutcome>;

    /// Flags an in-flight measurement for cancellation. Returns
    /// immediately; the measurement itself observes the flag.
    fn cancel_measurement(&self);
}

impl std::fmt::Debug for dyn TotalStation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TotalStation")
            .field("name", &self.name())
            .finish()
    }
}

/// Validates a D/M/S angle, aggregating every out-of-range field.
pub(crate) fn validate_angle(degrees: u32, minutes: u32, seconds: u32) -> Result<()> {
    let mut problems = Vec::new();
    if degrees > 359 {
        problems.push(format!(
            "Degrees entered ({degrees}) is out of range (0 to 359)."
        ));
    }
    if minutes > 59 {
        problems.push(format!(
            "Minutes entered ({minutes}) is out of range (0 to 59)."
        ));
    }
    if seconds > 59 {
        problems.push(format!(
            "Seconds entered ({seconds}) is out of range (0 to 59)."
        ));
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(SurveyError::Validation(problems))
    }
}

type DriverFactory = Box<dyn Fn(&Settings) -> Result<Arc<dyn TotalStation>> + Send + Sync>;

/// Registry of total station drivers keyed by normalized (make, model).
///
/// `create` picks the demo simulator when the configured port is `"demo"`,
/// otherwise it builds the registered hardware driver for the configured
/// make and model.
pub struct InstrumentRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        #[allow(unused_mut)]
        let mut factories: HashMap<String, DriverFactory> = HashMap::new();

        #[cfg(feature = "instrument_serial")]
        factories.insert(
            driver_key("Topcon", "GTS-300 Series"),
            Box::new(|settings: &Settings| {
                let link = serial_link::SerialFrameLink::open_7e1(
                    &settings.serial.port,
                    topcon::gts_300_series::BAUD_RATE,
                )
                .map_err(|e| SurveyError::Communication(format!("{e:#}")))?;
                Ok(Arc::new(topcon::gts_300_series::Gts300Series::new(Box::new(link)))
                    as Arc<dyn TotalStation>)
            }),
        );

        Self { factories }
    }

    /// Registers (or replaces) the factory for a make/model pair.
    pub fn register<F>(&mut self, make: &str, model: &str, factory: F)
    where
        F: Fn(&Settings) -> Result<Arc<dyn TotalStation>> + Send + Sync + 'static,
    {
        self.factories.insert(driver_key(make, model), Box::new(factory));
    }

    /// Builds the driver selected by the settings.
    pub fn create(&self, settings: &Settings) -> Result<Arc<dyn TotalStation>> {
        if settings.serial.port == "demo" {
            return Ok(Arc::new(demo::DemoTotalStation::new()));
        }
        let key = driver_key(&settings.instrument.make, &settings.instrument.model);
        let factory = self.factories.get(&key).ok_or_else(|| {
            SurveyError::validation(format!(
                "There is no driver for the {} {} total station. Specify the correct total station make and model before proceeding.",
                settings.instrument.make, settings.instrument.model
            ))
        })?;
        factory(settings)
    }
}

/// Normalizes a make/model pair into a registry key. All Topcon GTS-300
/// series stations share one communications protocol, so any `GTS-30x`
/// model resolves to the series driver.
fn driver_key(make: &str, model: &str) -> String {
    let make = normalize(make);
    let mut model = normalize(model);
    if make == "topcon" && model.starts_with("gts_30") {
        model = "gts_300_series".to_string();
    }
    format!("{make}/{model}")
}

fn normalize(value: &str) -> String {
    value
        .trim()
        .to_ascii_lowercase()
        .replace([' ', '-'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn angle_validation_names_every_offending_field() {
        let err = validate_angle(360, 60, 75).unwrap_err();
        let problems = err.problems();
        assert_eq!(problems.len(), 3);
        assert_eq!(problems[0], "Degrees entered (360) is out of range (0 to 359).");
        assert_eq!(problems[1], "Minutes entered (60) is out of range (0 to 59).");
        assert_eq!(problems[2], "Seconds entered (75) is out of range (0 to 59).");
        assert!(validate_angle(359, 59, 59).is_ok());
        assert!(validate_angle(0, 0, 0).is_ok());
    }

    #[test]
    fn gts_300_models_share_one_driver_key() {
        assert_eq!(
            driver_key("Topcon", "GTS-300 Series"),
            driver_key("topcon", "GTS-303")
        );
        assert_eq!(
            driver_key("Topcon", "GTS-300 Series"),
            "topcon/gts_300_series"
        );
        assert_ne!(driver_key("Topcon", "GTS-300"), driver_key("Sokkia", "GTS-300"));
    }

    #[test]
    fn demo_port_selects_the_simulator() {
        let settings = Settings::new(None).unwrap();
        let registry = InstrumentRegistry::new();
        let station = registry.create(&settings).unwrap();
        assert_eq!(station.name(), "Demo");
    }

    #[test]
    fn unknown_model_is_rejected() {
        let mut settings = Settings::new(None).unwrap();
        settings.serial.port = "/dev/ttyUSB0".to_string();
        settings.instrument.make = "Acme".to_string();
        settings.instrument.model = "Theodolite 9000".to_string();
        let err = InstrumentRegistry::new().create(&settings).unwrap_err();
        assert!(err.to_string().contains("There is no driver"));
    }
}
