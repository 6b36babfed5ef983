//! Application settings.
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `STAKEOUT_`-prefixed environment variables (e.g.
//! `STAKEOUT_SERIAL__PORT=/dev/ttyUSB0`). A semantic validation pass runs
//! after deserialization, so a config that parses but makes no sense is
//! rejected up front instead of failing mid-survey.
//!
//! ```toml
//! [serial]
//! # "demo" or the device path, e.g. "/dev/ttyUSB0".
//! port = "demo"
//!
//! [instrument]
//! make = "Topcon"
//! model = "GTS-300 Series"
//!
//! [backsight]
//! # Acceptable backsight variance (expected vs. measured horizontal
//! # distance), in centimeters.
//! error_limit_cm = 3.0
//!
//! [atmosphere]
//! pressure_mmhg = 760.0
//! temperature_c = 15.0
//! ```

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{Result, SurveyError};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub serial: SerialSettings,
    pub instrument: InstrumentSettings,
    pub backsight: BacksightSettings,
    pub atmosphere: AtmosphereSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialSettings {
    /// `"demo"` selects the simulated instrument.
    pub port: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentSettings {
    pub make: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BacksightSettings {
    pub error_limit_cm: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AtmosphereSettings {
    pub pressure_mmhg: f64,
    pub temperature_c: f64,
}

impl Settings {
    /// Loads settings from defaults, an optional config file, and the
    /// environment, then validates them.
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("serial.port", "demo")?
            .set_default("instrument.make", "Topcon")?
            .set_default("instrument.model", "GTS-300 Series")?
            .set_default("backsight.error_limit_cm", 3.0)?
            .set_default("atmosphere.pressure_mmhg", 760.0)?
            .set_default("atmosphere.temperature_c", 15.0)?;
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(Environment::with_prefix("STAKEOUT").separator("__"));
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.serial.port.trim().is_empty() {
            problems.push("No serial port was given. Set it to “demo” or the device path.".to_string());
        }
        if !self.backsight.error_limit_cm.is_finite() || self.backsight.error_limit_cm <= 0.0 {
            problems.push(format!(
                "The backsight error limit ({}cm) must be greater than zero.",
                self.backsight.error_limit_cm
            ));
        }
        problems.extend(crate::session::validate_atmosphere(
            self.atmosphere.pressure_mmhg,
            self.atmosphere.temperature_c,
        ));
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SurveyError::Validation(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_select_the_demo_instrument() {
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.serial.port, "demo");
        assert_eq!(settings.instrument.make, "Topcon");
        assert_eq!(settings.instrument.model, "GTS-300 Series");
        assert_eq!(settings.backsight.error_limit_cm, 3.0);
        assert_eq!(settings.atmosphere.pressure_mmhg, 760.0);
        assert_eq!(settings.atmosphere.temperature_c, 15.0);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[serial]\nport = \"/dev/ttyUSB0\"\n\n[backsight]\nerror_limit_cm = 5.0"
        )
        .unwrap();
        let settings = Settings::new(file.path().to_str()).unwrap();
        assert_eq!(settings.serial.port, "/dev/ttyUSB0");
        assert_eq!(settings.backsight.error_limit_cm, 5.0);
        // Untouched sections keep their defaults.
        assert_eq!(settings.instrument.make, "Topcon");
    }

    #[test]
    fn nonsense_values_fail_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[serial]\nport = \"\"\n\n[backsight]\nerror_limit_cm = -1.0\n\n[atmosphere]\npressure_mmhg = 1013.0"
        )
        .unwrap();
        let err = Settings::new(file.path().to_str()).unwrap_err();
        let problems = err.problems();
        assert_eq!(problems.len(), 3);
        assert!(problems[0].contains("serial port"));
        assert!(problems[1].contains("backsight error limit"));
        assert!(problems[2].contains("pressure"));
    }
}
