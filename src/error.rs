//! Error types for the survey controller.
//!
//! `SurveyError` is the single error type surfaced by every driver, math,
//! and workflow operation. Each variant carries human-readable problem
//! text suitable for display to the surveyor:
//!
//! - **`Validation`**: input rejected before any hardware or persistence
//!   action (out-of-range angles, duplicate stations, bad offsets). Carries
//!   an ordered list of problems so a caller sees every bad field at once.
//! - **`Communication`**: the instrument did not acknowledge or returned a
//!   malformed frame. Retryable.
//! - **`State`**: an operation was invoked outside its required workflow
//!   state (a shot without an open grouping, a save without a staged shot).
//! - **`Persistence`**: the backing store rejected a read or write. Not
//!   auto-retried.
//! - **`Config`**: configuration file or environment parsing failed.
//!
//! A canceled measurement is deliberately NOT an error; see
//! [`crate::instruments::MeasurementOutcome`].

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, SurveyError>;

#[derive(Error, Debug)]
pub enum SurveyError {
    #[error("Validation failed: {}", .0.join(" "))]
    Validation(Vec<String>),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl SurveyError {
    /// A validation failure with a single problem description.
    pub fn validation(problem: impl Into<String>) -> Self {
        SurveyError::Validation(vec![problem.into()])
    }

    /// The ordered problem descriptions carried by this error.
    pub fn problems(&self) -> Vec<String> {
        match self {
            SurveyError::Validation(problems) => problems.clone(),
            other => vec![other.to_string()],
        }
    }
}
