//! Defines the custom error types for the lead-enricher application.

use std::io;
use thiserror::Error;
use url::ParseError as UrlParseError;

/// The primary error type for enrichment, storage and prediction.
#[derive(Error, Debug)]
pub(crate) enum AppError {
    /// Missing credentials, unknown storage selector or invalid settings.
    #[error("Configuration Error: {0}")]
    Config(String),

    /// The seed dataset (or another mandatory input) does not exist.
    #[error("Input Missing: {0}")]
    InputMissing(String),

    /// A backend write or transport failure. Always fatal.
    #[error("Storage Unavailable: {0}")]
    StorageUnavailable(String),

    /// `verify()` rejected a step.
    #[error("Step '{step}' precondition failed: {reason}")]
    StepPrecondition {
        /// Name of the rejected step.
        step: String,
        /// Why verification failed.
        reason: String,
    },

    /// Failure inside a step's `load_data()` or `run()`.
    #[error("Step '{step}' failed: {message}")]
    StepExecution {
        /// Name of the failing step.
        step: String,
        /// The underlying failure.
        message: String,
    },

    /// The LLM provider answered 429 after every retry attempt.
    #[error("Rate limited after {attempts} attempts")]
    RateLimited {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// A third-party API answered with something unusable.
    #[error("External API Error ({service}): {message}")]
    ExternalApi {
        /// Short name of the service.
        service: &'static str,
        /// Details about the failure.
        message: String,
    },

    /// Error related to file input/output operations.
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    /// Error during JSON serialization or deserialization.
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error reading or writing CSV.
    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),

    /// Error parsing a URL.
    #[error("URL Parsing Error: {0}")]
    UrlParse(#[from] UrlParseError),

    /// Error making HTTP requests via reqwest.
    #[error("HTTP Request Error: {0}")]
    Request(#[from] reqwest::Error),

    /// Error from the object store client.
    #[error("Object Store Error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Error parsing HTML or other scraped content.
    #[error("Parse Error: {0}")]
    Parse(String),

    /// An underlying error that doesn't fit other categories, using anyhow.
    #[error("Generic Error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl AppError {
    /// Errors that must halt the process instead of being captured per step.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Config(_) | AppError::InputMissing(_) | AppError::StorageUnavailable(_)
        )
    }

    pub(crate) fn step(step: &str, message: impl std::fmt::Display) -> Self {
        AppError::StepExecution {
            step: step.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn storage(message: impl std::fmt::Display) -> Self {
        AppError::StorageUnavailable(message.to_string())
    }
}

pub(crate) type Result<T> = std::result::Result<T, AppError>;
