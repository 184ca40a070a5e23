//! Error types for metrics computation
//!
//! Errors are classified by recoverability:
//! - Retryable: record store unreachable, timeouts, rate limits
//! - NonRetryable: bad configuration, malformed period selection
//!
//! Only errors that abort a whole run live here. Per-batch hydration
//! failures are logged and skipped inside the pipeline and never surface.

use thiserror::Error;

use crate::store::StoreError;

/// Errors that abort a single metrics run.
#[derive(Debug, Error)]
pub enum MetricsError {
    // Retryable errors
    #[error("Failed to fetch P3 meetings after {attempts} attempt(s): {source}")]
    MeetingSelection {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Metrics computation timed out after {0} seconds")]
    Timeout(u64),

    // Non-retryable errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid period selection: {0}")]
    InvalidPeriod(String),

    #[error("Invalid employee pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),
}

impl MetricsError {
    /// Returns true if running the same request again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            MetricsError::MeetingSelection { source, .. } => source.is_retryable(),
            MetricsError::Timeout(_) => true,
            MetricsError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            MetricsError::MeetingSelection { .. } => {
                "Check your connection to the record store and try again."
            }
            MetricsError::Timeout(_) => "The computation took too long. Try a narrower period.",
            MetricsError::Configuration(_) => "Check your configuration in ~/.p3metrics/config.json",
            MetricsError::InvalidPeriod(_) => "Use a month in YYYY-MM format.",
            MetricsError::InvalidPattern(_) => "Check the employee pattern is a valid regex.",
            MetricsError::Store(_) => "Check the record store logs for details.",
        }
    }
}

/// Serializable error representation for the CLI/JSON boundary
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
}

impl From<&MetricsError> for ErrorReport {
    fn from(err: &MetricsError) -> Self {
        let error_type = if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        ErrorReport {
            message: format!("Failed to load dashboard data: {err}"),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
