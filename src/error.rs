//! Unified error handling for the travel-analyzer library.
//!
//! One error enum covers the whole pipeline so callers can match on the
//! category that matters to them: fatal input problems, geocoding failures
//! that the resolver handles internally, cache degradation, and cancellation.

use std::fmt;

/// Unified error type for travel-analyzer operations.
#[derive(Debug, Clone)]
pub enum AnalyzerError {
    /// A source record is unparseable or missing a required field.
    /// Fatal: aborts the run and reports the offending record index.
    MalformedInput {
        record_index: usize,
        message: String,
    },
    /// A geocode lookup failed for a reason worth retrying (timeout, 5xx).
    GeocodeTransient { message: String },
    /// The geocoding service asked us to slow down.
    GeocodeRateLimited,
    /// The persistent cache could not be reached. Non-fatal: the resolver
    /// falls back to treating every lookup as a miss.
    CacheUnavailable { message: String },
    /// An external cancellation signal stopped the run early.
    Cancelled,
    /// Generic internal error.
    Internal { message: String },
}

impl fmt::Display for AnalyzerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalyzerError::MalformedInput {
                record_index,
                message,
            } => {
                write!(f, "Malformed record at index {}: {}", record_index, message)
            }
            AnalyzerError::GeocodeTransient { message } => {
                write!(f, "Transient geocoding error: {}", message)
            }
            AnalyzerError::GeocodeRateLimited => {
                write!(f, "Geocoding service rate limit exceeded")
            }
            AnalyzerError::CacheUnavailable { message } => {
                write!(f, "Geocode cache unavailable: {}", message)
            }
            AnalyzerError::Cancelled => {
                write!(f, "Run cancelled by caller")
            }
            AnalyzerError::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for AnalyzerError {}

impl From<rusqlite::Error> for AnalyzerError {
    fn from(err: rusqlite::Error) -> Self {
        AnalyzerError::CacheUnavailable {
            message: err.to_string(),
        }
    }
}

/// Result type alias for travel-analyzer operations.
pub type Result<T> = std::result::Result<T, AnalyzerError>;

/// Extension trait for converting Option to AnalyzerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a malformed-input error at a record index.
    fn ok_or_malformed(self, record_index: usize, message: &str) -> Result<T>;

    /// Convert Option to Result with a generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_malformed(self, record_index: usize, message: &str) -> Result<T> {
        self.ok_or_else(|| AnalyzerError::MalformedInput {
            record_index,
            message: message.to_string(),
        })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| AnalyzerError::Internal {
            message: message.to_string(),
        })
    }
}
