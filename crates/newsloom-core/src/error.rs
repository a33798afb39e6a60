use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Closed classification of everything that can go wrong while scraping.
///
/// Every [`AppError`] maps onto exactly one kind; retry decisions are made
/// on the kind, never on the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimited,
    Timeout,
    Parsing,
    Auth,
    Server,
    Client,
    Unknown,
}

impl ErrorKind {
    /// Classify an HTTP status code. Success codes classify as `Unknown`.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimited,
            401 | 403 => ErrorKind::Auth,
            408 => ErrorKind::Timeout,
            400..=499 => ErrorKind::Client,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::RateLimited | ErrorKind::Timeout | ErrorKind::Server
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Parsing => "parsing",
            ErrorKind::Auth => "auth",
            ErrorKind::Server => "server",
            ErrorKind::Client => "client",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-wide error types for newsloom.
#[derive(Error, Debug)]
pub enum AppError {
    /// Connection, DNS or transport failure.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The remote answered HTTP 429.
    #[error("Rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },

    /// Operation exceeded its deadline.
    #[error("Operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Feed, JSON or HTML payload could not be parsed.
    #[error("Parsing error: {0}")]
    ParsingError(String),

    /// Missing or rejected credentials (HTTP 401/403).
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// HTTP 5xx.
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// HTTP 4xx other than 429 and auth failures.
    #[error("Client error (HTTP {status}): {message}")]
    ClientError { status: u16, message: String },

    /// Every attempt failed; carries the last classified error.
    #[error("Final attempt {attempts} failed: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },

    /// A debounced call was replaced by a newer one before it ran.
    #[error("Superseded by a newer call")]
    Superseded,

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Adapter is disabled (for example, its API key is not configured).
    #[error("Adapter '{0}' is disabled")]
    Disabled(String),

    /// The adapter's circuit breaker is rejecting calls.
    #[error("Circuit for '{name}' is open, retry after {}s", .retry_after.as_secs())]
    CircuitOpen { name: String, retry_after: Duration },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Anything that does not fit elsewhere.
    #[error("{0}")]
    Unknown(String),
}

impl AppError {
    /// Build the error matching an unsuccessful HTTP status.
    pub fn from_status(status: u16, url: &str, retry_after: Option<Duration>) -> Self {
        let message = format!("HTTP {status} for {url}");
        match ErrorKind::from_status(status) {
            ErrorKind::RateLimited => AppError::RateLimited {
                url: url.to_string(),
                retry_after,
            },
            ErrorKind::Auth => AppError::AuthError(message),
            ErrorKind::Timeout => AppError::Timeout(Duration::ZERO),
            ErrorKind::Client => AppError::ClientError { status, message },
            ErrorKind::Server => AppError::ServerError { status, message },
            _ => AppError::Unknown(message),
        }
    }

    /// Map this error onto the closed taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NetworkError(_) => ErrorKind::Network,
            AppError::RateLimited { .. } => ErrorKind::RateLimited,
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::ParsingError(_) | AppError::SerializationError(_) => ErrorKind::Parsing,
            AppError::AuthError(_) => ErrorKind::Auth,
            AppError::ServerError { .. } => ErrorKind::Server,
            AppError::ClientError { .. } => ErrorKind::Client,
            AppError::RetriesExhausted { source, .. } => source.kind(),
            AppError::CircuitOpen { .. } => ErrorKind::Network,
            AppError::Superseded
            | AppError::Cancelled
            | AppError::Disabled(_)
            | AppError::Config(_)
            | AppError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    ///
    /// An exhausted retry chain is final even when the underlying kind
    /// would normally be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::RetriesExhausted { .. } | AppError::CircuitOpen { .. } => false,
            other => other.kind().is_retryable(),
        }
    }

    /// Returns true if this error should count against an adapter's circuit.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::RetriesExhausted { source, .. } => source.should_trip_circuit(),
            AppError::CircuitOpen { .. } => false,
            other => other.kind().is_retryable(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind() == ErrorKind::RateLimited
    }

    /// Server-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::RateLimited { retry_after, .. } => *retry_after,
            AppError::RetriesExhausted { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// Wrap this error as the outcome of the final attempt.
    pub fn into_final(self, attempts: u32) -> Self {
        match self {
            already @ AppError::RetriesExhausted { .. } => already,
            other => AppError::RetriesExhausted {
                attempts,
                source: Box::new(other),
            },
        }
    }
}

/// Classify an error onto the closed taxonomy.
pub fn classify(error: &AppError) -> ErrorKind {
    error.kind()
}

/// A per-adapter failure recorded in a [`ScrapingResult`](crate::models::ScrapingResult).
#[derive(Debug, Clone, Serialize)]
pub struct ScrapingError {
    pub source_id: String,
    pub source_name: String,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub occurred_at: DateTime<Utc>,
}

impl ScrapingError {
    pub fn new(source_id: impl Into<String>, source_name: impl Into<String>, error: &AppError) -> Self {
        Self {
            source_id: source_id.into(),
            source_name: source_name.into(),
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.kind().is_retryable(),
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimited);
        assert_eq!(ErrorKind::from_status(404), ErrorKind::Client);
        assert_eq!(ErrorKind::from_status(401), ErrorKind::Auth);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::Auth);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::Server);
    }

    #[test]
    fn test_rate_limit_is_retryable_not_found_is_not() {
        let rate_limited = AppError::from_status(429, "https://example.com", None);
        let not_found = AppError::from_status(404, "https://example.com", None);
        assert_eq!(classify(&rate_limited), ErrorKind::RateLimited);
        assert!(rate_limited.is_retryable());
        assert_eq!(classify(&not_found), ErrorKind::Client);
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(
            AppError::ServerError {
                status: 502,
                message: "bad gateway".into(),
            }
            .is_retryable()
        );
        assert!(!AppError::ParsingError("bad xml".into()).is_retryable());
        assert!(!AppError::AuthError("no key".into()).is_retryable());
        assert!(!AppError::Unknown("?".into()).is_retryable());
    }

    #[test]
    fn test_final_attempt_keeps_kind_but_stops_retrying() {
        let err = AppError::NetworkError("reset".into()).into_final(4);
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!err.is_retryable());
        assert!(err.should_trip_circuit());
        assert!(err.to_string().starts_with("Final attempt 4"));

        // Wrapping twice keeps the original attempt count.
        let again = err.into_final(9);
        assert!(matches!(again, AppError::RetriesExhausted { attempts: 4, .. }));
    }

    #[test]
    fn test_orchestration_errors_are_unknown() {
        assert_eq!(AppError::Superseded.kind(), ErrorKind::Unknown);
        assert_eq!(AppError::Cancelled.kind(), ErrorKind::Unknown);
        assert!(!AppError::Superseded.is_retryable());
    }

    #[test]
    fn test_scraping_error_record() {
        let err = AppError::from_status(500, "https://example.com/feed", None);
        let record = ScrapingError::new("hn", "Hacker News", &err);
        assert_eq!(record.kind, ErrorKind::Server);
        assert!(record.retryable);
        assert!(record.message.contains("500"));
    }
}
