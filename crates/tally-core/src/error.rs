use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error types for Tally.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A save kept losing the optimistic-concurrency race.
    #[error("Unrecoverable save conflict for item {tiid}")]
    Conflict { tiid: String },

    /// The referenced item does not exist.
    #[error("Item not found: {0}")]
    NotFound(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// HTTP client could not be built or used.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Conflict { .. } => true,
            AppError::DatabaseError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }
}

/// The closed set of recoverable provider failures.
///
/// Providers map their internal failures into one of these at their boundary;
/// the retry engine only ever switches on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    HttpTimeout,
    RateLimitReached,
    HttpError,
    /// HTTP 4xx/5xx or provider misconfiguration.
    ClientServerError,
    ContentMalformed,
    ValidationFailed,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::HttpTimeout,
        ErrorKind::RateLimitReached,
        ErrorKind::HttpError,
        ErrorKind::ClientServerError,
        ErrorKind::ContentMalformed,
        ErrorKind::ValidationFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::HttpTimeout => "http_timeout",
            ErrorKind::RateLimitReached => "rate_limit_reached",
            ErrorKind::HttpError => "http_error",
            ErrorKind::ClientServerError => "client_server_error",
            ErrorKind::ContentMalformed => "content_malformed",
            ErrorKind::ValidationFailed => "validation_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown error kind: {}", s))
    }
}

/// Failure returned by a provider capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider does not offer this capability. Not a failure.
    #[error("capability not implemented")]
    NotImplemented,

    /// One of the classified, retryable failures.
    #[error("{kind}: {message}")]
    Recoverable { kind: ErrorKind, message: String },

    /// Anything the provider could not classify. Never retried.
    #[error("unclassified provider failure: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ProviderError::Recoverable {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HttpTimeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimitReached, message)
    }

    pub fn http(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HttpError, message)
    }

    pub fn client_server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientServerError, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContentMalformed, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationFailed, message)
    }

    /// The classified kind, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ProviderError::Recoverable { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::malformed(err.to_string())
    }
}
