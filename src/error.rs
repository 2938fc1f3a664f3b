use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{HttpError, KvError};
use crate::config::ConfigError;
use crate::executor::RequestError;
use crate::image_cache::CacheError;
use crate::offline_queue::QueueError;
use crate::token::TokenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

/// Failure taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Device offline. Fails fast, no retry consumed.
    NoConnectivity,
    /// Request sent but no response received.
    TransportFailure,
    /// Response received with an error status.
    ServerError,
    /// Download or filesystem error in the image cache.
    CacheFailure,
    /// Missing refresh credential or failed refresh.
    TokenRefreshFailure,
    /// Durable storage read/write error.
    QueuePersistenceFailure,
    Configuration,
    InvalidRequest,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NoConnectivity => "NO_CONNECTIVITY",
            Self::TransportFailure => "TRANSPORT_FAILURE",
            Self::ServerError => "SERVER_ERROR",
            Self::CacheFailure => "CACHE_FAILURE",
            Self::TokenRefreshFailure => "TOKEN_REFRESH_FAILURE",
            Self::QueuePersistenceFailure => "QUEUE_PERSISTENCE_FAILURE",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::NoConnectivity
            | Self::TransportFailure
            | Self::CacheFailure
            | Self::QueuePersistenceFailure => ErrorSeverity::Transient,

            Self::ServerError | Self::TokenRefreshFailure | Self::InvalidRequest => {
                ErrorSeverity::Permanent
            }

            Self::Configuration => ErrorSeverity::Fatal,
        }
    }

    /// Only transport failures are retried by the request executor.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::TransportFailure)
    }

    #[must_use]
    pub fn user_facing_message(self) -> &'static str {
        match self {
            Self::NoConnectivity => {
                "You appear to be offline. Please check your internet connection."
            }
            Self::TransportFailure => "Unable to connect to the server. Please try again later.",
            Self::ServerError => "The server could not complete the request.",
            Self::CacheFailure => "Unable to load the image.",
            Self::TokenRefreshFailure => "Your session has expired. Please sign in again.",
            Self::QueuePersistenceFailure => "Unable to save your changes for later.",
            Self::Configuration => "The app is misconfigured. Please contact support.",
            Self::InvalidRequest => "The request could not be sent.",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("validation error: {0}")]
pub struct ValidationError(String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Umbrella error for the facade.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("request error: {0}")]
    Request(#[from] RequestError),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Config(_) => ErrorKind::Configuration,
            CoreError::Request(e) => e.kind(),
            CoreError::Http(e) => e.kind(),
            CoreError::Kv(_) => ErrorKind::QueuePersistenceFailure,
            CoreError::Cache(_) => ErrorKind::CacheFailure,
            CoreError::Queue(_) => ErrorKind::QueuePersistenceFailure,
            CoreError::Token(_) => ErrorKind::TokenRefreshFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let kinds = [
            ErrorKind::NoConnectivity,
            ErrorKind::TransportFailure,
            ErrorKind::ServerError,
            ErrorKind::CacheFailure,
            ErrorKind::TokenRefreshFailure,
            ErrorKind::QueuePersistenceFailure,
            ErrorKind::Configuration,
            ErrorKind::InvalidRequest,
        ];
        let codes: std::collections::HashSet<_> = kinds.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_only_transport_failures_retry() {
        assert!(ErrorKind::TransportFailure.is_retryable());
        assert!(!ErrorKind::NoConnectivity.is_retryable());
        assert!(!ErrorKind::ServerError.is_retryable());
    }

    #[test]
    fn test_severity_defaults() {
        assert_eq!(
            ErrorKind::NoConnectivity.default_severity(),
            ErrorSeverity::Transient
        );
        assert_eq!(
            ErrorKind::Configuration.default_severity(),
            ErrorSeverity::Fatal
        );
    }
}
