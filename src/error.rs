//! Typed error hierarchy for mirror-bot
//!
//! Every error carries enough context to be shown to the chat that
//! requested the mirror, and says whether the failing operation may be
//! retried.

use std::path::PathBuf;
use thiserror::Error;

/// Reason reported to listeners when a user cancels a transfer
pub const CANCELED_BY_USER: &str = "Canceled by user.";

/// Main error type for the mirror core
#[derive(Debug, Error)]
pub enum MirrorError {
    /// An engine, the cloud API or a direct link could not be reached,
    /// or answered with an error status
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Download directory or payload file trouble
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// A download/upload engine rejected the request or reported a failure
    #[error("{engine}: {message}")]
    Engine {
        engine: &'static str,
        message: String,
    },

    /// Bad link, id or argument in a command
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Transfer or item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transfer already registered (duplicate torrent, duplicate NZB)
    #[error("Already registered: {0}")]
    AlreadyExists(String),

    /// The transfer is in a stage that does not allow the action
    #[error("Cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// Telegram message has no downloadable media
    #[error("Not downloadable content: {0}")]
    NotDownloadable(String),

    /// Transfer was canceled
    #[error("{}", CANCELED_BY_USER)]
    Canceled,

    /// Bot is shutting down
    #[error("Bot is shutting down")]
    Shutdown,

    /// Bot transport (Telegram API) failure
    #[error("Telegram error: {0}")]
    Transport(String),

    /// Broken invariant inside the bot
    #[error("Internal error: {0}")]
    Internal(String),
}

/// What went wrong talking to a remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Host name did not resolve
    DnsResolution,
    /// Nothing listening (engine daemon down)
    ConnectionRefused,
    /// Request or connect timed out
    Timeout,
    /// Non-success HTTP status
    HttpStatus(u16),
    /// Provider asked us to slow down (HTTP 429, Drive rate limit reasons)
    RateLimited,
    /// Redirect loop on a direct link
    TooManyRedirects,
    /// Response body did not decode
    InvalidResponse,
    Other,
}

/// What went wrong on the local filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Payload vanished before upload
    NotFound,
    PermissionDenied,
    /// Path is outside the download directory
    PathTraversal,
    AlreadyExists,
    /// I/O error
    Io,
}

impl MirrorError {
    /// Transient failures worth another attempt (timeouts, 5xx, rate limits)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Storage { kind, .. } => matches!(kind, StorageErrorKind::Io),
            _ => false,
        }
    }

    /// Check if the provider rejected the call because of rate limiting
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Self::Network {
                kind: NetworkErrorKind::RateLimited | NetworkErrorKind::HttpStatus(429),
                ..
            }
        )
    }

    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout
                | NetworkErrorKind::RateLimited
                | NetworkErrorKind::HttpStatus(429)
                | NetworkErrorKind::HttpStatus(500..=599)
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn engine(engine: &'static str, message: impl Into<String>) -> Self {
        Self::Engine {
            engine,
            message: message.into(),
        }
    }

    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

impl From<std::io::Error> for MirrorError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            _ => StorageErrorKind::Io,
        };
        Self::storage(kind, PathBuf::new(), err.to_string())
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(err: reqwest::Error) -> Self {
        let kind = match err.status() {
            Some(status) if status.as_u16() == 429 => NetworkErrorKind::RateLimited,
            Some(status) => NetworkErrorKind::HttpStatus(status.as_u16()),
            None if err.is_timeout() => NetworkErrorKind::Timeout,
            None if err.is_connect() => NetworkErrorKind::ConnectionRefused,
            None if err.is_redirect() => NetworkErrorKind::TooManyRedirects,
            None if err.is_decode() => NetworkErrorKind::InvalidResponse,
            None => NetworkErrorKind::Other,
        };
        Self::network(kind, err.to_string())
    }
}

impl From<url::ParseError> for MirrorError {
    fn from(err: url::ParseError) -> Self {
        Self::invalid_input("url", format!("not a valid link: {}", err))
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        Self::network(
            NetworkErrorKind::InvalidResponse,
            format!("Malformed engine response: {}", err),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = MirrorError::network(NetworkErrorKind::RateLimited, "userRateLimitExceeded");
        assert!(err.is_retryable());
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let err = MirrorError::network(NetworkErrorKind::HttpStatus(404), "gone");
        assert!(!err.is_retryable());
        assert!(!err.is_rate_limited());
        let err = MirrorError::network(NetworkErrorKind::HttpStatus(503), "busy");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_canceled_message() {
        assert_eq!(MirrorError::Canceled.to_string(), CANCELED_BY_USER);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        match MirrorError::from(io) {
            MirrorError::Storage { kind, .. } => assert_eq!(kind, StorageErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }
}
