//! Error types for ambisync-core.
//!
//! # Recovery policy
//!
//! | Error | Scope | Recovery |
//! |-------|-------|----------|
//! | [`Error::RemoteUnavailable`] | one device | logged, device skipped until the next pass |
//! | [`Error::StoreUnavailable`] | one device | logged, device skipped until the next pass |
//! | [`Error::DeviceTimeout`] | one device | logged, pass moves on to the next device |
//! | [`Error::MalformedRecord`] | one record | record dropped and counted, never inserted |
//! | duplicate key | one record | reported as [`InsertOutcome::Conflict`](ambisync_store::InsertOutcome), batch continues |
//! | [`Error::InvalidConfig`] | process | fix configuration and restart |
//!
//! There is no persistent retry queue. Synchronization is idempotent, so the
//! next scheduled pass re-attempts whatever window is still missing.

use thiserror::Error;

use ambisync_types::ParseError;

/// Errors produced while talking to the remote telemetry API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RemoteError {
    /// The request never produced an HTTP response.
    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    /// The remote throttled us.
    #[error("Rate limited by remote API")]
    RateLimited,

    /// The remote answered with a non-success status.
    #[error("Remote API returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body could not be decoded.
    #[error("Invalid response from remote API: {0}")]
    InvalidResponse(String),

    /// Any other failure, e.g. injected by a test double.
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport { .. } => true,
            RemoteError::RateLimited => true,
            RemoteError::Status { status, .. } => *status >= 500,
            RemoteError::InvalidResponse(_) => false,
            RemoteError::Other(_) => false,
        }
    }
}

/// Errors that can occur while synchronizing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The remote source could not be reached or refused the request.
    #[error("Remote source unavailable: {0}")]
    RemoteUnavailable(#[from] RemoteError),

    /// The record store could not be read or written.
    #[error("Record store unavailable: {0}")]
    StoreUnavailable(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// A record could not be interpreted.
    #[error("Malformed record: {0}")]
    MalformedRecord(#[from] ParseError),

    /// A device ran past its per-pass time allowance.
    #[error("Device sync exceeded {0:?}")]
    DeviceTimeout(std::time::Duration),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a store error from any error or message.
    pub fn store_unavailable(
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::StoreUnavailable(source.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

impl From<ambisync_store::Error> for Error {
    fn from(err: ambisync_store::Error) -> Self {
        Self::StoreUnavailable(Box::new(err))
    }
}

/// Result type alias using ambisync-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_transience() {
        assert!(RemoteError::RateLimited.is_transient());
        assert!(
            RemoteError::Transport {
                url: "https://example.invalid".to_string(),
                message: "connection refused".to_string(),
            }
            .is_transient()
        );
        assert!(
            RemoteError::Status {
                status: 503,
                message: "unavailable".to_string()
            }
            .is_transient()
        );
        assert!(
            !RemoteError::Status {
                status: 401,
                message: "unauthorized".to_string()
            }
            .is_transient()
        );
        assert!(!RemoteError::InvalidResponse("eof".to_string()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err: Error = RemoteError::RateLimited.into();
        assert_eq!(
            err.to_string(),
            "Remote source unavailable: Rate limited by remote API"
        );

        let err = Error::store_unavailable("disk I/O error");
        assert_eq!(err.to_string(), "Record store unavailable: disk I/O error");

        let err: Error = ParseError::MissingEpoch { field: "dateutc" }.into();
        assert!(err.to_string().contains("dateutc"));

        let err = Error::invalid_config("page_limit must be positive");
        assert!(err.to_string().contains("page_limit"));
    }

    #[test]
    fn test_store_error_conversion() {
        let store_err = ambisync_store::Error::DeviceNotFound("x".to_string());
        let err: Error = store_err.into();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
