//! Agent error types.

use std::time::Duration;

use skyproxy_core::ValidationError;
use skyproxy_storage::StorageError;
use thiserror::Error;

use crate::protocol::FailureReason;

/// Errors raised by a proxy settings sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The settings tool could not be run.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The settings tool ran but reported failure.
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    /// The current host configuration has no [`ProxyConfig`](skyproxy_core::ProxyConfig) equivalent.
    #[error("unsupported proxy configuration: {0}")]
    Unsupported(String),

    /// Output or stored value could not be understood.
    #[error("invalid proxy settings: {0}")]
    Invalid(String),

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by a key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The blocking storage task was cancelled or panicked.
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Errors raised by a connectivity probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connectivity test timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("no proxy configured")]
    NoProxy,
}

impl ProbeError {
    /// Returns the failure reason reported over the message protocol.
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Timeout(_) => FailureReason::Timeout,
            Self::Connection(_) => FailureReason::Connection,
            Self::InvalidResponse(_) => FailureReason::InvalidResponse,
            Self::NoProxy => FailureReason::NoProxy,
        }
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Connection(e.to_string())
        }
    }
}

/// Errors raised by profile controller operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The sink rejected a configuration. Persisted state is untouched.
    #[error("failed to apply proxy settings: {0}")]
    Apply(String),

    /// The current configuration could not be read before a test.
    #[error("failed to read current proxy settings: {0}")]
    Snapshot(String),

    #[error("a connectivity test is already in progress")]
    TestInProgress,

    #[error("connectivity test timed out")]
    TestTimedOut,

    /// The caller stopped waiting; the previous settings were still restored.
    #[error("connectivity test cancelled")]
    TestCancelled,

    #[error("connectivity test failed ({reason}): {message}")]
    TestFailed {
        reason: FailureReason,
        message: String,
    },

    /// The configuration in effect before a test could not be put back.
    #[error("failed to restore proxy settings after test: {0}")]
    RestoreFailed(String),

    #[error("no profile at index {0}")]
    ProfileNotFound(usize),

    #[error("no profiles configured")]
    NoProfiles,

    /// The background answered with a response of the wrong shape.
    #[error("unexpected response to {0}")]
    Protocol(&'static str),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_error_reasons() {
        assert_eq!(
            ProbeError::Timeout(Duration::from_secs(10)).reason(),
            FailureReason::Timeout
        );
        assert_eq!(
            ProbeError::Connection("refused".into()).reason(),
            FailureReason::Connection
        );
        assert_eq!(
            ProbeError::InvalidResponse("no ip".into()).reason(),
            FailureReason::InvalidResponse
        );
        assert_eq!(ProbeError::NoProxy.reason(), FailureReason::NoProxy);
    }

    #[test]
    fn test_timeout_message() {
        let err = ProbeError::Timeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "connectivity test timed out after 10s");
    }
}
