//! Error taxonomy for backend implementations.

use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

/// What went wrong inside a backend, classified by how the caller should
/// react rather than by where it happened.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend's settings are wrong. Init must not be retried until
    /// a human fixes the configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A transient fault (network hiccup, worker crash). Retry is
    /// reasonable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The machine or environment under the backend is broken (process
    /// spawn failure, out of disk). Retry may help after operator action.
    #[error("infrastructure failure: {0}")]
    Infra(String),

    /// The backend cannot serve this particular job.
    #[error("unsupported request: {0}")]
    Unsupported(String),

    /// A remote session token was rejected. Callers re-open the session
    /// and retry once before surfacing the failure.
    #[error("remote session expired")]
    SessionExpired,
}

impl BackendError {
    /// Config errors are permanent; everything else may clear on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackendError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_not_retryable() {
        assert!(!BackendError::Config("bad port".into()).is_retryable());
        assert!(BackendError::Transient("timeout".into()).is_retryable());
        assert!(BackendError::Infra("no disk".into()).is_retryable());
        assert!(BackendError::SessionExpired.is_retryable());
    }
}
