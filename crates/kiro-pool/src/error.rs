//! Error types for pool operations

use std::time::Duration;

/// Errors from repository, refresh and quota operations.
///
/// Availability, scoring, cooldown and fingerprint operations are infallible;
/// only persistence and the external refresh and usage calls surface errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential repository not configured: {0}")]
    NotConfigured(String),

    #[error("invalid credential id: {0}")]
    InvalidId(String),

    #[error("credential I/O error: {0}")]
    Io(String),

    #[error("credential parse error: {0}")]
    Parse(String),

    #[error("token refresh failed: {0}")]
    Refresh(#[from] kiro_auth::Error),

    #[error("quota check failed: {0}")]
    Usage(kiro_auth::Error),

    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
