//! Error types for token refresh and usage checks

/// Errors from token refresh and usage checks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("usage check failed: {0}")]
    UsageCheck(String),

    #[error("credential missing required field: {0}")]
    MissingField(&'static str),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
