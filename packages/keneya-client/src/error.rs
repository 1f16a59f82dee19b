//! Error types for the Keneya API client.

use thiserror::Error;

/// Result type for Keneya client operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Keneya client errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Configuration error (missing base URL, invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// OTP request denied by the local throttle; retry after the given
    /// number of seconds
    #[error("Too many OTP requests, retry in {retry_after}s")]
    RateLimited { retry_after: u64 },

    /// OTP verification rejected by the server
    #[error("Invalid or expired verification code")]
    InvalidCode,

    /// Network error (connection failed, timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// Refresh failed or no refresh token; the session has been cleared
    /// and the user must authenticate again
    #[error("Session expired")]
    SessionExpired,

    /// Non-2xx API response passed through unchanged (including 5xx)
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Access token claims could not be decoded
    #[error("Malformed access token: {0}")]
    MalformedToken(String),

    /// Credential store read/write failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Parse error (invalid JSON, unexpected response format)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Parse(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}
