//! Error types for authentication and rate limiting.
//!
//! "No credential presented" is not an error: it is the anonymous path and is
//! modelled as `None` by the extractor and the service.

use std::fmt;

use http::StatusCode;

/// Errors surfaced by the auth subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The credential could not be verified.
    ///
    /// Bad signatures, expired tokens, stale HMAC timestamps and unknown keys
    /// all collapse into this one variant so callers cannot tell them apart.
    VerificationFailed,

    /// The caller exhausted its tier quota for the current window.
    RateLimited {
        /// Seconds until the current window resets.
        retry_after_secs: u64,
    },

    /// The cache or identity store could not be reached.
    BackendUnavailable(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerificationFailed => write!(f, "Authentication failed"),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "Rate limit exceeded, retry after {}s", retry_after_secs)
            }
            Self::BackendUnavailable(msg) => write!(f, "Backend unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// Result type for auth operations.
pub type AuthResult<T> = Result<T, AuthError>;

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

impl AuthError {
    /// Create a rate-limited error.
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::RateLimited { retry_after_secs }
    }

    /// HTTP status a caller should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::VerificationFailed => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Machine-readable error code, safe to expose to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::VerificationFailed => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::BackendUnavailable(_) => "unavailable",
        }
    }
}
