//! Domain error kinds and their HTTP mapping.
//!
//! The proxy distinguishes error *kinds*, not exception types: privacy
//! rejections deliberately alias to not-found so an outside caller cannot
//! probe the catalog, and token problems carry an out-of-band `state`
//! marker so clients can tell an expired token from a malformed one.

use hyper::StatusCode;
use thiserror::Error;

/// State marker attached to token format/expiry failures.
pub const STATE_TOKEN_EXPIRED: &str = "token_expired";

/// Errors surfaced by the proxy pipeline and the registration service.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// Catalog miss, missing mode, privacy rejection, unknown node/service.
    #[error("{0}")]
    NotFound(String),

    /// Malformed registration body, netloc mismatch, unparseable token.
    #[error("{message}")]
    BadRequest {
        message: String,
        state: Option<&'static str>,
    },

    /// IP/host mismatch during registration, or bearer-token decode failure.
    #[error("{0}")]
    PermissionDenied(String),

    /// Operations/supervisor mode with no acceptable token.
    #[error("proxy authentication required")]
    ProxyAuthenticationRequired,

    /// Token validates cryptographically but its claims mismatch.
    #[error("{0}")]
    Conflict(String),

    /// Token missing required claims.
    #[error("{0}")]
    Unprocessable(String),

    /// Service has no healthy instances.
    #[error("{0}")]
    ServiceUnavailable(String),

    /// Repository or worker-thread failure.
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn not_found(message: impl Into<String>) -> Self {
        ProxyError::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ProxyError::BadRequest {
            message: message.into(),
            state: None,
        }
    }

    /// A bad-request with the `token_expired` state marker.
    pub fn token_expired(message: impl Into<String>) -> Self {
        ProxyError::BadRequest {
            message: message.into(),
            state: Some(STATE_TOKEN_EXPIRED),
        }
    }

    /// HTTP status this error renders as.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ProxyError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ProxyError::ProxyAuthenticationRequired => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            ProxyError::Conflict(_) => StatusCode::CONFLICT,
            ProxyError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProxyError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Out-of-band state marker, if any.
    pub fn state(&self) -> Option<&'static str> {
        match self {
            ProxyError::BadRequest { state, .. } => *state,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
