//! Error types for dispatched API calls

/// Errors from a dispatched call.
///
/// `Api` and `TokenRefresh` carry the upstream status and payload verbatim.
/// `Transport` means no response was received. None are retried here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: serde_json::Value },

    #[error("API request failed: {0}")]
    Transport(String),

    /// The auth source could not produce a usable credential.
    #[error("credential unavailable: {0}")]
    Credential(String),

    /// The token endpoint failed transiently while the credential needed a
    /// refresh. The session is kept, so the call can be retried.
    #[error("token refresh failed: {body}")]
    TokenRefresh {
        status: Option<u16>,
        body: serde_json::Value,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// HTTP status to report for this error at the console boundary.
    pub fn status(&self) -> u16 {
        match self {
            Error::Api { status, .. } => *status,
            Error::Transport(_) => 502,
            Error::Credential(_) => 401,
            Error::TokenRefresh { status, .. } => status.unwrap_or(502),
            Error::InvalidRequest(_) => 400,
        }
    }

    /// Upstream payload verbatim, or `{ "message": ... }` when there was none.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Error::Api { body, .. } => body.clone(),
            Error::TokenRefresh { body, .. } if !body.is_null() => body.clone(),
            other => serde_json::json!({ "message": other.to_string() }),
        }
    }
}

/// Result alias for dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;
