//! Error types for OAuth exchanges and credential storage

/// Errors from OAuth exchanges and credential storage.
///
/// The exchange variants split into two classes the lifecycle manager acts on:
/// `Exchange` is terminal (the grant itself was refused, credentials must be
/// cleared), everything that failed to produce an answer is transient
/// (credentials are kept and the refresh is retried later).
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The token endpoint rejected the authorization code or refresh token:
    /// expired, already used, revoked, or a mismatched redirect URI.
    #[error("token endpoint rejected the grant ({status}): {body}")]
    Exchange { status: u16, body: serde_json::Value },

    /// The token endpoint answered but could not serve the request (408, 429, 5xx).
    #[error("token endpoint unavailable ({status}): {body}")]
    Unavailable { status: u16, body: serde_json::Value },

    /// No response: connection failure or timeout.
    #[error("token request failed: {0}")]
    Transport(String),

    /// A 2xx response whose body is not a token response.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// The `state` returned by the authorization server does not match the
    /// one issued, or none was pending.
    #[error("anti-forgery state token mismatch")]
    StateMismatch,

    #[error("credential store error: {0}")]
    Store(String),

    /// One backing was updated and the other was not.
    #[error("partial credential store write: {0}")]
    PartialStoreWrite(String),
}

impl Error {
    /// Whether the credential that produced this error is unusable for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Exchange { .. })
    }

    /// Whether retrying the same exchange later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Unavailable { .. } | Error::Transport(_) | Error::InvalidResponse(_)
        )
    }

    /// HTTP status returned by the token endpoint, if it answered.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Error::Exchange { status, .. } | Error::Unavailable { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Upstream error payload verbatim, or `{ "message": ... }` when there was none.
    pub fn upstream_payload(&self) -> serde_json::Value {
        match self {
            Error::Exchange { body, .. } | Error::Unavailable { body, .. } => body.clone(),
            other => serde_json::json!({ "message": other.to_string() }),
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
