//! Error types for the token lifecycle

/// Errors from credential resolution and authorization.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] cloudbeds_auth::Error),

    /// The refresh failed transiently and the cached credential has already
    /// expired, so there is nothing usable to hand out.
    #[error("token refresh failed: {0}")]
    RefreshFailed(#[source] cloudbeds_auth::Error),

    /// The refresh task ended without publishing an outcome.
    #[error("token refresh aborted")]
    RefreshAborted,
}

/// Result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
