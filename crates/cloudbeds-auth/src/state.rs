//! Anti-forgery state token and authorization URL
//!
//! The state token is round-tripped through the authorization redirect. It is
//! persisted by whoever starts the flow (client store or an HTTP-only cookie)
//! and consumed exactly once when the callback arrives.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;

use crate::constants::SCOPES;
use crate::error::{Error, Result};

/// An authorization redirect together with the state token embedded in it.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Generate a fresh state token: 32 random bytes, URL-safe base64 (43 chars).
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the authorization URL for the given client.
pub fn build_authorization_url(
    authorize_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
) -> Result<String> {
    let url = url::Url::parse_with_params(
        authorize_endpoint,
        &[
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", SCOPES),
            ("state", state),
        ],
    )
    .map_err(|e| Error::InvalidResponse(format!("invalid authorize endpoint: {e}")))?;
    Ok(url.into())
}

/// Check the state returned on the callback against the pending one.
///
/// `pending` must already have been removed from its store by the caller so
/// that a second callback carrying the same state fails.
pub fn verify_state(pending: Option<&str>, received: Option<&str>) -> Result<()> {
    match (pending, received) {
        (Some(expected), Some(got)) if !expected.is_empty() && expected == got => Ok(()),
        _ => Err(Error::StateMismatch),
    }
}
