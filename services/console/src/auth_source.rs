//! Session-backed credential source for the dispatcher
//!
//! Resolves the bearer token through the token manager, so a call made while
//! the credential is expiring waits for the single refresh episode instead of
//! going out with a stale token.

use dispatch::{AuthSource, Error};
use std::future::Future;
use std::pin::Pin;
use token_lifecycle::TokenManager;

/// `AuthSource` over the local session.
pub struct SessionAuth {
    manager: TokenManager,
}

impl SessionAuth {
    pub fn new(manager: TokenManager) -> Self {
        Self { manager }
    }
}

/// Transient token-endpoint failures keep their upstream status and payload;
/// the session survives them. Anything else means no usable credential.
fn dispatch_error(err: token_lifecycle::Error) -> Error {
    match err {
        token_lifecycle::Error::RefreshFailed(source) | token_lifecycle::Error::Auth(source)
            if source.is_transient() =>
        {
            Error::TokenRefresh {
                status: source.upstream_status(),
                body: source.upstream_payload(),
            }
        }
        token_lifecycle::Error::RefreshAborted => Error::TokenRefresh {
            status: None,
            body: serde_json::Value::Null,
        },
        other => Error::Credential(other.to_string()),
    }
}

impl AuthSource for SessionAuth {
    fn id(&self) -> &str {
        "session"
    }

    fn bearer_token(&self) -> Pin<Box<dyn Future<Output = dispatch::Result<Option<String>>> + Send + '_>> {
        Box::pin(async move {
            let credential = self.manager.valid_credential().await.map_err(dispatch_error)?;
            Ok(credential.map(|c| c.access_token))
        })
    }

    fn report_unauthorized<'a>(&'a self, token: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.manager.report_unauthorized(token))
    }
}
