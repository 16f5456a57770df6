//! Fixed credentials: a known bearer token, or none at all.
//!
//! Used by the server-side pass-through, where the token arrives in a cookie
//! with the request and there is no session to refresh, and by callers that
//! only have the pre-shared API key.

use common::Secret;
use std::future::Future;
use std::pin::Pin;

use crate::AuthSource;

/// Auth source with nothing to refresh.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    token: Option<Secret<String>>,
}

impl StaticAuth {
    /// API-key fallback only.
    pub fn api_key_only() -> Self {
        Self::default()
    }

    /// Attach `token` as the bearer credential. A blank token means none.
    pub fn bearer(token: &str) -> Self {
        Self {
            token: Secret::<String>::non_empty(token),
        }
    }
}

impl AuthSource for StaticAuth {
    fn id(&self) -> &str {
        "static"
    }

    fn bearer_token(&self) -> Pin<Box<dyn Future<Output = crate::Result<Option<String>>> + Send + '_>> {
        let token = self.token.as_ref().map(|t| t.expose().clone());
        Box::pin(async move { Ok(token) })
    }

    fn report_unauthorized<'a>(&'a self, _token: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        // Nothing to invalidate: the caller owns the token.
        Box::pin(async {})
    }
}
