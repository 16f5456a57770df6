//! Authenticated request dispatch for the Cloudbeds API
//!
//! Defines the `AuthSource` trait that decouples the dispatcher from where
//! the bearer credential comes from. The session token manager resolves it
//! (waiting on an in-flight refresh when needed); `StaticAuth` covers a fixed
//! token or the API-key-only fallback.

pub mod dispatcher;
pub mod error;
pub mod static_auth;

pub use dispatcher::{ApiConfig, Dispatcher};
pub use error::{Error, Result};
pub use static_auth::StaticAuth;

use std::future::Future;
use std::pin::Pin;

/// Where the dispatcher gets its bearer credential.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn AuthSource>`).
pub trait AuthSource: Send + Sync {
    /// Identifier for logging (e.g. "session", "static")
    fn id(&self) -> &str;

    /// Bearer token to attach, or `None` to fall back to the API key.
    ///
    /// May wait for a token refresh in progress. Must never return an
    /// expired token.
    fn bearer_token(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>>;

    /// The API answered 401 to a call made with `token`.
    fn report_unauthorized<'a>(&'a self, token: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}
