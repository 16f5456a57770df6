//! Cloudbeds OAuth authentication library
//!
//! Authorization-code grant against the Cloudbeds token endpoint, plus the
//! two places a credential lives once issued: the client-readable store (a
//! JSON document mirroring browser local storage) and the server-only store
//! (three cookies, the token pair HTTP-only).
//!
//! Credential flow:
//! 1. `OAuthClient::build_authorization_url()` mints a single-use state token
//! 2. The user authorizes and is redirected back with `code` + `state`
//! 3. `state::verify_state()` consumes the persisted state token
//! 4. `OAuthClient::exchange_code()` turns the code into a `Credential`
//! 5. `CredentialStore::save()` writes the server-only store, then the client store
//! 6. The lifecycle manager calls `OAuthClient::refresh_token()` before expiry

pub mod constants;
pub mod cookies;
pub mod credentials;
pub mod error;
pub mod state;
pub mod token;

pub use constants::*;
pub use cookies::CookieJarStore;
pub use credentials::{ClientStore, Credential, CredentialBackend, CredentialStore, now_millis};
pub use error::{Error, Result};
pub use state::{AuthorizationRequest, generate_state, verify_state};
pub use token::{Exchanger, OAuthClient, TokenResponse};
