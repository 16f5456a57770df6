//! Token lifecycle for the Cloudbeds console session
//!
//! Decides whether the stored credential is valid, expiring, absent or
//! invalid, and drives exactly one refresh at a time. Readers get a credential
//! that is safe to use or nothing; they never see an expired token.
//!
//! Session lifecycle:
//! 1. `TokenManager::begin_authorization()` persists the state token
//! 2. `TokenManager::authorize()` verifies it, exchanges the code, saves → `Valid`
//! 3. Time-to-expiry drops under the threshold → `ExpiringSoon`
//! 4. A periodic check or a request starts the single refresh episode → `Refreshing`
//! 5. Success → `Valid`; rejection → both stores cleared, `Invalid`;
//!    transient failure → credential kept, retried on the next check
//! 6. A 401 from the API for the current token → `Invalid`

pub mod error;
pub mod manager;
pub mod refresh;
pub mod state;

pub use error::{Error, Result};
pub use manager::{RefreshOutcome, TokenManager};
pub use refresh::spawn_refresh_task;
pub use state::{TokenState, TokenStatus, classify};
