//! Token lifecycle states
//!
//! `classify` is the pure part of the state machine: given the stored
//! credential and the clock, which state is the session in. `Refreshing` and
//! `Invalid` are never produced here; they come from the manager's own
//! bookkeeping.

use std::time::Duration;

use cloudbeds_auth::Credential;
use serde::Serialize;

/// Lifecycle state of the session credential.
///
/// Transitions:
/// - Absent → Valid / ExpiringSoon (authorization code exchanged)
/// - Valid → ExpiringSoon (time-to-expiry under threshold)
/// - ExpiringSoon → Refreshing (first check or request to notice)
/// - Refreshing → Valid (refresh succeeded and was saved)
/// - Refreshing → ExpiringSoon (transient failure, retried on next check)
/// - Refreshing → Invalid (refresh token rejected, both stores cleared)
/// - Invalid → Valid (new authorization only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Absent,
    Valid,
    ExpiringSoon,
    Refreshing,
    Invalid,
}

impl TokenState {
    /// State label for status output and logging.
    pub fn label(&self) -> &'static str {
        match self {
            TokenState::Absent => "absent",
            TokenState::Valid => "valid",
            TokenState::ExpiringSoon => "expiring_soon",
            TokenState::Refreshing => "refreshing",
            TokenState::Invalid => "invalid",
        }
    }

    /// Whether the session should be shown as logged in.
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self,
            TokenState::Valid | TokenState::ExpiringSoon | TokenState::Refreshing
        )
    }
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Classify a stored credential at `now` (epoch ms).
///
/// A credential that has already expired is `ExpiringSoon` as well: its
/// refresh token may still be good, so a refresh is attempted, but the
/// manager never hands the expired access token out.
pub fn classify(credential: Option<&Credential>, now: u64, threshold: Duration) -> TokenState {
    match credential {
        None => TokenState::Absent,
        Some(credential) if credential.expires_in(now) >= threshold => TokenState::Valid,
        Some(_) => TokenState::ExpiringSoon,
    }
}

/// Snapshot of the session for display; never carries the tokens.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub state: TokenState,
    /// Unix timestamp in milliseconds.
    pub expires_at: Option<u64>,
    pub expires_in_secs: Option<u64>,
}
