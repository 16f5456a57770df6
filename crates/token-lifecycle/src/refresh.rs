//! Periodic background token check
//!
//! Spawns a task that runs `TokenManager::check` on a fixed cadence, so a
//! credential approaching expiry is refreshed before a request needs it.
//! The task runs independently of the request path and never waits for the
//! refresh it starts.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::manager::TokenManager;

/// Spawn a background task that checks the session every `interval`.
///
/// Returns a `JoinHandle`; abort it to stop the checks.
pub fn spawn_refresh_task(manager: TokenManager, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the immediate first tick; the caller has just checked.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let state = manager.check().await;
            debug!(state = state.label(), "periodic token check");
        }
    })
}
