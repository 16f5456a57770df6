//! Session token manager
//!
//! Owns the decision of whether the stored credential can be handed out,
//! must be refreshed, or is gone for good. At most one refresh episode runs at
//! a time: the first caller to find the credential expiring starts it, every
//! other caller (periodic check or request) awaits the same episode.
//!
//! The episode runs in a spawned task so a caller that gives up waiting does
//! not strand the others. Its outcome is applied to the credential store
//! before the manager leaves `Refreshing`, then published on a `watch`
//! channel to everyone waiting.

use std::sync::Arc;
use std::time::Duration;

use cloudbeds_auth::{
    AuthorizationRequest, ClientStore, Credential, CredentialStore, Exchanger, now_millis,
    verify_state,
};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::state::{TokenState, TokenStatus, classify};

/// Result of one refresh episode, shared by every waiter.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// New credential, already saved to both stores.
    Refreshed(Credential),
    /// Refresh token rejected; both stores cleared.
    Invalid,
    /// No answer from the token endpoint. `previous` is still stored.
    Transient {
        error: cloudbeds_auth::Error,
        previous: Credential,
    },
    /// The session was reset (logout or new authorization) while the
    /// exchange was outstanding; its result was discarded.
    Superseded,
}

enum RefreshState {
    Idle,
    Refreshing(watch::Receiver<Option<RefreshOutcome>>),
}

struct Session {
    refresh: RefreshState,
    invalid: bool,
    /// Bumped whenever the session is reset so a late refresh result for the
    /// old session is not written back.
    generation: u64,
}

struct Shared {
    store: Arc<CredentialStore>,
    client_store: Arc<ClientStore>,
    exchanger: Arc<dyn Exchanger>,
    threshold: Duration,
    session: Mutex<Session>,
}

/// Lifecycle manager for the session credential. Cheap to clone.
#[derive(Clone)]
pub struct TokenManager {
    shared: Arc<Shared>,
}

impl TokenManager {
    /// Create a manager over `store`.
    ///
    /// `client_store` must be the client-readable backing of `store`; the
    /// pending anti-forgery state lives there.
    pub fn new(
        store: Arc<CredentialStore>,
        client_store: Arc<ClientStore>,
        exchanger: Arc<dyn Exchanger>,
        threshold: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                client_store,
                exchanger,
                threshold,
                session: Mutex::new(Session {
                    refresh: RefreshState::Idle,
                    invalid: false,
                    generation: 0,
                }),
            }),
        }
    }

    /// Persist the state token of an authorization redirect about to be
    /// handed to the user.
    pub async fn begin_authorization(&self, request: &AuthorizationRequest) -> Result<()> {
        self.shared.client_store.save_state(&request.state).await?;
        debug!("authorization started, state token persisted");
        Ok(())
    }

    /// Complete an authorization: consume the pending state token, check it
    /// against `state`, exchange `code` and save the credential.
    ///
    /// This is the only way out of `Invalid`.
    pub async fn authorize(&self, code: &str, state: &str) -> Result<Credential> {
        let pending = self.shared.client_store.take_state().await?;
        verify_state(pending.as_deref(), Some(state))?;

        let credential = self.shared.exchanger.exchange_code(code).await?;

        let mut session = self.shared.session.lock().await;
        self.shared.store.save(&credential).await?;
        session.invalid = false;
        session.generation += 1;
        session.refresh = RefreshState::Idle;
        info!(
            expires_in = credential.expires_in(now_millis()).as_secs(),
            "authorization complete"
        );
        Ok(credential)
    }

    /// A credential that is safe to use right now, or `None` when the
    /// session is not authenticated.
    ///
    /// Returns the cached credential when valid. Otherwise starts (or joins)
    /// the refresh episode and waits for it. After a transient refresh failure
    /// the previous credential is returned only if it has not expired.
    pub async fn valid_credential(&self) -> Result<Option<Credential>> {
        loop {
            let mut waiter = {
                let mut session = self.shared.session.lock().await;
                match self.poll(&mut session).await {
                    Poll::Ready(credential) => return Ok(credential),
                    Poll::Wait(waiter) => waiter,
                }
            };

            let outcome = waiter
                .wait_for(Option::is_some)
                .await
                .map_err(|_| Error::RefreshAborted)?
                .clone();

            return match outcome {
                Some(RefreshOutcome::Refreshed(credential)) => Ok(Some(credential)),
                Some(RefreshOutcome::Invalid) => Ok(None),
                // Authorize, logout or a 401 replaced the session mid-refresh:
                // answer from whatever it left behind.
                Some(RefreshOutcome::Superseded) => continue,
                Some(RefreshOutcome::Transient { error, previous }) => {
                    if previous.is_expired(now_millis()) {
                        Err(Error::RefreshFailed(error))
                    } else {
                        Ok(Some(previous))
                    }
                }
                None => Err(Error::RefreshAborted),
            };
        }
    }

    /// Periodic check: recompute the state and start a refresh if the
    /// credential is expiring. Never waits for the refresh to finish; while
    /// one is outstanding this is a no-op.
    pub async fn check(&self) -> TokenState {
        let mut session = self.shared.session.lock().await;
        match self.poll(&mut session).await {
            Poll::Ready(Some(_)) => TokenState::Valid,
            Poll::Ready(None) if session.invalid => TokenState::Invalid,
            Poll::Ready(None) => TokenState::Absent,
            Poll::Wait(_) => TokenState::Refreshing,
        }
    }

    /// Current state. Never starts a refresh, but reading the store may
    /// re-sync the client backing from the server one.
    pub async fn state(&self) -> TokenState {
        self.status().await.state
    }

    /// Display snapshot of the session.
    pub async fn status(&self) -> TokenStatus {
        let session = self.shared.session.lock().await;
        let credential = self.shared.store.read().await;
        let now = now_millis();

        let state = if session.invalid {
            TokenState::Invalid
        } else if let RefreshState::Refreshing(_) = session.refresh {
            TokenState::Refreshing
        } else {
            classify(credential.as_ref(), now, self.shared.threshold)
        };

        TokenStatus {
            state,
            expires_at: credential.as_ref().map(|c| c.expires_at),
            expires_in_secs: credential.as_ref().map(|c| c.expires_in(now).as_secs()),
        }
    }

    /// Clear both stores and return to `Absent`.
    pub async fn logout(&self) -> Result<()> {
        let mut session = self.shared.session.lock().await;
        session.generation += 1;
        session.invalid = false;
        session.refresh = RefreshState::Idle;
        self.shared.store.clear().await?;
        info!("logged out, credential cleared");
        Ok(())
    }

    /// The wrapped API rejected `access_token` with 401.
    ///
    /// If it is still the stored token the session becomes `Invalid`. A 401
    /// for a token that has since been replaced by a refresh is ignored.
    pub async fn report_unauthorized(&self, access_token: &str) {
        let mut session = self.shared.session.lock().await;
        let current = self.shared.store.read().await;
        if current.is_none_or(|c| c.access_token != access_token) {
            debug!("401 for a superseded access token, ignoring");
            return;
        }

        warn!("API rejected the access token, clearing credentials");
        session.generation += 1;
        session.invalid = true;
        session.refresh = RefreshState::Idle;
        if let Err(e) = self.shared.store.clear().await {
            warn!(error = %e, "failed to clear credentials after 401");
        }
    }

    /// Decide under the session lock: hand out the stored credential, or
    /// join/start a refresh episode.
    async fn poll(&self, session: &mut Session) -> Poll {
        if let RefreshState::Refreshing(waiter) = &session.refresh {
            // A closed channel with the state still Refreshing means the
            // episode task died before publishing.
            if waiter.has_changed().is_ok() {
                return Poll::Wait(waiter.clone());
            }
            warn!("refresh episode ended without an outcome, resetting");
            session.refresh = RefreshState::Idle;
        }

        if session.invalid {
            return Poll::Ready(None);
        }

        let credential = self.shared.store.read().await;
        match (classify(credential.as_ref(), now_millis(), self.shared.threshold), credential) {
            (TokenState::Valid, credential) => Poll::Ready(credential),
            (TokenState::ExpiringSoon, Some(credential)) => {
                Poll::Wait(self.start_refresh(session, credential))
            }
            _ => Poll::Ready(None),
        }
    }

    fn start_refresh(&self, session: &mut Session, credential: Credential) -> Waiter {
        let (publish, waiter) = watch::channel(None);
        session.refresh = RefreshState::Refreshing(waiter.clone());
        let generation = session.generation;
        debug!(
            expires_in = credential.expires_in(now_millis()).as_secs(),
            "credential expiring, starting refresh"
        );

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = shared
                .exchanger
                .exchange_refresh_token(&credential.refresh_token)
                .await;

            let mut session = shared.session.lock().await;
            let outcome = if session.generation != generation {
                debug!("session reset during refresh, discarding result");
                RefreshOutcome::Superseded
            } else {
                let outcome = shared.apply(result, credential).await;
                if matches!(outcome, RefreshOutcome::Invalid) {
                    session.invalid = true;
                }
                session.refresh = RefreshState::Idle;
                outcome
            };
            drop(session);

            publish.send_replace(Some(outcome));
        });

        waiter
    }
}

type Waiter = watch::Receiver<Option<RefreshOutcome>>;

enum Poll {
    Ready(Option<Credential>),
    Wait(Waiter),
}

impl Shared {
    /// Apply an exchange result to the store. Called with the session lock held.
    async fn apply(
        &self,
        result: cloudbeds_auth::Result<Credential>,
        previous: Credential,
    ) -> RefreshOutcome {
        match result {
            Ok(credential) => match self.store.save(&credential).await {
                Ok(()) => {
                    metrics::counter!("console_token_refresh_total", "outcome" => "success")
                        .increment(1);
                    info!(
                        expires_in = credential.expires_in(now_millis()).as_secs(),
                        "token refresh succeeded"
                    );
                    RefreshOutcome::Refreshed(credential)
                }
                Err(e) => {
                    warn!(error = %e, "refreshed credential could not be saved");
                    // A failed rollback clears both backings; only hand out
                    // what is still stored.
                    match self.store.read().await {
                        Some(stored) => {
                            metrics::counter!("console_token_refresh_total", "outcome" => "transient")
                                .increment(1);
                            RefreshOutcome::Transient {
                                error: e,
                                previous: stored,
                            }
                        }
                        None => {
                            metrics::counter!("console_token_refresh_total", "outcome" => "invalid")
                                .increment(1);
                            RefreshOutcome::Invalid
                        }
                    }
                }
            },
            Err(e) if e.is_terminal() => {
                metrics::counter!("console_token_refresh_total", "outcome" => "invalid")
                    .increment(1);
                warn!(error = %e, "refresh token rejected, clearing credentials");
                if let Err(clear_err) = self.store.clear().await {
                    warn!(error = %clear_err, "failed to clear credentials");
                }
                RefreshOutcome::Invalid
            }
            Err(e) => {
                metrics::counter!("console_token_refresh_total", "outcome" => "transient")
                    .increment(1);
                warn!(error = %e, "token refresh failed (transient), will retry next check");
                RefreshOutcome::Transient { error: e, previous }
            }
        }
    }
}
