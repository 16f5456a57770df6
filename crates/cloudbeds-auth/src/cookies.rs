//! Server-only credential store: the cookie layout
//!
//! The credential triple travels as three cookies. The access and refresh
//! tokens are HTTP-only so script code never sees them; the expiry cookie is
//! script-readable so client code can schedule refreshes. The access and
//! expiry cookies live as long as the token, the refresh cookie 30 days.
//!
//! Request handlers build and read these cookies through `axum_extra`'s
//! `CookieJar`. `CookieJarStore` is the same layout persisted on the client
//! side as a list of `Set-Cookie` values, the way a browser keeps them.

use std::path::PathBuf;
use std::sync::RwLock;

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::constants::{
    ACCESS_TOKEN_COOKIE, OAUTH_STATE_COOKIE, REFRESH_COOKIE_MAX_AGE_SECS, REFRESH_TOKEN_COOKIE,
    STATE_MAX_AGE_SECS, TOKEN_EXPIRY_COOKIE,
};
use crate::credentials::{Credential, CredentialBackend, StoreFuture, now_millis, write_atomic};
use crate::error::{Error, Result};

fn base_cookie(
    name: &'static str,
    value: String,
    http_only: bool,
    secure: bool,
    max_age_secs: i64,
) -> Cookie<'static> {
    Cookie::build((name, value))
        .http_only(http_only)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::seconds(max_age_secs))
        .build()
}

/// The three cookies carrying `credential`, with lifetimes measured from `now`.
pub fn credential_cookies(
    credential: &Credential,
    now: u64,
    secure: bool,
) -> [Cookie<'static>; 3] {
    let lifetime_secs = credential.expires_in(now).as_secs() as i64;
    [
        base_cookie(
            ACCESS_TOKEN_COOKIE,
            credential.access_token.clone(),
            true,
            secure,
            lifetime_secs,
        ),
        base_cookie(
            REFRESH_TOKEN_COOKIE,
            credential.refresh_token.clone(),
            true,
            secure,
            REFRESH_COOKIE_MAX_AGE_SECS,
        ),
        base_cookie(
            TOKEN_EXPIRY_COOKIE,
            credential.expires_at.to_string(),
            false,
            secure,
            lifetime_secs,
        ),
    ]
}

/// Cookies that delete the credential triple from the browser.
pub fn clearing_cookies() -> [Cookie<'static>; 3] {
    [ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE, TOKEN_EXPIRY_COOKIE].map(|name| {
        Cookie::build((name, ""))
            .path("/")
            .max_age(time::Duration::ZERO)
            .build()
    })
}

/// HTTP-only cookie holding a pending state token.
pub fn state_cookie(state: &str, secure: bool) -> Cookie<'static> {
    base_cookie(
        OAUTH_STATE_COOKIE,
        state.to_owned(),
        true,
        secure,
        STATE_MAX_AGE_SECS,
    )
}

/// Cookie that deletes the pending state token.
pub fn clearing_state_cookie() -> Cookie<'static> {
    Cookie::build((OAUTH_STATE_COOKIE, ""))
        .path("/")
        .max_age(time::Duration::ZERO)
        .build()
}

/// Add the credential cookies to a response jar.
pub fn set_credential(jar: CookieJar, credential: &Credential, secure: bool) -> CookieJar {
    credential_cookies(credential, now_millis(), secure)
        .into_iter()
        .fold(jar, |jar, cookie| jar.add(cookie))
}

/// Add the clearing cookies to a response jar.
pub fn clear_credential(jar: CookieJar) -> CookieJar {
    clearing_cookies()
        .into_iter()
        .fold(jar, |jar, cookie| jar.add(cookie))
}

/// Rebuild the credential from a request jar. All three cookies must be present.
pub fn credential_from_jar(jar: &CookieJar) -> Option<Credential> {
    let access = jar.get(ACCESS_TOKEN_COOKIE)?;
    let refresh = jar.get(REFRESH_TOKEN_COOKIE)?;
    let expiry = jar.get(TOKEN_EXPIRY_COOKIE)?;
    Some(Credential {
        access_token: access.value().to_owned(),
        refresh_token: refresh.value().to_owned(),
        expires_at: expiry.value().parse().ok()?,
    })
}

/// Persisted form of the cookie jar.
#[derive(Debug, Default, Serialize, Deserialize)]
struct JarDocument {
    #[serde(default)]
    cookies: Vec<String>,
}

/// Server-only store persisted as `Set-Cookie` values.
///
/// Writes always go through `credential_cookies`, so the jar on disk has the
/// exact attributes a browser would have received from the callback handler.
pub struct CookieJarStore {
    path: PathBuf,
    secure: bool,
    cookies: RwLock<Vec<Cookie<'static>>>,
    write_lock: Mutex<()>,
}

impl CookieJarStore {
    /// Open the jar at `path`. A missing file is an empty jar; unparseable
    /// entries are skipped.
    pub async fn open(path: PathBuf, secure: bool) -> Result<Self> {
        let cookies = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading cookie jar: {e}")))?;
            let document: JarDocument = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("parsing cookie jar: {e}")))?;
            let cookies: Vec<Cookie<'static>> = document
                .cookies
                .into_iter()
                .filter_map(|raw| match Cookie::parse(raw) {
                    Ok(cookie) => Some(cookie),
                    Err(e) => {
                        warn!(error = %e, "skipping malformed cookie in jar");
                        None
                    }
                })
                .collect();
            info!(path = %path.display(), cookies = cookies.len(), "loaded cookie jar");
            cookies
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            secure,
            cookies: RwLock::new(cookies),
            write_lock: Mutex::new(()),
        })
    }

    /// Snapshot of the cookies currently held.
    pub fn cookies(&self) -> Vec<Cookie<'static>> {
        self.cookies
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn value_of(cookies: &[Cookie<'static>], name: &str) -> Option<String> {
        cookies
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.value().to_owned())
    }

    async fn replace(&self, next: Vec<Cookie<'static>>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let document = JarDocument {
            cookies: next.iter().map(ToString::to_string).collect(),
        };
        write_atomic(&self.path, &document).await?;
        *self
            .cookies
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        Ok(())
    }
}

impl CredentialBackend for CookieJarStore {
    fn name(&self) -> &'static str {
        "server"
    }

    fn load(&self) -> Option<Credential> {
        let cookies = self.cookies();
        Some(Credential {
            access_token: Self::value_of(&cookies, ACCESS_TOKEN_COOKIE)?,
            refresh_token: Self::value_of(&cookies, REFRESH_TOKEN_COOKIE)?,
            expires_at: Self::value_of(&cookies, TOKEN_EXPIRY_COOKIE)?.parse().ok()?,
        })
    }

    fn store<'a>(&'a self, credential: &'a Credential) -> StoreFuture<'a> {
        let next = credential_cookies(credential, now_millis(), self.secure).to_vec();
        Box::pin(self.replace(next))
    }

    fn clear(&self) -> StoreFuture<'_> {
        Box::pin(self.replace(Vec::new()))
    }
}
