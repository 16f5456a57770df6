//! Local console session
//!
//! Wires the pieces a CLI invocation or shell needs: the two credential
//! stores under `session.state_dir`, the OAuth client, the token manager and
//! a dispatcher that resolves credentials through it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cloudbeds_auth::{ClientStore, CookieJarStore, CredentialStore, OAuthClient};
use dispatch::{ApiConfig, Dispatcher};
use token_lifecycle::TokenManager;
use tracing::debug;

use crate::auth_source::SessionAuth;
use crate::config::Config;

pub struct Session {
    pub oauth: OAuthClient,
    pub manager: TokenManager,
    pub dispatcher: Dispatcher,
    pub refresh_interval: Duration,
}

impl Session {
    /// Open the stores and build the session from `config`.
    pub async fn open(config: &Config, http: reqwest::Client) -> anyhow::Result<Self> {
        let state_dir = &config.session.state_dir;
        tokio::fs::create_dir_all(state_dir)
            .await
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

        let client_store = Arc::new(
            ClientStore::open(config.session.client_store_path())
                .await
                .context("failed to open client store")?,
        );
        let cookie_jar = Arc::new(
            CookieJarStore::open(
                config.session.cookie_jar_path(),
                config.server.secure_cookies,
            )
            .await
            .context("failed to open cookie jar")?,
        );
        let store = Arc::new(CredentialStore::new(cookie_jar, client_store.clone()));

        let oauth = oauth_client(config, http.clone())?;
        let manager = TokenManager::new(
            store,
            client_store,
            Arc::new(oauth.clone()),
            config.session.refresh_threshold(),
        );
        let dispatcher = Dispatcher::new(
            http,
            api_config(config),
            Arc::new(SessionAuth::new(manager.clone())),
        );
        debug!(state_dir = %state_dir.display(), "session opened");

        Ok(Self {
            oauth,
            manager,
            dispatcher,
            refresh_interval: config.session.refresh_interval(),
        })
    }
}

/// OAuth client for the configured registration. Requires the client secret.
pub fn oauth_client(config: &Config, http: reqwest::Client) -> anyhow::Result<OAuthClient> {
    Ok(OAuthClient::new(
        http,
        config.oauth.client_id.clone(),
        config.client_secret()?,
        config.oauth.redirect_uri.clone(),
    )
    .with_endpoints(&config.oauth.authorize_url, &config.oauth.token_url)
    .with_timeout(Duration::from_secs(config.oauth.timeout_secs)))
}

pub fn api_config(config: &Config) -> ApiConfig {
    ApiConfig {
        base_url: config.api.base_url.clone(),
        property_id: config.api.property_id.clone(),
        api_key: config.api.api_key.clone(),
        timeout: Duration::from_secs(config.api.timeout_secs),
    }
}
