//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The OAuth client secret and the API key are loaded from
//! CLOUDBEDS_CLIENT_SECRET / CLOUDBEDS_API_KEY or from key files, never
//! stored in the TOML directly to avoid leaking secrets.

use cloudbeds_auth::{API_BASE_URL, AUTHORIZE_ENDPOINT, TOKEN_ENDPOINT};
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub oauth: OAuthConfig,
    pub api: ApiSection,
    #[serde(default)]
    pub session: SessionConfig,
}

/// HTTP server settings for `serve`
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Mark cookies `Secure`. Enable whenever the console is served over TLS.
    #[serde(default)]
    pub secure_cookies: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            secure_cookies: false,
        }
    }
}

/// OAuth client registration
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_exchange_timeout")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to CLOUDBEDS_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

/// Wrapped API settings
#[derive(Debug, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    pub property_id: String,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    /// Path to a file containing the API key (alternative to CLOUDBEDS_API_KEY)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

/// Local session settings for the CLI and shell
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Directory holding the client store and cookie jar.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            refresh_interval_secs: default_refresh_interval(),
            refresh_threshold_secs: default_refresh_threshold(),
        }
    }
}

impl SessionConfig {
    pub fn client_store_path(&self) -> PathBuf {
        self.state_dir.join("client-store.json")
    }

    pub fn cookie_jar_path(&self) -> PathBuf {
        self.state_dir.join("cookies.json")
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_max_connections() -> usize {
    1000
}

fn default_authorize_url() -> String {
    AUTHORIZE_ENDPOINT.to_string()
}

fn default_token_url() -> String {
    TOKEN_ENDPOINT.to_string()
}

fn default_exchange_timeout() -> u64 {
    15
}

fn default_api_base_url() -> String {
    API_BASE_URL.to_string()
}

fn default_api_timeout() -> u64 {
    30
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".cloudbeds-console")
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_refresh_threshold() -> u64 {
    300
}

const MAX_REFRESH_THRESHOLD_SECS: u64 = 24 * 60 * 60;

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Secret resolution order (client secret and API key alike):
    /// 1. env var (CLOUDBEDS_CLIENT_SECRET / CLOUDBEDS_API_KEY)
    /// 2. `*_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.oauth.client_secret = resolve_secret(
            "CLOUDBEDS_CLIENT_SECRET",
            config.oauth.client_secret_file.as_deref(),
            "client_secret_file",
        )?;
        config.api.api_key = resolve_secret(
            "CLOUDBEDS_API_KEY",
            config.api.api_key_file.as_deref(),
            "api_key_file",
        )?;

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config("oauth.client_id must not be empty".into()));
        }
        require_http_url("oauth.redirect_uri", &self.oauth.redirect_uri)?;
        require_http_url("oauth.authorize_url", &self.oauth.authorize_url)?;
        require_http_url("oauth.token_url", &self.oauth.token_url)?;
        require_http_url("api.base_url", &self.api.base_url)?;

        if self.oauth.timeout_secs == 0 || self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.session.refresh_interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh_interval_secs must be greater than 0".into(),
            ));
        }
        if self.session.refresh_threshold_secs >= MAX_REFRESH_THRESHOLD_SECS {
            return Err(common::Error::Config(format!(
                "refresh_threshold_secs must be less than {MAX_REFRESH_THRESHOLD_SECS}"
            )));
        }
        Ok(())
    }

    /// The client secret, required for any token exchange.
    pub fn client_secret(&self) -> common::Result<Secret<String>> {
        self.oauth.client_secret.clone().ok_or_else(|| {
            common::Error::Config(
                "no client secret: set CLOUDBEDS_CLIENT_SECRET or oauth.client_secret_file".into(),
            )
        })
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        if let Some(p) = cli_path {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("cloudbeds-console.toml")
    }
}

fn require_http_url(field: &str, value: &str) -> common::Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )))
    }
}

/// Env var takes precedence over the key file. Blank values count as unset.
fn resolve_secret(
    env_var: &str,
    file: Option<&Path>,
    field: &str,
) -> common::Result<Option<Secret<String>>> {
    if let Some(secret) = std::env::var(env_var)
        .ok()
        .and_then(|v| Secret::<String>::non_empty(&v))
    {
        return Ok(Some(secret));
    }
    let Some(file) = file else {
        return Ok(None);
    };
    let raw = std::fs::read_to_string(file).map_err(|e| {
        common::Error::Config(format!("failed to read {field} {}: {e}", file.display()))
    })?;
    Ok(Secret::<String>::non_empty(&raw))
}
