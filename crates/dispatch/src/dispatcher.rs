//! Authenticated calls against the Cloudbeds REST API
//!
//! Every call resolves its credential first (which may wait on a token
//! refresh), then attaches either `Authorization: Bearer` or the pre-shared
//! `x-api-key`, plus `x-property-id`. Responses are returned as JSON; non-2xx
//! responses and transport failures come back as distinct errors, unmodified.
//! Nothing is retried here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::Secret;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::AuthSource;
use crate::error::{Error, Result};

/// Connection settings for the wrapped API.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Scheme and host, e.g. `https://api.cloudbeds.com`. Paths are appended.
    pub base_url: String,
    pub property_id: String,
    pub api_key: Option<Secret<String>>,
    pub timeout: Duration,
}

/// Issues API calls with whatever credential the auth source provides.
#[derive(Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
    config: Arc<ApiConfig>,
    auth: Arc<dyn AuthSource>,
}

impl Dispatcher {
    pub fn new(http: reqwest::Client, config: ApiConfig, auth: Arc<dyn AuthSource>) -> Self {
        Self {
            http,
            config: Arc::new(config),
            auth,
        }
    }

    /// Same connection settings, different credential source.
    pub fn with_auth(&self, auth: Arc<dyn AuthSource>) -> Self {
        Self {
            http: self.http.clone(),
            config: self.config.clone(),
            auth,
        }
    }

    /// Issue `method path` with an optional JSON body and query parameters.
    ///
    /// Returns the parsed body of a 2xx response: an empty body is `null`, a
    /// non-JSON body is returned as a JSON string.
    #[instrument(skip(self, body, params), fields(auth = self.auth.id()))]
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        params: &[(String, String)],
    ) -> Result<Value> {
        let bearer = self.auth.bearer_token().await?;

        let url = self.url(path)?;
        let mut request = self
            .http
            .request(method.clone(), &url)
            .timeout(self.config.timeout)
            .header("x-property-id", &self.config.property_id);

        request = match (&bearer, &self.config.api_key) {
            (Some(token), _) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            (None, Some(key)) => request.header("x-api-key", key.expose().as_str()),
            (None, None) => {
                debug!("no session token or API key, sending unauthenticated");
                request
            }
        };
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let start = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                record(0, &method, start);
                warn!(error = %e, "API request failed before a response");
                return Err(Error::Transport(if e.is_timeout() {
                    format!("timed out after {:?}", self.config.timeout)
                } else {
                    e.to_string()
                }));
            }
        };

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("json"));
        let text = response.text().await;
        record(status.as_u16(), &method, start);

        let payload = match text {
            Ok(text) => parse_body(&text, is_json),
            Err(e) if status.is_success() => {
                return Err(Error::Transport(format!("reading response body: {e}")));
            }
            Err(e) => {
                debug!(error = %e, "error response body unreadable");
                Value::Null
            }
        };
        if status.is_success() {
            debug!(status = status.as_u16(), "API call succeeded");
            return Ok(payload);
        }

        warn!(status = status.as_u16(), "API returned an error");
        if status == reqwest::StatusCode::UNAUTHORIZED
            && let Some(token) = &bearer
        {
            self.auth.report_unauthorized(token).await;
        }
        Err(Error::Api {
            status: status.as_u16(),
            body: payload,
        })
    }

    fn url(&self, path: &str) -> Result<String> {
        if !path.starts_with('/') || path.contains("://") {
            return Err(Error::InvalidRequest(format!(
                "path must be absolute: {path}"
            )));
        }
        Ok(format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            path
        ))
    }
}

/// Empty body → `null`; JSON when it parses; otherwise the raw text.
fn parse_body(text: &str, is_json: bool) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            if is_json {
                debug!(error = %e, "response declared JSON but did not parse");
            }
            Value::String(text.to_owned())
        }
    }
}

fn record(status: u16, method: &Method, start: Instant) {
    let status = status.to_string();
    metrics::counter!("console_api_requests_total", "status" => status.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("console_api_request_duration_seconds", "status" => status)
        .record(start.elapsed().as_secs_f64());
}
