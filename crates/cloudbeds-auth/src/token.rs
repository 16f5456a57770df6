//! OAuth token exchange and refresh
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (callback completion)
//! 2. Token refresh (proactive and on-demand)
//!
//! Both POST a form to the token endpoint with a different `grant_type`.
//! Responses are sorted into terminal rejections (400/401/403) and transient
//! failures (no response, timeout, 408/429/5xx, malformed body) so the caller
//! can decide between clearing credentials and retrying.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::constants::{AUTHORIZE_ENDPOINT, DEFAULT_EXCHANGE_TIMEOUT, TOKEN_ENDPOINT};
use crate::credentials::{Credential, now_millis};
use crate::error::{Error, Result};
use crate::state::{AuthorizationRequest, build_authorization_url, generate_state};

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds. Some refresh responses omit
/// `refresh_token`, in which case the previous one stays valid.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

impl TokenResponse {
    /// Convert to a credential issued at `issued_at` (epoch ms).
    pub fn into_credential(self, issued_at: u64, previous_refresh: Option<&str>) -> Result<Credential> {
        let refresh_token = match (self.refresh_token, previous_refresh) {
            (Some(refresh), _) if !refresh.is_empty() => refresh,
            (_, Some(previous)) => previous.to_owned(),
            _ => {
                return Err(Error::InvalidResponse(
                    "token response has no refresh_token".into(),
                ));
            }
        };
        Ok(Credential::issued(
            self.access_token,
            refresh_token,
            issued_at,
            self.expires_in,
        ))
    }
}

/// The two exchanges of the authorization-code grant.
///
/// Uses `Pin<Box<dyn Future>>` return types so the lifecycle manager can hold
/// an `Arc<dyn Exchanger>` and tests can substitute a stub.
pub trait Exchanger: Send + Sync {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>>;

    fn exchange_refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>>;
}

/// Confidential OAuth client for the Cloudbeds token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: Secret<String>,
    redirect_uri: String,
    authorize_endpoint: String,
    token_endpoint: String,
    timeout: Duration,
}

impl OAuthClient {
    pub fn new(
        http: reqwest::Client,
        client_id: String,
        client_secret: Secret<String>,
        redirect_uri: String,
    ) -> Self {
        Self {
            http,
            client_id,
            client_secret,
            redirect_uri,
            authorize_endpoint: AUTHORIZE_ENDPOINT.to_owned(),
            token_endpoint: TOKEN_ENDPOINT.to_owned(),
            timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }

    /// Override the authorize and token endpoints.
    pub fn with_endpoints(mut self, authorize: impl Into<String>, token: impl Into<String>) -> Self {
        self.authorize_endpoint = authorize.into();
        self.token_endpoint = token.into();
        self
    }

    /// Override the per-exchange timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Authorization redirect with a freshly minted state token.
    ///
    /// The caller must persist `state` and check it on the callback.
    pub fn build_authorization_url(&self) -> Result<AuthorizationRequest> {
        let state = generate_state();
        let url = build_authorization_url(
            &self.authorize_endpoint,
            &self.client_id,
            &self.redirect_uri,
            &state,
        )?;
        Ok(AuthorizationRequest { url, state })
    }

    /// Exchange an authorization code for a credential.
    #[instrument(skip_all)]
    pub async fn exchange_code(&self, code: &str) -> Result<Credential> {
        let issued_at = now_millis();
        let response = self
            .post_form(&[
                ("grant_type", "authorization_code"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose().as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("code", code),
            ])
            .await?;
        debug!(expires_in = response.expires_in, "authorization code exchanged");
        response.into_credential(issued_at, None)
    }

    /// Exchange a refresh token for a new credential.
    #[instrument(skip_all)]
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Credential> {
        let issued_at = now_millis();
        let response = self
            .post_form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose().as_str()),
                ("refresh_token", refresh_token),
            ])
            .await?;
        debug!(expires_in = response.expires_in, "refresh token exchanged");
        response.into_credential(issued_at, Some(refresh_token))
    }

    async fn post_form(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Transport(format!("token endpoint timed out after {:?}", self.timeout))
                } else {
                    Error::Transport(format!("token request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body = serde_json::from_str::<serde_json::Value>(&text)
                .unwrap_or(serde_json::Value::String(text));
            warn!(status = status.as_u16(), "token endpoint returned an error");
            return Err(match status.as_u16() {
                400 | 401 | 403 => Error::Exchange {
                    status: status.as_u16(),
                    body,
                },
                code => Error::Unavailable { status: code, body },
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))
    }
}

impl Exchanger for OAuthClient {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>> {
        Box::pin(OAuthClient::exchange_code(self, code))
    }

    fn exchange_refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>> {
        Box::pin(self.refresh_token(refresh_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Forms = Arc<Mutex<Vec<HashMap<String, String>>>>;

    /// Start a stub token endpoint that records each form and answers with
    /// the given status and body.
    async fn start_token_server(status: StatusCode, body: &'static str) -> (String, Forms) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/auth/oauth/token", listener.local_addr().unwrap());
        let forms: Forms = Arc::default();
        let recorded = forms.clone();

        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/auth/oauth/token",
                axum::routing::post(
                    move |axum::Form(form): axum::Form<HashMap<String, String>>| {
                        let recorded = recorded.clone();
                        async move {
                            recorded.lock().unwrap().push(form);
                            (
                                status,
                                [(axum::http::header::CONTENT_TYPE, "application/json")],
                                body,
                            )
                        }
                    },
                ),
            );
            axum::serve(listener, app).await.unwrap();
        });

        (url, forms)
    }

    fn client(token_url: &str) -> OAuthClient {
        OAuthClient::new(
            reqwest::Client::new(),
            "client-1".into(),
            Secret::new("s3cret".into()),
            "http://localhost:3000/auth/callback".into(),
        )
        .with_endpoints(AUTHORIZE_ENDPOINT, token_url)
        .with_timeout(Duration::from_secs(2))
    }

    #[test]
    fn token_response_deserializes() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def","expires_in":3600,"token_type":"Bearer"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.refresh_token.as_deref(), Some("rt_def"));
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn refresh_response_without_refresh_token_keeps_previous() {
        let token = TokenResponse {
            access_token: "at_new".into(),
            refresh_token: None,
            expires_in: 60,
        };
        let credential = token.into_credential(1_000, Some("rt_old")).unwrap();
        assert_eq!(credential.refresh_token, "rt_old");
        assert_eq!(credential.expires_at, 61_000);
    }

    #[test]
    fn code_response_without_refresh_token_is_invalid() {
        let token = TokenResponse {
            access_token: "at".into(),
            refresh_token: None,
            expires_in: 60,
        };
        assert!(matches!(
            token.into_credential(0, None),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn authorization_request_embeds_fresh_state() {
        let oauth = client("http://127.0.0.1:1/token");
        let a = oauth.build_authorization_url().unwrap();
        let b = oauth.build_authorization_url().unwrap();
        assert_ne!(a.state, b.state);
        assert!(a.url.starts_with(AUTHORIZE_ENDPOINT));
        assert!(a.url.contains(&format!("state={}", a.state)));
        assert!(a.url.contains("client_id=client-1"));
    }

    #[tokio::test]
    async fn exchange_code_posts_authorization_code_grant() {
        let (url, forms) = start_token_server(
            StatusCode::OK,
            r#"{"access_token":"at_1","refresh_token":"rt_1","expires_in":3600}"#,
        )
        .await;

        let before = now_millis();
        let credential = client(&url).exchange_code("abc123").await.unwrap();
        let after = now_millis();

        assert_eq!(credential.access_token, "at_1");
        assert_eq!(credential.refresh_token, "rt_1");
        assert!(credential.expires_at >= before + 3_600_000);
        assert!(credential.expires_at <= after + 3_600_000);

        let forms = forms.lock().unwrap();
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0]["grant_type"], "authorization_code");
        assert_eq!(forms[0]["code"], "abc123");
        assert_eq!(forms[0]["client_id"], "client-1");
        assert_eq!(forms[0]["client_secret"], "s3cret");
        assert_eq!(forms[0]["redirect_uri"], "http://localhost:3000/auth/callback");
    }

    #[tokio::test]
    async fn refresh_posts_refresh_token_grant() {
        let (url, forms) = start_token_server(
            StatusCode::OK,
            r#"{"access_token":"at_2","refresh_token":"rt_2","expires_in":3600}"#,
        )
        .await;

        let credential = client(&url).refresh_token("rt_1").await.unwrap();
        assert_eq!(credential.access_token, "at_2");
        assert_eq!(credential.refresh_token, "rt_2");

        let forms = forms.lock().unwrap();
        assert_eq!(forms[0]["grant_type"], "refresh_token");
        assert_eq!(forms[0]["refresh_token"], "rt_1");
    }

    #[tokio::test]
    async fn rejected_grant_is_terminal_with_payload() {
        let (url, _) = start_token_server(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#,
        )
        .await;

        let err = client(&url).refresh_token("rt_revoked").await.unwrap_err();
        assert!(err.is_terminal(), "got: {err:?}");
        assert_eq!(err.upstream_status(), Some(400));
        assert_eq!(err.upstream_payload()["error"], "invalid_grant");
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let (url, _) = start_token_server(StatusCode::SERVICE_UNAVAILABLE, "maintenance").await;

        let err = client(&url).refresh_token("rt").await.unwrap_err();
        assert!(err.is_transient(), "got: {err:?}");
        assert_eq!(err.upstream_payload(), serde_json::json!("maintenance"));
    }

    #[tokio::test]
    async fn malformed_success_body_is_transient() {
        let (url, _) = start_token_server(StatusCode::OK, r#"{"unexpected":true}"#).await;

        let err = client(&url).exchange_code("abc").await.unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let err = client("http://127.0.0.1:1/token")
            .refresh_token("rt")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "got: {err:?}");
        assert!(err.is_transient());
    }
}
