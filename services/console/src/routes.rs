//! Browser-facing OAuth endpoints
//!
//! Stateless handlers: everything that must survive between requests lives in
//! cookies, so any number of handler invocations can run side by side. Each
//! handler finishes building its cookie changes before it responds.
//!
//! Endpoints:
//! - GET  /auth/login    : mint a state token, redirect to the authorize endpoint
//! - GET  /auth/callback : verify state, exchange the code, set the credential cookies
//! - POST /auth/token    : refresh using the refresh-token cookie
//! - GET  /auth/status   : authentication state from the expiry cookie
//! - POST /auth/logout   : clear the credential cookies

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum_extra::extract::cookie::CookieJar;
use cloudbeds_auth::cookies::{
    clear_credential, clearing_state_cookie, set_credential, state_cookie,
};
use cloudbeds_auth::{
    ACCESS_TOKEN_COOKIE, OAUTH_STATE_COOKIE, OAuthClient, REFRESH_TOKEN_COOKIE,
    TOKEN_EXPIRY_COOKIE, now_millis, verify_state,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::metrics;

/// Where the callback sends the browser when authorization did not complete.
const AUTH_FAILED_REDIRECT: &str = "/?auth=failed";

/// Shared state for the auth handlers.
#[derive(Clone)]
pub struct AuthState {
    pub oauth: OAuthClient,
    pub secure_cookies: bool,
}

pub fn build_auth_router(state: AuthState) -> Router {
    Router::new()
        .route("/auth/login", get(login))
        .route("/auth/callback", get(callback))
        .route("/auth/token", post(refresh_token))
        .route("/auth/status", get(status))
        .route("/auth/logout", post(logout))
        .with_state(state)
}

/// JSON error body `{message, error}`, the shape every console endpoint uses.
pub(crate) fn error_response(
    status: StatusCode,
    message: &str,
    error: serde_json::Value,
) -> Response {
    (
        status,
        axum::Json(serde_json::json!({
            "message": message,
            "error": error,
        })),
    )
        .into_response()
}

/// GET /auth/login: store a fresh state token in an HTTP-only cookie and
/// redirect to the authorization endpoint.
async fn login(State(state): State<AuthState>, jar: CookieJar) -> Response {
    match state.oauth.build_authorization_url() {
        Ok(request) => {
            info!("authorization redirect issued");
            let jar = jar.add(state_cookie(&request.state, state.secure_cookies));
            (jar, Redirect::to(&request.url)).into_response()
        }
        Err(e) => {
            warn!(error = %e, "failed to build authorization URL");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error building authorization URL",
                e.upstream_payload(),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// GET /auth/callback: complete the authorization-code grant.
///
/// The state cookie is consumed whatever the outcome.
async fn callback(
    State(state): State<AuthState>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> (CookieJar, Redirect) {
    let pending = jar.get(OAUTH_STATE_COOKIE).map(|c| c.value().to_owned());
    let jar = jar.add(clearing_state_cookie());

    if let Some(error) = params.error {
        warn!(error, "authorization denied upstream");
        metrics::record_callback("denied");
        return (jar, Redirect::to(AUTH_FAILED_REDIRECT));
    }
    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        warn!("callback without authorization code");
        metrics::record_callback("missing_code");
        return (jar, Redirect::to(AUTH_FAILED_REDIRECT));
    };
    if let Err(e) = verify_state(pending.as_deref(), params.state.as_deref()) {
        warn!(error = %e, "callback state check failed");
        metrics::record_callback("state_mismatch");
        return (jar, Redirect::to(AUTH_FAILED_REDIRECT));
    }

    match state.oauth.exchange_code(&code).await {
        Ok(credential) => {
            info!(
                expires_in = credential.expires_in(now_millis()).as_secs(),
                "authorization code exchanged, session established"
            );
            metrics::record_callback("success");
            let jar = set_credential(jar, &credential, state.secure_cookies);
            (jar, Redirect::to("/"))
        }
        Err(e) => {
            warn!(error = %e, "authorization code exchange failed");
            metrics::record_callback("exchange_failed");
            (jar, Redirect::to(AUTH_FAILED_REDIRECT))
        }
    }
}

/// POST /auth/token: refresh the credential held in the cookies.
///
/// Any failure clears the credential cookies and reports the upstream
/// status (500 when there was no response) with the upstream payload.
async fn refresh_token(State(state): State<AuthState>, jar: CookieJar) -> Response {
    let Some(refresh) = jar
        .get(REFRESH_TOKEN_COOKIE)
        .map(|c| c.value().to_owned())
        .filter(|v| !v.is_empty())
    else {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "message": "No refresh token available" })),
        )
            .into_response();
    };

    match state.oauth.refresh_token(&refresh).await {
        Ok(credential) => {
            let expires_in = credential.expires_in(now_millis()).as_secs();
            info!(expires_in, "token refreshed via token endpoint");
            metrics::record_refresh("success");
            let jar = set_credential(jar, &credential, state.secure_cookies);
            (
                jar,
                axum::Json(serde_json::json!({ "success": true, "expiresIn": expires_in })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "token refresh failed, clearing cookies");
            metrics::record_refresh(if e.is_terminal() { "invalid" } else { "transient" });
            let status = e
                .upstream_status()
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                clear_credential(jar),
                error_response(status, "Error refreshing token", e.upstream_payload()),
            )
                .into_response()
        }
    }
}

/// GET /auth/status: whether the browser holds an unexpired session.
/// Never exposes the tokens.
async fn status(jar: CookieJar) -> impl IntoResponse {
    let now = now_millis();
    let has_token = jar
        .get(ACCESS_TOKEN_COOKIE)
        .is_some_and(|c| !c.value().is_empty());
    let expiry = jar
        .get(TOKEN_EXPIRY_COOKIE)
        .and_then(|c| c.value().parse::<u64>().ok());

    let authenticated = has_token && expiry.is_some_and(|at| at > now);
    let expires_in = expiry.map(|at| at.saturating_sub(now) / 1000);

    axum::Json(serde_json::json!({
        "authenticated": authenticated,
        "expiryTime": expiry,
        "expiresIn": expires_in,
    }))
}

/// POST /auth/logout: clear the credential cookies.
async fn logout(jar: CookieJar) -> impl IntoResponse {
    info!("session cookies cleared");
    (
        clear_credential(jar),
        axum::Json(serde_json::json!({ "success": true })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, header};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    /// Start a stub token endpoint answering every POST with `status` and
    /// `body`. Returns the endpoint URL and a call counter.
    async fn start_token_server(
        status: StatusCode,
        body: &'static str,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/auth/oauth/token", listener.local_addr().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/auth/oauth/token",
                axum::routing::post(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { (status, [(header::CONTENT_TYPE, "application/json")], body) }
                }),
            );
            axum::serve(listener, app).await.unwrap();
        });

        (url, calls)
    }

    fn test_state(token_url: &str) -> AuthState {
        AuthState {
            oauth: OAuthClient::new(
                reqwest::Client::new(),
                "client-1".into(),
                common::Secret::new("s3cret".into()),
                "http://localhost:3000/auth/callback".into(),
            )
            .with_endpoints("https://api.cloudbeds.com/auth/oauth/authorize", token_url),
            secure_cookies: false,
        }
    }

    fn set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    fn cookie<'a>(cookies: &'a [String], name: &str) -> &'a str {
        cookies
            .iter()
            .find(|c| c.starts_with(&format!("{name}=")))
            .unwrap_or_else(|| panic!("no {name} cookie in {cookies:?}"))
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    #[tokio::test]
    async fn login_sets_state_cookie_and_redirects() {
        let app = build_auth_router(test_state("http://127.0.0.1:1/token"));

        let response = app
            .oneshot(Request::get("/auth/login").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let cookies = set_cookies(&response);
        let state_cookie = cookie(&cookies, OAUTH_STATE_COOKIE);
        assert!(state_cookie.contains("HttpOnly"));
        assert!(state_cookie.contains("Max-Age=600"));

        let state = state_cookie
            .split(';')
            .next()
            .unwrap()
            .trim_start_matches("cloudbedsOAuthState=");
        let url = location(&response);
        assert!(url.starts_with("https://api.cloudbeds.com/auth/oauth/authorize?"));
        assert!(url.contains(&format!("state={state}")));
        assert!(url.contains("response_type=code"));
    }

    #[tokio::test]
    async fn callback_exchanges_code_and_sets_cookies() {
        let (url, calls) = start_token_server(
            StatusCode::OK,
            r#"{"access_token":"at_1","refresh_token":"rt_1","expires_in":3600}"#,
        )
        .await;
        let app = build_auth_router(test_state(&url));

        let before = now_millis();
        let response = app
            .oneshot(
                Request::get("/auth/callback?code=abc123&state=st4te")
                    .header(header::COOKIE, "cloudbedsOAuthState=st4te")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let cookies = set_cookies(&response);
        let access = cookie(&cookies, ACCESS_TOKEN_COOKIE);
        assert!(access.starts_with("cloudbedsToken=at_1"));
        assert!(access.contains("HttpOnly"));
        let refresh = cookie(&cookies, REFRESH_TOKEN_COOKIE);
        assert!(refresh.contains("Max-Age=2592000"));

        let expiry = cookie(&cookies, TOKEN_EXPIRY_COOKIE);
        assert!(!expiry.contains("HttpOnly"));
        let expires_at: u64 = expiry
            .split(';')
            .next()
            .unwrap()
            .trim_start_matches("cloudbedsTokenExpiry=")
            .parse()
            .unwrap();
        let expected = before + 3_600_000;
        assert!(
            expires_at >= expected && expires_at < expected + 5_000,
            "expiry {expires_at} not within 5s of now + 3600s"
        );

        // State cookie consumed.
        assert!(cookie(&cookies, OAUTH_STATE_COOKIE).contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn callback_with_mismatched_state_does_not_exchange() {
        let (url, calls) = start_token_server(StatusCode::OK, "{}").await;
        let app = build_auth_router(test_state(&url));

        let response = app
            .oneshot(
                Request::get("/auth/callback?code=abc123&state=forged")
                    .header(header::COOKIE, "cloudbedsOAuthState=st4te")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(location(&response), AUTH_FAILED_REDIRECT);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_without_code_or_with_error_fails() {
        let (url, calls) = start_token_server(StatusCode::OK, "{}").await;

        for uri in [
            "/auth/callback?state=st4te",
            "/auth/callback?error=access_denied&state=st4te",
        ] {
            let app = build_auth_router(test_state(&url));
            let response = app
                .oneshot(
                    Request::get(uri)
                        .header(header::COOKIE, "cloudbedsOAuthState=st4te")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(location(&response), AUTH_FAILED_REDIRECT, "{uri}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_exchange_failure_redirects_with_indicator() {
        let (url, _) = start_token_server(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant"}"#,
        )
        .await;
        let app = build_auth_router(test_state(&url));

        let response = app
            .oneshot(
                Request::get("/auth/callback?code=used&state=st4te")
                    .header(header::COOKIE, "cloudbedsOAuthState=st4te")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(location(&response), AUTH_FAILED_REDIRECT);
        let cookies = set_cookies(&response);
        assert!(!cookies.iter().any(|c| c.starts_with("cloudbedsToken=")));
    }

    #[tokio::test]
    async fn token_without_refresh_cookie_is_401_without_exchange() {
        let (url, calls) = start_token_server(StatusCode::OK, "{}").await;
        let app = build_auth_router(test_state(&url));

        let response = app
            .oneshot(Request::post("/auth/token").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let body = json_body(response).await;
        assert_eq!(body, serde_json::json!({"message": "No refresh token available"}));
    }

    #[tokio::test]
    async fn token_refresh_success_resets_cookies() {
        let (url, _) = start_token_server(
            StatusCode::OK,
            r#"{"access_token":"at_2","refresh_token":"rt_2","expires_in":3600}"#,
        )
        .await;
        let app = build_auth_router(test_state(&url));

        let response = app
            .oneshot(
                Request::post("/auth/token")
                    .header(header::COOKIE, "cloudbedsRefreshToken=rt_1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookies = set_cookies(&response);
        assert!(cookie(&cookies, ACCESS_TOKEN_COOKIE).starts_with("cloudbedsToken=at_2"));
        assert!(cookie(&cookies, REFRESH_TOKEN_COOKIE).starts_with("cloudbedsRefreshToken=rt_2"));

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        let expires_in = body["expiresIn"].as_u64().unwrap();
        assert!((3595..=3600).contains(&expires_in), "{expires_in}");
    }

    #[tokio::test]
    async fn token_refresh_rejection_clears_cookies_with_upstream_status() {
        let (url, _) = start_token_server(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant"}"#,
        )
        .await;
        let app = build_auth_router(test_state(&url));

        let response = app
            .oneshot(
                Request::post("/auth/token")
                    .header(header::COOKIE, "cloudbedsRefreshToken=rt_revoked")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let cookies = set_cookies(&response);
        for name in [ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE, TOKEN_EXPIRY_COOKIE] {
            assert!(cookie(&cookies, name).contains("Max-Age=0"), "{name}");
        }
        let body = json_body(response).await;
        assert_eq!(body["message"], "Error refreshing token");
        assert_eq!(body["error"]["error"], "invalid_grant");
    }

    #[tokio::test]
    async fn token_refresh_without_response_is_500() {
        let app = build_auth_router(test_state("http://127.0.0.1:1/token"));

        let response = app
            .oneshot(
                Request::post("/auth/token")
                    .header(header::COOKIE, "cloudbedsRefreshToken=rt_1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn status_reads_expiry_cookie() {
        let app = build_auth_router(test_state("http://127.0.0.1:1/token"));
        let expires_at = now_millis() + 120_000;

        let response = app
            .oneshot(
                Request::get("/auth/status")
                    .header(
                        header::COOKIE,
                        format!("cloudbedsToken=at_1; cloudbedsTokenExpiry={expires_at}"),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = json_body(response).await;
        assert_eq!(body["authenticated"], true);
        assert_eq!(body["expiryTime"], expires_at);
        assert!(body["expiresIn"].as_u64().unwrap() <= 120);
        assert!(!body.to_string().contains("at_1"));
    }

    #[tokio::test]
    async fn status_without_cookies_is_unauthenticated() {
        let app = build_auth_router(test_state("http://127.0.0.1:1/token"));

        let response = app
            .oneshot(Request::get("/auth/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = json_body(response).await;
        assert_eq!(body["authenticated"], false);
        assert!(body["expiryTime"].is_null());
    }

    #[tokio::test]
    async fn logout_clears_cookies() {
        let app = build_auth_router(test_state("http://127.0.0.1:1/token"));

        let response = app
            .oneshot(
                Request::post("/auth/logout")
                    .header(header::COOKIE, "cloudbedsToken=at_1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 3);
        assert!(cookies.iter().all(|c| c.contains("Max-Age=0")));
    }
}
