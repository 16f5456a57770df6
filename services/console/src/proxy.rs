//! Server-side API pass-through
//!
//! `ANY /api/{*path}` forwards to the Cloudbeds API through the dispatcher.
//! The bearer credential comes from the access-token cookie sent with the
//! request; without one (or once it has expired) the configured API key is
//! used. Upstream status and body come back unchanged; failures use the
//! `{message, error}` body of the auth endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use cloudbeds_auth::cookies::credential_from_jar;
use cloudbeds_auth::{ACCESS_TOKEN_COOKIE, now_millis};
use dispatch::{Dispatcher, StaticAuth};
use serde_json::Value;
use tracing::{Instrument, info_span, warn};

use crate::routes::error_response;

#[derive(Clone)]
pub struct ProxyState {
    /// Dispatcher carrying the API connection settings. Its auth source is
    /// replaced per request.
    pub dispatcher: Dispatcher,
}

/// Bearer token for this request: the access-token cookie, unless the expiry
/// cookie says it has lapsed.
fn request_token(jar: &CookieJar) -> Option<String> {
    match credential_from_jar(jar) {
        Some(credential) if credential.is_expired(now_millis()) => None,
        Some(credential) => Some(credential.access_token),
        // No expiry cookie to judge by: trust the access cookie's own Max-Age.
        None => jar.get(ACCESS_TOKEN_COOKIE).map(|c| c.value().to_owned()),
    }
}

pub async fn api_passthrough(
    State(state): State<ProxyState>,
    jar: CookieJar,
    method: Method,
    uri: Uri,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let span = info_span!("api_passthrough", request_id = %request_id, method = %method, path = %uri.path());

    let mut response = forward(&state, &jar, method, uri.path(), &params, &body)
        .instrument(span)
        .await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn forward(
    state: &ProxyState,
    jar: &CookieJar,
    method: Method,
    path: &str,
    params: &[(String, String)],
    body: &Bytes,
) -> Response {
    let body: Option<Value> = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(body) {
            Ok(value) => Some(value),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "Invalid JSON body",
                    serde_json::json!({ "message": e.to_string() }),
                );
            }
        }
    };

    let auth = match request_token(jar) {
        Some(token) => StaticAuth::bearer(&token),
        None => StaticAuth::api_key_only(),
    };
    let dispatcher = state.dispatcher.with_auth(Arc::new(auth));

    match dispatcher.call(method, path, body.as_ref(), params).await {
        Ok(value) => (StatusCode::OK, axum::Json(value)).into_response(),
        Err(e) => {
            warn!(error = %e, "pass-through call failed");
            let status = match &e {
                dispatch::Error::Api { status, .. } => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                dispatch::Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, "Error calling Cloudbeds API", e.payload())
        }
    }
}
