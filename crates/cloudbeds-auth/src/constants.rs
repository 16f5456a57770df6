//! Cloudbeds OAuth endpoints and storage layout
//!
//! Endpoint defaults can be overridden from config (tests point them at a
//! local stub). Cookie and client-store key names are part of the persisted
//! state layout and must not change between releases.

use std::time::Duration;

/// Authorization endpoint the user is redirected to.
pub const AUTHORIZE_ENDPOINT: &str = "https://api.cloudbeds.com/auth/oauth/authorize";

/// Token endpoint for code exchange and token refresh.
pub const TOKEN_ENDPOINT: &str = "https://api.cloudbeds.com/auth/oauth/token";

/// Base URL of the hotel-management API.
pub const API_BASE_URL: &str = "https://api.cloudbeds.com";

/// Fixed capability list requested on every authorization.
pub const SCOPES: &str = "read:property read:roomType read:reservation write:reservation read:guest write:guest read:housekeeping";

/// HTTP-only cookie holding the access token.
pub const ACCESS_TOKEN_COOKIE: &str = "cloudbedsToken";

/// HTTP-only cookie holding the refresh token.
pub const REFRESH_TOKEN_COOKIE: &str = "cloudbedsRefreshToken";

/// Script-readable cookie holding the expiry instant (epoch milliseconds).
pub const TOKEN_EXPIRY_COOKIE: &str = "cloudbedsTokenExpiry";

/// HTTP-only cookie holding the pending anti-forgery state token.
pub const OAUTH_STATE_COOKIE: &str = "cloudbedsOAuthState";

/// Refresh-token cookie lifetime (30 days).
pub const REFRESH_COOKIE_MAX_AGE_SECS: i64 = 30 * 24 * 60 * 60;

/// Lifetime of a pending state token.
pub const STATE_MAX_AGE_SECS: i64 = 600;

/// Upper bound on a single code or refresh exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);
