//! Cloudbeds Console
//!
//! Single binary for working against the Cloudbeds hotel API:
//! 1. `serve` runs the browser-facing OAuth endpoints and the `/api` pass-through
//! 2. `login` / `complete` authorize a local session
//! 3. `call` and `shell` dispatch API calls with a credential that is kept
//!    fresh by the token manager
//! 4. `status` / `logout` inspect and clear the local session

mod auth_source;
mod config;
mod error;
mod metrics;
mod proxy;
mod routes;
mod session;
mod shell;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use clap::{Parser, Subcommand};
use dispatch::{Dispatcher, StaticAuth};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::proxy::ProxyState;
use crate::routes::AuthState;
use crate::session::Session;
use crate::shell::CallRequest;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "cloudbeds-console", version, about = "Cloudbeds API console")]
struct Cli {
    /// Config file (falls back to CONFIG_PATH, then ./cloudbeds-console.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server
    Serve,
    /// Print the authorization URL for a new session
    Login,
    /// Finish authorization with the code and state from the redirect
    Complete {
        #[arg(long)]
        code: String,
        #[arg(long)]
        state: String,
    },
    /// Dispatch one API call
    Call {
        method: String,
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
        /// Query parameter as key=value (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,
    },
    /// Interactive session: one `METHOD PATH [JSON]` per line
    Shell,
    /// Token state and time to expiry
    Status,
    /// Clear the local session
    Logout,
}

/// Shared state for the operational endpoints.
#[derive(Clone)]
struct AppState {
    started_at: Instant,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes.
///
/// The concurrency limit covers every route; security headers are added to
/// every response, errors included.
fn build_router(
    app: AppState,
    auth: AuthState,
    proxy: ProxyState,
    max_connections: usize,
) -> Router {
    let api = Router::new()
        .route("/api/{*path}", any(proxy::api_passthrough))
        .with_state(proxy);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(app)
        .merge(routes::build_auth_router(auth))
        .merge(api)
        .fallback(not_found)
        .layer(axum::middleware::map_response(security_headers))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let http = reqwest::Client::builder()
        .user_agent(concat!("cloudbeds-console/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    match cli.command {
        Command::Serve => serve(config, http).await,
        Command::Login => {
            let session = Session::open(&config, http).await?;
            let request = session.oauth.build_authorization_url()?;
            session.manager.begin_authorization(&request).await?;
            println!("{}", request.url);
            Ok(())
        }
        Command::Complete { code, state } => {
            let session = Session::open(&config, http).await?;
            let credential = session
                .manager
                .authorize(&code, &state)
                .await
                .context("authorization failed")?;
            println!(
                "authenticated, token expires in {}s",
                credential.expires_in(cloudbeds_auth::now_millis()).as_secs()
            );
            Ok(())
        }
        Command::Call {
            method,
            path,
            body,
            params,
        } => {
            let request = CallRequest::parse(&method, &path, body.as_deref(), &params)?;
            let session = Session::open(&config, http).await?;
            match request.dispatch(&session.dispatcher).await {
                Ok(value) => {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                    Ok(())
                }
                Err(e) => {
                    println!("{}", serde_json::to_string_pretty(&e.payload())?);
                    anyhow::bail!("API call failed with status {}", e.status())
                }
            }
        }
        Command::Shell => {
            let session = Session::open(&config, http).await?;
            shell::run(
                session.manager,
                session.dispatcher,
                session.refresh_interval,
                tokio::io::BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await
        }
        Command::Status => {
            let session = Session::open(&config, http).await?;
            let status = session.manager.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Logout => {
            let session = Session::open(&config, http).await?;
            session.manager.logout().await?;
            println!("logged out");
            Ok(())
        }
    }
}

async fn serve(config: Config, http: reqwest::Client) -> Result<()> {
    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder()?;

    info!(
        listen_addr = %config.server.listen_addr,
        api_base_url = %config.api.base_url,
        secure_cookies = config.server.secure_cookies,
        "starting cloudbeds-console server"
    );

    let auth = AuthState {
        oauth: session::oauth_client(&config, http.clone())?,
        secure_cookies: config.server.secure_cookies,
    };
    let proxy = ProxyState {
        dispatcher: Dispatcher::new(
            http,
            session::api_config(&config),
            Arc::new(StaticAuth::api_key_only()),
        ),
    };
    let app_state = AppState {
        started_at: Instant::now(),
        prometheus,
    };
    let app = build_router(app_state, auth, proxy, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Prometheus metrics endpoint: text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn not_found() -> impl IntoResponse {
    (
        axum::http::StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({ "message": "Not found" })),
    )
}

async fn security_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
    response
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
///
/// A handler that cannot be installed never fires; the other one still does.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
