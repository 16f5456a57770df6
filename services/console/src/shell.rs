//! Interactive console session
//!
//! Reads one command per line and dispatches it through the session. While
//! the shell is open the periodic token check runs in the background, so an
//! idle session keeps its credential fresh.
//!
//! Commands:
//! - `METHOD PATH [JSON]`: dispatch an API call (query string allowed in PATH)
//! - `status`: token state and time to expiry
//! - `logout`: clear both stores
//! - `quit` / `exit`

use dispatch::Dispatcher;
use reqwest::Method;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use token_lifecycle::{TokenManager, spawn_refresh_task};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// A parsed API call.
#[derive(Debug, PartialEq)]
pub struct CallRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub params: Vec<(String, String)>,
}

impl CallRequest {
    /// Build a call from CLI arguments.
    pub fn parse(method: &str, path: &str, body: Option<&str>, params: &[String]) -> Result<Self> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::InvalidMethod(method.to_string()))?;
        let body = body
            .map(|raw| serde_json::from_str(raw).map_err(|e| Error::InvalidBody(e.to_string())))
            .transpose()?;
        let params = params
            .iter()
            .map(|param| match param.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
                _ => Err(Error::InvalidParam(param.clone())),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            method,
            path: path.to_string(),
            body,
            params,
        })
    }

    pub async fn dispatch(&self, dispatcher: &Dispatcher) -> dispatch::Result<Value> {
        dispatcher
            .call(
                self.method.clone(),
                &self.path,
                self.body.as_ref(),
                &self.params,
            )
            .await
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Call(CallRequest),
    Status,
    Logout,
    Quit,
}

/// Parse one shell line. Blank lines are `None`.
fn parse_line(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    match line {
        "status" => return Ok(Some(Command::Status)),
        "logout" => return Ok(Some(Command::Logout)),
        "quit" | "exit" => return Ok(Some(Command::Quit)),
        _ => {}
    }

    let (method, rest) = line.split_once(char::is_whitespace).ok_or(Error::InvalidCommand)?;
    let rest = rest.trim_start();
    let (path, body) = match rest.split_once(char::is_whitespace) {
        Some((path, body)) => (path, Some(body.trim())),
        None => (rest, None),
    };
    CallRequest::parse(method, path, body, &[]).map(|call| Some(Command::Call(call)))
}

/// Run the shell until `quit` or end of input.
pub async fn run<R, W>(
    manager: TokenManager,
    dispatcher: Dispatcher,
    refresh_interval: std::time::Duration,
    input: R,
    mut output: W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let initial = manager.check().await;
    info!(state = initial.label(), "shell session started");
    let refresher = spawn_refresh_task(manager.clone(), refresh_interval);

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match parse_line(&line) {
            Ok(None) => continue,
            Ok(Some(Command::Quit)) => break,
            Ok(Some(Command::Status)) => serde_json::to_string_pretty(&manager.status().await)?,
            Ok(Some(Command::Logout)) => match manager.logout().await {
                Ok(()) => "logged out".to_string(),
                Err(e) => format!("error: {e}"),
            },
            Ok(Some(Command::Call(call))) => match call.dispatch(&dispatcher).await {
                Ok(value) => serde_json::to_string_pretty(&value)?,
                Err(e) => {
                    warn!(error = %e, "shell call failed");
                    let body = serde_json::json!({ "status": e.status(), "error": e.payload() });
                    serde_json::to_string_pretty(&body)?
                }
            },
            Err(e) => format!("error: {e}"),
        };
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }

    refresher.abort();
    info!("shell session ended");
    Ok(())
}
