//! Console command errors
//!
//! Per-request errors of the HTTP handlers are rendered directly as JSON
//! responses and never propagate as Rust errors. These cover the commands
//! typed into the CLI and the interactive shell.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("invalid JSON body: {0}")]
    InvalidBody(String),

    #[error("invalid parameter {0:?}, expected key=value")]
    InvalidParam(String),

    #[error("expected `METHOD PATH [JSON]`, `status`, `logout` or `quit`")]
    InvalidCommand,
}

/// Result alias using console Error
pub type Result<T> = std::result::Result<T, Error>;
