//! Shared types for the Cloudbeds console workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
