//! Relay error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid method: {0}")]
    InvalidMethod(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status: {0}")]
    Status(u16),

    #[error("no async runtime: {0}")]
    Runtime(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
