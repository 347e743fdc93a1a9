//! Error types for bor-core

use crate::sandbox::SandboxError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BorError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("staging error: {0}")]
    Staging(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
