//! Daemon error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("push client error: {0}")]
    Push(#[from] bridge_push::PushError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
