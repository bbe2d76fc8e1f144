// src/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(
        "failed to connect to queue manager '{queue_manager}' at {host}:{port} (channel '{channel}'): {cause}"
    )]
    ConnectionError {
        queue_manager: String,
        host: String,
        port: u16,
        channel: String,
        cause: String,
    },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Send error: {0}")]
    SendError(String),

    #[error("Receive error on message #{sequence}: {cause}")]
    ReceiveError { sequence: u64, cause: String },

    #[error("Failed to close {resource}: {cause}")]
    TeardownError { resource: &'static str, cause: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("Configuration error: {0}")]
    Config(String),
}

// Custom Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn teardown(resource: &'static str, cause: impl ToString) -> Self {
        BridgeError::TeardownError {
            resource,
            cause: cause.to_string(),
        }
    }

    /// True for errors that mean the caller used the API out of order.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, BridgeError::IllegalState(_))
    }
}

impl From<LapinError> for BridgeError {
    fn from(error: LapinError) -> Self {
        BridgeError::Transport(error.to_string())
    }
}
