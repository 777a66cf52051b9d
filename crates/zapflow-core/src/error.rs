//! Zapflow error types.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ZapflowError>;

#[derive(Debug, Error)]
pub enum ZapflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Gateway send failed: {0}")]
    GatewaySend(String),

    #[error("No eligible channel available")]
    NoChannelAvailable,

    #[error("Variator error: {0}")]
    Variator(String),

    #[error("Progress store error: {0}")]
    Progress(String),

    #[error("Invalid dispatch job: {0}")]
    InvalidJob(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = ZapflowError::GatewaySend("WAHA 500: boom".into());
        assert_eq!(err.to_string(), "Gateway send failed: WAHA 500: boom");
    }
}
