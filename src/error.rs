//! Error types for the node manager.
//!
//! Every fallible operation in the crate returns [`Result`]. Validation
//! failures are always reported before anything is written to a node or to
//! the gateway.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed caller input (ids, band indices, offsets...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// No connected node can take the request
    #[error("No available nodes")]
    NoAvailableNodes,

    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    /// The node's persistent socket is not open
    #[error("Node '{0}' is not connected")]
    NodeNotConnected(String),

    #[error("No current track")]
    NoCurrentTrack,

    /// An unresolved track could not be matched against a search
    #[error("Failed to resolve track: {0}")]
    Resolve(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Node responded with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Player for guild {0} has been destroyed")]
    PlayerDestroyed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Checks that an id is a non-empty string of ASCII digits (Discord snowflake).
pub(crate) fn validate_snowflake(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Validation(format!(
            "{} must be a non-empty numeric string, got '{}'",
            kind, value
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snowflake_validation() {
        assert!(validate_snowflake("guild", "123456789").is_ok());
        assert!(validate_snowflake("guild", "").is_err());
        assert!(validate_snowflake("guild", "12a").is_err());
        assert!(validate_snowflake("guild", "-12").is_err());
    }
}
