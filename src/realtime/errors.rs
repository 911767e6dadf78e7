//! # Real-Time Errors
//!
//! Error types for the real-time module.

use std::time::Duration;

use thiserror::Error;

/// Result type for real-time operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Real-time errors
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    // ==================
    // Connection Errors
    // ==================
    /// Socket-level failure before or after open
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connect attempt exceeded its budget
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// Connection was closed while an operation was in flight
    #[error("Connection closed")]
    ConnectionClosed,

    // ==================
    // Dispatch Errors
    // ==================
    /// Malformed inbound frame
    #[error("Invalid message format: {0}")]
    Parse(String),

    /// A subscriber returned an error or panicked while handling an event
    #[error("Handler failed: {0}")]
    Handler(String),

    // ==================
    // Presence Errors
    // ==================
    /// Local presence used before `initialize`
    #[error("Not tracking presence")]
    NotTracking,

    // ==================
    // Internal Errors
    // ==================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RealtimeError {
    /// Whether this error schedules a reconnect rather than ending the channel
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RealtimeError::Transport(_) | RealtimeError::Timeout(_) | RealtimeError::ConnectionClosed
        )
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::Parse(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::Transport(e.to_string())
    }
}
