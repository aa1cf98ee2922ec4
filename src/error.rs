use crate::domain::models::SessionState;
use crate::infrastructure::bluetooth::protocol::ParseError;

/// Errors surfaced by the session bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to load collaborators: {0}")]
    Init(String),

    #[error("Session not initialized")]
    NotInitialized,

    #[error("A session is already live in this process")]
    SessionExists,

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Another lifecycle operation is in progress (rejected {operation})")]
    Busy { operation: &'static str },

    #[error("Scan failed: {0}")]
    Scan(String),

    #[error("Failed to connect to {address} after {attempts} attempts: {reason}")]
    Connect {
        address: String,
        attempts: u32,
        reason: String,
    },

    #[error("No live connection")]
    NotConnected,

    #[error("Malformed frame: {0}")]
    Parse(#[from] ParseError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Async runtime error: {0}")]
    Runtime(String),
}

impl BridgeError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn scan(err: impl std::fmt::Display) -> Self {
        Self::Scan(err.to_string())
    }
}
