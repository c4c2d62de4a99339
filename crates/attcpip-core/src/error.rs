//! Error types for the control core.

use attcpip_protocol::{CorrelationId, DecodeError, SummaryState};
use std::time::Duration;
use thiserror::Error;

/// Why a pending command ended without a terminal reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No terminal reply within the command's timeout.
    #[error("Command timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The command was cancelled locally.
    #[error("Command cancelled")]
    Cancelled,

    /// The connection dropped while the command was pending.
    #[error("Connection lost while command pending: {reason}")]
    Disconnected { reason: String },
}

/// Core error type.
#[derive(Error, Debug)]
pub enum CoreError {
    /// IO error (socket operations, config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Undecodable inbound data
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A correlation id was registered twice. Indicates a bug.
    #[error("Duplicate correlation id {0}")]
    DuplicateCorrelation(CorrelationId),

    /// Command rejected by the summary-state machine.
    #[error("Command {command} rejected in state {state}: {reason}")]
    InvalidState {
        command: String,
        state: SummaryState,
        reason: &'static str,
    },

    /// The link is not connected.
    #[error("Not connected")]
    NotConnected,

    /// TCP connect did not finish in time.
    #[error("Connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// The remote controller reported a failure.
    #[error("Command {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The command never reached a terminal reply.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
