//! Error types for the simulator.

use attcpip_protocol::CorrelationId;
use thiserror::Error;

/// Simulator error type.
#[derive(Error, Debug)]
pub enum SimulatorError {
    /// IO error (bind, accept)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Nothing is connected on the named link
    #[error("No client connected on {0} link")]
    NoClient(&'static str),

    /// No deferred command with this id
    #[error("No deferred command with correlation id {0}")]
    UnknownDeferred(CorrelationId),
}

/// Result type for simulator operations.
pub type SimulatorResult<T> = Result<T, SimulatorError>;
