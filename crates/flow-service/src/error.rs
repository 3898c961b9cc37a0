//! Error types for flow services

use flow_engine::FlowEngineError;
use thiserror::Error;

/// Result type alias using FlowServiceError
pub type Result<T> = std::result::Result<T, FlowServiceError>;

/// Errors surfaced by the service layer
#[derive(Debug, Error)]
pub enum FlowServiceError {
    /// Error from the flow engine core
    #[error(transparent)]
    Engine(#[from] FlowEngineError),

    /// The agent runner failed for one agent
    #[error("Agent '{agent_id}' failed: {message}")]
    Agent { agent_id: String, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(serde_json::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(serde_json::Error),
}

impl FlowServiceError {
    /// Whether this error reports a cancelled turn
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Engine(FlowEngineError::Cancelled))
    }
}
