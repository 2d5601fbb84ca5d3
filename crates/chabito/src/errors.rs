use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentError {
    #[error("Unknown tool requested by the model: {0}")]
    UnknownTool(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Model invocation failed: {0}")]
    ModelInvocation(String),

    #[error("Agent loop exceeded {0} tool-call rounds without a final reply")]
    LoopExceeded(usize),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Stable machine-readable code, used by the transports in error bodies
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::UnknownTool(_) => "unknown_tool",
            AgentError::InvalidParameters(_) => "invalid_parameters",
            AgentError::ExecutionError(_) => "tool_execution_failed",
            AgentError::ModelInvocation(_) => "model_invocation_failed",
            AgentError::LoopExceeded(_) => "agent_loop_exceeded",
            AgentError::Timeout { .. } => "timeout",
            AgentError::Internal(_) => "internal_error",
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
