//! Error types for the orchestration runtime
//!
//! Errors are grouped into the classes the runner reasons about:
//! configuration problems are caught before any loop starts, validation and
//! protocol errors unwind the loop to the caller, execution errors stay
//! inside the loop as tool results, and infrastructure failures of the trace
//! exporter are swallowed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::guardrail::GuardrailVerdict;

/// Result type alias for the runtime
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Agent or tool misconfiguration, detected at construction.
    Configuration,
    /// Guardrail violation or malformed arguments; user-visible.
    Validation,
    /// Tool invocation failure or timeout; recoverable inside the loop.
    Execution,
    /// Unparseable decisions, handoff overflow, turn overflow.
    Protocol,
    /// Session store or trace export failures.
    Infrastructure,
    /// The invocation was cancelled by its caller.
    Cancelled,
}

/// Misconfiguration detected while building tools, agents or the runner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("agent '{agent}' has empty instructions")]
    EmptyInstructions { agent: String },

    #[error("agent name must not be empty")]
    EmptyAgentName,

    #[error("agent '{agent}' references unknown tool '{tool}'")]
    UnknownTool { agent: String, tool: String },

    #[error("agent '{agent}' lists tool '{tool}' more than once")]
    DuplicateAgentTool { agent: String, tool: String },

    #[error("agent '{agent}' references unknown handoff target '{target}'")]
    UnknownHandoffTarget { agent: String, target: String },

    #[error("agent '{agent}' lists handoff target '{target}' more than once")]
    DuplicateHandoffTarget { agent: String, target: String },

    #[error("agent '{agent}' cannot hand off to itself")]
    SelfHandoff { agent: String },

    #[error("agent '{name}' is already defined")]
    DuplicateAgent { name: String },

    #[error("tool '{name}' is already registered")]
    DuplicateTool { name: String },

    #[error("tool '{name}' declares an invalid argument schema: {message}")]
    InvalidToolSchema { name: String, message: String },

    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),
}

/// Failure of a single tool invocation.
///
/// Tool errors never escape the registry as `Err`; they are carried inside a
/// [`ToolResult`](crate::items::ToolResult) and shown to the agent as data.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    #[error("unknown tool '{name}'")]
    UnknownTool { name: String },

    #[error("invalid arguments for tool '{name}': {message}")]
    ArgumentValidation { name: String, message: String },

    #[error("tool '{name}' failed: {message}")]
    Execution { name: String, message: String },

    #[error("tool '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },
}

impl ToolError {
    /// Stable short code for logs and persisted results.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::UnknownTool { .. } => "unknown_tool",
            ToolError::ArgumentValidation { .. } => "argument_validation",
            ToolError::Execution { .. } => "execution",
            ToolError::Timeout { .. } => "timeout",
        }
    }
}

/// Opaque failure reported by the model client collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("model client error: {message}")]
pub struct ModelClientError {
    pub message: String,
}

impl ModelClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure to obtain a usable decision from an agent in one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecisionError {
    /// The model answered, but the answer maps to no decision variant.
    #[error("could not parse model decision: {0}")]
    Parse(String),

    #[error(transparent)]
    ModelClient(#[from] ModelClientError),

    #[error("model decision timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The model asked for a handoff the controller refused.
    #[error("handoff rejected: {0}")]
    HandoffRejected(String),
}

/// Failure of the session store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session store error: {0}")]
    Other(String),
}

/// Terminal failure of a runner invocation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("unknown agent '{name}'")]
    UnknownAgent { name: String },

    #[error("guardrail '{}' violated: {}", .verdict.guardrail, .verdict.reason)]
    GuardrailViolation { verdict: Box<GuardrailVerdict> },

    #[error("maximum turns exceeded: {max_turns}")]
    MaxTurnsExceeded { max_turns: usize },

    #[error("handoff chain exceeded maximum of {max_chain} (rejected transfer to '{target}')")]
    HandoffChainExceeded { max_chain: usize, target: String },

    #[error("agent '{agent}' produced no usable decision after {attempts} attempts: {last}")]
    UnrecoverableDecision {
        agent: String,
        attempts: usize,
        last: DecisionError,
    },

    #[error("invocation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RuntimeError {
    /// Which class of the error taxonomy this failure belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            RuntimeError::Configuration(_) | RuntimeError::UnknownAgent { .. } => {
                ErrorClass::Configuration
            }
            RuntimeError::GuardrailViolation { .. } => ErrorClass::Validation,
            RuntimeError::MaxTurnsExceeded { .. }
            | RuntimeError::HandoffChainExceeded { .. }
            | RuntimeError::UnrecoverableDecision { .. } => ErrorClass::Protocol,
            RuntimeError::Cancelled => ErrorClass::Cancelled,
            RuntimeError::Store(_) => ErrorClass::Infrastructure,
        }
    }

    /// Stable reason code carried by every terminal failure.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RuntimeError::Configuration(_) => "configuration_error",
            RuntimeError::UnknownAgent { .. } => "unknown_agent",
            RuntimeError::GuardrailViolation { .. } => "guardrail_violation",
            RuntimeError::MaxTurnsExceeded { .. } => "max_turns_exceeded",
            RuntimeError::HandoffChainExceeded { .. } => "handoff_chain_exceeded",
            RuntimeError::UnrecoverableDecision { .. } => "unrecoverable_decision",
            RuntimeError::Cancelled => "cancelled",
            RuntimeError::Store(_) => "session_store_error",
        }
    }

    /// The guardrail verdict behind a violation, if any.
    pub fn verdict(&self) -> Option<&GuardrailVerdict> {
        match self {
            RuntimeError::GuardrailViolation { verdict } => Some(verdict),
            _ => None,
        }
    }
}
