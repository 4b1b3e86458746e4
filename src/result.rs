//! Result types for runner invocations

use thiserror::Error;

use crate::error::{ErrorClass, RuntimeError};
use crate::guardrail::GuardrailVerdict;
use crate::handoff::HandoffStats;
use crate::items::HandoffRecord;
use crate::session::SessionId;
use crate::tracing::TraceSnapshot;
use crate::usage::UsageStats;

/// A successful invocation.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// The final answer, after output guardrails passed.
    pub final_output: String,
    /// Agent that produced the answer.
    pub agent: String,
    pub session_id: SessionId,
    /// Loop iterations (decisions that were acted on).
    pub iterations: usize,
    pub tool_calls: usize,
    /// Handoffs accepted during this invocation.
    pub handoffs: Vec<HandoffRecord>,
    /// Requested, accepted and rejected handoffs in this invocation.
    pub handoff_stats: HandoffStats,
    pub usage: UsageStats,
    /// Every guardrail verdict produced, input checkpoint first.
    pub verdicts: Vec<GuardrailVerdict>,
    pub trace: TraceSnapshot,
}

/// A terminal failure, with whatever the invocation got done before it.
///
/// The session passed to the runner is left at the last fully completed turn.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: RuntimeError,
    /// Owning agent when the invocation stopped.
    pub agent: Option<String>,
    pub session_id: SessionId,
    pub iterations: usize,
    pub tool_calls: usize,
    pub handoffs: Vec<HandoffRecord>,
    pub handoff_stats: HandoffStats,
    pub usage: UsageStats,
    pub verdicts: Vec<GuardrailVerdict>,
    pub trace: TraceSnapshot,
}

impl RunFailure {
    pub fn reason_code(&self) -> &'static str {
        self.error.reason_code()
    }

    pub fn class(&self) -> ErrorClass {
        self.error.class()
    }

    pub fn verdict(&self) -> Option<&GuardrailVerdict> {
        self.error.verdict()
    }

    pub fn into_error(self) -> RuntimeError {
        self.error
    }
}
