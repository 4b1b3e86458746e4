//! Items recorded in a session: turns, tool calls, tool results and handoffs
//!
//! This module defines the core data structures of conversation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ToolError;

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by an agent decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier unique within the owning session.
    pub id: String,
    pub name: String,
    /// Structured key/value argument payload.
    pub arguments: Value,
    /// When the model produced the request, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
}

impl ToolCall {
    /// Create a call with a freshly generated identifier.
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: gen_call_id(),
            name: name.into(),
            arguments,
            requested_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn requested_at(mut self, at: DateTime<Utc>) -> Self {
        self.requested_at = Some(at);
        self
    }
}

/// Generates a tool call identifier.
pub fn gen_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Payload or error produced for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { output: Value },
    Failure { error: ToolError },
}

/// The answer to exactly one [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub outcome: ToolOutcome,
    /// Wall-clock execution latency in milliseconds.
    pub latency_ms: u64,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, output: Value, latency: Duration) -> Self {
        Self {
            call_id: call_id.into(),
            outcome: ToolOutcome::Success { output },
            latency_ms: latency.as_millis() as u64,
        }
    }

    pub fn failure(call_id: impl Into<String>, error: ToolError, latency: Duration) -> Self {
        Self {
            call_id: call_id.into(),
            outcome: ToolOutcome::Failure { error },
            latency_ms: latency.as_millis() as u64,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            ToolOutcome::Success { output } => Some(output),
            ToolOutcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ToolError> {
        match &self.outcome {
            ToolOutcome::Success { .. } => None,
            ToolOutcome::Failure { error } => Some(error),
        }
    }

    /// Text rendering shown to the model.
    pub fn render(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success { output } => output.to_string(),
            ToolOutcome::Failure { error } => format!("Error: {}", error),
        }
    }
}

/// A transfer of session ownership between agents. Never removed once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    /// Session turn index at which the handoff occurred.
    pub turn_index: u64,
}

/// What a turn carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    Text { text: String },
    ToolCall { call: ToolCall },
    ToolResult { result: ToolResult },
    Handoff { record: HandoffRecord },
}

/// One appended unit of session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: u64,
    pub role: Role,
    pub content: TurnContent,
    /// Agent that produced the turn, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Single-line rendering used for model prompts and logs.
    pub fn render(&self) -> String {
        match &self.content {
            TurnContent::Text { text } => text.clone(),
            TurnContent::ToolCall { call } => {
                format!("call {} id={} args={}", call.name, call.id, call.arguments)
            }
            TurnContent::ToolResult { result } => {
                format!("result id={} {}", result.call_id, result.render())
            }
            TurnContent::Handoff { record } => format!(
                "handoff from {} to {}: {}",
                record.from_agent, record.to_agent, record.reason
            ),
        }
    }
}
