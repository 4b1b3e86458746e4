//! Mapping raw model responses onto decisions
//!
//! Exactly one of three things can come back from an agent step. Anything
//! that does not map cleanly onto one of them is a parse error; nothing is
//! guessed.
//!
//! Handoffs are offered to the model as pseudo-tools named
//! `transfer_to_<agent>`, so a transfer request arrives as a tool call with
//! that prefix and an optional `reason` argument.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecisionError;
use crate::items::{gen_call_id, ToolCall};
use crate::model::ModelResponse;

/// Name prefix of handoff pseudo-tools.
pub const HANDOFF_TOOL_PREFIX: &str = "transfer_to_";

/// Outcome of one agent reasoning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    FinalAnswer { text: String },
    ToolRequest { calls: Vec<ToolCall> },
    HandoffRequest { target: String, reason: String },
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::FinalAnswer { .. } => "final_answer",
            Decision::ToolRequest { .. } => "tool_request",
            Decision::HandoffRequest { .. } => "handoff_request",
        }
    }
}

/// Pseudo-tool name advertising a handoff to `agent`.
pub fn handoff_tool_name(agent: &str) -> String {
    format!("{}{}", HANDOFF_TOOL_PREFIX, agent)
}

fn parse_arguments(name: &str, raw: &str) -> Result<Value, DecisionError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let value: Value = serde_json::from_str(raw).map_err(|e| {
        DecisionError::Parse(format!("arguments for '{}' are not valid JSON: {}", name, e))
    })?;
    if !value.is_object() {
        return Err(DecisionError::Parse(format!(
            "arguments for '{}' must be a JSON object",
            name
        )));
    }
    Ok(value)
}

/// Classifies a model response.
pub fn parse_response(response: &ModelResponse) -> Result<Decision, DecisionError> {
    if response.tool_calls.is_empty() {
        return match response.content.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Ok(Decision::FinalAnswer {
                text: text.to_string(),
            }),
            _ => Err(DecisionError::Parse(
                "response has neither text nor tool calls".to_string(),
            )),
        };
    }

    let transfers = response
        .tool_calls
        .iter()
        .filter(|c| c.name.starts_with(HANDOFF_TOOL_PREFIX))
        .count();

    if transfers > 0 {
        if response.tool_calls.len() > 1 {
            return Err(DecisionError::Parse(
                "a handoff must be the only call in a response".to_string(),
            ));
        }
        let call = &response.tool_calls[0];
        let target = call.name[HANDOFF_TOOL_PREFIX.len()..].trim();
        if target.is_empty() {
            return Err(DecisionError::Parse("handoff names no target agent".to_string()));
        }
        let args = parse_arguments(&call.name, &call.arguments)?;
        let reason = match args.get("reason") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(DecisionError::Parse(
                    "handoff reason must be a string".to_string(),
                ))
            }
        };
        return Ok(Decision::HandoffRequest {
            target: target.to_string(),
            reason,
        });
    }

    let mut calls = Vec::with_capacity(response.tool_calls.len());
    for raw in &response.tool_calls {
        if raw.name.trim().is_empty() {
            return Err(DecisionError::Parse("tool call without a name".to_string()));
        }
        let arguments = parse_arguments(&raw.name, &raw.arguments)?;
        let id = raw
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(gen_call_id);
        calls.push(ToolCall {
            id,
            name: raw.name.clone(),
            arguments,
            requested_at: Some(chrono::Utc::now()),
        });
    }

    // Call ids must be unique within one request.
    let mut seen = std::collections::HashSet::new();
    if !calls.iter().all(|c| seen.insert(c.id.clone())) {
        return Err(DecisionError::Parse("duplicate tool call ids".to_string()));
    }

    Ok(Decision::ToolRequest { calls })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawToolCall;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_text_is_final_answer() {
        let d = parse_response(&ModelResponse::text("  42 ")).unwrap();
        assert_eq!(
            d,
            Decision::FinalAnswer {
                text: "42".to_string()
            }
        );
    }

    #[test]
    fn test_empty_response_is_parse_error() {
        assert!(matches!(
            parse_response(&ModelResponse::default()),
            Err(DecisionError::Parse(_))
        ));
        assert!(parse_response(&ModelResponse::text("   ")).is_err());
    }

    #[test]
    fn test_tool_calls_become_tool_request() {
        let resp = ModelResponse::tool_calls(vec![
            RawToolCall {
                id: Some("call_a".to_string()),
                name: "lookup".to_string(),
                arguments: r#"{"key":"x"}"#.to_string(),
            },
            RawToolCall::new("lookup", json!({"key": "y"})),
        ]);
        match parse_response(&resp).unwrap() {
            Decision::ToolRequest { calls } => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].id, "call_a");
                assert_eq!(calls[0].arguments, json!({"key": "x"}));
                assert!(calls[1].id.starts_with("call_"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tool_call_with_text_is_still_tool_request() {
        let mut resp = ModelResponse::tool_call("lookup", json!({"key": "x"}));
        resp.content = Some("let me check".to_string());
        assert_eq!(parse_response(&resp).unwrap().kind(), "tool_request");
    }

    #[test]
    fn test_handoff_pseudo_tool() {
        let d = parse_response(&ModelResponse::handoff("billing", "invoice question")).unwrap();
        assert_eq!(
            d,
            Decision::HandoffRequest {
                target: "billing".to_string(),
                reason: "invoice question".to_string()
            }
        );

        let bare = ModelResponse::tool_calls(vec![RawToolCall {
            id: None,
            name: handoff_tool_name("billing"),
            arguments: String::new(),
        }]);
        assert_eq!(
            parse_response(&bare).unwrap(),
            Decision::HandoffRequest {
                target: "billing".to_string(),
                reason: String::new()
            }
        );
    }

    #[test]
    fn test_ambiguous_responses_rejected() {
        let mixed = ModelResponse::tool_calls(vec![
            RawToolCall::new("transfer_to_billing", json!({})),
            RawToolCall::new("lookup", json!({"key": "x"})),
        ]);
        assert!(parse_response(&mixed).is_err());

        let bad_args = ModelResponse::tool_calls(vec![RawToolCall {
            id: None,
            name: "lookup".to_string(),
            arguments: "{not json".to_string(),
        }]);
        assert!(parse_response(&bad_args).is_err());

        let array_args = ModelResponse::tool_call("lookup", json!(["x"]));
        assert!(parse_response(&array_args).is_err());

        let no_target = ModelResponse::tool_call("transfer_to_", json!({}));
        assert!(parse_response(&no_target).is_err());

        let dup = ModelResponse::tool_calls(vec![
            RawToolCall {
                id: Some("c".to_string()),
                name: "a".to_string(),
                arguments: "{}".to_string(),
            },
            RawToolCall {
                id: Some("c".to_string()),
                name: "b".to_string(),
                arguments: "{}".to_string(),
            },
        ]);
        assert!(parse_response(&dup).is_err());
    }
}
