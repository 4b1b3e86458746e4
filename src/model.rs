//! Model client abstraction
//!
//! The runtime never talks to a model vendor directly. It hands a
//! [`ModelRequest`] to a [`ModelClient`] and gets back a loosely-shaped
//! [`ModelResponse`], which [`decision::parse_response`](crate::decision::parse_response)
//! turns into a typed decision.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ModelClientError;
use crate::items::Turn;
use crate::usage::Usage;

/// Opaque model configuration bound to an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Model identifier understood by the client.
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Vendor-specific knobs passed through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ModelSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Callable advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Everything the model sees for one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub agent: String,
    pub system_instructions: String,
    /// Authorized tools followed by handoff pseudo-tools.
    pub tool_schemas: Vec<ToolSchema>,
    pub history: Vec<Turn>,
    pub settings: ModelSettings,
    /// Set when re-prompting after an unusable answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
}

/// A tool call as the model emitted it, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    /// Argument payload as JSON text.
    pub arguments: String,
}

impl RawToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments: arguments.to_string(),
        }
    }
}

/// Raw model answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<RawToolCall>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self::tool_calls(vec![RawToolCall::new(name, arguments)])
    }

    pub fn tool_calls(calls: Vec<RawToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Default::default()
        }
    }

    /// A transfer request in the pseudo-tool form agents advertise.
    pub fn handoff(target: &str, reason: &str) -> Self {
        Self::tool_call(
            format!("{}{}", crate::decision::HANDOFF_TOOL_PREFIX, target),
            serde_json::json!({ "reason": reason }),
        )
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Model backend collaborator.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelClientError>;
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelClientError> {
        (**self).complete(request).await
    }
}

/// Client backed by an async closure.
pub struct FnModelClient<F> {
    f: F,
}

/// Wraps an async closure as a [`ModelClient`].
pub fn model_fn<F, Fut>(f: F) -> FnModelClient<F>
where
    F: Fn(ModelRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ModelResponse, ModelClientError>> + Send + 'static,
{
    FnModelClient { f }
}

#[async_trait]
impl<F, Fut> ModelClient for FnModelClient<F>
where
    F: Fn(ModelRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ModelResponse, ModelClientError>> + Send + 'static,
{
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelClientError> {
        (self.f)(request).await
    }
}

/// Deterministic client replaying a fixed script of responses.
///
/// Once the script runs out, the fallback (if any) is returned forever;
/// otherwise every further call fails.
#[derive(Default)]
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<Result<ModelResponse, ModelClientError>>>,
    fallback: Option<ModelResponse>,
    delay: Option<Duration>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, response: ModelResponse) -> Self {
        self.push(Ok(response))
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.push(Err(ModelClientError::new(message)))
    }

    /// Response returned once the script is exhausted.
    pub fn then_always(mut self, response: ModelResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    /// Sleeps before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(self, entry: Result<ModelResponse, ModelClientError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(entry);
        }
        self
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelClientError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .map_err(|e| ModelClientError::new(e.to_string()))?
            .pop_front();
        match (next, &self.fallback) {
            (Some(entry), _) => entry,
            (None, Some(fallback)) => Ok(fallback.clone()),
            (None, None) => Err(ModelClientError::new("script exhausted")),
        }
    }
}
