//! Tool registry: validation, dispatch, deadlines and per-tool statistics
//!
//! The registry is built once and shared read-only between invocations.
//! `invoke` never returns `Err`; every failure (unknown tool, schema
//! mismatch, invoker error, deadline) comes back as a [`ToolResult`] so the
//! runner can hand it to the agent as data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::decision::HANDOFF_TOOL_PREFIX;
use crate::error::{ConfigurationError, ToolError};
use crate::items::{ToolCall, ToolResult};
use crate::model::ToolSchema;
use crate::tool::{ToolDef, ToolDescriptor};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct ToolCounters {
    calls: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    total_latency_ms: AtomicU64,
}

/// Point-in-time call statistics for one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolStats {
    pub calls: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub avg_latency_ms: f64,
}

impl ToolStats {
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        (self.calls - self.failures) as f64 / self.calls as f64
    }
}

struct RegisteredTool {
    def: ToolDef,
    validator: Arc<jsonschema::Validator>,
    counters: ToolCounters,
}

/// Registry of named tools.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Deadline for tools that do not declare their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Builds a registry from a list of tools, failing on the first bad one.
    pub fn from_tools(tools: impl IntoIterator<Item = ToolDef>) -> Result<Self, ConfigurationError> {
        let mut registry = Self::new();
        for tool in tools {
            registry.register(tool)?;
        }
        Ok(registry)
    }

    /// Adds a tool. Names are unique, may not use the handoff prefix, and the
    /// argument schema must compile.
    pub fn register(&mut self, tool: ToolDef) -> Result<(), ConfigurationError> {
        let name = tool.descriptor.name.clone();
        if name.trim().is_empty() {
            return Err(ConfigurationError::InvalidToolSchema {
                name,
                message: "tool name must not be empty".to_string(),
            });
        }
        if name.starts_with(HANDOFF_TOOL_PREFIX) {
            return Err(ConfigurationError::InvalidToolSchema {
                message: format!("names starting with '{}' are reserved for handoffs", HANDOFF_TOOL_PREFIX),
                name,
            });
        }
        if self.tools.contains_key(&name) {
            return Err(ConfigurationError::DuplicateTool { name });
        }
        let validator = jsonschema::Validator::new(&tool.descriptor.parameters).map_err(|e| {
            ConfigurationError::InvalidToolSchema {
                name: name.clone(),
                message: e.to_string(),
            }
        })?;

        debug!(tool = %name, kind = ?tool.descriptor.kind, "registered tool");
        self.order.push(name.clone());
        self.tools.insert(
            name,
            RegisteredTool {
                def: tool,
                validator: Arc::new(validator),
                counters: ToolCounters::default(),
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|t| &t.def.descriptor)
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| &t.def.descriptor)
    }

    /// Model-facing schemas for the named tools, skipping unknown names.
    pub fn schemas_for<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<ToolSchema> {
        names
            .into_iter()
            .filter_map(|n| self.descriptor(n))
            .map(ToolDescriptor::to_schema)
            .collect()
    }

    /// Checks `args` against the tool's declared schema.
    pub fn validate_arguments(&self, name: &str, args: &Value) -> Result<(), ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
        })?;
        Self::validate_with(name, &tool.validator, args)
    }

    fn validate_with(
        name: &str,
        validator: &jsonschema::Validator,
        args: &Value,
    ) -> Result<(), ToolError> {
        if !args.is_object() {
            return Err(ToolError::ArgumentValidation {
                name: name.to_string(),
                message: "arguments must be a JSON object".to_string(),
            });
        }
        if validator.is_valid(args) {
            return Ok(());
        }
        let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
        Err(ToolError::ArgumentValidation {
            name: name.to_string(),
            message: errors.join("; "),
        })
    }

    /// Runs one tool by name, returning its payload or the failure.
    pub async fn invoke_named(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        self.dispatch(name, args, self.default_timeout).await
    }

    /// Runs a call under the registry's default deadline.
    pub async fn invoke(&self, call: &ToolCall) -> ToolResult {
        self.invoke_within(call, self.default_timeout).await
    }

    /// Runs a call; `fallback_timeout` applies unless the tool declares its own.
    pub async fn invoke_within(&self, call: &ToolCall, fallback_timeout: Duration) -> ToolResult {
        let start = Instant::now();
        let outcome = self
            .dispatch(&call.name, call.arguments.clone(), fallback_timeout)
            .await;
        let latency = start.elapsed();

        if let Some(tool) = self.tools.get(&call.name) {
            let c = &tool.counters;
            c.calls.fetch_add(1, Ordering::Relaxed);
            c.total_latency_ms
                .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
            match &outcome {
                Err(ToolError::Timeout { .. }) => {
                    c.failures.fetch_add(1, Ordering::Relaxed);
                    c.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    c.failures.fetch_add(1, Ordering::Relaxed);
                }
                Ok(_) => {}
            }
        }

        match outcome {
            Ok(output) => {
                debug!(tool = %call.name, call_id = %call.id, latency_ms = latency.as_millis() as u64, "tool succeeded");
                ToolResult::success(call.id.clone(), output, latency)
            }
            Err(error) => {
                warn!(tool = %call.name, call_id = %call.id, code = error.code(), "tool failed: {}", error);
                ToolResult::failure(call.id.clone(), error, latency)
            }
        }
    }

    async fn dispatch(
        &self,
        name: &str,
        args: Value,
        fallback_timeout: Duration,
    ) -> Result<Value, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
        })?;
        Self::validate_with(name, &tool.validator, &args)?;

        let timeout = tool.def.descriptor.timeout.unwrap_or(fallback_timeout);
        let invoker = tool.def.invoker.clone();
        match tokio::time::timeout(timeout, invoker.oneshot(args)).await {
            Ok(Ok(output)) => Ok(into_object(output)),
            Ok(Err(e)) => Err(ToolError::Execution {
                name: name.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ToolError::Timeout {
                name: name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn stats(&self, name: &str) -> Option<ToolStats> {
        self.tools.get(name).map(|t| {
            let calls = t.counters.calls.load(Ordering::Relaxed);
            let total = t.counters.total_latency_ms.load(Ordering::Relaxed);
            ToolStats {
                calls,
                failures: t.counters.failures.load(Ordering::Relaxed),
                timeouts: t.counters.timeouts.load(Ordering::Relaxed),
                avg_latency_ms: if calls == 0 {
                    0.0
                } else {
                    total as f64 / calls as f64
                },
            }
        })
    }

    /// Stats for every tool, keyed by name.
    pub fn all_stats(&self) -> HashMap<String, ToolStats> {
        self.order
            .iter()
            .filter_map(|n| self.stats(n).map(|s| (n.clone(), s)))
            .collect()
    }
}

/// Tool outputs are key/value maps; any other value is stored under `"value"`.
fn into_object(output: Value) -> Value {
    match output {
        Value::Object(_) => output,
        other => serde_json::json!({ "value": other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolDescriptor, ToolKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tower::BoxError;

    fn lookup_tool() -> ToolDef {
        ToolDef::from_fn(
            ToolDescriptor::new("lookup", "Look up a key").parameters(json!({
                "type": "object",
                "properties": { "key": { "type": "string" } },
                "required": ["key"]
            })),
            |args: Value| async move {
                match args["key"].as_str() {
                    Some("x") => Ok(json!({"value": "42"})),
                    Some(other) => Err::<Value, BoxError>(format!("no entry for {}", other).into()),
                    None => Err("missing key".into()),
                }
            },
        )
    }

    fn slow_tool(timeout: Duration) -> ToolDef {
        ToolDef::from_fn(
            ToolDescriptor::new("slow", "Sleeps")
                .kind(ToolKind::HostedApi)
                .timeout(timeout),
            |_args: Value| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, BoxError>(json!({}))
            },
        )
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(lookup_tool()).unwrap();
        let err = registry.register(lookup_tool()).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::DuplicateTool {
                name: "lookup".to_string()
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let mut registry = ToolRegistry::new();
        let bad = ToolDef::from_fn(
            ToolDescriptor::new("bad", "").parameters(json!({"type": 12})),
            |_args: Value| async move { Ok::<_, BoxError>(Value::Null) },
        );
        assert!(matches!(
            registry.register(bad),
            Err(ConfigurationError::InvalidToolSchema { .. })
        ));
    }

    #[test]
    fn test_handoff_prefix_is_reserved() {
        let mut registry = ToolRegistry::new();
        let shadow = ToolDef::from_fn(
            ToolDescriptor::new("transfer_to_account", "Moves money"),
            |args: Value| async move { Ok::<_, BoxError>(args) },
        );
        match registry.register(shadow) {
            Err(ConfigurationError::InvalidToolSchema { name, message }) => {
                assert_eq!(name, "transfer_to_account");
                assert!(message.contains("reserved for handoffs"));
            }
            other => panic!("expected a reserved-name error, got {:?}", other),
        }
        assert!(!registry.contains("transfer_to_account"));
    }

    #[tokio::test]
    async fn test_scalar_output_is_wrapped() {
        let count = ToolDef::from_fn(ToolDescriptor::new("count", "Counts"), |_args: Value| async move {
            Ok::<_, BoxError>(json!(5))
        });
        let registry = ToolRegistry::from_tools([count]).unwrap();

        let result = registry.invoke(&ToolCall::new("count", json!({}))).await;
        assert_eq!(result.output(), Some(&json!({"value": 5})));
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let registry = ToolRegistry::from_tools([lookup_tool()]).unwrap();
        let call = ToolCall::new("lookup", json!({"key": "x"}));
        let result = registry.invoke(&call).await;

        assert_eq!(result.call_id, call.id);
        assert_eq!(result.output(), Some(&json!({"value": "42"})));
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let registry = ToolRegistry::new();
        let call = ToolCall::new("missing", json!({}));
        let result = registry.invoke(&call).await;
        assert_eq!(
            result.error(),
            Some(&ToolError::UnknownTool {
                name: "missing".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_invoke_argument_validation() {
        let registry = ToolRegistry::from_tools([lookup_tool()]).unwrap();

        let result = registry.invoke(&ToolCall::new("lookup", json!({}))).await;
        assert!(matches!(
            result.error(),
            Some(ToolError::ArgumentValidation { .. })
        ));

        let result = registry.invoke(&ToolCall::new("lookup", json!("x"))).await;
        assert!(matches!(
            result.error(),
            Some(ToolError::ArgumentValidation { .. })
        ));
    }

    #[tokio::test]
    async fn test_invoke_execution_error() {
        let registry = ToolRegistry::from_tools([lookup_tool()]).unwrap();
        let result = registry
            .invoke(&ToolCall::new("lookup", json!({"key": "y"})))
            .await;
        match result.error() {
            Some(ToolError::Execution { name, message }) => {
                assert_eq!(name, "lookup");
                assert_eq!(message, "no entry for y");
            }
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invoke_timeout_uses_tool_deadline() {
        let registry = ToolRegistry::from_tools([slow_tool(Duration::from_millis(50))]).unwrap();
        let result = registry
            .invoke_within(&ToolCall::new("slow", json!({})), Duration::from_secs(60))
            .await;
        assert_eq!(
            result.error(),
            Some(&ToolError::Timeout {
                name: "slow".to_string(),
                timeout_ms: 50
            })
        );

        let stats = registry.stats("slow").unwrap();
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_invoke_named_and_stats() {
        let registry = ToolRegistry::from_tools([lookup_tool()]).unwrap();
        let out = registry
            .invoke_named("lookup", json!({"key": "x"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"value": "42"}));

        registry.invoke(&ToolCall::new("lookup", json!({"key": "x"}))).await;
        registry.invoke(&ToolCall::new("lookup", json!({"key": "z"}))).await;

        let stats = registry.stats("lookup").unwrap();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.success_rate(), 0.5);
    }

    #[test]
    fn test_schemas_for_preserves_requested_order() {
        let registry = ToolRegistry::from_tools([
            lookup_tool(),
            slow_tool(Duration::from_secs(1)),
        ])
        .unwrap();
        let schemas = registry.schemas_for(["slow", "nope", "lookup"]);
        let names: Vec<_> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["slow", "lookup"]);
    }
}
