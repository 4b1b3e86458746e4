//! # Agent Orchestrator
//!
//! A bounded execution loop for LLM agents. A [`Runner`] asks the agent that
//! owns a [`Session`] for a decision, acts on it (run tools, hand the
//! conversation to another agent, or return a final answer) and repeats until
//! an answer passes the output guardrails or a limit is hit.
//!
//! ## Core Concepts
//!
//! - **Tools**: named capabilities with a JSON schema, backed by a Tower
//!   service and registered in a [`ToolRegistry`]
//! - **Agents**: instructions, model settings, authorized tools and allowed
//!   handoff targets, validated into an [`AgentRegistry`]
//! - **Guardrails**: ordered, fail-fast checks on input and final output
//! - **Handoffs**: validated transfers of ownership between agents
//! - **Tracing**: a span tree per invocation, flushed to a [`TraceExporter`]
//!
//! The model itself sits behind the [`ModelClient`] trait; nothing here
//! speaks a vendor protocol.
//!
//! ## Getting Started
//!
//! ```rust
//! use agent_orchestrator::{
//!     tool_typed, Agent, AgentRegistry, ModelResponse, Runner, ScriptedModelClient, Session,
//!     ToolRegistry,
//! };
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Deserialize, JsonSchema)]
//! struct AddArgs {
//!     a: f64,
//!     b: f64,
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let add = tool_typed("add", "Add two numbers", |args: AddArgs| async move {
//!     Ok::<_, tower::BoxError>(serde_json::json!({ "sum": args.a + args.b }))
//! });
//! let tools = Arc::new(ToolRegistry::from_tools([add])?);
//! let agents = Arc::new(AgentRegistry::build(
//!     tools,
//!     vec![Agent::builder("math", "You add numbers.").tool("add")],
//! )?);
//!
//! let client = Arc::new(
//!     ScriptedModelClient::new()
//!         .respond(ModelResponse::tool_call("add", serde_json::json!({"a": 2, "b": 2})))
//!         .respond(ModelResponse::text("2 + 2 = 4")),
//! );
//! let runner = Runner::builder(agents, client).build()?;
//!
//! let mut session = Session::new("demo");
//! let result = runner.run(&mut session, "math", "What is 2 + 2?").await?;
//! assert_eq!(result.final_output, "2 + 2 = 4");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod decision;
pub mod error;
pub mod guardrail;
pub mod handoff;
pub mod items;
pub mod model;
pub mod result;
pub mod runner;
pub mod session;
pub mod sqlite_session;
pub mod tool;
pub mod tool_registry;
pub mod tracing;
pub mod usage;

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentRegistry};
pub use config::{ConfigBuilder, RuntimeConfig};
pub use decision::{parse_response, Decision};
pub use error::{
    ConfigurationError, DecisionError, ErrorClass, ModelClientError, RuntimeError, StoreError,
    ToolError,
};
pub use guardrail::{
    Checkpoint, Guardrail, GuardrailPipeline, GuardrailResult, GuardrailVerdict,
    FormatGuardrail, MaxLengthGuardrail, PatternBlockGuardrail, PolicyGuardrail,
};
pub use handoff::{HandoffController, HandoffError, HandoffPolicy, HandoffState, HandoffStats};
pub use items::{HandoffRecord, Role, ToolCall, ToolOutcome, ToolResult, Turn, TurnContent};
pub use model::{
    model_fn, ModelClient, ModelRequest, ModelResponse, ModelSettings, RawToolCall,
    ScriptedModelClient, ToolSchema,
};
pub use result::{RunFailure, RunResult};
pub use runner::{Runner, RunnerBuilder};
pub use session::{InMemorySessionStore, Session, SessionId, SessionStore};
pub use sqlite_session::SqliteSessionStore;
pub use tool::{invoker_fn, tool_typed, ToolDef, ToolDescriptor, ToolInvoker, ToolKind};
pub use tool_registry::{ToolRegistry, ToolStats};
pub use crate::tracing::{
    InMemoryExporter, LogExporter, NoopExporter, Span, SpanKind, SpanStatus, TraceExporter,
    TraceSnapshot, Tracer,
};
pub use usage::{Usage, UsageStats};
