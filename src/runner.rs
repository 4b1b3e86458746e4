//! # Runner
//!
//! The `Runner` drives one session through the bounded decision loop:
//!
//! 1. input guardrails, then the caller's input is appended;
//! 2. up to `max_turns` iterations of: ask the owning agent for a decision,
//!    then run its tool calls, apply its handoff, or check and return its
//!    final answer;
//! 3. close the trace and flush it to the exporter.
//!
//! Unusable decisions (parse errors, model client failures, decision
//! timeouts, rejected handoffs) are retried within the turn with a correction
//! prompt, up to `decision_retry_budget` extra attempts. Tool failures are
//! not errors here; they are appended as tool results for the agent to read.
//!
//! The session only ever grows by complete units: a user turn, a tool call
//! with its result, a handoff, or a final answer. When a session store is
//! configured each unit is saved before the loop moves on.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentRegistry};
use crate::config::RuntimeConfig;
use crate::decision::{Decision, HANDOFF_TOOL_PREFIX};
use crate::error::{ConfigurationError, DecisionError, RuntimeError, ToolError};
use crate::guardrail::{first_violation, Checkpoint, GuardrailPipeline, GuardrailVerdict};
use crate::handoff::{HandoffController, HandoffError, HandoffPolicy, HandoffStats};
use crate::items::{gen_call_id, HandoffRecord, ToolCall, ToolResult, Turn, TurnContent};
use crate::model::ModelClient;
use crate::result::{RunFailure, RunResult};
use crate::session::{Session, SessionId, SessionStore};
use crate::tracing::{NoopExporter, SpanId, SpanKind, SpanStatus, TraceExporter, Tracer};
use crate::usage::{Usage, UsageStats};

fn truncate_for_log(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    } else {
        s.to_string()
    }
}

fn format_history_for_log(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| {
            let label = match &t.content {
                TurnContent::Text { .. } => format!("{:?}", t.role).to_uppercase(),
                TurnContent::ToolCall { .. } => "CALL".to_string(),
                TurnContent::ToolResult { .. } => "RESULT".to_string(),
                TurnContent::Handoff { .. } => "HANDOFF".to_string(),
            };
            format!(
                "{:02} {:<9}| {}",
                t.index,
                label,
                truncate_for_log(&t.render(), 160)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn correction_prompt(error: &DecisionError) -> String {
    format!(
        "Your previous response could not be used ({}). Reply with plain text for a final \
         answer, with calls to the listed tools, or with exactly one {}<agent> call.",
        error, HANDOFF_TOOL_PREFIX
    )
}

fn unmetered_request() -> Usage {
    Usage {
        request_count: 1,
        ..Usage::default()
    }
}

/// Counters and audit data accumulated while an invocation runs.
#[derive(Debug, Default)]
struct RunState {
    iterations: usize,
    tool_calls: usize,
    handoffs: Vec<HandoffRecord>,
    handoff_stats: HandoffStats,
    usage: UsageStats,
    verdicts: Vec<GuardrailVerdict>,
    owner: Option<String>,
}

/// What a turn ended with.
enum TurnOutcome {
    Final(String),
    Continue,
}

/// A decision the loop can act on. Handoffs are applied while deciding so
/// that a rejected one can be retried.
enum Accepted {
    Final(String),
    Tools(Vec<ToolCall>),
    Handoff,
}

/// Closes and flushes the trace if the invocation future is dropped early.
struct TraceGuard {
    tracer: Arc<Tracer>,
    export_timeout: Duration,
    armed: bool,
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.tracer.close_open_spans(SpanStatus::Cancelled);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let tracer = self.tracer.clone();
            let timeout = self.export_timeout;
            handle.spawn(async move {
                tracer.flush(timeout).await;
            });
        }
    }
}

/// Builder for [`Runner`].
pub struct RunnerBuilder {
    agents: Arc<AgentRegistry>,
    client: Arc<dyn ModelClient>,
    guardrails: Arc<GuardrailPipeline>,
    config: RuntimeConfig,
    exporter: Arc<dyn TraceExporter>,
    store: Option<Arc<dyn SessionStore>>,
}

impl RunnerBuilder {
    pub fn guardrails(mut self, guardrails: GuardrailPipeline) -> Self {
        self.guardrails = Arc::new(guardrails);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn exporter(mut self, exporter: Arc<dyn TraceExporter>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Runner, ConfigurationError> {
        self.config.validate()?;
        for name in &self.config.handoff_disallow {
            if !self.agents.contains(name) {
                return Err(ConfigurationError::InvalidConfig(format!(
                    "handoff_disallow names unknown agent '{}'",
                    name
                )));
            }
        }
        Ok(Runner {
            agents: self.agents,
            client: self.client,
            guardrails: self.guardrails,
            config: self.config,
            exporter: self.exporter,
            store: self.store,
        })
    }
}

/// Executes agents over sessions. Cheap to clone and safe to share; each
/// invocation gets its own tracer and handoff controller.
#[derive(Clone)]
pub struct Runner {
    agents: Arc<AgentRegistry>,
    client: Arc<dyn ModelClient>,
    guardrails: Arc<GuardrailPipeline>,
    config: RuntimeConfig,
    exporter: Arc<dyn TraceExporter>,
    store: Option<Arc<dyn SessionStore>>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("agents", &self.agents.names())
            .field("guardrails", &self.guardrails)
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn builder(agents: Arc<AgentRegistry>, client: Arc<dyn ModelClient>) -> RunnerBuilder {
        RunnerBuilder {
            agents,
            client,
            guardrails: Arc::new(GuardrailPipeline::new()),
            config: RuntimeConfig::default(),
            exporter: Arc::new(NoopExporter),
            store: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Runs `agent` on `input` against `session`.
    pub async fn run(
        &self,
        session: &mut Session,
        agent: &str,
        input: impl Into<String>,
    ) -> Result<RunResult, RunFailure> {
        self.run_with_cancellation(session, agent, input, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), stopping with [`RuntimeError::Cancelled`]
    /// once `cancel` fires. The session keeps every unit completed before
    /// cancellation and nothing after it.
    pub async fn run_with_cancellation(
        &self,
        session: &mut Session,
        agent: &str,
        input: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<RunResult, RunFailure> {
        let input = input.into();
        let tracer = Arc::new(Tracer::with_exporter(self.exporter.clone()));
        let mut guard = TraceGuard {
            tracer: tracer.clone(),
            export_timeout: self.config.export_timeout(),
            armed: true,
        };
        let root = tracer.start_span(format!("invocation:{}", agent), SpanKind::Invocation, None);
        tracer.set_attribute(&root, "session_id", session.id().to_string());
        tracer.set_attribute(&root, "agent", agent);
        info!(session = %session.id(), agent = %agent, trace_id = %tracer.trace_id(), "run started");

        let mut state = RunState::default();
        let outcome = {
            let drive = self.drive(session, agent, input, &tracer, &root, &mut state);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
                res = drive => res,
            }
        };

        match &outcome {
            Ok(_) => tracer.end_span(&root, SpanStatus::Ok),
            Err(RuntimeError::Cancelled) => {
                tracer.set_attribute(&root, "reason_code", "cancelled");
                tracer.close_open_spans(SpanStatus::Cancelled);
            }
            Err(e) => {
                tracer.set_attribute(&root, "reason_code", e.reason_code());
                tracer.set_attribute(&root, "error", e.to_string());
                tracer.close_open_spans(SpanStatus::Error);
            }
        }
        let trace = tracer.flush(self.config.export_timeout()).await;
        guard.armed = false;

        match outcome {
            Ok(final_output) => {
                info!(
                    session = %session.id(),
                    iterations = state.iterations,
                    tool_calls = state.tool_calls,
                    handoffs = state.handoffs.len(),
                    "run finished"
                );
                Ok(RunResult {
                    final_output,
                    agent: state.owner.unwrap_or_else(|| agent.to_string()),
                    session_id: session.id().clone(),
                    iterations: state.iterations,
                    tool_calls: state.tool_calls,
                    handoffs: state.handoffs,
                    handoff_stats: state.handoff_stats,
                    usage: state.usage,
                    verdicts: state.verdicts,
                    trace,
                })
            }
            Err(error) => {
                warn!(
                    session = %session.id(),
                    reason_code = error.reason_code(),
                    class = ?error.class(),
                    "run failed: {}",
                    error
                );
                Err(RunFailure {
                    error,
                    agent: state.owner,
                    session_id: session.id().clone(),
                    iterations: state.iterations,
                    tool_calls: state.tool_calls,
                    handoffs: state.handoffs,
                    handoff_stats: state.handoff_stats,
                    usage: state.usage,
                    verdicts: state.verdicts,
                    trace,
                })
            }
        }
    }

    /// Loads `session_id` from the configured store (or starts it), runs,
    /// and leaves the saved copy at the last completed turn.
    ///
    /// A resumed session continues with the agent that owned it; `agent`
    /// only picks the owner of a new session.
    pub async fn run_stored(
        &self,
        session_id: &SessionId,
        agent: &str,
        input: impl Into<String>,
    ) -> Result<RunResult, RunFailure> {
        let input = input.into();
        let loaded = match &self.store {
            Some(store) => store.load(session_id).await.map_err(RuntimeError::from),
            None => Err(RuntimeError::Configuration(ConfigurationError::InvalidConfig(
                "run_stored requires a session store".to_string(),
            ))),
        };
        let mut session = match loaded {
            Ok(Some(session)) => session,
            Ok(None) => Session::new(session_id.clone()),
            Err(error) => {
                return Err(RunFailure {
                    error,
                    agent: None,
                    session_id: session_id.clone(),
                    iterations: 0,
                    tool_calls: 0,
                    handoffs: Vec::new(),
                    handoff_stats: HandoffStats::default(),
                    usage: UsageStats::default(),
                    verdicts: Vec::new(),
                    trace: Default::default(),
                })
            }
        };
        let start = session
            .owner()
            .filter(|owner| self.agents.contains(owner))
            .unwrap_or(agent)
            .to_string();
        self.run(&mut session, &start, input).await
    }

    async fn persist(&self, session: &Session) -> Result<(), RuntimeError> {
        if let Some(store) = &self.store {
            store.save(session).await?;
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<Arc<Agent>, RuntimeError> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownAgent {
                name: name.to_string(),
            })
    }

    async fn drive(
        &self,
        session: &mut Session,
        agent: &str,
        input: String,
        tracer: &Tracer,
        root: &SpanId,
        state: &mut RunState,
    ) -> Result<String, RuntimeError> {
        let start = self.resolve(agent)?;

        let verdicts = self
            .guardrails
            .run(Checkpoint::Input, session, &input, Some((tracer, root)))
            .await;
        let violation = first_violation(&verdicts).cloned();
        state.verdicts.extend(verdicts);
        if let Some(verdict) = violation {
            return Err(RuntimeError::GuardrailViolation {
                verdict: Box::new(verdict),
            });
        }

        session.set_owner(start.name());
        state.owner = Some(start.name().to_string());
        session.push_user(input);
        self.persist(session).await?;

        let mut controller =
            HandoffController::for_session(session, start.name(), HandoffPolicy::from(&self.config));
        state.handoff_stats = controller.stats();
        let max_turns = self.config.max_turns;

        for iteration in 1..=max_turns {
            state.iterations = iteration;
            let owner = controller
                .current()
                .map(str::to_string)
                .unwrap_or_else(|| start.name().to_string());
            let agent = self.resolve(&owner)?;

            let turn_span = tracer.start_span(format!("turn {}", iteration), SpanKind::Turn, Some(root));
            tracer.set_attribute(&turn_span, "agent", agent.name());
            debug!(iteration, agent = %agent.name(), "starting turn");
            debug!(
                target: "runner::history",
                "\n=== History for {} ===\n{}\n=== end ===",
                agent.name(),
                format_history_for_log(session.turns())
            );

            match self
                .turn(session, &agent, &mut controller, tracer, &turn_span, state)
                .await
            {
                Ok(TurnOutcome::Final(text)) => {
                    tracer.end_span(&turn_span, SpanStatus::Ok);
                    controller.terminate();
                    return Ok(text);
                }
                Ok(TurnOutcome::Continue) => tracer.end_span(&turn_span, SpanStatus::Ok),
                Err(e) => {
                    tracer.fail_span(&turn_span, e.to_string());
                    controller.terminate();
                    return Err(e);
                }
            }
        }

        controller.terminate();
        Err(RuntimeError::MaxTurnsExceeded { max_turns })
    }

    async fn turn(
        &self,
        session: &mut Session,
        agent: &Agent,
        controller: &mut HandoffController,
        tracer: &Tracer,
        turn_span: &SpanId,
        state: &mut RunState,
    ) -> Result<TurnOutcome, RuntimeError> {
        match self
            .accepted_decision(session, agent, controller, tracer, turn_span, state)
            .await?
        {
            Accepted::Handoff => {
                self.persist(session).await?;
                Ok(TurnOutcome::Continue)
            }
            Accepted::Tools(calls) => {
                self.run_tools(session, agent, calls, tracer, turn_span, state)
                    .await?;
                Ok(TurnOutcome::Continue)
            }
            Accepted::Final(text) => {
                let verdicts = self
                    .guardrails
                    .run(Checkpoint::Output, session, &text, Some((tracer, turn_span)))
                    .await;
                let violation = first_violation(&verdicts).cloned();
                state.verdicts.extend(verdicts);
                if let Some(verdict) = violation {
                    return Err(RuntimeError::GuardrailViolation {
                        verdict: Box::new(verdict),
                    });
                }
                session.push_assistant(agent.name(), text.clone());
                self.persist(session).await?;
                Ok(TurnOutcome::Final(text))
            }
        }
    }

    /// Asks `agent` for decisions until one is usable or the retry budget
    /// runs out. Handoff requests are applied here.
    async fn accepted_decision(
        &self,
        session: &mut Session,
        agent: &Agent,
        controller: &mut HandoffController,
        tracer: &Tracer,
        turn_span: &SpanId,
        state: &mut RunState,
    ) -> Result<Accepted, RuntimeError> {
        let mut attempts = 0usize;
        let mut correction = None;

        loop {
            attempts += 1;
            let span = tracer.start_span(
                format!("decision:{}", agent.name()),
                SpanKind::Decision,
                Some(turn_span),
            );
            tracer.set_attribute(&span, "attempt", attempts);

            let error = match self.decide(agent, session, correction.take()).await {
                Ok((decision, usage)) => {
                    state.usage.record(agent.name(), &usage.unwrap_or_else(unmetered_request));
                    tracer.set_attribute(&span, "decision", decision.kind());
                    tracer.end_span(&span, SpanStatus::Ok);

                    match decision {
                        Decision::FinalAnswer { text } => return Ok(Accepted::Final(text)),
                        Decision::ToolRequest { calls } => return Ok(Accepted::Tools(calls)),
                        Decision::HandoffRequest { target, reason } => {
                            let applied =
                                self.apply_handoff(session, agent, controller, &target, &reason, tracer, turn_span);
                            state.handoff_stats = controller.stats();
                            match applied {
                                Ok(record) => {
                                    state.owner = Some(record.to_agent.clone());
                                    state.handoffs.push(record);
                                    return Ok(Accepted::Handoff);
                                }
                                Err(HandoffError::ChainLimitExceeded { max_chain, target }) => {
                                    return Err(RuntimeError::HandoffChainExceeded { max_chain, target });
                                }
                                Err(rejected) => DecisionError::HandoffRejected(rejected.to_string()),
                            }
                        }
                    }
                }
                Err(error) => {
                    state.usage.record(agent.name(), &unmetered_request());
                    tracer.fail_span(&span, error.to_string());
                    error
                }
            };

            if attempts > self.config.decision_retry_budget {
                return Err(RuntimeError::UnrecoverableDecision {
                    agent: agent.name().to_string(),
                    attempts,
                    last: error,
                });
            }
            warn!(agent = %agent.name(), attempt = attempts, "unusable decision, re-prompting: {}", error);
            correction = Some(correction_prompt(&error));
        }
    }

    async fn decide(
        &self,
        agent: &Agent,
        session: &Session,
        correction: Option<String>,
    ) -> Result<(Decision, Option<Usage>), DecisionError> {
        let fut = agent.decide(
            session,
            self.client.as_ref(),
            &self.agents,
            self.config.history_window,
            correction,
        );
        match self.config.decision_timeout() {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| DecisionError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })?,
            None => fut.await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_handoff(
        &self,
        session: &mut Session,
        agent: &Agent,
        controller: &mut HandoffController,
        target: &str,
        reason: &str,
        tracer: &Tracer,
        turn_span: &SpanId,
    ) -> Result<HandoffRecord, HandoffError> {
        let span = tracer.start_span(
            format!("handoff:{}->{}", agent.name(), target),
            SpanKind::Handoff,
            Some(turn_span),
        );
        let result = controller.transfer(session, &self.agents, target, reason);
        match &result {
            Ok(record) => {
                let mut attrs = Map::new();
                attrs.insert("from".to_string(), json!(record.from_agent));
                attrs.insert("to".to_string(), json!(record.to_agent));
                attrs.insert("reason".to_string(), json!(record.reason));
                attrs.insert("turn_index".to_string(), json!(record.turn_index));
                tracer.record_event(&span, "handoff.accepted", attrs);
                tracer.end_span(&span, SpanStatus::Ok);
            }
            Err(e) => tracer.fail_span(&span, e.to_string()),
        }
        result
    }

    async fn run_tools(
        &self,
        session: &mut Session,
        agent: &Agent,
        calls: Vec<ToolCall>,
        tracer: &Tracer,
        turn_span: &SpanId,
        state: &mut RunState,
    ) -> Result<(), RuntimeError> {
        let tools = self.agents.tools();
        for mut call in calls {
            if session.contains_call_id(&call.id) {
                call.id = gen_call_id();
            }
            let span = tracer.start_span(format!("tool:{}", call.name), SpanKind::ToolCall, Some(turn_span));
            tracer.set_attribute(&span, "call_id", call.id.clone());
            tracer.set_attribute(&span, "arguments", call.arguments.clone());

            let result = if agent.can_use_tool(&call.name) {
                tools.invoke_within(&call, self.config.tool_timeout()).await
            } else {
                warn!(agent = %agent.name(), tool = %call.name, "tool not authorized for agent");
                ToolResult::failure(
                    call.id.clone(),
                    ToolError::UnknownTool {
                        name: call.name.clone(),
                    },
                    Duration::ZERO,
                )
            };

            let mut attrs = Map::new();
            attrs.insert("call_id".to_string(), json!(call.id));
            attrs.insert("success".to_string(), Value::Bool(result.is_success()));
            attrs.insert("latency_ms".to_string(), json!(result.latency_ms));
            if let Some(err) = result.error() {
                attrs.insert("error".to_string(), json!(err.code()));
            }
            tracer.record_event(&span, "tool.result", attrs);
            match result.error() {
                Some(err) => tracer.fail_span(&span, err.to_string()),
                None => tracer.end_span(&span, SpanStatus::Ok),
            }

            session.push_tool_exchange(agent.name(), call, result);
            state.tool_calls += 1;
            self.persist(session).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelResponse, ScriptedModelClient};
    use crate::tool::{ToolDef, ToolDescriptor};
    use crate::tool_registry::ToolRegistry;
    use pretty_assertions::assert_eq;
    use tower::BoxError;

    fn registry() -> Arc<AgentRegistry> {
        let echo = ToolDef::from_fn(ToolDescriptor::new("echo", "Echo arguments"), |args: Value| async move {
            Ok::<_, BoxError>(args)
        });
        let tools = Arc::new(ToolRegistry::from_tools([echo]).unwrap());
        Arc::new(
            AgentRegistry::build(
                tools,
                vec![
                    Agent::builder("main", "Be useful.").tool("echo").handoff("other"),
                    Agent::builder("other", "Be other."),
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundaries() {
        assert_eq!(truncate_for_log("héllo", 10), "héllo");
        assert_eq!(truncate_for_log("héllo wörld", 4), "héll…");
    }

    #[test]
    fn test_builder_validates_config() {
        let client = Arc::new(ScriptedModelClient::new());
        let bad = RuntimeConfig {
            max_turns: 0,
            ..RuntimeConfig::default()
        };
        assert!(Runner::builder(registry(), client.clone()).config(bad).build().is_err());

        let unknown = crate::config::ConfigBuilder::new()
            .disallow_handoff_to("ghost")
            .build();
        assert!(Runner::builder(registry(), client).config(unknown).build().is_err());
    }

    #[tokio::test]
    async fn test_unauthorized_tool_becomes_error_result() {
        let client = Arc::new(
            ScriptedModelClient::new()
                .respond(ModelResponse::tool_call("secret", json!({})))
                .respond(ModelResponse::text("ok")),
        );
        let runner = Runner::builder(registry(), client).build().unwrap();
        let mut session = Session::new("s");

        let result = runner.run(&mut session, "main", "go").await.unwrap();
        assert_eq!(result.tool_calls, 1);
        let (_, tool_result) = session.tool_exchanges().next().unwrap();
        assert_eq!(
            tool_result.error(),
            Some(&ToolError::UnknownTool {
                name: "secret".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_starting_agent() {
        let client = Arc::new(ScriptedModelClient::new());
        let runner = Runner::builder(registry(), client.clone()).build().unwrap();
        let mut session = Session::new("s");

        let failure = runner.run(&mut session, "nobody", "hi").await.unwrap_err();
        assert_eq!(failure.reason_code(), "unknown_agent");
        assert_eq!(session.turn_counter(), 0);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reused_call_ids_are_replaced() {
        let call = |id: &str| {
            ModelResponse::tool_calls(vec![crate::model::RawToolCall {
                id: Some(id.to_string()),
                name: "echo".to_string(),
                arguments: "{}".to_string(),
            }])
        };
        let client = Arc::new(
            ScriptedModelClient::new()
                .respond(call("dup"))
                .respond(call("dup"))
                .respond(ModelResponse::text("done")),
        );
        let runner = Runner::builder(registry(), client).build().unwrap();
        let mut session = Session::new("s");
        runner.run(&mut session, "main", "go").await.unwrap();

        let ids: Vec<_> = session.tool_exchanges().map(|(c, _)| c.id.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], "dup");
        assert_ne!(ids[1], "dup");
    }
}
