//! # Guardrails
//!
//! A guardrail is a pass/violate predicate over a candidate text and the
//! session history it would join. The [`GuardrailPipeline`] runs its input
//! guardrails before the first agent decision and its output guardrails on a
//! final answer, in configured order, stopping at the first violation.
//!
//! Every guardrail that ran leaves a [`GuardrailVerdict`], passing or not, so
//! the caller can audit what was checked.
//!
//! ```rust
//! use agent_orchestrator::guardrail::{GuardrailPipeline, PatternBlockGuardrail};
//! use agent_orchestrator::session::Session;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let pipeline = GuardrailPipeline::new().with_output(Arc::new(PatternBlockGuardrail::new(
//!     "no_secrets",
//!     vec!["password".to_string()],
//! )));
//!
//! let session = Session::new("demo");
//! let verdicts = pipeline.check_output(&session, "your password is hunter2").await;
//! assert!(!verdicts[0].passed);
//! assert!(verdicts[0].reason.contains("password"));
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::session::Session;
use crate::tracing::{SpanId, SpanKind, SpanStatus, Tracer};

/// Where in the loop a guardrail runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    Input,
    Output,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::Input => f.write_str("input"),
            Checkpoint::Output => f.write_str("output"),
        }
    }
}

/// Represents the outcome of a guardrail check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub passed: bool,
    pub reason: Option<String>,
}

impl GuardrailResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn violate(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// A validator over candidate input or output.
///
/// Implementations must be pure: the same candidate and session state give
/// the same result.
#[async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, session: &Session, candidate: &str) -> GuardrailResult;
}

/// Audit record of one guardrail evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub guardrail: String,
    pub checkpoint: Checkpoint,
    pub passed: bool,
    pub reason: String,
    /// The candidate text that was evaluated.
    pub payload: String,
}

/// Counters for one guardrail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GuardrailStats {
    pub checks: u64,
    pub violations: u64,
}

impl GuardrailStats {
    pub fn violation_rate(&self) -> f64 {
        if self.checks == 0 {
            0.0
        } else {
            self.violations as f64 / self.checks as f64
        }
    }
}

/// Ordered input and output guardrails.
#[derive(Default)]
pub struct GuardrailPipeline {
    input: Vec<Arc<dyn Guardrail>>,
    output: Vec<Arc<dyn Guardrail>>,
    stats: Mutex<BTreeMap<String, GuardrailStats>>,
}

impl fmt::Debug for GuardrailPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |gs: &[Arc<dyn Guardrail>]| gs.iter().map(|g| g.name().to_string()).collect::<Vec<_>>();
        f.debug_struct("GuardrailPipeline")
            .field("input", &names(&self.input))
            .field("output", &names(&self.output))
            .finish()
    }
}

impl GuardrailPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.input.push(guardrail);
        self
    }

    pub fn with_output(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.output.push(guardrail);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.output.is_empty()
    }

    pub async fn check_input(&self, session: &Session, candidate: &str) -> Vec<GuardrailVerdict> {
        self.run(Checkpoint::Input, session, candidate, None).await
    }

    pub async fn check_output(&self, session: &Session, candidate: &str) -> Vec<GuardrailVerdict> {
        self.run(Checkpoint::Output, session, candidate, None).await
    }

    /// Runs one checkpoint, opening a span per guardrail under `parent`.
    pub(crate) async fn run(
        &self,
        checkpoint: Checkpoint,
        session: &Session,
        candidate: &str,
        trace: Option<(&Tracer, &SpanId)>,
    ) -> Vec<GuardrailVerdict> {
        let guardrails = match checkpoint {
            Checkpoint::Input => &self.input,
            Checkpoint::Output => &self.output,
        };

        let mut verdicts = Vec::with_capacity(guardrails.len());
        for guardrail in guardrails {
            let span = trace.map(|(tracer, parent)| {
                let id = tracer.start_span(
                    format!("guardrail:{}", guardrail.name()),
                    SpanKind::Guardrail,
                    Some(parent),
                );
                tracer.set_attribute(&id, "checkpoint", checkpoint.to_string());
                id
            });

            let result = guardrail.check(session, candidate).await;
            let verdict = GuardrailVerdict {
                guardrail: guardrail.name().to_string(),
                checkpoint,
                passed: result.passed,
                reason: result.reason.unwrap_or_else(|| {
                    if result.passed {
                        "passed".to_string()
                    } else {
                        format!("rejected by {}", guardrail.name())
                    }
                }),
                payload: candidate.to_string(),
            };
            self.record(&verdict);

            if let (Some((tracer, _)), Some(id)) = (trace, span.as_ref()) {
                tracer.set_attribute(id, "passed", verdict.passed);
                if verdict.passed {
                    tracer.end_span(id, SpanStatus::Ok);
                } else {
                    tracer.fail_span(id, verdict.reason.clone());
                }
            }

            let violated = !verdict.passed;
            verdicts.push(verdict);
            if violated {
                break;
            }
        }
        verdicts
    }

    fn record(&self, verdict: &GuardrailVerdict) {
        if verdict.passed {
            debug!(guardrail = %verdict.guardrail, checkpoint = %verdict.checkpoint, "guardrail passed");
        } else {
            warn!(guardrail = %verdict.guardrail, checkpoint = %verdict.checkpoint, "guardrail violated: {}", verdict.reason);
        }
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        let entry = stats.entry(verdict.guardrail.clone()).or_default();
        entry.checks += 1;
        if !verdict.passed {
            entry.violations += 1;
        }
    }

    pub fn stats(&self) -> BTreeMap<String, GuardrailStats> {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// First failing verdict in a checkpoint's list.
pub fn first_violation(verdicts: &[GuardrailVerdict]) -> Option<&GuardrailVerdict> {
    verdicts.iter().find(|v| !v.passed)
}

/// Rejects candidates longer than a number of characters.
#[derive(Debug, Clone)]
pub struct MaxLengthGuardrail {
    name: String,
    max_length: usize,
}

impl MaxLengthGuardrail {
    pub fn new(max_length: usize) -> Self {
        Self {
            name: format!("max_length_{}", max_length),
            max_length,
        }
    }
}

#[async_trait]
impl Guardrail for MaxLengthGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, _session: &Session, candidate: &str) -> GuardrailResult {
        let len = candidate.chars().count();
        if len > self.max_length {
            GuardrailResult::violate(format!(
                "length {} exceeds maximum of {} characters",
                len, self.max_length
            ))
        } else {
            GuardrailResult::pass()
        }
    }
}

/// Blocks candidates containing any of a list of patterns, case-insensitively.
///
/// ```rust
/// use agent_orchestrator::guardrail::{Guardrail, PatternBlockGuardrail};
/// use agent_orchestrator::session::Session;
///
/// # #[tokio::main]
/// # async fn main() {
/// let filter = PatternBlockGuardrail::new("profanity", vec!["darn".to_string()]);
/// let session = Session::new("s");
/// assert!(filter.check(&session, "What a wonderful day!").await.passed);
/// assert!(!filter.check(&session, "Oh, DARN it!").await.passed);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PatternBlockGuardrail {
    name: String,
    patterns: Vec<String>,
}

impl PatternBlockGuardrail {
    pub fn new(name: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl Guardrail for PatternBlockGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, _session: &Session, candidate: &str) -> GuardrailResult {
        let lower = candidate.to_lowercase();
        match self.patterns.iter().find(|p| lower.contains(p.as_str())) {
            Some(pattern) => GuardrailResult::violate(format!("contains blocked pattern: {}", pattern)),
            None => GuardrailResult::pass(),
        }
    }
}

/// Restricts the `"format"` field of structured candidates.
///
/// A candidate that parses as a JSON object with a string `"format"` field
/// must name one of the allowed formats. Anything else passes.
#[derive(Debug, Clone)]
pub struct FormatGuardrail {
    name: String,
    allowed: Vec<String>,
}

impl FormatGuardrail {
    pub fn new(name: impl Into<String>, allowed: Vec<String>) -> Self {
        Self {
            name: name.into(),
            allowed,
        }
    }
}

#[async_trait]
impl Guardrail for FormatGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, _session: &Session, candidate: &str) -> GuardrailResult {
        let parsed: Value = match serde_json::from_str(candidate) {
            Ok(value) => value,
            Err(_) => return GuardrailResult::pass(),
        };
        match parsed.get("format").and_then(Value::as_str) {
            Some(format) if !self.allowed.iter().any(|a| a == format) => GuardrailResult::violate(
                format!("format must be one of: {}", self.allowed.join(", ")),
            ),
            _ => GuardrailResult::pass(),
        }
    }
}

type PolicyFn = dyn Fn(&Session, &str) -> Option<String> + Send + Sync;

/// Guardrail from a closure returning a violation reason, or `None` to pass.
pub struct PolicyGuardrail {
    name: String,
    policy: Arc<PolicyFn>,
}

impl PolicyGuardrail {
    pub fn new<F>(name: impl Into<String>, policy: F) -> Self
    where
        F: Fn(&Session, &str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            policy: Arc::new(policy),
        }
    }
}

impl fmt::Debug for PolicyGuardrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyGuardrail")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl Guardrail for PolicyGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, session: &Session, candidate: &str) -> GuardrailResult {
        match (self.policy)(session, candidate) {
            Some(reason) => GuardrailResult::violate(reason),
            None => GuardrailResult::pass(),
        }
    }
}
