//! # Tracing for Runner Invocations
//!
//! A [`Tracer`] records the timeline of one runner invocation as nested
//! spans (invocation → turn → decision / tool call / guardrail / handoff)
//! plus timestamped events attached to a span. It is a passive observer:
//! none of its operations return errors or influence control flow, and a
//! failing [`TraceExporter`] only leaves a diagnostic behind.
//!
//! Every span and event is also mirrored to the `tracing` crate so the usual
//! subscriber setup shows the run as it happens.
//!
//! ```rust
//! use agent_orchestrator::tracing::{SpanKind, SpanStatus, Tracer};
//!
//! let tracer = Tracer::new();
//! let root = tracer.start_span("invocation", SpanKind::Invocation, None);
//! let tool = tracer.start_span("tool:get_weather", SpanKind::ToolCall, Some(&root));
//! tracer.record_event(&tool, "tool.result", serde_json::Map::new());
//! tracer.end_span(&tool, SpanStatus::Ok);
//! tracer.end_span(&root, SpanStatus::Ok);
//!
//! let snapshot = tracer.snapshot();
//! assert_eq!(snapshot.spans.len(), 2);
//! assert_eq!(snapshot.spans[1].parent_id.as_ref(), Some(&root));
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A unique identifier for a trace (one runner invocation).
pub type TraceId = String;

/// A unique identifier for a span.
pub type SpanId = String;

pub fn gen_trace_id() -> TraceId {
    Uuid::new_v4().to_string()
}

pub fn gen_span_id() -> SpanId {
    Uuid::new_v4().to_string()
}

/// What a span measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Invocation,
    Turn,
    Decision,
    ToolCall,
    Guardrail,
    Handoff,
    Custom,
}

/// Final state of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    /// Still open.
    #[default]
    Unset,
    Ok,
    Error,
    Cancelled,
}

/// A named, timed interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: SpanId,
    pub trace_id: TraceId,
    pub parent_id: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    /// Set when the span is closed.
    pub end_time: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    pub error: Option<String>,
    pub attributes: Map<String, Value>,
}

impl Span {
    fn new(trace_id: TraceId, parent_id: Option<SpanId>, name: String, kind: SpanKind) -> Self {
        Self {
            id: gen_span_id(),
            trace_id,
            parent_id,
            name,
            kind,
            start_time: Utc::now(),
            end_time: None,
            status: SpanStatus::Unset,
            error: None,
            attributes: Map::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

/// A timestamped fact attached to a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub span_id: SpanId,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: Map<String, Value>,
}

/// Failure reported by a trace exporter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("trace export failed: {0}")]
pub struct ExportError(pub String);

/// Destination for finished traces.
#[async_trait]
pub trait TraceExporter: Send + Sync {
    async fn export(&self, trace_id: &str, spans: &[Span], events: &[Event])
        -> Result<(), ExportError>;
}

#[derive(Debug, Default)]
struct TraceBuffer {
    spans: Vec<Span>,
    events: Vec<Event>,
    diagnostics: Vec<String>,
    flushed: bool,
}

/// Collects spans and events for one invocation.
pub struct Tracer {
    trace_id: TraceId,
    buffer: Mutex<TraceBuffer>,
    exporter: Arc<dyn TraceExporter>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("trace_id", &self.trace_id)
            .finish_non_exhaustive()
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    /// Tracer whose flush goes nowhere.
    pub fn new() -> Self {
        Self::with_exporter(Arc::new(NoopExporter))
    }

    pub fn with_exporter(exporter: Arc<dyn TraceExporter>) -> Self {
        let trace_id = gen_trace_id();
        debug!(trace_id = %trace_id, "starting trace");
        Self {
            trace_id,
            buffer: Mutex::new(TraceBuffer::default()),
            exporter,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    // A panic while holding the lock must not take tracing down with it.
    fn lock(&self) -> MutexGuard<'_, TraceBuffer> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Opens a span. After a flush the trace is sealed and the returned id
    /// refers to nothing.
    pub fn start_span(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<&SpanId>,
    ) -> SpanId {
        let span = Span::new(self.trace_id.clone(), parent.cloned(), name.into(), kind);
        let id = span.id.clone();
        let mut buf = self.lock();
        if buf.flushed {
            buf.diagnostics
                .push(format!("span '{}' started after flush", span.name));
            return id;
        }
        debug!(trace_id = %self.trace_id, span_id = %id, kind = ?kind, "start span {}", span.name);
        buf.spans.push(span);
        id
    }

    /// Attaches a key/value attribute to an open span.
    pub fn set_attribute(&self, span_id: &SpanId, key: impl Into<String>, value: impl Into<Value>) {
        let mut buf = self.lock();
        if buf.flushed {
            return;
        }
        if let Some(span) = buf.spans.iter_mut().find(|s| &s.id == span_id) {
            span.attributes.insert(key.into(), value.into());
        }
    }

    /// Closes a span. Closing twice keeps the first status.
    pub fn end_span(&self, span_id: &SpanId, status: SpanStatus) {
        self.close(span_id, status, None);
    }

    /// Closes a span as failed with a message.
    pub fn fail_span(&self, span_id: &SpanId, error: impl Into<String>) {
        self.close(span_id, SpanStatus::Error, Some(error.into()));
    }

    fn close(&self, span_id: &SpanId, status: SpanStatus, error: Option<String>) {
        let mut buf = self.lock();
        if buf.flushed {
            return;
        }
        let Some(span) = buf.spans.iter_mut().find(|s| &s.id == span_id) else {
            return;
        };
        if !span.is_open() {
            return;
        }
        span.end_time = Some(Utc::now());
        span.status = status;
        match &error {
            Some(e) => warn!(span_id = %span_id, status = ?status, "span {} failed: {}", span.name, e),
            None => debug!(span_id = %span_id, status = ?status, duration_ms = span.duration_ms().unwrap_or(0), "end span {}", span.name),
        }
        span.error = error;
    }

    /// Closes every open span with `status`, innermost first.
    pub fn close_open_spans(&self, status: SpanStatus) {
        let open: Vec<SpanId> = {
            let buf = self.lock();
            buf.spans
                .iter()
                .rev()
                .filter(|s| s.is_open())
                .map(|s| s.id.clone())
                .collect()
        };
        for id in open {
            self.end_span(&id, status);
        }
    }

    pub fn record_event(&self, span_id: &SpanId, name: impl Into<String>, attributes: Map<String, Value>) {
        let name = name.into();
        let mut buf = self.lock();
        if buf.flushed {
            buf.diagnostics
                .push(format!("event '{}' recorded after flush", name));
            return;
        }
        let rendered = Value::Object(attributes.clone());
        debug!(span_id = %span_id, event = %name, "{}", rendered);
        buf.events.push(Event {
            span_id: span_id.clone(),
            name,
            timestamp: Utc::now(),
            attributes,
        });
    }

    /// Local notes about tracing problems, such as export failures.
    pub fn diagnostics(&self) -> Vec<String> {
        self.lock().diagnostics.clone()
    }

    pub fn snapshot(&self) -> TraceSnapshot {
        let buf = self.lock();
        TraceSnapshot {
            trace_id: self.trace_id.clone(),
            spans: buf.spans.clone(),
            events: buf.events.clone(),
            diagnostics: buf.diagnostics.clone(),
        }
    }

    /// Seals the trace and hands it to the exporter, waiting at most
    /// `timeout`. Export failures become diagnostics. Only the first flush
    /// exports.
    pub async fn flush(&self, timeout: Duration) -> TraceSnapshot {
        let (spans, events) = {
            let mut buf = self.lock();
            if buf.flushed {
                drop(buf);
                return self.snapshot();
            }
            buf.flushed = true;
            (buf.spans.clone(), buf.events.clone())
        };

        let outcome = tokio::time::timeout(
            timeout,
            self.exporter.export(&self.trace_id, &spans, &events),
        )
        .await;
        let diagnostic = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "trace export timed out after {}ms",
                timeout.as_millis()
            )),
        };
        if let Some(message) = diagnostic {
            warn!(trace_id = %self.trace_id, "{}", message);
            self.lock().diagnostics.push(message);
        }
        self.snapshot()
    }
}

/// Immutable copy of a trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSnapshot {
    pub trace_id: TraceId,
    pub spans: Vec<Span>,
    pub events: Vec<Event>,
    pub diagnostics: Vec<String>,
}

/// Aggregate counts over a trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceSummary {
    pub total_spans: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub open: usize,
    pub events: usize,
    pub avg_duration_ms: f64,
}

impl TraceSnapshot {
    pub fn spans_of(&self, kind: SpanKind) -> impl Iterator<Item = &Span> {
        self.spans.iter().filter(move |s| s.kind == kind)
    }

    pub fn span_named(&self, name: &str) -> Option<&Span> {
        self.spans.iter().find(|s| s.name == name)
    }

    pub fn children_of<'a>(&'a self, parent: &'a SpanId) -> impl Iterator<Item = &'a Span> {
        self.spans
            .iter()
            .filter(move |s| s.parent_id.as_ref() == Some(parent))
    }

    pub fn root(&self) -> Option<&Span> {
        self.spans.iter().find(|s| s.parent_id.is_none())
    }

    pub fn events_for<'a>(&'a self, span: &'a SpanId) -> impl Iterator<Item = &'a Event> {
        self.events.iter().filter(move |e| &e.span_id == span)
    }

    pub fn summary(&self) -> TraceSummary {
        let mut summary = TraceSummary {
            total_spans: self.spans.len(),
            events: self.events.len(),
            ..Default::default()
        };
        let mut total_ms = 0i64;
        let mut closed = 0usize;
        for span in &self.spans {
            match span.status {
                SpanStatus::Ok => summary.completed += 1,
                SpanStatus::Error => summary.failed += 1,
                SpanStatus::Cancelled => summary.cancelled += 1,
                SpanStatus::Unset => {}
            }
            match span.duration_ms() {
                Some(ms) => {
                    total_ms += ms;
                    closed += 1;
                }
                None => summary.open += 1,
            }
        }
        if closed > 0 {
            summary.avg_duration_ms = total_ms as f64 / closed as f64;
        }
        summary
    }
}

/// Discards every trace.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

#[async_trait]
impl TraceExporter for NoopExporter {
    async fn export(&self, _: &str, _: &[Span], _: &[Event]) -> Result<(), ExportError> {
        Ok(())
    }
}

/// Writes a finished trace as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExporter;

#[async_trait]
impl TraceExporter for LogExporter {
    async fn export(&self, trace_id: &str, spans: &[Span], events: &[Event]) -> Result<(), ExportError> {
        info!(trace_id = %trace_id, spans = spans.len(), events = events.len(), "trace finished");
        for span in spans {
            info!(
                trace_id = %trace_id,
                span_id = %span.id,
                parent_id = span.parent_id.as_deref().unwrap_or("-"),
                kind = ?span.kind,
                status = ?span.status,
                duration_ms = span.duration_ms().unwrap_or(0),
                "{}",
                span.name
            );
        }
        Ok(())
    }
}

/// An exported trace held by [`InMemoryExporter`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedTrace {
    pub trace_id: TraceId,
    pub spans: Vec<Span>,
    pub events: Vec<Event>,
}

/// Keeps exported traces in memory, mainly for tests.
#[derive(Debug, Default, Clone)]
pub struct InMemoryExporter {
    traces: Arc<Mutex<Vec<ExportedTrace>>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<ExportedTrace> {
        self.traces
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TraceExporter for InMemoryExporter {
    async fn export(&self, trace_id: &str, spans: &[Span], events: &[Event]) -> Result<(), ExportError> {
        let mut traces = self
            .traces
            .lock()
            .map_err(|e| ExportError(e.to_string()))?;
        traces.push(ExportedTrace {
            trace_id: trace_id.to_string(),
            spans: spans.to_vec(),
            events: events.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct FailingExporter;

    #[async_trait]
    impl TraceExporter for FailingExporter {
        async fn export(&self, _: &str, _: &[Span], _: &[Event]) -> Result<(), ExportError> {
            Err(ExportError("collector unreachable".to_string()))
        }
    }

    struct StuckExporter;

    #[async_trait]
    impl TraceExporter for StuckExporter {
        async fn export(&self, _: &str, _: &[Span], _: &[Event]) -> Result<(), ExportError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[test]
    fn test_trace_id_generation() {
        let id1 = gen_trace_id();
        let id2 = gen_trace_id();
        assert_ne!(id1, id2);
        assert!(!id1.is_empty());
    }

    #[test]
    fn test_span_nesting_and_status() {
        let tracer = Tracer::new();
        let root = tracer.start_span("invocation", SpanKind::Invocation, None);
        let turn = tracer.start_span("turn 1", SpanKind::Turn, Some(&root));
        tracer.fail_span(&turn, "boom");
        tracer.end_span(&turn, SpanStatus::Ok);
        tracer.end_span(&root, SpanStatus::Error);

        let snap = tracer.snapshot();
        let turn_span = snap.span_named("turn 1").unwrap();
        assert_eq!(turn_span.status, SpanStatus::Error);
        assert_eq!(turn_span.error.as_deref(), Some("boom"));
        assert_eq!(snap.children_of(&root).count(), 1);
        assert_eq!(snap.root().map(|s| &s.id), Some(&root));
    }

    #[test]
    fn test_events_attach_to_span() {
        let tracer = Tracer::new();
        let span = tracer.start_span("tool:lookup", SpanKind::ToolCall, None);
        let mut attrs = Map::new();
        attrs.insert("call_id".to_string(), json!("call_1"));
        tracer.record_event(&span, "tool.result", attrs);
        tracer.set_attribute(&span, "tool", "lookup");

        let snap = tracer.snapshot();
        let events: Vec<_> = snap.events_for(&span).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attributes["call_id"], json!("call_1"));
        assert_eq!(snap.spans[0].attributes["tool"], json!("lookup"));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_event_log_line_carries_attributes() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let tracer = Tracer::new();
            let span = tracer.start_span("handoff", SpanKind::Handoff, None);
            let mut attrs = Map::new();
            attrs.insert("to".to_string(), json!("billing"));
            tracer.record_event(&span, "handoff.accepted", attrs);
            assert_eq!(tracer.snapshot().events.len(), 1);
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("handoff.accepted"), "{}", output);
        assert!(output.contains(r#"{"to":"billing"}"#), "{}", output);
    }

    #[test]
    fn test_close_open_spans() {
        let tracer = Tracer::new();
        let root = tracer.start_span("invocation", SpanKind::Invocation, None);
        let done = tracer.start_span("turn 1", SpanKind::Turn, Some(&root));
        tracer.end_span(&done, SpanStatus::Ok);
        tracer.start_span("turn 2", SpanKind::Turn, Some(&root));

        tracer.close_open_spans(SpanStatus::Cancelled);

        let summary = tracer.snapshot().summary();
        assert_eq!(summary.total_spans, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.cancelled, 2);
        assert_eq!(summary.open, 0);
    }

    #[tokio::test]
    async fn test_flush_exports_once_and_seals() {
        let exporter = InMemoryExporter::new();
        let tracer = Tracer::with_exporter(Arc::new(exporter.clone()));
        let root = tracer.start_span("invocation", SpanKind::Invocation, None);
        tracer.end_span(&root, SpanStatus::Ok);

        tracer.flush(Duration::from_secs(1)).await;
        tracer.flush(Duration::from_secs(1)).await;
        assert_eq!(exporter.traces().len(), 1);
        assert_eq!(exporter.traces()[0].trace_id, tracer.trace_id());

        tracer.start_span("late", SpanKind::Custom, None);
        let snap = tracer.snapshot();
        assert_eq!(snap.spans.len(), 1);
        assert_eq!(snap.diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn test_export_failure_is_a_diagnostic() {
        let tracer = Tracer::with_exporter(Arc::new(FailingExporter));
        tracer.start_span("invocation", SpanKind::Invocation, None);

        let snap = tracer.flush(Duration::from_secs(1)).await;
        assert_eq!(
            snap.diagnostics,
            vec!["trace export failed: collector unreachable".to_string()]
        );
    }

    #[tokio::test]
    async fn test_export_timeout_is_bounded() {
        let tracer = Tracer::with_exporter(Arc::new(StuckExporter));
        let started = std::time::Instant::now();
        let snap = tracer.flush(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(snap.diagnostics[0].contains("timed out"));
    }
}
