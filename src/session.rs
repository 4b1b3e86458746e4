//! Sessions: the mutable conversation state threaded through a run
//!
//! A [`Session`] is append-only. Turns receive strictly increasing indices,
//! handoff records are only ever pushed, and the accessors hand out shared
//! slices so callers cannot reorder or drop history. Persistence lives behind
//! the [`SessionStore`] trait; [`InMemorySessionStore`] ships here and
//! [`SqliteSessionStore`](crate::sqlite_session::SqliteSessionStore) in its
//! own module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::items::{HandoffRecord, Role, ToolCall, ToolResult, Turn, TurnContent};

/// Session identifier newtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Conversation state owned by at most one in-flight invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: SessionId,
    turns: Vec<Turn>,
    owner: Option<String>,
    turn_counter: u64,
    handoff_chain: Vec<HandoffRecord>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            turns: Vec::new(),
            owner: None,
            turn_counter: 0,
            handoff_chain: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// The most recent `window` turns, or all of them.
    pub fn recent_turns(&self, window: Option<usize>) -> &[Turn] {
        match window {
            Some(n) if n < self.turns.len() => &self.turns[self.turns.len() - n..],
            _ => &self.turns,
        }
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Name of the agent currently owning the conversation.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Index the next appended turn will receive.
    pub fn turn_counter(&self) -> u64 {
        self.turn_counter
    }

    pub fn handoff_chain(&self) -> &[HandoffRecord] {
        &self.handoff_chain
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub(crate) fn set_owner(&mut self, agent: impl Into<String>) {
        self.owner = Some(agent.into());
        self.updated_at = Utc::now();
    }

    fn push(&mut self, role: Role, content: TurnContent, agent: Option<&str>) -> u64 {
        let index = self.turn_counter;
        let now = Utc::now();
        self.turns.push(Turn {
            index,
            role,
            content,
            agent: agent.map(str::to_string),
            created_at: now,
        });
        self.turn_counter += 1;
        self.updated_at = now;
        index
    }

    /// Appends caller input.
    pub fn push_user(&mut self, text: impl Into<String>) -> u64 {
        self.push(Role::User, TurnContent::Text { text: text.into() }, None)
    }

    /// Appends an agent's text answer.
    pub fn push_assistant(&mut self, agent: &str, text: impl Into<String>) -> u64 {
        self.push(
            Role::Assistant,
            TurnContent::Text { text: text.into() },
            Some(agent),
        )
    }

    /// Appends a tool call immediately followed by its result.
    ///
    /// The pair is written together so the history never holds a call
    /// without its answer.
    pub fn push_tool_exchange(&mut self, agent: &str, call: ToolCall, result: ToolResult) -> (u64, u64) {
        debug_assert_eq!(call.id, result.call_id);
        let call_index = self.push(Role::Assistant, TurnContent::ToolCall { call }, Some(agent));
        let result_index = self.push(Role::Tool, TurnContent::ToolResult { result }, Some(agent));
        (call_index, result_index)
    }

    /// Records a transfer of ownership as a visible turn and a chain entry.
    pub fn push_handoff(
        &mut self,
        from: &str,
        to: &str,
        reason: impl Into<String>,
    ) -> HandoffRecord {
        let record = HandoffRecord {
            from_agent: from.to_string(),
            to_agent: to.to_string(),
            reason: reason.into(),
            turn_index: self.turn_counter,
        };
        self.push(
            Role::System,
            TurnContent::Handoff {
                record: record.clone(),
            },
            Some(from),
        );
        self.handoff_chain.push(record.clone());
        self.owner = Some(to.to_string());
        record
    }

    pub fn contains_call_id(&self, id: &str) -> bool {
        self.turns.iter().any(|t| match &t.content {
            TurnContent::ToolCall { call } => call.id == id,
            _ => false,
        })
    }

    /// Tool calls and results in history order.
    pub fn tool_exchanges(&self) -> impl Iterator<Item = (&ToolCall, &ToolResult)> {
        self.turns.windows(2).filter_map(|pair| match (&pair[0].content, &pair[1].content) {
            (TurnContent::ToolCall { call }, TurnContent::ToolResult { result })
                if call.id == result.call_id =>
            {
                Some((call, result))
            }
            _ => None,
        })
    }
}

/// Durable storage for sessions.
///
/// The runner saves after every fully completed turn, so `save` must replace
/// the stored session atomically.
#[async_trait]
pub trait SessionStore: Send + Sync + Debug {
    async fn load(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    async fn save(&self, session: &Session) -> Result<(), StoreError>;
}

/// Process-local [`SessionStore`], mostly useful for tests.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(sessions.get(id).cloned())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        sessions.insert(session.id().clone(), session.clone());
        Ok(())
    }
}
