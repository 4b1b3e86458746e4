//! # Integration Tests for SQLite Session Storage
//!
//! A runner backed by [`SqliteSessionStore`] should leave the database at the
//! last completed turn, and a fresh store over the same file should pick the
//! conversation up where it stopped.

use agent_orchestrator::{
    Agent, AgentRegistry, ConfigBuilder, ModelResponse, Runner, ScriptedModelClient, SessionId,
    SessionStore, SqliteSessionStore, ToolDef, ToolDescriptor, ToolRegistry, TurnContent,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

fn agents() -> Arc<AgentRegistry> {
    let echo = ToolDef::from_fn(ToolDescriptor::new("echo", "Echo"), |args: Value| async move {
        Ok::<_, tower::BoxError>(args)
    });
    Arc::new(
        AgentRegistry::build(
            Arc::new(ToolRegistry::from_tools([echo]).unwrap()),
            vec![
                Agent::builder("front", "Greet, then hand off.").handoff("back"),
                Agent::builder("back", "Do the work.").tool("echo"),
            ],
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_runner_persists_across_store_instances() {
    // 1. Set up a temporary directory that holds the database file.
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sessions.db");
    let id = SessionId::new("integration_test_user");

    // 2. First process: hand off, call a tool and answer.
    {
        let store = Arc::new(SqliteSessionStore::new(&db_path).await.unwrap());
        let client = Arc::new(
            ScriptedModelClient::new()
                .respond(ModelResponse::handoff("back", "work to do"))
                .respond(ModelResponse::tool_call("echo", json!({"n": 1})))
                .respond(ModelResponse::text("echoed 1")),
        );
        let runner = Runner::builder(agents(), client)
            .store(store.clone())
            .build()
            .unwrap();

        let result = runner.run_stored(&id, "front", "start").await.unwrap();
        assert_eq!(result.final_output, "echoed 1");
        assert_eq!(result.agent, "back");
    }

    // 3. Second process: the stored owner keeps the conversation.
    let store = Arc::new(SqliteSessionStore::new(&db_path).await.unwrap());
    let saved = store.load(&id).await.unwrap().unwrap();
    assert_eq!(saved.owner(), Some("back"));
    assert_eq!(saved.turn_counter(), 5);
    assert_eq!(saved.handoff_chain().len(), 1);
    assert!(matches!(
        saved.turns()[1].content,
        TurnContent::Handoff { .. }
    ));

    let client = Arc::new(ScriptedModelClient::new().respond(ModelResponse::text("still here")));
    let runner = Runner::builder(agents(), client.clone())
        .store(store.clone())
        .build()
        .unwrap();
    let result = runner.run_stored(&id, "front", "again").await.unwrap();

    assert_eq!(result.agent, "back");
    assert_eq!(client.requests()[0].agent, "back");
    assert_eq!(client.requests()[0].history.len(), 6);

    let reloaded = store.load(&id).await.unwrap().unwrap();
    assert_eq!(reloaded.turn_counter(), 7);
    assert_eq!(store.list_sessions().await.unwrap(), vec![id]);
}

#[tokio::test]
async fn test_failed_run_keeps_completed_turns() {
    let store = Arc::new(SqliteSessionStore::new_in_memory().await.unwrap());
    let client = Arc::new(
        ScriptedModelClient::new().then_always(ModelResponse::tool_call("echo", json!({}))),
    );
    let runner = Runner::builder(agents(), client)
        .store(store.clone())
        .config(ConfigBuilder::new().max_turns(2).build())
        .build()
        .unwrap();
    let id = SessionId::new("looping");

    let failure = runner.run_stored(&id, "back", "loop").await.unwrap_err();
    assert_eq!(failure.reason_code(), "max_turns_exceeded");

    let saved = store.load(&id).await.unwrap().unwrap();
    assert_eq!(saved.turn_counter(), 5);
    assert_eq!(saved.tool_exchanges().count(), 2);
}

#[tokio::test]
async fn test_delete_removes_session() {
    let store = SqliteSessionStore::new_in_memory().await.unwrap();
    let id = SessionId::new("gone");
    let mut session = agent_orchestrator::Session::new(id.clone());
    session.push_user("hello");
    store.save(&session).await.unwrap();

    assert!(store.delete(&id).await.unwrap());
    assert!(!store.delete(&id).await.unwrap());
    assert!(store.load(&id).await.unwrap().is_none());
}
