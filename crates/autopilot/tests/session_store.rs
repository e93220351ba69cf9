//! Session persistence and resume.

mod common;

use autopilot::agent::events::EventSender;
use autopilot::agent::{SessionSnapshot, SessionStore, TurnConfig, TurnLoop};
use autopilot::context::{ContextConfig, ContextManager};
use autopilot::tools::{PolicyGate, ToolInvocationPipeline, ToolRegistry};
use autopilot::{Message, MessageRole};
use common::{ScriptedClient, text_reply};
use std::sync::Arc;

fn pipeline() -> ToolInvocationPipeline {
    ToolInvocationPipeline::new(Arc::new(ToolRegistry::new()), Arc::new(PolicyGate::allow_all()))
}

#[tokio::test]
async fn save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path()).unwrap();

    let mut snapshot = SessionSnapshot::new();
    snapshot.messages = vec![Message::system("sys"), Message::user("Fix the parser")];
    snapshot.turn_count = 3;
    store.save(&snapshot).await.unwrap();

    let loaded = store.load(&snapshot.session_id).await.unwrap();
    assert_eq!(loaded, snapshot);
    assert!(store.load("missing").await.is_none());
    assert!(store.load("../escape").await.is_none());
}

#[tokio::test]
async fn list_and_latest_order_by_update_time() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path()).unwrap();

    let mut older = SessionSnapshot::new();
    older.messages = vec![Message::user("first task")];
    older.updated_at = older.updated_at - chrono::Duration::hours(1);
    let mut newer = SessionSnapshot::new();
    newer.messages = vec![Message::user("second task")];
    store.save(&older).await.unwrap();
    store.save(&newer).await.unwrap();
    store.checkpoint(&newer).await.unwrap();

    let listed = store.list().await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].session_id, newer.session_id);
    assert_eq!(listed[1].preview, "first task");
    assert_eq!(store.latest().await.unwrap().session_id, newer.session_id);
}

#[tokio::test]
async fn checkpoints_accumulate_without_touching_the_primary() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path()).unwrap();
    let mut snapshot = SessionSnapshot::new();

    for turn in 0..3 {
        snapshot.turn_count = turn;
        store.checkpoint(&snapshot).await.unwrap();
    }

    assert_eq!(store.checkpoints(&snapshot.session_id).await.len(), 3);
    assert!(store.load(&snapshot.session_id).await.is_none());
    assert!(store.list().await.is_empty());
}

#[tokio::test]
async fn malformed_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path()).unwrap();
    let good = SessionSnapshot::new();
    store.save(&good).await.unwrap();
    std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

    let listed = store.list().await;
    assert_eq!(listed.len(), 1);
    assert!(store.load("broken").await.is_none());
}

#[tokio::test]
async fn resumed_session_continues_the_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path()).unwrap();

    let llm = Arc::new(ScriptedClient::new(vec![
        Ok(text_reply("First answer.")),
        Ok(text_reply("Second answer.")),
    ]));
    let context = ContextManager::new(ContextConfig::default()).with_system_prompt("sys");
    let mut first = TurnLoop::new(llm.clone(), pipeline(), context, TurnConfig::default());
    let outcome = first.run("Question one", &EventSender::disconnected()).await;

    let mut snapshot = SessionSnapshot::new();
    snapshot.update_from(first.context(), outcome.turns);
    store.save(&snapshot).await.unwrap();

    let saved = store.latest().await.unwrap();
    let restored = ContextManager::restore(
        ContextConfig::default(),
        saved.messages.clone(),
        saved.total_usage,
    );
    let mut second = TurnLoop::new(llm.clone(), pipeline(), restored, TurnConfig::default());
    second.run("Question two", &EventSender::disconnected()).await;

    let request = llm.requests().pop().unwrap();
    let texts: Vec<&str> = request.iter().map(|m| m.text()).collect();
    assert_eq!(texts, vec!["sys", "Question one", "First answer.", "Question two"]);
    assert_eq!(request[2].role, MessageRole::Assistant);
    assert_eq!(second.context().total_usage().total(), 30);
}
