//! Autonomous loop exit paths against a scripted model.

mod common;

use autopilot::agent::{SessionSnapshot, SessionStore, SharedContextStore, TurnConfig, TurnLoop};
use autopilot::autonomous::{
    AutonomousConfig, AutonomousLoop, CircuitState, ExitMode, ExitReason, ManualClock, RateLimiter,
};
use autopilot::context::{ContextConfig, ContextManager};
use autopilot::tools::{PolicyGate, ToolInvocationPipeline, ToolRegistry};
use chrono::Utc;
use common::{ScriptedClient, Reply, text_reply, tool_reply, write_tool};
use std::path::Path;
use std::sync::{Arc, Mutex};

const FINISHED: &str = "The feature is complete and all tests pass.\n\nEXIT_SIGNAL: true";

fn turn_loop(llm: Arc<ScriptedClient>, registry: ToolRegistry) -> TurnLoop {
    let pipeline = ToolInvocationPipeline::new(Arc::new(registry), Arc::new(PolicyGate::allow_all()));
    let context = ContextManager::new(ContextConfig::default()).with_system_prompt("sys");
    TurnLoop::new(llm, pipeline, context, TurnConfig::default())
}

fn config(dir: &Path) -> AutonomousConfig {
    AutonomousConfig::default().with_rate_limit_file(dir.join("rate_limit.json"))
}

fn limiter(max: u32) -> RateLimiter {
    RateLimiter::in_memory(max, Arc::new(ManualClock::new(Utc::now())))
}

fn autonomous(llm: Arc<ScriptedClient>, config: AutonomousConfig) -> AutonomousLoop {
    AutonomousLoop::new(turn_loop(llm, ToolRegistry::new()), "Implement the feature", config)
        .with_rate_limiter(limiter(100))
}

#[tokio::test]
async fn exits_on_dual_gate_signal() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedClient::new(vec![
        Ok(text_reply("Started on the parser.")),
        Ok(text_reply(FINISHED)),
    ]));
    let mut looped = autonomous(llm.clone(), config(dir.path()));

    let summary = looped.run(10).await;

    assert_eq!(summary.exit_reason, ExitReason::ExitSignal);
    assert_eq!(summary.loops_run, 2);
    assert_eq!(summary.usage.total(), 30);
    assert_eq!(looped.rate_limiter().count(), 2);

    let first_prompt = llm.requests()[0].last().unwrap().text().to_string();
    assert!(first_prompt.starts_with("Implement the feature"));
    assert!(first_prompt.contains("[autonomous loop status]"));
    assert!(first_prompt.contains("loop: 1/10"));
    assert!(first_prompt.contains("EXIT_SIGNAL: true"));
}

#[tokio::test]
async fn completion_words_alone_do_not_exit_in_dual_gate_mode() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedClient::repeating(text_reply(
        "The feature is complete and all tests pass.",
    )));
    let mut looped = autonomous(llm, config(dir.path()));

    let summary = looped.run(2).await;

    assert_eq!(summary.exit_reason, ExitReason::MaxLoopsReached);
    assert_eq!(summary.loops_run, 2);
}

#[tokio::test]
async fn completion_only_mode_exits_without_signal() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedClient::repeating(text_reply(
        "The feature is complete and all tests pass.",
    )));
    let mut looped = autonomous(
        llm,
        config(dir.path()).with_exit_mode(ExitMode::CompletionOnly),
    );

    let summary = looped.run(5).await;

    assert_eq!(summary.exit_reason, ExitReason::ExitSignal);
    assert_eq!(summary.loops_run, 1);
}

#[tokio::test]
async fn breaker_opens_after_loops_without_progress() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedClient::repeating(text_reply("Still thinking.")));
    let mut looped = autonomous(llm.clone(), config(dir.path()));

    let summary = looped.run(10).await;

    assert_eq!(summary.exit_reason, ExitReason::CircuitBreakerOpen);
    assert_eq!(summary.loops_run, 3);
    assert_eq!(looped.breaker().state(), CircuitState::Open);
    assert!(looped.breaker().open_reason().unwrap().contains("no progress"));
    assert_eq!(llm.request_count(), 3);
}

#[tokio::test]
async fn file_changes_keep_the_breaker_closed() {
    let dir = tempfile::tempdir().unwrap();
    let mut replies: Vec<Reply> = Vec::new();
    for i in 0..4 {
        let args = format!(r#"{{"path":"src/file{i}.rs"}}"#);
        let id = format!("c{i}");
        replies.push(Ok(tool_reply(&[(id.as_str(), "write_file", args.as_str())])));
        replies.push(Ok(text_reply("Wrote another file.")));
    }
    let llm = Arc::new(ScriptedClient::new(replies));
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut looped = AutonomousLoop::new(
        turn_loop(llm, ToolRegistry::new().with(write_tool(log))),
        "Write files",
        config(dir.path()),
    )
    .with_rate_limiter(limiter(100));

    let summary = looped.run(4).await;

    assert_eq!(summary.exit_reason, ExitReason::MaxLoopsReached);
    assert_eq!(summary.files_modified.len(), 4);
    assert_eq!(looped.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn stops_when_rate_limited() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedClient::repeating(text_reply("Working.")));
    let mut looped = autonomous(llm.clone(), config(dir.path())).with_rate_limiter(limiter(2));

    let summary = looped.run(10).await;

    assert_eq!(summary.exit_reason, ExitReason::RateLimitExceeded);
    assert_eq!(summary.loops_run, 2);
    assert_eq!(llm.request_count(), 2);
}

#[tokio::test]
async fn provider_failure_ends_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedClient::new(vec![Err("401 unauthorized".into())]));
    let mut looped = autonomous(llm, config(dir.path()));

    let summary = looped.run(10).await;

    assert_eq!(summary.exit_reason, ExitReason::TurnFailed);
    assert_eq!(summary.errors_encountered, 1);
}

#[tokio::test]
async fn cancelled_loop_reports_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedClient::repeating(text_reply("Working.")));
    let mut looped = autonomous(llm.clone(), config(dir.path()));
    looped.turn_loop().cancellation_token().cancel();

    let summary = looped.run(10).await;

    assert_eq!(summary.exit_reason, ExitReason::Cancelled);
    assert_eq!(summary.loops_run, 0);
    assert_eq!(llm.request_count(), 0);
}

#[tokio::test]
async fn records_shared_context_and_session_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let shared_path = dir.path().join("shared.json");
    let mut shared = SharedContextStore::load(&shared_path);
    shared.set("convention", "use anyhow-free errors");

    let store = Arc::new(SessionStore::new(dir.path().join("sessions")).unwrap());
    let snapshot = SessionSnapshot::new();
    let session_id = snapshot.session_id.clone();

    let llm = Arc::new(ScriptedClient::new(vec![
        Ok(text_reply("Halfway there.")),
        Ok(text_reply(FINISHED)),
    ]));
    let mut looped = autonomous(llm.clone(), config(dir.path()))
        .with_shared_context(shared)
        .with_session(store.clone(), snapshot);

    let summary = looped.run(5).await;
    assert_eq!(summary.exit_reason, ExitReason::ExitSignal);

    // Notes were offered to the model.
    let prompt = llm.requests()[0].last().unwrap().text().to_string();
    assert!(prompt.contains("convention: use anyhow-free errors"));

    let reloaded = SharedContextStore::load(&shared_path);
    assert_eq!(reloaded.get_str("last_exit_reason"), Some("exit_signal"));
    assert_eq!(reloaded.get("loops_run"), Some(&serde_json::json!(2)));

    assert_eq!(store.checkpoints(&session_id).await.len(), 2);
    let saved = store.load(&session_id).await.unwrap();
    assert_eq!(saved.turn_count, 2);
    assert_eq!(saved.messages.len(), looped.turn_loop().context().len());
}
