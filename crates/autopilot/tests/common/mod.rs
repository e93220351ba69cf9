//! Shared fixtures: a scripted model and a few in-memory tools.

#![allow(dead_code)]

use autopilot::llm::{LlmClient, LlmEvent, LlmFuture, LlmStream};
use autopilot::tools::{FnTool, ToolResult};
use autopilot::{Message, TokenUsage, ToolCall, ToolDef};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One scripted completion: the events of an opened stream, or an open error.
pub type Reply = Result<Vec<LlmEvent>, String>;

/// A model that replays canned replies in order and records every request.
///
/// When the script runs out, `fallback` is replayed (or the open fails).
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Option<Vec<LlmEvent>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with `events`.
    pub fn repeating(events: Vec<LlmEvent>) -> Self {
        Self {
            fallback: Some(events),
            ..Self::new(Vec::new())
        }
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl LlmClient for ScriptedClient {
    fn chat_completion<'a>(
        &'a self,
        messages: &'a [Message],
        _tools: Option<&'a [ToolDef]>,
    ) -> LlmFuture<'a> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone().map(Ok))
            .unwrap_or_else(|| Err("script exhausted".to_string()));
        Box::pin(async move {
            let events = reply?;
            let stream: LlmStream = Box::pin(futures::stream::iter(events));
            Ok(stream)
        })
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

pub fn usage() -> TokenUsage {
    TokenUsage::new(10, 5)
}

/// A reply that streams `text` in two deltas and ends.
pub fn text_reply(text: &str) -> Vec<LlmEvent> {
    let mid = text.len() / 2;
    let split = (0..=mid).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
    let (head, tail) = text.split_at(split);
    vec![
        LlmEvent::TextDelta(head.to_string()),
        LlmEvent::TextDelta(tail.to_string()),
        LlmEvent::MessageComplete(usage()),
    ]
}

/// A reply made only of tool calls: `(id, name, json_args)`.
pub fn tool_reply(calls: &[(&str, &str, &str)]) -> Vec<LlmEvent> {
    let mut events: Vec<LlmEvent> = calls
        .iter()
        .map(|(id, name, args)| LlmEvent::ToolCallComplete(ToolCall::new(*id, *name, *args)))
        .collect();
    events.push(LlmEvent::MessageComplete(usage()));
    events
}

fn object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

/// Echoes its arguments and logs its name to `log`.
pub fn echo_tool(log: Arc<Mutex<Vec<String>>>) -> FnTool {
    FnTool::new(
        ToolDef::new("echo", "Echo the arguments", object_schema()),
        move |args: serde_json::Value| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("echo".into());
                ToolResult::ok(args.to_string())
            }
        },
    )
}

/// Pretends to write the file named by `path`.
pub fn write_tool(log: Arc<Mutex<Vec<String>>>) -> FnTool {
    FnTool::new(
        ToolDef::new("write_file", "Write a file", object_schema()),
        move |args: serde_json::Value| {
            let log = log.clone();
            async move {
                let path = args["path"].as_str().unwrap_or_default().to_string();
                log.lock().unwrap().push(format!("write_file:{path}"));
                ToolResult::ok(format!("wrote {path}"))
            }
        },
    )
    .mutation(true)
}

/// Always fails.
pub fn failing_tool() -> FnTool {
    FnTool::new(
        ToolDef::new("run_tests", "Run the test suite", object_schema()),
        |_: serde_json::Value| async move {
            ToolResult::failure("2 tests failed").with_exit_code(101)
        },
    )
}
