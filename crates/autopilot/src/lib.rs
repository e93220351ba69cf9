//! Autonomous coding-assistant runtime.
//!
//! `autopilot` drives a turn-based conversation with a language model, lets
//! the model call tools, keeps the conversation inside a token budget, and
//! can run unattended for many iterations with safeguards against runaway or
//! stalled execution.
//!
//! The core abstraction is the [`TurnLoop`](agent::turn_loop::TurnLoop): it
//! streams a completion, dispatches tool calls sequentially through the
//! [`ToolInvocationPipeline`](tools::pipeline::ToolInvocationPipeline), and
//! repeats until the model answers without tool calls or `max_turns` is hit.
//! The [`AutonomousLoop`](autonomous::AutonomousLoop) wraps it with a
//! persisted rate limiter, a circuit breaker, and a regex response analyzer.
//!
//! # Getting started
//!
//! ```ignore
//! use autopilot::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let providers = ProviderTable::with_builtin();
//!     let llm = providers.build("openrouter", &ProviderSettings::from_env("z-ai/glm-5")?)?;
//!
//!     let tools = Arc::new(ToolRegistry::new());
//!     let pipeline = ToolInvocationPipeline::new(tools, Arc::new(PolicyGate::allow_all()));
//!     let context = ContextManager::new(ContextConfig::default())
//!         .with_system_prompt("You are a careful coding assistant.");
//!
//!     let turn_loop = TurnLoop::new(llm, pipeline, context, TurnConfig::default());
//!     let mut stream = turn_loop.spawn("Summarize src/main.rs");
//!     while let Some(event) = stream.next_event().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | Turn loop, event stream, repetition detection, session store, shared context |
//! | [`context`] | [`ContextManager`](context::ContextManager), compaction engine, summarizer |
//! | [`tools`] | [`Tool`](tools::core::Tool) trait, registry, hooks, approval gate, invocation pipeline |
//! | [`autonomous`] | Unattended loop with rate limiter, circuit breaker, response analyzer |
//! | [`llm`] | [`LlmClient`](llm::LlmClient) trait, provider table, OpenRouter SSE adapter, retry |
//! | [`config`] | File-loadable [`AgentConfig`](config::AgentConfig) |

pub mod agent;
pub mod autonomous;
pub mod config;
pub mod context;
pub mod llm;
pub mod prelude;
pub mod tools;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Constants ──────────────────────────────────────────────────────

/// Default model for all LLM calls.
pub const DEFAULT_MODEL: &str = "z-ai/glm-5";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use autopilot::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct EditArgs {
///     path: String,
///     #[serde(default)]
///     create: Option<bool>,
/// }
///
/// let schema = json_schema_for::<EditArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"path".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the conversation.
///
/// `is_error` and `timestamp` are bookkeeping for the runtime (failed tool
/// results, recency scoring) and are not part of the provider wire format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    fn new(role: MessageRole, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            is_error: false,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, Some(content.into()))
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, Some(content.into()))
    }

    /// Assistant message carrying tool calls, with optional accompanying text.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::new(MessageRole::Assistant, content.filter(|c| !c.is_empty()))
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(MessageRole::Tool, Some(content.into()))
        }
    }

    /// Override the creation timestamp.
    pub fn with_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Message text, or the empty string.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Characters of content plus tool-call names and arguments.
    pub fn char_count(&self) -> usize {
        let calls: usize = self
            .tool_calls
            .iter()
            .flatten()
            .map(|c| c.function.name.chars().count() + c.function.arguments.chars().count())
            .sum();
        self.text().chars().count() + calls
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the model (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

// ── Usage ──────────────────────────────────────────────────────────

/// Token usage statistics for one completion or an aggregate.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cached_tokens: 0,
        }
    }

    /// `prompt + completion`; cached tokens are a subset of the prompt.
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cached_tokens += other.cached_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}
