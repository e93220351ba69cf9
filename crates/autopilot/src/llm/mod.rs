//! Language-model client abstraction.
//!
//! The runtime talks to a model only through [`LlmClient`], which returns a
//! stream of [`LlmEvent`]s. Wire formats live in adapters such as
//! [`openrouter::OpenRouterClient`]. Adapters are constructed through an
//! explicit [`ProviderTable`] built once at startup and passed by reference.

pub mod openrouter;
pub mod retry;

use crate::{Message, TokenUsage, ToolCall, ToolDef};
use futures::{Stream, StreamExt};
use retry::RetryConfig;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// One event from a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    /// Incremental assistant text.
    TextDelta(String),
    /// A fully assembled tool call.
    ToolCallComplete(ToolCall),
    /// A provider or transport error. Does not end the stream by itself.
    Error(String),
    /// Terminal usage record for the completion.
    MessageComplete(TokenUsage),
}

/// A stream of completion events. Ends when the producer is done.
pub type LlmStream = Pin<Box<dyn Stream<Item = LlmEvent> + Send>>;

/// Future returned by [`LlmClient::chat_completion`].
pub type LlmFuture<'a> = Pin<Box<dyn Future<Output = Result<LlmStream, String>> + Send + 'a>>;

/// A streaming chat-completion provider.
pub trait LlmClient: Send + Sync {
    /// Start a streaming completion over `messages`, advertising `tools`.
    ///
    /// An `Err` means the stream could not be opened at all. Failures after
    /// the stream is open arrive as [`LlmEvent::Error`].
    fn chat_completion<'a>(
        &'a self,
        messages: &'a [Message],
        tools: Option<&'a [ToolDef]>,
    ) -> LlmFuture<'a>;

    /// Model identifier, for logging.
    fn model(&self) -> &str {
        "unknown"
    }
}

/// Drain a stream into its text and usage.
///
/// Returns `Err` only when the stream produced errors and no text at all.
pub async fn collect_completion(mut stream: LlmStream) -> Result<(String, TokenUsage), String> {
    let mut text = String::new();
    let mut usage = TokenUsage::default();
    let mut errors = Vec::new();
    while let Some(event) = stream.next().await {
        match event {
            LlmEvent::TextDelta(delta) => text.push_str(&delta),
            LlmEvent::MessageComplete(u) => usage = u,
            LlmEvent::Error(e) => errors.push(e),
            LlmEvent::ToolCallComplete(_) => {}
        }
    }
    if text.is_empty() && !errors.is_empty() {
        return Err(errors.join("; "));
    }
    Ok((text, usage))
}

// ── Provider table ─────────────────────────────────────────────────

/// Settings handed to a provider constructor.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub model: String,
    pub api_key: String,
    /// Override the provider's default endpoint.
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub retry: RetryConfig,
}

impl ProviderSettings {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            base_url: None,
            max_tokens: 4096,
            temperature: 0.2,
            retry: RetryConfig::default(),
        }
    }

    /// Read the API key from `OPENROUTER_KEY`.
    pub fn from_env(model: impl Into<String>) -> Result<Self, String> {
        let key =
            std::env::var("OPENROUTER_KEY").map_err(|_| "OPENROUTER_KEY not set".to_string())?;
        Ok(Self::new(model, key))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }
}

/// Constructor for a provider adapter.
pub type ProviderConstructor = fn(&ProviderSettings) -> Result<Arc<dyn LlmClient>, String>;

/// Name → constructor map for provider adapters.
#[derive(Default)]
pub struct ProviderTable {
    constructors: BTreeMap<String, ProviderConstructor>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with the adapters that ship with this crate.
    pub fn with_builtin() -> Self {
        Self::new().with("openrouter", |settings| {
            Ok(Arc::new(openrouter::OpenRouterClient::new(settings)?))
        })
    }

    /// Register (or replace) a constructor. Builder-style.
    pub fn with(mut self, name: impl Into<String>, constructor: ProviderConstructor) -> Self {
        self.constructors.insert(name.into(), constructor);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(|k| k.as_str()).collect()
    }

    pub fn build(
        &self,
        name: &str,
        settings: &ProviderSettings,
    ) -> Result<Arc<dyn LlmClient>, String> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            format!(
                "Unknown provider '{name}' (available: {})",
                self.names().join(", ")
            )
        })?;
        constructor(settings)
    }
}
