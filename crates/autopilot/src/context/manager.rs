//! Conversation history and token accounting for one session.

use super::compaction::{Tokenizer, count_tokens};
use crate::{Message, MessageRole, TokenUsage, ToolCall};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix of the synthetic message that replaces summarized history.
pub const SUMMARY_PREFIX: &str = "[Conversation summary]";

const PRUNED_PREFIX: &str = "[pruned tool output:";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Context window of the model, in tokens.
    pub max_tokens: usize,
    /// Fraction of `max_tokens` above which compaction is requested.
    pub compression_threshold: f64,
    /// Messages kept verbatim after the summary.
    pub keep_recent: usize,
    /// Consumed tool outputs longer than this are pruned.
    pub prune_min_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            compression_threshold: 0.75,
            keep_recent: 6,
            prune_min_chars: 2_000,
        }
    }
}

impl ContextConfig {
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn with_keep_recent(mut self, keep_recent: usize) -> Self {
        self.keep_recent = keep_recent;
        self
    }
}

/// Owns the message sequence and usage totals.
///
/// Mutation is append-only except for the two compaction operations,
/// [`replace_with_summary`](Self::replace_with_summary) and
/// [`prune_tool_outputs`](Self::prune_tool_outputs).
#[derive(Clone)]
pub struct ContextManager {
    config: ContextConfig,
    messages: Vec<Message>,
    total_usage: TokenUsage,
    latest_usage: Option<TokenUsage>,
    compactions: usize,
    tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("config", &self.config)
            .field("messages", &self.messages.len())
            .field("total_usage", &self.total_usage)
            .field("compactions", &self.compactions)
            .field("tokenizer", &self.tokenizer.is_some())
            .finish()
    }
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self::restore(config, Vec::new(), TokenUsage::default())
    }

    /// Set or replace the leading system message.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let system = Message::system(prompt);
        match self.messages.first_mut() {
            Some(first) if is_system_prompt(first) => *first = system,
            _ => self.messages.insert(0, system),
        }
        self
    }

    /// Count window tokens with `tokenizer` instead of the character estimate.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn set_tokenizer(&mut self, tokenizer: Arc<dyn Tokenizer>) {
        self.tokenizer = Some(tokenizer);
    }

    pub fn tokenizer(&self) -> Option<&Arc<dyn Tokenizer>> {
        self.tokenizer.as_ref()
    }

    /// Rebuild from a persisted history.
    pub fn restore(config: ContextConfig, messages: Vec<Message>, total_usage: TokenUsage) -> Self {
        Self {
            config,
            messages,
            total_usage,
            latest_usage: None,
            compactions: 0,
            tokenizer: None,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    // ── Appending ──────────────────────────────────────────────────

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn add_assistant_message(&mut self, content: Option<String>, tool_calls: Vec<ToolCall>) {
        let message = if tool_calls.is_empty() {
            Message::assistant_text(content.unwrap_or_default())
        } else {
            Message::assistant_tool_calls(content, tool_calls)
        };
        self.messages.push(message);
    }

    /// Append the result of a tool call made by an earlier assistant message.
    pub fn add_tool_result(
        &mut self,
        call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), String> {
        let message = Message::tool_result(call_id, content);
        self.push_tool_message(message)
    }

    /// Like [`add_tool_result`](Self::add_tool_result), flagged as an error.
    pub fn add_tool_error(
        &mut self,
        call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), String> {
        let mut message = Message::tool_result(call_id, content);
        message.is_error = true;
        self.push_tool_message(message)
    }

    fn push_tool_message(&mut self, message: Message) -> Result<(), String> {
        let call_id = message.tool_call_id.as_deref().unwrap_or_default();
        let known = self
            .messages
            .iter()
            .rev()
            .filter_map(|m| m.tool_calls.as_ref())
            .flatten()
            .any(|c| c.id == call_id);
        if !known {
            return Err(format!(
                "Failed to add tool result: no assistant tool call with id '{call_id}'"
            ));
        }
        self.messages.push(message);
        Ok(())
    }

    // ── Reading ────────────────────────────────────────────────────

    /// Owned copy of the history.
    pub fn get_messages(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Text of the most recent user message, used as the compaction query.
    pub fn last_user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(Message::text)
            .unwrap_or("")
    }

    // ── Usage ──────────────────────────────────────────────────────

    pub fn add_usage(&mut self, usage: &TokenUsage) {
        self.total_usage.accumulate(usage);
    }

    pub fn set_latest_usage(&mut self, usage: TokenUsage) {
        self.latest_usage = Some(usage);
    }

    pub fn total_usage(&self) -> &TokenUsage {
        &self.total_usage
    }

    pub fn latest_usage(&self) -> Option<&TokenUsage> {
        self.latest_usage.as_ref()
    }

    /// Tokens currently occupied by the history.
    pub fn window_tokens(&self) -> usize {
        let estimate = count_tokens(self.tokenizer.as_deref(), &self.messages);
        let reported = self
            .latest_usage
            .as_ref()
            .map_or(0, |u| usize::try_from(u.total()).unwrap_or(usize::MAX));
        estimate.max(reported)
    }

    pub fn needs_compression(&self) -> bool {
        let limit = self.config.compression_threshold * self.config.max_tokens as f64;
        self.window_tokens() as f64 > limit
    }

    pub fn compactions(&self) -> usize {
        self.compactions
    }

    // ── Compaction ─────────────────────────────────────────────────

    /// Collapse history to `[system?, summary, last keep_recent messages]`.
    ///
    /// Earlier summaries are dropped; the new one supersedes them.
    pub fn replace_with_summary(&mut self, summary: &str) {
        let before = self.messages.len();
        let system = self.messages.first().filter(|m| is_system_prompt(m)).cloned();
        let floor = usize::from(system.is_some());

        let mut start = before.saturating_sub(self.config.keep_recent).max(floor);
        while start > floor && self.messages.get(start).is_some_and(|m| m.role == MessageRole::Tool) {
            start -= 1;
        }
        // A tool message at the floor has lost its call.
        while self.messages.get(start).is_some_and(|m| m.role == MessageRole::Tool) {
            start += 1;
        }

        let tail = self
            .messages
            .split_off(start)
            .into_iter()
            .filter(|m| !is_summary(m));
        self.messages = system
            .into_iter()
            .chain(std::iter::once(Message::system(format!(
                "{SUMMARY_PREFIX}\n{summary}"
            ))))
            .chain(tail)
            .collect();
        self.latest_usage = None;
        self.compactions += 1;
        info!(
            "Replaced history with summary: {before} -> {} messages",
            self.messages.len()
        );
    }

    /// Shrink large tool outputs the model has already responded to.
    ///
    /// Returns the number of messages pruned.
    pub fn prune_tool_outputs(&mut self) -> usize {
        let Some(last_assistant) = self
            .messages
            .iter()
            .rposition(|m| m.role == MessageRole::Assistant)
        else {
            return 0;
        };
        let min_chars = self.config.prune_min_chars;
        let mut pruned = 0;
        for msg in &mut self.messages[..last_assistant] {
            if msg.role != MessageRole::Tool || msg.text().starts_with(PRUNED_PREFIX) {
                continue;
            }
            let chars = msg.text().chars().count();
            if chars > min_chars {
                msg.content = Some(format!("{PRUNED_PREFIX} {chars} chars]"));
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Pruned {pruned} consumed tool output(s)");
        }
        pruned
    }
}

fn is_summary(message: &Message) -> bool {
    message.role == MessageRole::System && message.text().starts_with(SUMMARY_PREFIX)
}

fn is_system_prompt(message: &Message) -> bool {
    message.role == MessageRole::System && !is_summary(message)
}
