//! Multi-strategy message scoring and eviction.
//!
//! [`CompactionEngine::compact`] selects the messages worth keeping from a
//! borrowed snapshot of the history and returns them as a new sequence. The
//! selection is not written back: the turn loop hands it to the
//! [`Summarizer`](super::summarizer::Summarizer) and substitutes the summary
//! via [`ContextManager::replace_with_summary`](super::ContextManager::replace_with_summary).
//!
//! Scoring functions are free functions so they can be tested and reused on
//! their own.

use crate::{Message, MessageRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Score used wherever a signal is unavailable.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Characters per token for the fallback estimate.
pub const CHARS_PER_TOKEN: usize = 4;

/// Decay constant for recency scoring, in hours.
const RECENCY_DECAY_HOURS: f64 = 24.0;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStrategy {
    /// No scoring; keeps the most recent candidates.
    TokenBased,
    Relevance,
    Recency,
    Importance,
    Semantic,
    #[default]
    Hybrid,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CompactionConfig {
    pub strategy: CompactionStrategy,
    /// Histories at or below this length are returned unchanged.
    pub min_messages: usize,
    /// Upper bound on kept messages, protected ones included.
    pub max_messages: usize,
    pub keep_system: bool,
    /// Keep tool results and assistant messages carrying tool calls.
    pub keep_tool_messages: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: CompactionStrategy::Hybrid,
            min_messages: 10,
            max_messages: 50,
            keep_system: true,
            keep_tool_messages: true,
        }
    }
}

impl CompactionConfig {
    pub fn with_strategy(mut self, strategy: CompactionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_limits(mut self, min_messages: usize, max_messages: usize) -> Self {
        self.min_messages = min_messages;
        self.max_messages = max_messages;
        self
    }
}

/// Counts tokens for a piece of text.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Produces embedding vectors. Returning `None` degrades scores to neutral.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

/// Per-message signals, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MessageScore {
    pub relevance: f64,
    pub recency: f64,
    pub importance: f64,
    pub semantic: f64,
}

impl MessageScore {
    pub fn weighted(&self, strategy: CompactionStrategy) -> f64 {
        match strategy {
            CompactionStrategy::TokenBased => NEUTRAL_SCORE,
            CompactionStrategy::Relevance => self.relevance,
            CompactionStrategy::Recency => self.recency,
            CompactionStrategy::Importance => self.importance,
            CompactionStrategy::Semantic => self.semantic,
            CompactionStrategy::Hybrid => {
                0.30 * self.relevance
                    + 0.30 * self.recency
                    + 0.25 * self.importance
                    + 0.15 * self.semantic
            }
        }
    }
}

// ── Scoring functions ──────────────────────────────────────────────

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of query keywords present in `text`. Empty query → neutral.
pub fn relevance_score(query: &str, text: &str) -> f64 {
    let query_words = keywords(query);
    if query_words.is_empty() {
        return NEUTRAL_SCORE;
    }
    let text_words = keywords(text);
    let hits = query_words.intersection(&text_words).count();
    hits as f64 / query_words.len() as f64
}

/// `e^(-age_hours / 24)`, clamped to `[0, 1]`. Missing timestamp → neutral.
pub fn recency_score(timestamp: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(ts) = timestamp else {
        return NEUTRAL_SCORE;
    };
    let age_hours = (now - ts).num_milliseconds().max(0) as f64 / 3_600_000.0;
    (-age_hours / RECENCY_DECAY_HOURS).exp().clamp(0.0, 1.0)
}

/// Role- and content-based importance.
pub fn importance_score(message: &Message) -> f64 {
    match message.role {
        MessageRole::Tool => 1.0,
        MessageRole::System => 0.8,
        MessageRole::Assistant if message.has_tool_calls() => 0.9,
        MessageRole::Assistant if message.text().contains("```") => 0.7,
        MessageRole::Assistant | MessageRole::User => 0.4,
    }
}

/// Cosine similarity mapped from `[-1, 1]` to `[0, 1]`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(((dot / (norm_a * norm_b)) + 1.0) / 2.0)
}

/// `ceil(total_characters / 4)` over content and tool-call arguments.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(Message::char_count)
        .sum::<usize>()
        .div_ceil(CHARS_PER_TOKEN)
}

/// Token count under `tokenizer`, falling back to [`estimate_tokens`].
///
/// Tool-call names and arguments count alongside message text.
pub fn count_tokens(tokenizer: Option<&dyn Tokenizer>, messages: &[Message]) -> usize {
    let Some(tokenizer) = tokenizer else {
        return estimate_tokens(messages);
    };
    messages
        .iter()
        .map(|m| {
            let calls: usize = m
                .tool_calls
                .iter()
                .flatten()
                .map(|c| {
                    tokenizer.count(&c.function.name) + tokenizer.count(&c.function.arguments)
                })
                .sum();
            tokenizer.count(m.text()) + calls
        })
        .sum()
}

// ── Engine ─────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct CompactionEngine {
    config: CompactionConfig,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
}

impl std::fmt::Debug for CompactionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionEngine")
            .field("config", &self.config)
            .field("tokenizer", &self.tokenizer.is_some())
            .field("embeddings", &self.embeddings.is_some())
            .finish()
    }
}

impl CompactionEngine {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            tokenizer: None,
            embeddings: None,
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_embeddings(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings = Some(provider);
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> Option<&Arc<dyn Tokenizer>> {
        self.tokenizer.as_ref()
    }

    pub fn estimate_tokens(&self, messages: &[Message]) -> usize {
        count_tokens(self.tokenizer.as_deref(), messages)
    }

    fn is_protected(&self, message: &Message) -> bool {
        match message.role {
            MessageRole::System => self.config.keep_system,
            MessageRole::Tool => self.config.keep_tool_messages,
            _ => self.config.keep_tool_messages && message.has_tool_calls(),
        }
    }

    pub fn score(
        &self,
        message: &Message,
        query: &str,
        query_embedding: Option<&[f32]>,
        now: DateTime<Utc>,
    ) -> MessageScore {
        let semantic = match (self.config.strategy, query_embedding, &self.embeddings) {
            (
                CompactionStrategy::Semantic | CompactionStrategy::Hybrid,
                Some(q),
                Some(provider),
            ) => provider
                .embed(message.text())
                .and_then(|m| cosine_similarity(q, &m))
                .unwrap_or(NEUTRAL_SCORE),
            _ => NEUTRAL_SCORE,
        };
        MessageScore {
            relevance: relevance_score(query, message.text()),
            recency: recency_score(message.timestamp, now),
            importance: importance_score(message),
            semantic,
        }
    }

    /// Select the messages to keep: protected ones plus the best-scoring
    /// candidates, at most `max_messages` in total unless protected messages
    /// alone exceed it. Output is protected then kept, each in original order.
    pub fn compact(&self, messages: &[Message], query: &str, now: DateTime<Utc>) -> Vec<Message> {
        if messages.len() <= self.config.min_messages {
            return messages.to_vec();
        }

        let (protected, candidates): (Vec<usize>, Vec<usize>) =
            (0..messages.len()).partition(|&i| self.is_protected(&messages[i]));
        let budget = self.config.max_messages.saturating_sub(protected.len());

        let mut kept: Vec<usize> = match self.config.strategy {
            CompactionStrategy::TokenBased => {
                candidates[candidates.len().saturating_sub(budget)..].to_vec()
            }
            strategy => {
                let query_embedding = match (strategy, &self.embeddings) {
                    (CompactionStrategy::Semantic | CompactionStrategy::Hybrid, Some(p)) => {
                        p.embed(query)
                    }
                    _ => None,
                };
                let mut scored: Vec<(usize, f64)> = candidates
                    .iter()
                    .map(|&i| {
                        let score =
                            self.score(&messages[i], query, query_embedding.as_deref(), now);
                        (i, score.weighted(strategy))
                    })
                    .collect();
                scored.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(Ordering::Equal)
                        .then(a.0.cmp(&b.0))
                });
                scored.into_iter().take(budget).map(|(i, _)| i).collect()
            }
        };
        kept.sort_unstable();

        debug!(
            "Compaction ({:?}): {} messages -> {} protected + {} kept",
            self.config.strategy,
            messages.len(),
            protected.len(),
            kept.len()
        );

        protected
            .iter()
            .chain(kept.iter())
            .map(|&i| messages[i].clone())
            .collect()
    }
}
