//! Conversation history and its compaction.
//!
//! - [`ContextManager`] owns the message sequence and usage totals.
//! - [`compaction`] scores a snapshot of the history and selects what to
//!   keep, without touching the manager.
//! - [`summarizer`] turns the selection into a running summary via one LLM
//!   call, which the manager substitutes for the history.

pub mod compaction;
pub mod manager;
pub mod summarizer;

pub use compaction::{
    CompactionConfig, CompactionEngine, CompactionStrategy, EmbeddingProvider, MessageScore,
    Tokenizer, count_tokens, estimate_tokens,
};
pub use manager::{ContextConfig, ContextManager, SUMMARY_PREFIX};
pub use summarizer::{Summarizer, SummarizerConfig};
