//! Convenience re-exports for common `autopilot` types.
//!
//! ```ignore
//! use autopilot::prelude::*;
//! ```
//!
//! Covers building a [`TurnLoop`] or [`AutonomousLoop`] end to end. Scoring
//! internals, hook entries, and provider event types stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Message, MessageRole, TokenUsage, ToolCall, ToolDef, json_schema_for};

// ── Providers ───────────────────────────────────────────────────────
pub use crate::llm::{LlmClient, ProviderSettings, ProviderTable};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    AgentEvent, EventSender, EventStream, SessionSnapshot, SessionStore, SharedContextStore,
    TurnConfig, TurnLoop, TurnOutcome, TurnState,
};
pub use crate::config::AgentConfig;

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    CompactionConfig, CompactionEngine, CompactionStrategy, ContextConfig, ContextManager,
    Summarizer,
};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{
    ApprovalMode, ApprovalPolicy, FnTool, PolicyGate, Tool, ToolArguments, ToolInvocationPipeline,
    ToolRegistry, ToolResult,
};

// ── Autonomous mode ─────────────────────────────────────────────────
pub use crate::autonomous::{AutonomousConfig, AutonomousLoop, ExitReason, LoopSummary};
