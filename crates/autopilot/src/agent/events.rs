//! The ordered event stream from the turn loop to its consumers.
//!
//! Events flow through a bounded channel. The producer side is an
//! [`EventSender`]; the stream ends when the producer drops it. Consumers
//! must treat `TextDelta`s as append-only until the matching `TextComplete`.

use super::turn_loop::{TurnLoop, TurnOutcome, TurnState};
use crate::TokenUsage;
use crate::tools::core::ToolResult;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart {
        max_turns: u32,
    },
    TextDelta {
        text: String,
    },
    TextComplete {
        text: String,
    },
    ToolCallStart {
        call_id: String,
        name: String,
        arguments: String,
    },
    ToolCallComplete {
        call_id: String,
        name: String,
        result: ToolResult,
    },
    AgentError {
        message: String,
    },
    /// History was summarized to fit the token budget.
    Compacted {
        messages_before: usize,
        messages_after: usize,
    },
    AgentEnd {
        state: TurnState,
        turns: u32,
        usage: TokenUsage,
    },
}

impl AgentEvent {
    /// Wire name of the event (`agent_start`, `text_delta`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentStart { .. } => "agent_start",
            Self::TextDelta { .. } => "text_delta",
            Self::TextComplete { .. } => "text_complete",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallComplete { .. } => "tool_call_complete",
            Self::AgentError { .. } => "agent_error",
            Self::Compacted { .. } => "compacted",
            Self::AgentEnd { .. } => "agent_end",
        }
    }
}

/// Log an event at a level matching its importance.
pub fn log_event(event: &AgentEvent) {
    match event {
        AgentEvent::AgentStart { max_turns } => debug!("Agent starting (max_turns={max_turns})"),
        AgentEvent::TextDelta { text } => trace!("delta: {text}"),
        AgentEvent::TextComplete { text } => debug!("Text complete ({} chars)", text.len()),
        AgentEvent::ToolCallStart { name, call_id, .. } => debug!("Tool call {call_id}: {name}"),
        AgentEvent::ToolCallComplete { name, result, .. } => {
            if result.success {
                debug!("Tool {name} succeeded ({} bytes)", result.output.len());
            } else {
                info!(
                    "Tool {name} failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        AgentEvent::AgentError { message } => warn!("Agent error: {message}"),
        AgentEvent::Compacted {
            messages_before,
            messages_after,
        } => info!("Context compacted: {messages_before} -> {messages_after} messages"),
        AgentEvent::AgentEnd {
            state,
            turns,
            usage,
        } => info!(
            "Agent finished: {state:?} after {turns} turn(s), {} tokens",
            usage.total()
        ),
    }
}

// ── Producer ───────────────────────────────────────────────────────

/// Producer half of the event stream.
///
/// A disconnected sender only logs. Send failures (consumer gone) are
/// ignored so a dropped consumer never stalls the loop.
#[derive(Clone, Debug, Default)]
pub struct EventSender {
    tx: Option<mpsc::Sender<AgentEvent>>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sender that only logs events.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    /// Bounded channel pair.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub async fn emit(&self, event: AgentEvent) {
        log_event(&event);
        if let Some(tx) = &self.tx
            && tx.send(event).await.is_err()
        {
            trace!("Event consumer dropped");
        }
    }
}

// ── Consumer ───────────────────────────────────────────────────────

/// Events from a spawned [`TurnLoop`] run, plus the handle to its result.
pub struct EventStream {
    rx: mpsc::Receiver<AgentEvent>,
    handle: JoinHandle<(TurnLoop, TurnOutcome)>,
}

impl EventStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<AgentEvent>,
        handle: JoinHandle<(TurnLoop, TurnOutcome)>,
    ) -> Self {
        Self { rx, handle }
    }

    /// Next event, or `None` once the run is over.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    /// Drain remaining events and return the loop with its outcome.
    pub async fn finish(mut self) -> Result<(TurnLoop, TurnOutcome), String> {
        while self.rx.recv().await.is_some() {}
        self.handle
            .await
            .map_err(|e| format!("Failed to join turn loop task: {e}"))
    }
}

impl Stream for EventStream {
    type Item = AgentEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<AgentEvent>> {
        self.rx.poll_recv(cx)
    }
}
