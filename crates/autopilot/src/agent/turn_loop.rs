//! The turn loop: stream a completion, dispatch tool calls, repeat.
//!
//! Each turn:
//! 1. compacts the history if the [`ContextManager`] reports it is too large,
//! 2. streams a completion with the registry's tool schemas,
//! 3. forwards text deltas as they arrive and buffers completed tool calls,
//! 4. ends the run with [`TurnState::FinalResponse`] if there were no tool
//!    calls, otherwise invokes each call in order through the
//!    [`ToolInvocationPipeline`] and appends the results,
//! 5. checks for repetition, records usage, and prunes consumed tool output.
//!
//! Provider `Error` events are reported but do not abort the turn. The run
//! stops after `max_turns` turns or when the cancellation token fires.

use super::events::{AgentEvent, EVENT_CHANNEL_CAPACITY, EventSender, EventStream};
use super::repetition::{RepetitionDetector, text_signature, tool_signature};
use crate::context::{CompactionEngine, ContextManager, Summarizer};
use crate::llm::{LlmClient, LlmEvent};
use crate::tools::core::ToolArguments;
use crate::tools::pipeline::ToolInvocationPipeline;
use crate::{TokenUsage, ToolCall, ToolDef};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Argument and metadata keys that name the file a mutating tool touched.
const PATH_KEYS: &[&str] = &["path", "file_path"];

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub max_turns: u32,
    /// Working directory passed to every tool.
    pub cwd: PathBuf,
    pub repetition_window: usize,
    pub repetition_threshold: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_turns: 25,
            cwd: PathBuf::from("."),
            repetition_window: 10,
            repetition_threshold: 3,
        }
    }
}

impl TurnConfig {
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_repetition(mut self, window: usize, threshold: usize) -> Self {
        self.repetition_window = window;
        self.repetition_threshold = threshold;
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Start,
    StreamingModel,
    DispatchingTools,
    FinalResponse,
    MaxTurnsReached,
    Cancelled,
    /// The provider could not be reached.
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::FinalResponse | Self::MaxTurnsReached | Self::Cancelled | Self::Failed
        )
    }
}

/// What one [`TurnLoop::run`] produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutcome {
    pub state: TurnState,
    /// Text of the final response (empty unless `FinalResponse`).
    pub final_text: String,
    pub turns: u32,
    /// Usage of this run, summarization calls included.
    pub usage: TokenUsage,
    /// Paths touched by successful mutating tool calls, first-seen order.
    pub files_modified: Vec<String>,
    pub tool_errors: usize,
    pub stream_errors: usize,
}

impl TurnOutcome {
    fn record_file(&mut self, path: &str) {
        if !self.files_modified.iter().any(|p| p == path) {
            self.files_modified.push(path.to_string());
        }
    }
}

/// What a single streamed completion produced.
struct StreamedTurn {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<TokenUsage>,
}

enum StreamInterrupt {
    Cancelled,
    Failed(String),
}

pub struct TurnLoop {
    llm: Arc<dyn LlmClient>,
    pipeline: ToolInvocationPipeline,
    context: ContextManager,
    config: TurnConfig,
    compaction: Option<(CompactionEngine, Summarizer)>,
    repetition: RepetitionDetector,
    cancel: CancellationToken,
    state: TurnState,
}

impl TurnLoop {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        pipeline: ToolInvocationPipeline,
        context: ContextManager,
        config: TurnConfig,
    ) -> Self {
        let repetition =
            RepetitionDetector::new(config.repetition_window, config.repetition_threshold);
        Self {
            llm,
            pipeline,
            context,
            config,
            compaction: None,
            repetition,
            cancel: CancellationToken::new(),
            state: TurnState::Start,
        }
        .with_compaction(CompactionEngine::default(), Summarizer::default())
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replace the compaction engine and summarizer.
    ///
    /// The engine and the context share one tokenizer: the engine's if it
    /// has one, otherwise the context's.
    pub fn with_compaction(mut self, engine: CompactionEngine, summarizer: Summarizer) -> Self {
        let engine = match (engine.tokenizer().cloned(), self.context.tokenizer().cloned()) {
            (Some(tokenizer), _) => {
                self.context.set_tokenizer(tokenizer);
                engine
            }
            (None, Some(tokenizer)) => engine.with_tokenizer(tokenizer),
            (None, None) => engine,
        };
        self.compaction = Some((engine, summarizer));
        self
    }

    /// Never compact; the history grows until the provider rejects it.
    pub fn without_compaction(mut self) -> Self {
        self.compaction = None;
        self
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextManager {
        &mut self.context
    }

    pub fn into_context(self) -> ContextManager {
        self.context
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run in a background task, returning the event stream.
    pub fn spawn(mut self, input: impl Into<String>) -> EventStream {
        let input = input.into();
        let (sender, rx) = EventSender::channel(EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            let outcome = self.run(input, &sender).await;
            drop(sender);
            (self, outcome)
        });
        EventStream::new(rx, handle)
    }

    /// Append `input` as a user message and run turns until a terminal state.
    ///
    /// Every path emits `AgentStart` first and `AgentEnd` last.
    pub async fn run(&mut self, input: impl Into<String>, events: &EventSender) -> TurnOutcome {
        let max_turns = self.config.max_turns;
        self.state = TurnState::Start;
        self.context.add_user_message(input);
        events.emit(AgentEvent::AgentStart { max_turns }).await;

        let tool_defs = self.pipeline.registry().definitions();
        let mut outcome = TurnOutcome::default();

        let state = loop {
            if self.cancel.is_cancelled() {
                break TurnState::Cancelled;
            }
            if outcome.turns >= max_turns {
                events
                    .emit(AgentEvent::AgentError {
                        message: format!("Maximum turns ({max_turns}) reached"),
                    })
                    .await;
                break TurnState::MaxTurnsReached;
            }
            outcome.turns += 1;
            debug!("Turn {}/{max_turns}", outcome.turns);

            self.compact_if_needed(events, &mut outcome).await;
            self.inject_correction_if_repeating();

            self.state = TurnState::StreamingModel;
            let streamed = match self.stream_turn(&tool_defs, events, &mut outcome).await {
                Ok(streamed) => streamed,
                Err(StreamInterrupt::Cancelled) => break TurnState::Cancelled,
                Err(StreamInterrupt::Failed(e)) => {
                    outcome.stream_errors += 1;
                    events.emit(AgentEvent::AgentError { message: e }).await;
                    break TurnState::Failed;
                }
            };

            if !streamed.text.is_empty() {
                events
                    .emit(AgentEvent::TextComplete {
                        text: streamed.text.clone(),
                    })
                    .await;
            }
            if let Some(usage) = streamed.usage {
                self.context.add_usage(&usage);
                self.context.set_latest_usage(usage);
                outcome.usage.accumulate(&usage);
            }

            if streamed.tool_calls.is_empty() {
                self.context
                    .add_assistant_message(Some(streamed.text.clone()), Vec::new());
                self.context.prune_tool_outputs();
                outcome.final_text = streamed.text;
                break TurnState::FinalResponse;
            }

            let text = (!streamed.text.is_empty()).then_some(streamed.text);
            if let Some(text) = &text {
                self.repetition.record(text_signature(text));
            }
            self.context
                .add_assistant_message(text, streamed.tool_calls.clone());

            self.state = TurnState::DispatchingTools;
            if !self
                .dispatch_tools(&streamed.tool_calls, events, &mut outcome)
                .await
            {
                break TurnState::Cancelled;
            }

            self.context.prune_tool_outputs();
        };

        if state == TurnState::Cancelled {
            info!("Turn loop cancelled after {} turn(s)", outcome.turns);
            events
                .emit(AgentEvent::AgentError {
                    message: "Cancelled".into(),
                })
                .await;
        }

        self.state = state;
        outcome.state = state;
        events
            .emit(AgentEvent::AgentEnd {
                state,
                turns: outcome.turns,
                usage: outcome.usage,
            })
            .await;
        outcome
    }

    // ── Steps ──────────────────────────────────────────────────────

    async fn compact_if_needed(&mut self, events: &EventSender, outcome: &mut TurnOutcome) {
        if !self.context.needs_compression() {
            return;
        }
        let Some((engine, summarizer)) = self.compaction.as_mut() else {
            debug!("Context over threshold but compaction is disabled");
            return;
        };

        let before = self.context.len();
        let selected = engine.compact(
            self.context.messages(),
            self.context.last_user_text(),
            Utc::now(),
        );
        match summarizer.summarize(self.llm.as_ref(), &selected).await {
            Ok((summary, usage)) => {
                self.context.replace_with_summary(&summary);
                self.context.add_usage(&usage);
                outcome.usage.accumulate(&usage);
                events
                    .emit(AgentEvent::Compacted {
                        messages_before: before,
                        messages_after: self.context.len(),
                    })
                    .await;
            }
            Err(e) => {
                warn!("Compaction failed: {e}");
                events
                    .emit(AgentEvent::AgentError {
                        message: format!("Compaction failed: {e}"),
                    })
                    .await;
            }
        }
    }

    async fn stream_turn(
        &self,
        tool_defs: &[ToolDef],
        events: &EventSender,
        outcome: &mut TurnOutcome,
    ) -> Result<StreamedTurn, StreamInterrupt> {
        let tools = (!tool_defs.is_empty()).then_some(tool_defs);
        let messages = self.context.get_messages();

        let mut stream = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(StreamInterrupt::Cancelled),
            opened = self.llm.chat_completion(&messages, tools) => {
                opened.map_err(|e| StreamInterrupt::Failed(format!("Failed to start completion: {e}")))?
            }
        };

        let mut streamed = StreamedTurn {
            text: String::new(),
            tool_calls: Vec::new(),
            usage: None,
        };
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(StreamInterrupt::Cancelled),
                next = stream.next() => next,
            };
            let Some(event) = next else {
                break;
            };
            match event {
                LlmEvent::TextDelta(delta) => {
                    streamed.text.push_str(&delta);
                    events.emit(AgentEvent::TextDelta { text: delta }).await;
                }
                LlmEvent::ToolCallComplete(call) => streamed.tool_calls.push(call),
                LlmEvent::Error(message) => {
                    outcome.stream_errors += 1;
                    events.emit(AgentEvent::AgentError { message }).await;
                }
                LlmEvent::MessageComplete(usage) => streamed.usage = Some(usage),
            }
        }
        Ok(streamed)
    }

    /// Invoke each call in order. Returns `false` if cancelled; the calls not
    /// yet run get a "Cancelled" error result so the history stays valid.
    async fn dispatch_tools(
        &mut self,
        calls: &[ToolCall],
        events: &EventSender,
        outcome: &mut TurnOutcome,
    ) -> bool {
        for (i, call) in calls.iter().enumerate() {
            if self.cancel.is_cancelled() {
                for skipped in &calls[i..] {
                    self.append_tool_message(skipped, false, "Error: Cancelled".into());
                }
                return false;
            }

            let result = self.pipeline.invoke(call, &self.config.cwd, events).await;
            if result.success {
                if self.pipeline.registry().is_mutating(call.name()) {
                    let args = ToolArguments::parse(&call.function.arguments);
                    let path = PATH_KEYS
                        .iter()
                        .find_map(|k| args.get_str(k).map(str::to_string))
                        .or_else(|| {
                            PATH_KEYS
                                .iter()
                                .find_map(|k| result.metadata_str(k).map(str::to_string))
                        });
                    if let Some(path) = path {
                        outcome.record_file(&path);
                    }
                }
            } else {
                outcome.tool_errors += 1;
            }
            self.append_tool_message(call, result.success, result.to_message_content());
            self.repetition.record(tool_signature(call));
        }
        true
    }

    fn append_tool_message(&mut self, call: &ToolCall, success: bool, content: String) {
        let appended = if success {
            self.context.add_tool_result(&call.id, content)
        } else {
            self.context.add_tool_error(&call.id, content)
        };
        if let Err(e) = appended {
            warn!("{e}");
        }
    }

    fn inject_correction_if_repeating(&mut self) {
        if let Some(correction) = self.repetition.check() {
            self.context.add_user_message(correction);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TurnState::Start.is_terminal());
        assert!(!TurnState::DispatchingTools.is_terminal());
        assert!(TurnState::FinalResponse.is_terminal());
        assert!(TurnState::Cancelled.is_terminal());
    }

    #[test]
    fn files_are_deduplicated_in_order() {
        let mut outcome = TurnOutcome::default();
        outcome.record_file("b.rs");
        outcome.record_file("a.rs");
        outcome.record_file("b.rs");
        assert_eq!(outcome.files_modified, vec!["b.rs", "a.rs"]);
    }

    #[test]
    fn config_builders() {
        let config = TurnConfig::default()
            .with_max_turns(3)
            .with_cwd("/tmp")
            .with_repetition(6, 2);
        assert_eq!(config.max_turns, 3);
        assert_eq!(config.cwd, PathBuf::from("/tmp"));
        assert_eq!(config.repetition_threshold, 2);
    }
}
