//! Unattended execution: run the turn loop repeatedly on one task.
//!
//! Each iteration checks the [`RateLimiter`] and [`CircuitBreaker`], sends the
//! task with an `[autonomous loop status]` block appended, runs the
//! [`TurnLoop`] to completion, classifies the final text with the
//! [`ResponseAnalyzer`], and feeds the result to the breaker. The loop ends on
//! an exit signal, `max_loops`, the rate limit, an open breaker, a provider
//! failure, or cancellation.

pub mod circuit_breaker;
pub mod config;
pub mod rate_limiter;
pub mod response_analyzer;

pub use circuit_breaker::{BreakerCounters, BreakerThresholds, CircuitBreaker, CircuitState};
pub use config::{AutonomousConfig, ExitMode};
pub use rate_limiter::{Clock, ManualClock, RateLimiter, SystemClock};
pub use response_analyzer::{AnalysisResult, ResponseAnalyzer};

use crate::TokenUsage;
use crate::agent::events::EventSender;
use crate::agent::session::{SessionSnapshot, SessionStore};
use crate::agent::shared_context::SharedContextStore;
use crate::agent::turn_loop::{TurnLoop, TurnState};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ExitSignal,
    MaxLoopsReached,
    RateLimitExceeded,
    CircuitBreakerOpen,
    Cancelled,
    /// The turn loop could not reach the provider.
    TurnFailed,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExitSignal => "exit_signal",
            Self::MaxLoopsReached => "max_loops_reached",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::Cancelled => "cancelled",
            Self::TurnFailed => "turn_failed",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LoopSummary {
    pub loops_run: u32,
    pub exit_reason: ExitReason,
    pub files_modified: Vec<String>,
    /// Iterations that reported errors.
    pub errors_encountered: u32,
    pub usage: TokenUsage,
}

pub struct AutonomousLoop {
    turn_loop: TurnLoop,
    task: String,
    config: AutonomousConfig,
    rate_limiter: RateLimiter,
    breaker: CircuitBreaker,
    analyzer: ResponseAnalyzer,
    shared: Option<SharedContextStore>,
    session: Option<(Arc<SessionStore>, SessionSnapshot)>,
    events: EventSender,
}

impl AutonomousLoop {
    /// Rate-limit state is loaded from `config.rate_limit_file`.
    pub fn new(turn_loop: TurnLoop, task: impl Into<String>, config: AutonomousConfig) -> Self {
        let rate_limiter = RateLimiter::load(
            &config.rate_limit_file,
            config.max_calls_per_hour,
            Arc::new(SystemClock),
        );
        let breaker = CircuitBreaker::new(BreakerThresholds {
            max_no_progress: config.max_no_progress_loops,
            max_consecutive_errors: config.max_consecutive_errors,
            max_completion: config.max_completion_indicators,
        });
        let analyzer = ResponseAnalyzer::new(config.exit_mode(), config.min_completion_indicators);
        Self {
            turn_loop,
            task: task.into(),
            config,
            rate_limiter,
            breaker,
            analyzer,
            shared: None,
            session: None,
            events: EventSender::disconnected(),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_shared_context(mut self, store: SharedContextStore) -> Self {
        self.shared = Some(store);
        self
    }

    /// Checkpoint `snapshot` after every iteration and save it at the end.
    pub fn with_session(mut self, store: Arc<SessionStore>, snapshot: SessionSnapshot) -> Self {
        self.session = Some((store, snapshot));
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &AutonomousConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_mut(&mut self) -> &mut CircuitBreaker {
        &mut self.breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn turn_loop(&self) -> &TurnLoop {
        &self.turn_loop
    }

    pub fn shared_context(&self) -> Option<&SharedContextStore> {
        self.shared.as_ref()
    }

    pub fn session(&self) -> Option<&SessionSnapshot> {
        self.session.as_ref().map(|(_, s)| s)
    }

    pub fn into_turn_loop(self) -> TurnLoop {
        self.turn_loop
    }

    /// Run up to `max_loops` iterations.
    pub async fn run(&mut self, max_loops: u32) -> LoopSummary {
        let cancel = self.turn_loop.cancellation_token();
        let mut summary = LoopSummary {
            loops_run: 0,
            exit_reason: ExitReason::MaxLoopsReached,
            files_modified: Vec::new(),
            errors_encountered: 0,
            usage: TokenUsage::default(),
        };
        info!("Autonomous loop starting (max_loops={max_loops})");

        summary.exit_reason = loop {
            if cancel.is_cancelled() {
                break ExitReason::Cancelled;
            }
            if summary.loops_run >= max_loops {
                break ExitReason::MaxLoopsReached;
            }
            if !self.rate_limiter.check_limit() {
                break ExitReason::RateLimitExceeded;
            }
            if self.breaker.state() == CircuitState::Open {
                break ExitReason::CircuitBreakerOpen;
            }

            let prompt = self.augmented_prompt(summary.loops_run + 1, max_loops);
            let outcome = self.turn_loop.run(prompt, &self.events).await;
            summary.loops_run += 1;
            summary.usage.accumulate(&outcome.usage);
            for path in &outcome.files_modified {
                if !summary.files_modified.contains(path) {
                    summary.files_modified.push(path.clone());
                }
            }
            if let Err(e) = self.rate_limiter.increment() {
                warn!("{e}");
            }
            self.checkpoint(outcome.turns).await;

            match outcome.state {
                TurnState::Cancelled => break ExitReason::Cancelled,
                TurnState::Failed => {
                    summary.errors_encountered += 1;
                    break ExitReason::TurnFailed;
                }
                _ => {}
            }

            let analysis = self.analyzer.analyze(&outcome.final_text);
            let has_errors = analysis.error_count > 0
                || outcome.stream_errors > 0
                || outcome.state == TurnState::MaxTurnsReached;
            if has_errors {
                summary.errors_encountered += 1;
            }
            let state = self.breaker.update(
                !outcome.files_modified.is_empty(),
                has_errors,
                analysis.completion_indicators > 0,
            );
            debug!(
                "Loop {}: {:?}, {} file(s) changed, errors={has_errors}, circuit={state:?}",
                summary.loops_run,
                outcome.state,
                outcome.files_modified.len()
            );

            if self.analyzer.should_exit(&analysis) {
                info!(
                    "Exit signal accepted: {}",
                    analysis.matched_exit_signals.join(", ")
                );
                break ExitReason::ExitSignal;
            }
        };

        info!(
            "Autonomous loop finished: {} after {} loop(s)",
            summary.exit_reason, summary.loops_run
        );
        self.finish(&summary).await;
        summary
    }

    /// The task followed by the loop status block.
    pub fn augmented_prompt(&self, loop_index: u32, max_loops: u32) -> String {
        let counters = self.breaker.counters();
        let thresholds = self.breaker.thresholds();
        let mut prompt = format!(
            "{}\n\n[autonomous loop status]\n\
             loop: {loop_index}/{max_loops}\n\
             calls this hour: {}/{}\n\
             circuit: {:?} (no progress {}/{}, consecutive errors {}/{}, completion {}/{})\n",
            self.task,
            self.rate_limiter.count(),
            self.rate_limiter.max_calls_per_hour(),
            self.breaker.state(),
            counters.no_progress,
            thresholds.max_no_progress,
            counters.consecutive_errors,
            thresholds.max_consecutive_errors,
            counters.completion,
            thresholds.max_completion,
        );
        if let Some(shared) = &self.shared
            && !shared.is_empty()
        {
            prompt.push_str("notes:\n");
            for line in shared.render() {
                prompt.push_str(&format!("- {line}\n"));
            }
        }
        let finish = match self.analyzer.mode() {
            ExitMode::DualGate => {
                "When the whole task is complete, say what was completed and end with `EXIT_SIGNAL: true`."
            }
            ExitMode::CompletionOnly => "When the whole task is complete, say what was completed.",
        };
        prompt.push_str(finish);
        prompt
    }

    async fn checkpoint(&mut self, turns: u32) {
        let Some((store, snapshot)) = self.session.as_mut() else {
            return;
        };
        snapshot.update_from(self.turn_loop.context(), turns);
        if let Err(e) = store.checkpoint(snapshot).await {
            warn!("{e}");
        }
    }

    async fn finish(&mut self, summary: &LoopSummary) {
        if let Some(shared) = self.shared.as_mut() {
            shared.set("last_exit_reason", summary.exit_reason.as_str());
            shared.set("loops_run", summary.loops_run);
            if let Err(e) = shared.save() {
                warn!("{e}");
            }
        }
        if let Some((store, snapshot)) = &self.session
            && let Err(e) = store.save(snapshot).await
        {
            warn!("{e}");
        }
    }
}
