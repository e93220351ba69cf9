//! Detection of a model stuck repeating itself.
//!
//! The turn loop records a signature per action (each tool call, each final
//! response). When the recent signatures show the same action `threshold`
//! times in a row, or an A/B/A/B cycle repeated `threshold` times, the
//! detector returns a corrective message for the loop to inject.

use crate::ToolCall;
use std::collections::VecDeque;
use tracing::info;

/// Prefix of the injected corrective message.
pub const LOOP_DETECTED_PREFIX: &str = "[loop detected]";

#[derive(Debug, Clone)]
pub struct RepetitionDetector {
    window: usize,
    threshold: usize,
    history: VecDeque<String>,
}

impl Default for RepetitionDetector {
    fn default() -> Self {
        Self::new(10, 3)
    }
}

impl RepetitionDetector {
    /// `threshold` is clamped to at least 2; `window` to at least
    /// `2 * threshold` so cycles fit.
    pub fn new(window: usize, threshold: usize) -> Self {
        let threshold = threshold.max(2);
        let window = window.max(threshold * 2);
        Self {
            window,
            threshold,
            history: VecDeque::with_capacity(window),
        }
    }

    pub fn record(&mut self, signature: impl Into<String>) {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(signature.into());
    }

    /// Corrective message if the recent actions repeat. Clears the history
    /// when it fires.
    pub fn check(&mut self) -> Option<String> {
        let message = if let Some(action) = self.repeated_action() {
            format!(
                "{LOOP_DETECTED_PREFIX} You have repeated the same action {} times in a row: {action}. \
                 It is not making progress. Try a different approach, re-read the relevant files, \
                 or explain what is blocking you.",
                self.threshold
            )
        } else if let Some((a, b)) = self.cycle() {
            format!(
                "{LOOP_DETECTED_PREFIX} You are alternating between the same two actions ({a} and {b}). \
                 It is not making progress. Step back and try a different approach."
            )
        } else {
            return None;
        };
        info!("Repetition detected; injecting corrective message");
        self.history.clear();
        Some(message)
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    fn repeated_action(&self) -> Option<&str> {
        let len = self.history.len();
        if len < self.threshold {
            return None;
        }
        let mut recent = self.history.range(len - self.threshold..);
        let first = recent.next()?;
        recent.all(|s| s == first).then_some(first.as_str())
    }

    fn cycle(&self) -> Option<(&str, &str)> {
        let span = self.threshold * 2;
        let len = self.history.len();
        if len < span {
            return None;
        }
        let recent: Vec<&String> = self.history.range(len - span..).collect();
        let (a, b) = (recent[0], recent[1]);
        if a == b {
            return None;
        }
        recent
            .iter()
            .enumerate()
            .all(|(i, s)| *s == if i % 2 == 0 { a } else { b })
            .then_some((a.as_str(), b.as_str()))
    }
}

/// Signature of a tool call: name plus arguments in canonical JSON.
pub fn tool_signature(call: &ToolCall) -> String {
    let args = serde_json::from_str::<serde_json::Value>(&call.function.arguments)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| call.function.arguments.trim().to_string());
    format!("{}({args})", call.function.name)
}

/// Signature of a text response: lowercased, whitespace collapsed.
pub fn text_signature(text: &str) -> String {
    let normalized: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
    format!("text:{}", normalized.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_actions_trigger_at_threshold() {
        let mut detector = RepetitionDetector::default();
        let call = ToolCall::new("c", "read_file", r#"{ "path": "a.rs" }"#);
        detector.record(tool_signature(&call));
        detector.record(tool_signature(&call));
        assert!(detector.check().is_none());

        let same_args_reformatted = ToolCall::new("d", "read_file", r#"{"path":"a.rs"}"#);
        detector.record(tool_signature(&same_args_reformatted));
        let message = detector.check().unwrap();
        assert!(message.starts_with(LOOP_DETECTED_PREFIX));
        assert!(message.contains("read_file"));

        // History cleared: does not fire again immediately.
        detector.record(tool_signature(&call));
        assert!(detector.check().is_none());
    }

    #[test]
    fn alternating_cycle_triggers() {
        let mut detector = RepetitionDetector::new(10, 3);
        for i in 0..5 {
            detector.record(if i % 2 == 0 { "a" } else { "b" });
            assert!(detector.check().is_none(), "fired early at {i}");
        }
        detector.record("a");
        assert!(detector.check().is_none());

        let mut detector = RepetitionDetector::new(10, 3);
        for i in 0..6 {
            detector.record(if i % 2 == 0 { "a" } else { "b" });
        }
        assert!(detector.check().unwrap().contains("alternating"));
    }

    #[test]
    fn varied_actions_do_not_trigger() {
        let mut detector = RepetitionDetector::default();
        for s in ["a", "b", "c", "a", "c", "b", "a"] {
            detector.record(s);
            assert!(detector.check().is_none());
        }
    }

    #[test]
    fn text_signature_normalizes() {
        assert_eq!(text_signature("Done.\n  All good"), text_signature("done. all   GOOD"));
    }
}
