//! Regex classification of model responses.
//!
//! Three independent pattern families: exit signals (detected), completion
//! indicators (counted), and error reports (counted). The classifiers are
//! plain functions over text; [`ResponseAnalyzer`] only adds the exit policy.

use super::config::ExitMode;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static EXIT_SIGNAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\bEXIT_SIGNAL\s*[:=]\s*true\b").expect("Invalid exit signal pattern"),
        Regex::new(r"(?i)\[\s*TASK[_ ]COMPLETE\s*\]").expect("Invalid task complete pattern"),
        Regex::new(r"(?i)<promise>\s*COMPLETE\s*</promise>").expect("Invalid promise pattern"),
        Regex::new(r"\bALL_TASKS_COMPLETE\b").expect("Invalid all tasks pattern"),
    ]
});

static COMPLETION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(
            r"(?i)\b(?:task|work|implementation|feature|fix|change)s?\s+(?:is\s+|are\s+|has\s+been\s+|have\s+been\s+)?(?:now\s+)?(?:complete|completed|done|finished)\b",
        )
        .expect("Invalid completion pattern"),
        Regex::new(r"(?i)\ball\s+(?:tests|checks)\s+(?:now\s+)?pass(?:ed|ing)?\b")
            .expect("Invalid tests pass pattern"),
        Regex::new(r"(?i)\bsuccessfully\s+(?:implemented|completed|fixed|added|updated|finished)\b")
            .expect("Invalid success pattern"),
        Regex::new(r"(?i)\bnothing\s+(?:left|else|more)\s+to\s+do\b")
            .expect("Invalid nothing left pattern"),
        Regex::new(r"(?i)\bno\s+(?:further|more|remaining)\s+(?:changes|work|tasks)\b")
            .expect("Invalid no remaining work pattern"),
        Regex::new(r"(?i)\bready\s+for\s+review\b").expect("Invalid review pattern"),
    ]
});

static ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?m)^\s*error(?:\[\w+\])?:").expect("Invalid error line pattern"),
        Regex::new(r"(?i)\b(?:test|tests|build|compilation|command)\s+failed\b")
            .expect("Invalid failure pattern"),
        Regex::new(r"\bpanicked at\b").expect("Invalid panic pattern"),
        Regex::new(r"Traceback \(most recent call last\)").expect("Invalid traceback pattern"),
        Regex::new(r"(?i)\bcommand not found\b").expect("Invalid command pattern"),
        Regex::new(r"(?i)\bunhandled exception\b").expect("Invalid exception pattern"),
    ]
});

fn count_matches(patterns: &[Regex], text: &str) -> usize {
    patterns.iter().map(|re| re.find_iter(text).count()).sum()
}

/// Exit-signal matches, in pattern order.
pub fn exit_signals(text: &str) -> Vec<String> {
    EXIT_SIGNAL_PATTERNS
        .iter()
        .filter_map(|re| re.find(text))
        .map(|m| m.as_str().to_string())
        .collect()
}

pub fn count_completion_indicators(text: &str) -> usize {
    count_matches(&COMPLETION_PATTERNS, text)
}

pub fn count_errors(text: &str) -> usize {
    count_matches(&ERROR_PATTERNS, text)
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisResult {
    pub has_exit_signal: bool,
    pub completion_indicators: usize,
    pub error_count: usize,
    pub matched_exit_signals: Vec<String>,
}

pub fn analyze(text: &str) -> AnalysisResult {
    let matched_exit_signals = exit_signals(text);
    AnalysisResult {
        has_exit_signal: !matched_exit_signals.is_empty(),
        completion_indicators: count_completion_indicators(text),
        error_count: count_errors(text),
        matched_exit_signals,
    }
}

#[derive(Debug, Clone)]
pub struct ResponseAnalyzer {
    mode: ExitMode,
    min_completion_indicators: usize,
}

impl Default for ResponseAnalyzer {
    fn default() -> Self {
        Self::new(ExitMode::DualGate, 2)
    }
}

impl ResponseAnalyzer {
    pub fn new(mode: ExitMode, min_completion_indicators: usize) -> Self {
        Self {
            mode,
            min_completion_indicators,
        }
    }

    pub fn mode(&self) -> ExitMode {
        self.mode
    }

    pub fn analyze(&self, text: &str) -> AnalysisResult {
        analyze(text)
    }

    pub fn should_exit(&self, analysis: &AnalysisResult) -> bool {
        let enough = analysis.completion_indicators >= self.min_completion_indicators;
        match self.mode {
            ExitMode::DualGate => analysis.has_exit_signal && enough,
            ExitMode::CompletionOnly => enough,
        }
    }
}
