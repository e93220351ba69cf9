use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the response analyzer decides the task is finished.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitMode {
    /// Explicit exit signal and enough completion indicators.
    DualGate,
    /// Enough completion indicators alone.
    CompletionOnly,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AutonomousConfig {
    pub max_calls_per_hour: u32,
    pub max_no_progress_loops: u32,
    pub max_consecutive_errors: u32,
    pub max_completion_indicators: u32,
    pub require_exit_signal: bool,
    pub min_completion_indicators: usize,
    pub max_loops: u32,
    /// Overrides the mode implied by `require_exit_signal`.
    pub exit_mode: Option<ExitMode>,
    /// Where the hourly call counter is persisted.
    pub rate_limit_file: PathBuf,
}

impl Default for AutonomousConfig {
    fn default() -> Self {
        Self {
            max_calls_per_hour: 100,
            max_no_progress_loops: 3,
            max_consecutive_errors: 5,
            max_completion_indicators: 5,
            require_exit_signal: true,
            min_completion_indicators: 2,
            max_loops: 50,
            exit_mode: None,
            rate_limit_file: PathBuf::from(".autopilot/rate_limit.json"),
        }
    }
}

impl AutonomousConfig {
    pub fn exit_mode(&self) -> ExitMode {
        self.exit_mode.unwrap_or(if self.require_exit_signal {
            ExitMode::DualGate
        } else {
            ExitMode::CompletionOnly
        })
    }

    pub fn with_max_loops(mut self, max_loops: u32) -> Self {
        self.max_loops = max_loops;
        self
    }

    pub fn with_max_calls_per_hour(mut self, max: u32) -> Self {
        self.max_calls_per_hour = max;
        self
    }

    pub fn with_exit_mode(mut self, mode: ExitMode) -> Self {
        self.exit_mode = Some(mode);
        self
    }

    pub fn with_rate_limit_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.rate_limit_file = path.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_mode_follows_require_exit_signal() {
        let mut config = AutonomousConfig::default();
        assert_eq!(config.exit_mode(), ExitMode::DualGate);
        config.require_exit_signal = false;
        assert_eq!(config.exit_mode(), ExitMode::CompletionOnly);
        let config = config.with_exit_mode(ExitMode::DualGate);
        assert_eq!(config.exit_mode(), ExitMode::DualGate);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: AutonomousConfig =
            serde_json::from_str(r#"{"max_loops": 7, "exit_mode": "completion_only"}"#).unwrap();
        assert_eq!(config.max_loops, 7);
        assert_eq!(config.max_calls_per_hour, 100);
        assert_eq!(config.exit_mode(), ExitMode::CompletionOnly);
    }
}
