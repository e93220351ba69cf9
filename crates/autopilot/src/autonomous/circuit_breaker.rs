//! Halts an unattended loop after sustained stagnation, errors, or
//! repeated claims of completion.
//!
//! Three counters are updated once per loop iteration:
//!
//! | Counter | Increments when | Resets when |
//! |---------|-----------------|-------------|
//! | `no_progress` | no files changed and no errors | files changed or errors |
//! | `consecutive_errors` | errors | no errors |
//! | `completion` | a completion indicator was seen | never |
//!
//! Reaching a threshold opens the breaker. While open, updates are ignored
//! until [`CircuitBreaker::reset`]. `HalfOpen` is never entered.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    HalfOpen,
    Open,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerThresholds {
    pub max_no_progress: u32,
    pub max_consecutive_errors: u32,
    pub max_completion: u32,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            max_no_progress: 3,
            max_consecutive_errors: 5,
            max_completion: 5,
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BreakerCounters {
    pub no_progress: u32,
    pub consecutive_errors: u32,
    pub completion: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    thresholds: BreakerThresholds,
    state: CircuitState,
    counters: BreakerCounters,
    open_reason: Option<String>,
}

impl CircuitBreaker {
    pub fn new(thresholds: BreakerThresholds) -> Self {
        Self {
            thresholds,
            ..Self::default()
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn counters(&self) -> BreakerCounters {
        self.counters
    }

    pub fn thresholds(&self) -> BreakerThresholds {
        self.thresholds
    }

    /// Why the breaker opened, while it is open.
    pub fn open_reason(&self) -> Option<&str> {
        self.open_reason.as_deref()
    }

    /// Record one iteration's signals and return the resulting state.
    pub fn update(
        &mut self,
        files_changed: bool,
        has_errors: bool,
        has_completion: bool,
    ) -> CircuitState {
        if self.state == CircuitState::Open {
            return self.state;
        }

        let c = &mut self.counters;
        c.no_progress = if !files_changed && !has_errors {
            c.no_progress + 1
        } else {
            0
        };
        c.consecutive_errors = if has_errors {
            c.consecutive_errors + 1
        } else {
            0
        };
        if has_completion {
            c.completion += 1;
        }
        debug!(
            "Circuit counters: no_progress={}, errors={}, completion={}",
            c.no_progress, c.consecutive_errors, c.completion
        );

        let t = self.thresholds;
        let reason = if c.no_progress >= t.max_no_progress {
            Some(format!("no progress in {} consecutive loops", c.no_progress))
        } else if c.consecutive_errors >= t.max_consecutive_errors {
            Some(format!("errors in {} consecutive loops", c.consecutive_errors))
        } else if c.completion >= t.max_completion {
            Some(format!("completion reported {} times", c.completion))
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!("Circuit breaker opened: {reason}");
            self.state = CircuitState::Open;
            self.open_reason = Some(reason);
        }
        self.state
    }

    /// Close the breaker and zero all counters.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.counters = BreakerCounters::default();
        self.open_reason = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_exactly_at_no_progress_threshold() {
        let mut breaker = CircuitBreaker::default();
        let states: Vec<CircuitState> = (0..3).map(|_| breaker.update(false, false, false)).collect();
        assert_eq!(
            states,
            vec![CircuitState::Closed, CircuitState::Closed, CircuitState::Open]
        );
        assert!(breaker.open_reason().unwrap().contains("no progress"));
    }

    #[test]
    fn progress_resets_no_progress() {
        let mut breaker = CircuitBreaker::default();
        breaker.update(false, false, false);
        breaker.update(false, false, false);
        breaker.update(true, false, false);
        assert_eq!(breaker.counters().no_progress, 0);
        breaker.update(false, false, false);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn consecutive_errors_open_and_reset_on_success() {
        let mut breaker = CircuitBreaker::new(BreakerThresholds {
            max_no_progress: 100,
            max_consecutive_errors: 2,
            max_completion: 100,
        });
        breaker.update(false, true, false);
        breaker.update(true, false, false);
        assert_eq!(breaker.counters().consecutive_errors, 0);
        breaker.update(false, true, false);
        assert_eq!(breaker.update(false, true, false), CircuitState::Open);
    }

    #[test]
    fn completion_never_resets() {
        let mut breaker = CircuitBreaker::new(BreakerThresholds {
            max_no_progress: 100,
            max_consecutive_errors: 100,
            max_completion: 2,
        });
        breaker.update(true, false, true);
        breaker.update(true, false, false);
        assert_eq!(breaker.counters().completion, 1);
        assert_eq!(breaker.update(true, false, true), CircuitState::Open);
    }

    #[test]
    fn open_is_sticky_until_reset() {
        let mut breaker = CircuitBreaker::new(BreakerThresholds {
            max_no_progress: 1,
            ..BreakerThresholds::default()
        });
        assert_eq!(breaker.update(false, false, false), CircuitState::Open);
        let before = breaker.counters();
        assert_eq!(breaker.update(true, false, false), CircuitState::Open);
        assert_eq!(breaker.counters(), before);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counters(), BreakerCounters::default());
        assert!(breaker.open_reason().is_none());
    }

    #[test]
    fn state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&CircuitState::HalfOpen).unwrap(), "\"HALF_OPEN\"");
    }
}
