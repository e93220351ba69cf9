//! Persisted hourly call quota.
//!
//! State is a small JSON file, `{"count": N, "last_reset": "<RFC 3339>"}`,
//! so the quota survives process restarts. The window is fixed: once an hour
//! has passed since `last_reset`, the next [`RateLimiter::check_limit`]
//! starts a new window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitState {
    pub count: u32,
    pub last_reset: DateTime<Utc>,
}

pub struct RateLimiter {
    path: Option<PathBuf>,
    max_calls_per_hour: u32,
    state: RateLimitState,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Load state from `path`. A missing file starts a fresh window; an
    /// unreadable or corrupt one is logged and also starts fresh.
    pub fn load(path: impl Into<PathBuf>, max_calls_per_hour: u32, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let state = read_state(&path).unwrap_or_else(|| RateLimitState {
            count: 0,
            last_reset: clock.now(),
        });
        debug!(
            "Rate limiter: {}/{max_calls_per_hour} calls since {}",
            state.count, state.last_reset
        );
        Self {
            path: Some(path),
            max_calls_per_hour,
            state,
            clock,
        }
    }

    /// A limiter that is never written to disk.
    pub fn in_memory(max_calls_per_hour: u32, clock: Arc<dyn Clock>) -> Self {
        let state = RateLimitState {
            count: 0,
            last_reset: clock.now(),
        };
        Self {
            path: None,
            max_calls_per_hour,
            state,
            clock,
        }
    }

    /// Whether another call is allowed. Starts a new window (and persists it)
    /// when the current one is at least an hour old.
    pub fn check_limit(&mut self) -> bool {
        let now = self.clock.now();
        if now - self.state.last_reset >= Duration::hours(1) {
            info!("Rate limit window reset ({} calls in previous window)", self.state.count);
            self.state = RateLimitState {
                count: 0,
                last_reset: now,
            };
            if let Err(e) = self.persist() {
                warn!("{e}");
            }
            return true;
        }
        let allowed = self.state.count < self.max_calls_per_hour;
        if !allowed {
            warn!(
                "Rate limit reached: {}/{} calls this hour",
                self.state.count, self.max_calls_per_hour
            );
        }
        allowed
    }

    /// Count one call and persist.
    pub fn increment(&mut self) -> Result<(), String> {
        self.state.count += 1;
        self.persist()
    }

    pub fn count(&self) -> u32 {
        self.state.count
    }

    pub fn max_calls_per_hour(&self) -> u32 {
        self.max_calls_per_hour
    }

    pub fn state(&self) -> RateLimitState {
        self.state
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self) -> Result<(), String> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create rate limit dir: {e}"))?;
        }
        let json = serde_json::to_string(&self.state)
            .map_err(|e| format!("Failed to serialize rate limit state: {e}"))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| format!("Failed to write rate limit state: {e}"))?;
        std::fs::rename(&tmp, path).map_err(|e| format!("Failed to rename rate limit state: {e}"))
    }
}

fn read_state(path: &Path) -> Option<RateLimitState> {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Ignoring unreadable rate limit state at {}: {e}", path.display());
            return None;
        }
    };
    serde_json::from_str(&json)
        .map_err(|e| warn!("Ignoring corrupt rate limit state at {}: {e}", path.display()))
        .ok()
}
