//! Persisted session snapshots.
//!
//! A session is stored as one JSON file per id in the store directory, with
//! timestamped checkpoint copies beside it:
//!
//! ```text
//! sessions_dir/
//!   sess-18e3f2a1b00-0.json
//!   sess-18e3f2a1b00-0.20260301T120000123.json
//! ```
//!
//! All store operations are serialized by one async mutex so a save never
//! interleaves with another save or a listing. Files are written atomically
//! (temp file, then rename) and are readable by the owner only.

use crate::context::ContextManager;
use crate::{Message, MessageRole, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PREVIEW_CHARS: usize = 200;
const CHECKPOINT_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%3f";

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a session id: `sess-<hex millis>-<counter>`.
pub fn generate_session_id() -> String {
    let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sess-{:x}-{n}", Utc::now().timestamp_millis())
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ── SessionSnapshot ────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: u32,
    pub messages: Vec<Message>,
    pub total_usage: TokenUsage,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSnapshot {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            session_id: generate_session_id(),
            created_at: now,
            updated_at: now,
            turn_count: 0,
            messages: Vec::new(),
            total_usage: TokenUsage::default(),
        }
    }

    /// Copy the history and usage out of `context`, adding `turns`.
    pub fn update_from(&mut self, context: &ContextManager, turns: u32) {
        self.messages = context.get_messages();
        self.total_usage = *context.total_usage();
        self.turn_count += turns;
        self.updated_at = Utc::now();
    }

    /// First user message, truncated.
    pub fn preview(&self) -> String {
        self.messages
            .iter()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.text().chars().take(PREVIEW_CHARS).collect())
            .unwrap_or_default()
    }
}

/// Listing entry for a stored session.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: u32,
    pub message_count: usize,
    pub preview: String,
}

impl From<&SessionSnapshot> for SessionSummary {
    fn from(s: &SessionSnapshot) -> Self {
        Self {
            session_id: s.session_id.clone(),
            created_at: s.created_at,
            updated_at: s.updated_at,
            turn_count: s.turn_count,
            message_count: s.messages.len(),
            preview: s.preview(),
        }
    }
}

// ── SessionStore ───────────────────────────────────────────────────

pub struct SessionStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    /// Create a store, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, String> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create session dir '{}': {e}", dir.display()))?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Write `<id>.json`, replacing any previous snapshot.
    pub async fn save(&self, snapshot: &SessionSnapshot) -> Result<PathBuf, String> {
        let _guard = self.lock.lock().await;
        let path = self.checked_path(&snapshot.session_id, None)?;
        write_private(&path, snapshot).await?;
        info!(
            "Saved session {} ({} messages)",
            snapshot.session_id,
            snapshot.messages.len()
        );
        Ok(path)
    }

    /// Write a timestamped copy `<id>.<YYYYmmddTHHMMSSfff>.json`. A second
    /// checkpoint in the same millisecond gets a `_N` suffix.
    pub async fn checkpoint(&self, snapshot: &SessionSnapshot) -> Result<PathBuf, String> {
        let _guard = self.lock.lock().await;
        let base = Utc::now().format(CHECKPOINT_TIME_FORMAT).to_string();
        let mut path = self.checked_path(&snapshot.session_id, Some(&base))?;
        let mut n = 1;
        while tokio::fs::try_exists(&path).await.unwrap_or(false) {
            path = self.checked_path(&snapshot.session_id, Some(&format!("{base}_{n}")))?;
            n += 1;
        }
        write_private(&path, snapshot).await?;
        debug!("Checkpointed session {} to {}", snapshot.session_id, path.display());
        Ok(path)
    }

    /// Load a session. Missing, unreadable, or malformed files yield `None`.
    pub async fn load(&self, id: &str) -> Option<SessionSnapshot> {
        let _guard = self.lock.lock().await;
        if !is_valid_id(id) {
            warn!("Rejected invalid session id '{id}'");
            return None;
        }
        read_snapshot(&self.session_path(id)).await
    }

    /// All sessions, most recently updated first. Checkpoints are not listed.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let _guard = self.lock.lock().await;
        let mut summaries: Vec<SessionSummary> = self
            .read_all()
            .await
            .iter()
            .map(SessionSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// The most recently updated session.
    pub async fn latest(&self) -> Option<SessionSnapshot> {
        let _guard = self.lock.lock().await;
        self.read_all()
            .await
            .into_iter()
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at))
    }

    /// Checkpoint files for a session, oldest first.
    pub async fn checkpoints(&self, id: &str) -> Vec<PathBuf> {
        let _guard = self.lock.lock().await;
        let prefix = format!("{id}.");
        let mut paths: Vec<PathBuf> = self
            .json_files()
            .await
            .into_iter()
            .filter(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.starts_with(&prefix))
            })
            .collect();
        paths.sort();
        paths
    }

    fn checked_path(&self, id: &str, stamp: Option<&str>) -> Result<PathBuf, String> {
        if !is_valid_id(id) {
            return Err(format!("Failed to save session: invalid id '{id}'"));
        }
        Ok(match stamp {
            Some(stamp) => self.dir.join(format!("{id}.{stamp}.json")),
            None => self.session_path(id),
        })
    }

    async fn json_files(&self) -> Vec<PathBuf> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read session dir '{}': {e}", self.dir.display());
                return Vec::new();
            }
        };
        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.extension().is_some_and(|e| e == "json") {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read session dir entry: {e}");
                    break;
                }
            }
        }
        paths
    }

    /// Snapshots whose file stem is a plain id (no checkpoint suffix).
    async fn read_all(&self) -> Vec<SessionSnapshot> {
        let mut snapshots = Vec::new();
        for path in self.json_files().await {
            let is_primary = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(is_valid_id);
            if !is_primary {
                continue;
            }
            if let Some(snapshot) = read_snapshot(&path).await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }
}

async fn read_snapshot(path: &Path) -> Option<SessionSnapshot> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Skipping unreadable session at {}: {e}", path.display());
            return None;
        }
    };
    match serde_json::from_str(&json) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("Skipping malformed session at {}: {e}", path.display());
            None
        }
    }
}

/// Atomic owner-only write: temp file with mode 0600, then rename.
async fn write_private(path: &Path, snapshot: &SessionSnapshot) -> Result<(), String> {
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| format!("Failed to serialize session: {e}"))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("Failed to save session: bad path '{}'", path.display()))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(&tmp)
        .await
        .map_err(|e| format!("Failed to create temp session file: {e}"))?;
    file.write_all(json.as_bytes())
        .await
        .map_err(|e| format!("Failed to write session: {e}"))?;
    file.flush()
        .await
        .map_err(|e| format!("Failed to flush session: {e}"))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| format!("Failed to rename session file: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_valid() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with("sess-"));
        assert!(is_valid_id(&a));
        assert!(!is_valid_id("../etc"));
        assert!(!is_valid_id("a.b"));
    }

    #[test]
    fn preview_uses_first_user_message() {
        let mut snapshot = SessionSnapshot::new();
        snapshot.messages = vec![Message::system("sys"), Message::user("x".repeat(300))];
        assert_eq!(snapshot.preview().chars().count(), PREVIEW_CHARS);
    }

    #[tokio::test]
    async fn save_rejects_invalid_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let mut snapshot = SessionSnapshot::new();
        snapshot.session_id = "../escape".into();
        assert!(store.save(&snapshot).await.is_err());
        assert!(store.load("../escape").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let path = store.save(&SessionSnapshot::new()).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
