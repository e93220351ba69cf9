//! File-loadable configuration for the whole runtime.
//!
//! Every field has a default, so a partial JSON file works:
//!
//! ```json
//! {
//!   "model": "z-ai/glm-5",
//!   "retry": { "max_retries": 4, "initial_delay_ms": 1000 },
//!   "context": { "max_tokens": 64000 },
//!   "approval": { "mutating": "ask" },
//!   "autonomous": { "max_loops": 20 }
//! }
//! ```

use crate::DEFAULT_MODEL;
use crate::agent::turn_loop::TurnConfig;
use crate::autonomous::AutonomousConfig;
use crate::context::{CompactionConfig, ContextConfig, SummarizerConfig};
use crate::llm::ProviderSettings;
use crate::llm::retry::RetryConfig;
use crate::tools::approval::ApprovalPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an autonomous coding assistant working in a software repository. \
Use the available tools to inspect and change files. Make one focused change \
at a time, verify it, and report what you did.";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Name in the provider table.
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Backoff for opening provider requests.
    pub retry: RetryConfig,
    pub system_prompt: String,
    pub max_turns: u32,
    pub context: ContextConfig,
    pub compaction: CompactionConfig,
    pub summarizer: SummarizerConfig,
    pub approval: ApprovalPolicy,
    pub autonomous: AutonomousConfig,
    pub session_dir: PathBuf,
    pub shared_context_file: Option<PathBuf>,
    /// JSON file of shell-template tools.
    pub tools_file: Option<PathBuf>,
    /// JSON file of hook commands.
    pub hooks_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: "openrouter".into(),
            model: DEFAULT_MODEL.into(),
            base_url: None,
            max_tokens: 4096,
            temperature: 0.2,
            retry: RetryConfig::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_turns: TurnConfig::default().max_turns,
            context: ContextConfig::default(),
            compaction: CompactionConfig::default(),
            summarizer: SummarizerConfig::default(),
            approval: ApprovalPolicy::default(),
            autonomous: AutonomousConfig::default(),
            session_dir: PathBuf::from(".autopilot/sessions"),
            shared_context_file: None,
            tools_file: None,
            hooks_file: None,
        }
    }
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config '{}': {e}", path.display()))?;
        serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse config '{}': {e}", path.display()))
    }

    /// Provider settings for this config with the given API key.
    pub fn provider_settings(&self, api_key: impl Into<String>) -> ProviderSettings {
        let mut settings = ProviderSettings::new(&self.model, api_key).with_max_tokens(self.max_tokens);
        settings.temperature = self.temperature;
        settings.retry = self.retry.clone();
        if let Some(url) = &self.base_url {
            settings = settings.with_base_url(url);
        }
        settings
    }

    pub fn turn_config(&self, cwd: impl Into<PathBuf>) -> TurnConfig {
        TurnConfig::default()
            .with_max_turns(self.max_turns)
            .with_cwd(cwd)
    }
}
