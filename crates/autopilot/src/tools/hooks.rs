//! Pre- and post-invocation hooks.
//!
//! [`InvocationHook`] is the typed interface the pipeline calls around each
//! tool execution. [`ExternalHookRunner`] implements it by running shell
//! commands configured in a [`HookConfig`] (loadable from JSON).

use super::core::{ToolArguments, ToolResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Decision returned by [`InvocationHook::pre_tool_use`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    Proceed,
    /// Skip execution; the reason is returned to the model as a failure.
    Block(String),
}

/// Hook called around every tool invocation.
pub trait InvocationHook: Send + Sync {
    fn pre_tool_use(&self, _tool: &str, _args: &ToolArguments) -> HookAction {
        HookAction::Proceed
    }

    /// Return a note to append to the tool output, or `None`.
    fn post_tool_use(&self, _tool: &str, _result: &ToolResult) -> Option<String> {
        None
    }
}

// ── HookConfig ─────────────────────────────────────────────────────

/// External hook commands.
///
/// ```json
/// {
///   "pre_tool_use": [{ "command": "./check.sh", "matcher": "shell" }],
///   "post_tool_use": [{ "command": "cargo fmt --check" , "matcher": "write" }]
/// }
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct HookConfig {
    #[serde(default)]
    pub pre_tool_use: Vec<HookEntry>,
    #[serde(default)]
    pub post_tool_use: Vec<HookEntry>,
}

/// A shell command with an optional tool-name matcher (substring).
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HookEntry {
    pub command: String,
    #[serde(default)]
    pub matcher: Option<String>,
}

impl HookEntry {
    fn matches(&self, tool: &str) -> bool {
        self.matcher.as_deref().is_none_or(|m| tool.contains(m))
    }
}

// ── ExternalHookRunner ─────────────────────────────────────────────

/// Runs configured shell commands as hooks.
///
/// Commands receive:
/// - `AUTOPILOT_HOOK_EVENT`: `pre_tool_use` or `post_tool_use`
/// - `AUTOPILOT_TOOL_NAME`
/// - `AUTOPILOT_TOOL_ARGS` (pre)
/// - `AUTOPILOT_TOOL_RESULT` (post, truncated to 10KB)
/// - `AUTOPILOT_TOOL_SUCCESS` (post, `true`/`false`)
///
/// A non-zero exit from a pre hook blocks the call; its stdout is the reason.
/// Non-empty stdout from a post hook is appended to the tool output.
pub struct ExternalHookRunner {
    hooks: HookConfig,
    workdir: PathBuf,
}

const MAX_TOOL_RESULT_ENV_BYTES: usize = 10_240;

impl ExternalHookRunner {
    pub fn new(hooks: HookConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            hooks,
            workdir: workdir.into(),
        }
    }

    /// Load hook config from a JSON file.
    pub fn load(path: impl AsRef<Path>, workdir: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read hooks config '{}': {e}", path.display()))?;
        let hooks = serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse hooks config '{}': {e}", path.display()))?;
        Ok(Self::new(hooks, workdir))
    }

    fn run(&self, command: &str, env_vars: &[(&str, &str)]) -> Result<(i32, String), String> {
        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&self.workdir);
        for (key, val) in env_vars {
            cmd.env(key, val);
        }
        let output = cmd
            .output()
            .map_err(|e| format!("Failed to execute hook command: {e}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((output.status.code().unwrap_or(1), stdout))
    }
}

impl InvocationHook for ExternalHookRunner {
    fn pre_tool_use(&self, tool: &str, args: &ToolArguments) -> HookAction {
        let args = args.to_string();
        for entry in self.hooks.pre_tool_use.iter().filter(|e| e.matches(tool)) {
            let env = [
                ("AUTOPILOT_HOOK_EVENT", "pre_tool_use"),
                ("AUTOPILOT_TOOL_NAME", tool),
                ("AUTOPILOT_TOOL_ARGS", args.as_str()),
            ];
            match self.run(&entry.command, &env) {
                Ok((0, _)) => {}
                Ok((_, reason)) if reason.is_empty() => {
                    return HookAction::Block(format!("hook '{}' blocked tool '{tool}'", entry.command));
                }
                Ok((_, reason)) => return HookAction::Block(reason),
                Err(e) => warn!("pre_tool_use hook failed: {e}"),
            }
        }
        HookAction::Proceed
    }

    fn post_tool_use(&self, tool: &str, result: &ToolResult) -> Option<String> {
        let content: String = result
            .to_message_content()
            .chars()
            .take(MAX_TOOL_RESULT_ENV_BYTES)
            .collect();
        let success = result.success.to_string();
        let mut notes = Vec::new();
        for entry in self.hooks.post_tool_use.iter().filter(|e| e.matches(tool)) {
            let env = [
                ("AUTOPILOT_HOOK_EVENT", "post_tool_use"),
                ("AUTOPILOT_TOOL_NAME", tool),
                ("AUTOPILOT_TOOL_RESULT", content.as_str()),
                ("AUTOPILOT_TOOL_SUCCESS", success.as_str()),
            ];
            match self.run(&entry.command, &env) {
                Ok((_, output)) if !output.is_empty() => notes.push(output),
                Ok(_) => {}
                Err(e) => warn!("post_tool_use hook failed: {e}"),
            }
        }
        (!notes.is_empty()).then(|| notes.join("\n"))
    }
}
