//! Approval and safety gate for tool calls.
//!
//! The pipeline asks an [`ApprovalGate`] before executing any tool. The
//! stock gate, [`PolicyGate`], applies an [`ApprovalPolicy`]: blocked
//! command patterns first, then a per-tool [`ApprovalMode`]. `Ask` defers
//! to a [`Prompter`], typically a human at a terminal.

use super::core::ToolArguments;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{BufRead, Write};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Command patterns denied regardless of mode (lowercased substring match).
pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &["rm -rf /", "mkfs", "> /dev/"];

/// Argument keys inspected for blocked command patterns.
const COMMAND_ARG_KEYS: &[&str] = &["command", "cmd"];

/// A pending tool call awaiting a decision.
#[derive(Debug)]
pub struct ApprovalRequest<'a> {
    pub tool: &'a str,
    pub arguments: &'a ToolArguments,
    /// Rendered command line for tools that run one through a shell.
    pub command_line: Option<&'a str>,
    pub cwd: &'a Path,
    pub mutating: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny(String),
}

pub type ApprovalFuture<'a> = Pin<Box<dyn Future<Output = ApprovalDecision> + Send + 'a>>;

/// Decides whether a tool call may execute.
pub trait ApprovalGate: Send + Sync {
    fn decide<'a>(&'a self, request: &'a ApprovalRequest<'a>) -> ApprovalFuture<'a>;
}

/// Asks someone (usually a human) to confirm a tool call.
pub trait Prompter: Send + Sync {
    fn confirm<'a>(&'a self, request: &'a ApprovalRequest<'a>) -> ApprovalFuture<'a>;
}

// ── Policy ─────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    Allow,
    Deny,
    Ask,
}

/// Per-tool approval rules.
///
/// Resolution order: `tools[name]`, then `mutating` for mutating tools, then
/// `default`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ApprovalPolicy {
    pub default: ApprovalMode,
    pub mutating: Option<ApprovalMode>,
    pub tools: BTreeMap<String, ApprovalMode>,
    pub blocked_commands: Vec<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            default: ApprovalMode::Allow,
            mutating: None,
            tools: BTreeMap::new(),
            blocked_commands: DEFAULT_BLOCKED_COMMANDS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl ApprovalPolicy {
    pub fn with_default(mut self, mode: ApprovalMode) -> Self {
        self.default = mode;
        self
    }

    pub fn with_mutating(mut self, mode: ApprovalMode) -> Self {
        self.mutating = Some(mode);
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, mode: ApprovalMode) -> Self {
        self.tools.insert(name.into(), mode);
        self
    }

    pub fn block_command(mut self, pattern: impl Into<String>) -> Self {
        self.blocked_commands.push(pattern.into());
        self
    }

    pub fn mode_for(&self, tool: &str, mutating: bool) -> ApprovalMode {
        if let Some(mode) = self.tools.get(tool) {
            return *mode;
        }
        match self.mutating {
            Some(mode) if mutating => mode,
            _ => self.default,
        }
    }

    /// The first blocked pattern found in a command-style argument or in the
    /// rendered command line.
    pub fn blocked_pattern(
        &self,
        args: &ToolArguments,
        command_line: Option<&str>,
    ) -> Option<&str> {
        let mut commands: Vec<String> = match args {
            ToolArguments::Structured(_) => COMMAND_ARG_KEYS
                .iter()
                .filter_map(|k| args.get_str(k))
                .map(str::to_lowercase)
                .collect(),
            ToolArguments::Raw(raw) => vec![raw.to_lowercase()],
        };
        commands.extend(command_line.map(str::to_lowercase));
        self.blocked_commands
            .iter()
            .map(String::as_str)
            .find(|p| commands.iter().any(|c| c.contains(&p.to_lowercase())))
    }
}

// ── PolicyGate ─────────────────────────────────────────────────────

/// [`ApprovalGate`] driven by an [`ApprovalPolicy`].
pub struct PolicyGate {
    policy: ApprovalPolicy,
    prompter: Option<Arc<dyn Prompter>>,
}

impl PolicyGate {
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self {
            policy,
            prompter: None,
        }
    }

    /// Approve everything except blocked command patterns.
    pub fn allow_all() -> Self {
        Self::new(ApprovalPolicy::default())
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }
}

impl ApprovalGate for PolicyGate {
    fn decide<'a>(&'a self, request: &'a ApprovalRequest<'a>) -> ApprovalFuture<'a> {
        Box::pin(async move {
            if let Some(pattern) = self
                .policy
                .blocked_pattern(request.arguments, request.command_line)
            {
                warn!("Blocked {} call matching '{pattern}'", request.tool);
                return ApprovalDecision::Deny(format!(
                    "command matches blocked pattern '{pattern}'"
                ));
            }
            let mode = self.policy.mode_for(request.tool, request.mutating);
            debug!("Approval mode for {}: {mode:?}", request.tool);
            match mode {
                ApprovalMode::Allow => ApprovalDecision::Approve,
                ApprovalMode::Deny => {
                    ApprovalDecision::Deny(format!("tool '{}' is denied by policy", request.tool))
                }
                ApprovalMode::Ask => match &self.prompter {
                    Some(prompter) => prompter.confirm(request).await,
                    None => ApprovalDecision::Deny(format!(
                        "tool '{}' requires approval and no one is available to approve it",
                        request.tool
                    )),
                },
            }
        })
    }
}

// ── StdinPrompter ──────────────────────────────────────────────────

/// Prompts on stderr and reads `y`/`n` from stdin.
pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn confirm<'a>(&'a self, request: &'a ApprovalRequest<'a>) -> ApprovalFuture<'a> {
        let call = match request.command_line {
            Some(line) => format!("{}: `{line}`", request.tool),
            None => format!("{}({})", request.tool, request.arguments),
        };
        let question = format!("Allow {call} in {}? [y/N] ", request.cwd.display());
        let tool = request.tool.to_string();
        Box::pin(async move {
            let answer = tokio::task::spawn_blocking(move || {
                let mut stderr = std::io::stderr();
                let _ = write!(stderr, "{question}");
                let _ = stderr.flush();
                let mut line = String::new();
                std::io::stdin().lock().read_line(&mut line).map(|_| line)
            })
            .await;
            match answer {
                Ok(Ok(line)) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes") => {
                    ApprovalDecision::Approve
                }
                Ok(Ok(_)) => ApprovalDecision::Deny(format!("user declined '{tool}'")),
                Ok(Err(e)) => ApprovalDecision::Deny(format!("Failed to read approval: {e}")),
                Err(e) => ApprovalDecision::Deny(format!("Failed to read approval: {e}")),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPrompter {
        calls: AtomicUsize,
        approve: bool,
    }

    impl Prompter for CountingPrompter {
        fn confirm<'a>(&'a self, _request: &'a ApprovalRequest<'a>) -> ApprovalFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let decision = if self.approve {
                ApprovalDecision::Approve
            } else {
                ApprovalDecision::Deny("nope".into())
            };
            Box::pin(async move { decision })
        }
    }

    fn request<'a>(tool: &'a str, args: &'a ToolArguments, mutating: bool) -> ApprovalRequest<'a> {
        ApprovalRequest {
            tool,
            arguments: args,
            command_line: None,
            cwd: Path::new("."),
            mutating,
        }
    }

    #[test]
    fn mode_resolution_order() {
        let policy = ApprovalPolicy::default()
            .with_mutating(ApprovalMode::Ask)
            .with_tool("write_file", ApprovalMode::Allow);
        assert_eq!(policy.mode_for("write_file", true), ApprovalMode::Allow);
        assert_eq!(policy.mode_for("shell", true), ApprovalMode::Ask);
        assert_eq!(policy.mode_for("read_file", false), ApprovalMode::Allow);
    }

    #[tokio::test]
    async fn blocked_command_denied_even_when_allowed() {
        let gate = PolicyGate::allow_all();
        let args = ToolArguments::parse(r#"{"command":"sudo RM -RF / --no-preserve-root"}"#);
        let decision = gate.decide(&request("shell", &args, true)).await;
        assert!(matches!(decision, ApprovalDecision::Deny(r) if r.contains("rm -rf /")));

        let safe = ToolArguments::parse(r#"{"command":"ls"}"#);
        assert_eq!(
            gate.decide(&request("shell", &safe, true)).await,
            ApprovalDecision::Approve
        );
    }

    #[tokio::test]
    async fn blocked_pattern_in_rendered_command_line() {
        let gate = PolicyGate::allow_all();
        let args = ToolArguments::parse(r#"{"package":"core; mkfs.ext4 /dev/sda"}"#);

        let mut req = request("run_tests", &args, false);
        assert_eq!(gate.decide(&req).await, ApprovalDecision::Approve);

        req.command_line = Some("cargo test -p 'core; mkfs.ext4 /dev/sda'");
        assert!(matches!(
            gate.decide(&req).await,
            ApprovalDecision::Deny(r) if r.contains("mkfs")
        ));
    }

    #[tokio::test]
    async fn ask_uses_prompter_or_denies() {
        let args = ToolArguments::parse("{}");
        let policy = ApprovalPolicy::default().with_default(ApprovalMode::Ask);

        let unattended = PolicyGate::new(policy.clone());
        assert!(matches!(
            unattended.decide(&request("x", &args, false)).await,
            ApprovalDecision::Deny(_)
        ));

        let prompter = Arc::new(CountingPrompter {
            calls: AtomicUsize::new(0),
            approve: true,
        });
        let gate = PolicyGate::new(policy).with_prompter(prompter.clone());
        assert_eq!(
            gate.decide(&request("x", &args, false)).await,
            ApprovalDecision::Approve
        );
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn policy_deserializes_partial_json() {
        let policy: ApprovalPolicy =
            serde_json::from_str(r#"{"default":"ask","tools":{"read_file":"allow"}}"#).unwrap();
        assert_eq!(policy.default, ApprovalMode::Ask);
        assert_eq!(policy.mode_for("read_file", false), ApprovalMode::Allow);
        assert_eq!(policy.blocked_commands.len(), DEFAULT_BLOCKED_COMMANDS.len());
    }
}
