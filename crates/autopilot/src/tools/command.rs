//! Shell-template tools loaded from a JSON tools file.
//!
//! Each entry is a function definition plus an `execute` command template in
//! which `{{param}}` placeholders are replaced by shell-quoted argument values,
//! so placeholders stand alone in the template rather than inside quotes:
//!
//! ```json
//! [
//!   {
//!     "type": "function",
//!     "function": {
//!       "name": "run_tests",
//!       "description": "Run the test suite for a package",
//!       "parameters": {"type": "object", "properties": {"package": {"type": "string"}}}
//!     },
//!     "execute": "cargo test -p {{package}}",
//!     "mutating": false
//!   }
//! ]
//! ```

use super::core::{Tool, ToolArguments, ToolFuture, ToolResult};
use crate::{FunctionDef, ToolDef, ToolType};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder regex is valid")
});

#[derive(Deserialize)]
struct ToolFileEntry {
    #[serde(rename = "type")]
    tool_type: ToolType,
    function: FunctionDef,
    execute: String,
    #[serde(default)]
    mutating: bool,
}

/// A tool that renders a command template and runs it with `sh -c`.
#[derive(Debug, Clone)]
pub struct CommandTool {
    def: ToolDef,
    template: String,
    mutating: bool,
}

impl CommandTool {
    pub fn new(def: ToolDef, template: impl Into<String>) -> Self {
        Self {
            def,
            template: template.into(),
            mutating: false,
        }
    }

    pub fn mutating(mut self, mutating: bool) -> Self {
        self.mutating = mutating;
        self
    }
}

impl Tool for CommandTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute<'a>(&'a self, args: &'a ToolArguments, cwd: &'a Path) -> ToolFuture<'a> {
        Box::pin(async move {
            let cmd = render_command(&self.template, args);
            debug!("[tool] {}: {cmd}", self.def.function.name);

            let output = match tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .current_dir(cwd)
                .kill_on_drop(true)
                .output()
                .await
            {
                Ok(o) => o,
                Err(e) => return ToolResult::failure(format!("Failed to spawn '{cmd}': {e}")),
            };

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let combined = if stderr.trim().is_empty() {
                stdout
            } else {
                format!("{stdout}\n[stderr]\n{stderr}")
            };
            let code = output.status.code().unwrap_or(-1);

            let result = if output.status.success() {
                ToolResult::ok(combined)
            } else {
                ToolResult::failure(format!("command exited with status {code}"))
                    .with_output(combined)
            };
            result.with_exit_code(code)
        })
    }

    fn is_mutation(&self) -> bool {
        self.mutating
    }

    fn command_line(&self, args: &ToolArguments) -> Option<String> {
        Some(render_command(&self.template, args))
    }
}

/// Substitute `{{param}}` placeholders; unknown placeholders become empty.
///
/// Every substituted value is shell-quoted so it reaches the command as a
/// single word. Whitespace runs in the template collapse to one space;
/// whitespace inside values is kept as is.
pub fn render_command(template: &str, args: &ToolArguments) -> String {
    let mut literals = PLACEHOLDER.split(template);
    let mut rendered = collapse_whitespace(literals.next().unwrap_or_default());
    for (caps, literal) in PLACEHOLDER.captures_iter(template).zip(literals) {
        let value = match args.as_value().and_then(|v| v.get(&caps[1])) {
            Some(serde_json::Value::String(s)) => shell_quote(s),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => shell_quote(&other.to_string()),
        };
        rendered.push_str(&value);
        let literal = collapse_whitespace(literal);
        match literal.strip_prefix(' ') {
            Some(rest) if value.is_empty() && rendered.ends_with(' ') => rendered.push_str(rest),
            _ => rendered.push_str(&literal),
        }
    }
    rendered.trim().to_string()
}

fn collapse_whitespace(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    let mut in_space = false;
    for ch in literal.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    out
}

fn shell_quote(value: &str) -> String {
    // NUL cannot appear in a shell argument.
    let value = value.replace('\0', "");
    shlex::try_quote(&value)
        .map(|quoted| quoted.into_owned())
        .unwrap_or_default()
}

/// Load command tools from a JSON tools file.
pub fn load_command_tools(path: impl AsRef<Path>) -> Result<Vec<CommandTool>, String> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read tools file '{}': {e}", path.display()))?;
    let entries: Vec<ToolFileEntry> = serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse tools file '{}': {e}", path.display()))?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            CommandTool::new(
                ToolDef {
                    tool_type: entry.tool_type,
                    function: entry.function,
                },
                entry.execute,
            )
            .mutating(entry.mutating)
        })
        .collect())
}
