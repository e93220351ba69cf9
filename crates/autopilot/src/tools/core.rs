//! Tool abstraction and registry.
//!
//! The [`Tool`] trait defines what every tool implements: a definition
//! (name, description, JSON Schema) and an async `execute` that returns a
//! structured [`ToolResult`]. Tools are collected into a [`ToolRegistry`],
//! which resolves names, exports schemas, validates arguments, bounds
//! execution time, and truncates oversized output.

use crate::ToolDef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Default timeout for tool execution.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = ToolResult> + Send + 'a>>;

// ── ToolResult ─────────────────────────────────────────────────────

/// Outcome of a tool invocation.
///
/// Failures are data: a failed result is fed back to the model as a tool
/// message with `is_error = true` and never stops the turn.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
        self
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }

    /// Text fed back to the model as the tool message content.
    pub fn to_message_content(&self) -> String {
        match (&self.error, self.success) {
            (Some(err), false) if self.output.is_empty() => format!("Error: {err}"),
            (Some(err), false) => format!("Error: {err}\n\n{}", self.output),
            _ => self.output.clone(),
        }
    }
}

// ── ToolArguments ──────────────────────────────────────────────────

/// Arguments of a tool call: parsed JSON when possible, otherwise the raw text.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolArguments {
    Structured(serde_json::Value),
    Raw(String),
}

impl ToolArguments {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Structured(serde_json::Value::Object(Default::default()));
        }
        match serde_json::from_str(trimmed) {
            Ok(value) => Self::Structured(value),
            Err(_) => Self::Raw(raw.to_string()),
        }
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Structured(v) => Some(v),
            Self::Raw(_) => None,
        }
    }

    /// String-valued argument `key`, if the arguments are a JSON object.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.as_value()?.get(key)?.as_str()
    }

    /// Deserialize into a typed struct. The error is phrased for the model.
    pub fn parse_into<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        let value = match self {
            Self::Structured(v) => v.clone(),
            Self::Raw(raw) => {
                return Err(format!(
                    "invalid JSON arguments: {raw}. Provide valid JSON matching the tool's parameter schema."
                ));
            }
        };
        serde_json::from_value(value).map_err(|e| {
            format!("invalid tool arguments: {e}. Provide valid JSON matching the tool's parameter schema.")
        })
    }
}

impl fmt::Display for ToolArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structured(v) => write!(f, "{v}"),
            Self::Raw(raw) => write!(f, "{raw}"),
        }
    }
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool the model can invoke via function calling.
///
/// Errors are returned as failed [`ToolResult`]s rather than panics.
/// Timeouts and subprocess handling beyond the registry-wide bound are the
/// tool's own concern.
pub trait Tool: Send + Sync {
    /// Definition advertised to the model.
    fn definition(&self) -> ToolDef;

    /// Run the tool in `cwd`.
    fn execute<'a>(&'a self, args: &'a ToolArguments, cwd: &'a Path) -> ToolFuture<'a>;

    fn name(&self) -> String {
        self.definition().function.name
    }

    /// Whether the tool changes files or other external state.
    fn is_mutation(&self) -> bool {
        false
    }

    /// The shell command line this call would run, for tools that run one.
    fn command_line(&self, _args: &ToolArguments) -> Option<String> {
        None
    }
}

// ── Errors ─────────────────────────────────────────────────────────

/// Failure to resolve a tool call against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    UnknownTool(String),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTool(name) => write!(f, "Unknown tool '{name}'"),
        }
    }
}

// ── ToolRegistry ───────────────────────────────────────────────────

/// Tools dispatched by name.
///
/// ```ignore
/// let tools = ToolRegistry::new()
///     .with_timeout(Some(Duration::from_secs(30)))
///     .with(read_file_tool())
///     .with(write_file_tool());
/// let schemas = tools.definitions();
/// ```
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    max_result_bytes: usize,
    validate_args: bool,
    timeout: Option<Duration>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("max_result_bytes", &self.max_result_bytes)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            validate_args: true,
            timeout: Some(DEFAULT_TOOL_TIMEOUT),
        }
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    /// Validate arguments against each tool's JSON Schema before execution.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// Upper bound on a single execution. `None` disables it.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name(), Arc::new(tool));
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Resolve a tool by name.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn Tool>, InvocationError> {
        self.tools
            .get(name)
            .ok_or_else(|| InvocationError::UnknownTool(name.to_string()))
    }

    /// Schemas for the model, ordered by name.
    pub fn definitions(&self) -> Vec<ToolDef> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|k| k.as_str()).collect()
    }

    pub fn is_mutating(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.is_mutation())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate, run with the timeout, and truncate the output.
    pub async fn execute(&self, tool: &dyn Tool, args: &ToolArguments, cwd: &Path) -> ToolResult {
        let name = tool.name();
        if self.validate_args
            && let Some(error) = validate_tool_arguments(tool, args)
        {
            return ToolResult::failure(error);
        }

        log_tool_call(&name, args);
        let start = Instant::now();
        let mut result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, tool.execute(args, cwd)).await {
                Ok(r) => r,
                Err(_) => {
                    info!("Tool {name} timed out after {:.0}s", limit.as_secs_f64());
                    ToolResult::failure(format!(
                        "tool '{name}' timed out after {:.0} seconds",
                        limit.as_secs_f64()
                    ))
                }
            },
            None => tool.execute(args, cwd).await,
        };
        debug!(
            "Tool {name} finished in {:.0}ms (success={}, {} bytes)",
            start.elapsed().as_secs_f64() * 1000.0,
            result.success,
            result.output.len()
        );

        result.output = truncate_result(std::mem::take(&mut result.output), self.max_result_bytes);
        result
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate arguments against the tool's declared JSON Schema.
///
/// Returns `None` if valid, or an error phrased for the model to self-correct.
pub fn validate_tool_arguments(tool: &dyn Tool, args: &ToolArguments) -> Option<String> {
    let name = tool.name();
    let value = match args {
        ToolArguments::Structured(v) => v,
        ToolArguments::Raw(_) => {
            return Some(format!(
                "invalid JSON arguments for tool '{name}'. \
                 Provide valid JSON matching the tool's parameter schema."
            ));
        }
    };
    let schema = tool.definition().function.parameters;
    let Ok(validator) = jsonschema::validator_for(&schema) else {
        return None;
    };
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "argument validation failed for tool '{name}':\n{}",
            errors.join("\n")
        ))
    }
}

fn log_tool_call(name: &str, args: &ToolArguments) {
    let rendered = args.to_string();
    let preview: String = rendered.chars().take(120).collect();
    info!(
        "[tool] {name}({preview}{})",
        if rendered.chars().count() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {rendered}");
}

/// Truncate to at most `max` bytes on a char boundary, noting the original size.
pub fn truncate_result(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let total = s.len();
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s.push_str(&format!("...\n[truncated: {total} bytes total]"));
    s
}

// ── FnTool ─────────────────────────────────────────────────────────

type ErasedToolHandler =
    Box<dyn Fn(ToolArguments) -> Pin<Box<dyn Future<Output = ToolResult> + Send>> + Send + Sync>;

/// A closure-based tool that deserializes its arguments and delegates to a handler.
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct EchoArgs { text: String }
///
/// let echo = FnTool::new(
///     ToolDef::new("echo", "Echo text back", json_schema_for::<EchoArgs>()),
///     |args: EchoArgs| async move { ToolResult::ok(args.text) },
/// );
/// ```
pub struct FnTool {
    def: ToolDef,
    handler: ErasedToolHandler,
    mutation: bool,
}

impl FnTool {
    pub fn new<A, F, Fut>(def: ToolDef, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolResult> + Send + 'static,
    {
        let erased = move |args: ToolArguments| -> Pin<Box<dyn Future<Output = ToolResult> + Send>> {
            match args.parse_into::<A>() {
                Ok(a) => Box::pin(handler(a)),
                Err(e) => Box::pin(async move { ToolResult::failure(e) }),
            }
        };
        Self {
            def,
            handler: Box::new(erased),
            mutation: false,
        }
    }

    /// Mark this tool as changing files or other external state.
    pub fn mutation(mut self, is_mutation: bool) -> Self {
        self.mutation = is_mutation;
        self
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute<'a>(&'a self, args: &'a ToolArguments, _cwd: &'a Path) -> ToolFuture<'a> {
        (self.handler)(args.clone())
    }

    fn is_mutation(&self) -> bool {
        self.mutation
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.function.name)
            .field("mutation", &self.mutation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_schema_for;
    use schemars::JsonSchema;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct EchoArgs {
        text: String,
    }

    fn echo() -> FnTool {
        FnTool::new(
            ToolDef::new("echo", "Echo text", json_schema_for::<EchoArgs>()),
            |args: EchoArgs| async move { ToolResult::ok(args.text) },
        )
    }

    fn slow() -> FnTool {
        FnTool::new(
            ToolDef::new("slow", "Sleeps", serde_json::json!({"type": "object"})),
            |_: serde_json::Value| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ToolResult::ok("late")
            },
        )
    }

    #[test]
    fn arguments_parse_structured_or_raw() {
        assert_eq!(
            ToolArguments::parse(r#"{"a":1}"#).as_value(),
            Some(&serde_json::json!({"a": 1}))
        );
        assert_eq!(
            ToolArguments::parse("ls -la"),
            ToolArguments::Raw("ls -la".into())
        );
        assert!(ToolArguments::parse("  ").as_value().is_some());
    }

    #[test]
    fn failure_content_includes_error_and_output() {
        let r = ToolResult::failure("exit 2").with_output("partial");
        assert_eq!(r.to_message_content(), "Error: exit 2\n\npartial");
        assert_eq!(ToolResult::failure("x").to_message_content(), "Error: x");
        assert_eq!(ToolResult::ok("fine").to_message_content(), "fine");
    }

    #[test]
    fn registry_resolves_and_rejects_unknown() {
        let registry = ToolRegistry::new().with(echo()).with(echo().mutation(false));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_ok());
        assert_eq!(
            registry.get("nope").err(),
            Some(InvocationError::UnknownTool("nope".into()))
        );
        assert_eq!(
            InvocationError::UnknownTool("nope".into()).to_string(),
            "Unknown tool 'nope'"
        );
    }

    #[tokio::test]
    async fn execute_validates_against_schema() {
        let registry = ToolRegistry::new().with(echo());
        let tool = registry.get("echo").unwrap().clone();
        let cwd = Path::new(".");

        let ok = registry
            .execute(tool.as_ref(), &ToolArguments::parse(r#"{"text":"hi"}"#), cwd)
            .await;
        assert!(ok.success);
        assert_eq!(ok.output, "hi");

        let bad = registry
            .execute(tool.as_ref(), &ToolArguments::parse(r#"{"txt":"hi"}"#), cwd)
            .await;
        assert!(!bad.success);
        assert!(bad.error.unwrap().contains("validation failed"));
    }

    #[tokio::test]
    async fn execute_times_out() {
        let registry = ToolRegistry::new()
            .with_timeout(Some(Duration::from_millis(20)))
            .with(slow());
        let tool = registry.get("slow").unwrap().clone();
        let result = registry
            .execute(tool.as_ref(), &ToolArguments::parse("{}"), Path::new("."))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(10);
        let out = truncate_result(s, 5);
        assert!(out.starts_with("éé..."));
        assert!(out.contains("[truncated: 20 bytes total]"));
        assert_eq!(truncate_result("short".into(), 100), "short");
    }
}
