//! Safety-gated, hook-wrapped tool execution.
//!
//! For each call: resolve the tool, run pre hooks, consult the approval gate,
//! execute, run post hooks. Every path produces a [`ToolResult`] and is
//! bracketed by `ToolCallStart` / `ToolCallComplete` events.

use super::approval::{ApprovalDecision, ApprovalGate, ApprovalRequest};
use super::core::{ToolArguments, ToolRegistry, ToolResult};
use super::hooks::{HookAction, InvocationHook};
use crate::ToolCall;
use crate::agent::events::{AgentEvent, EventSender};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ToolInvocationPipeline {
    registry: Arc<ToolRegistry>,
    approval: Arc<dyn ApprovalGate>,
    hooks: Vec<Arc<dyn InvocationHook>>,
}

impl ToolInvocationPipeline {
    pub fn new(registry: Arc<ToolRegistry>, approval: Arc<dyn ApprovalGate>) -> Self {
        Self {
            registry,
            approval,
            hooks: Vec::new(),
        }
    }

    /// Add a hook. Hooks run in registration order.
    pub fn with_hook(mut self, hook: Arc<dyn InvocationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Invoke one tool call, emitting start/complete events around it.
    pub async fn invoke(&self, call: &ToolCall, cwd: &Path, events: &EventSender) -> ToolResult {
        events
            .emit(AgentEvent::ToolCallStart {
                call_id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
            })
            .await;

        let args = ToolArguments::parse(&call.function.arguments);
        let result = self.run(call.name(), &args, cwd).await;

        events
            .emit(AgentEvent::ToolCallComplete {
                call_id: call.id.clone(),
                name: call.function.name.clone(),
                result: result.clone(),
            })
            .await;
        result
    }

    async fn run(&self, name: &str, args: &ToolArguments, cwd: &Path) -> ToolResult {
        let tool = match self.registry.get(name) {
            Ok(tool) => tool.clone(),
            Err(e) => {
                warn!("{e}");
                return ToolResult::failure(format!(
                    "{e}. Available tools: {}",
                    self.registry.names().join(", ")
                ));
            }
        };

        for hook in &self.hooks {
            if let HookAction::Block(reason) = hook.pre_tool_use(name, args) {
                info!("Hook blocked {name}: {reason}");
                return ToolResult::failure(format!("blocked by hook: {reason}"))
                    .with_metadata("blocked", true);
            }
        }

        let command_line = tool.command_line(args);
        let request = ApprovalRequest {
            tool: name,
            arguments: args,
            command_line: command_line.as_deref(),
            cwd,
            mutating: tool.is_mutation(),
        };
        if let ApprovalDecision::Deny(reason) = self.approval.decide(&request).await {
            info!("Denied {name}: {reason}");
            return ToolResult::failure(format!("denied: {reason}")).with_metadata("denied", true);
        }

        let mut result = self.registry.execute(tool.as_ref(), args, cwd).await;

        for hook in &self.hooks {
            if let Some(note) = hook.post_tool_use(name, &result) {
                result.output.push_str(&format!("\n\n[hook] {note}"));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDef;
    use crate::tools::approval::{ApprovalMode, ApprovalPolicy, PolicyGate};
    use crate::tools::core::FnTool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tool(name: &str, counter: Arc<AtomicUsize>) -> FnTool {
        FnTool::new(
            ToolDef::new(name, "counts", serde_json::json!({"type": "object"})),
            move |_: serde_json::Value| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ToolResult::ok("ran")
                }
            },
        )
    }

    struct BlockShell;

    impl InvocationHook for BlockShell {
        fn pre_tool_use(&self, tool: &str, _args: &ToolArguments) -> HookAction {
            if tool == "shell" {
                HookAction::Block("no shell today".into())
            } else {
                HookAction::Proceed
            }
        }

        fn post_tool_use(&self, tool: &str, _result: &ToolResult) -> Option<String> {
            Some(format!("checked {tool}"))
        }
    }

    async fn invoke_collect(
        pipeline: &ToolInvocationPipeline,
        call: ToolCall,
    ) -> (ToolResult, Vec<AgentEvent>) {
        let (sender, mut rx) = EventSender::channel(16);
        let result = pipeline.invoke(&call, Path::new("."), &sender).await;
        drop(sender);
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        (result, events)
    }

    #[tokio::test]
    async fn unknown_tool_is_failure_with_events() {
        let pipeline = ToolInvocationPipeline::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(PolicyGate::allow_all()),
        );
        let (result, events) = invoke_collect(&pipeline, ToolCall::new("c1", "ghost", "{}")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Unknown tool 'ghost'"));
        let names: Vec<_> = events.iter().map(AgentEvent::name).collect();
        assert_eq!(names, vec!["tool_call_start", "tool_call_complete"]);
    }

    #[tokio::test]
    async fn denial_skips_execution() {
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new().with(counting_tool("deploy", runs.clone()));
        let gate = PolicyGate::new(ApprovalPolicy::default().with_tool("deploy", ApprovalMode::Deny));
        let pipeline = ToolInvocationPipeline::new(Arc::new(registry), Arc::new(gate));

        let (result, events) = invoke_collect(&pipeline, ToolCall::new("c1", "deploy", "{}")).await;
        assert!(!result.success);
        assert_eq!(result.metadata.unwrap()["denied"], true);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn hooks_block_and_annotate() {
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new()
            .with(counting_tool("shell", runs.clone()))
            .with(counting_tool("read_file", runs.clone()));
        let pipeline =
            ToolInvocationPipeline::new(Arc::new(registry), Arc::new(PolicyGate::allow_all()))
                .with_hook(Arc::new(BlockShell));

        let (blocked, _) = invoke_collect(&pipeline, ToolCall::new("c1", "shell", "{}")).await;
        assert!(!blocked.success);
        assert!(blocked.error.unwrap().contains("no shell today"));

        let (ok, _) = invoke_collect(&pipeline, ToolCall::new("c2", "read_file", "{}")).await;
        assert!(ok.success);
        assert_eq!(ok.output, "ran\n\n[hook] checked read_file");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
