//! Tools and the invocation pipeline.
//!
//! - [`core`]: the [`Tool`](core::Tool) trait, [`ToolResult`](core::ToolResult),
//!   [`ToolRegistry`](core::ToolRegistry), and [`FnTool`](core::FnTool).
//! - [`command`]: shell-template tools loaded from a JSON tools file.
//! - [`hooks`]: pre/post invocation hooks, including external shell hooks.
//! - [`approval`]: the approval and safety gate.
//! - [`pipeline`]: resolution, hooks, approval, and execution for one call.

pub mod approval;
pub mod command;
pub mod core;
pub mod hooks;
pub mod pipeline;

pub use approval::{ApprovalGate, ApprovalMode, ApprovalPolicy, PolicyGate, StdinPrompter};
pub use command::{CommandTool, load_command_tools};
pub use core::{FnTool, InvocationError, Tool, ToolArguments, ToolRegistry, ToolResult};
pub use hooks::{ExternalHookRunner, HookAction, HookConfig, InvocationHook};
pub use pipeline::ToolInvocationPipeline;
