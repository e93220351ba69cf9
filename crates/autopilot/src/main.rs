//! Run the coding assistant on a task, once or unattended.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # One run: the model works until it answers without tool calls
//! autopilot --prompt "Fix the failing test in src/parser.rs" --tools tools.json
//!
//! # Pipe the task from stdin
//! cat TASK.md | autopilot --stdin --workdir ../project
//!
//! # Unattended: repeat until the model signals completion
//! autopilot --prompt "Implement the TODOs in src/" --autonomous --max-loops 20
//!
//! # Continue the most recent session, asking before mutating tools run
//! autopilot --resume latest --prompt "Now add tests" --approval ask
//! ```

use autopilot::agent::events::{AgentEvent, EVENT_CHANNEL_CAPACITY, EventSender};
use autopilot::agent::{SessionSnapshot, SessionStore, SharedContextStore, TurnLoop, TurnState};
use autopilot::autonomous::AutonomousLoop;
use autopilot::config::AgentConfig;
use autopilot::context::{CompactionEngine, ContextManager, Summarizer};
use autopilot::llm::ProviderTable;
use autopilot::tools::{
    ApprovalMode, ExternalHookRunner, PolicyGate, StdinPrompter, ToolInvocationPipeline,
    ToolRegistry, load_command_tools,
};
use clap::Parser;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Run the coding assistant on a task.
///
/// Reads the API key from the OPENROUTER_KEY environment variable.
#[derive(Parser)]
#[command(name = "autopilot")]
struct Cli {
    // ── Task ───────────────────────────────────────────────────
    /// Task for the assistant
    #[arg(long)]
    prompt: Option<String>,

    /// Read the task from stdin
    #[arg(long)]
    stdin: bool,

    // ── Configuration ──────────────────────────────────────────
    /// JSON config file (see `AgentConfig`)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model to use (overrides the config file)
    #[arg(long)]
    model: Option<String>,

    /// Provider name from the provider table
    #[arg(long)]
    provider: Option<String>,

    /// JSON file of shell-template tools
    #[arg(long)]
    tools: Option<PathBuf>,

    /// JSON file of pre/post tool hooks
    #[arg(long)]
    hooks: Option<PathBuf>,

    /// Directory tools run in
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Maximum model turns per run
    #[arg(long)]
    max_turns: Option<u32>,

    /// Approval for mutating tools: allow, deny, or ask
    #[arg(long, value_parser = parse_approval)]
    approval: Option<ApprovalMode>,

    // ── Autonomous mode ────────────────────────────────────────
    /// Repeat the task until the model signals completion
    #[arg(long)]
    autonomous: bool,

    /// Maximum iterations in autonomous mode
    #[arg(long)]
    max_loops: Option<u32>,

    // ── Sessions ───────────────────────────────────────────────
    /// Directory for session snapshots
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Resume a session by id, or `latest`
    #[arg(long)]
    resume: Option<String>,

    /// List stored sessions and exit
    #[arg(long)]
    list_sessions: bool,

    // ── Output ─────────────────────────────────────────────────
    /// Print events as JSON lines instead of text
    #[arg(long)]
    json: bool,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

// ── Helpers ────────────────────────────────────────────────────────

fn parse_approval(s: &str) -> Result<ApprovalMode, String> {
    match s {
        "allow" => Ok(ApprovalMode::Allow),
        "deny" => Ok(ApprovalMode::Deny),
        "ask" => Ok(ApprovalMode::Ask),
        other => Err(format!("expected allow, deny, or ask, got '{other}'")),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "autopilot=debug" } else { "autopilot=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).compact())
        .init();
}

fn read_stdin_content() -> Result<String, String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("Failed to read stdin: {e}"))?;
    Ok(buf)
}

fn build_task(cli: &Cli) -> Result<String, String> {
    let stdin_text = if cli.stdin {
        Some(read_stdin_content()?)
    } else {
        None
    };
    match (&cli.prompt, stdin_text) {
        (Some(msg), Some(piped)) => Ok(format!("{msg}\n\n{piped}")),
        (Some(msg), None) => Ok(msg.clone()),
        (None, Some(piped)) => Ok(piped),
        (None, None) => Err("Provide --prompt, --stdin, or both".to_string()),
    }
}

/// Merge the config file with command-line overrides.
fn load_config(cli: &Cli) -> Result<AgentConfig, String> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    if let Some(provider) = &cli.provider {
        config.provider = provider.clone();
    }
    if let Some(max_turns) = cli.max_turns {
        config.max_turns = max_turns;
    }
    if let Some(mode) = cli.approval {
        config.approval.mutating = Some(mode);
    }
    if let Some(max_loops) = cli.max_loops {
        config.autonomous.max_loops = max_loops;
    }
    if let Some(dir) = &cli.session_dir {
        config.session_dir = dir.clone();
    }
    if cli.tools.is_some() {
        config.tools_file = cli.tools.clone();
    }
    if cli.hooks.is_some() {
        config.hooks_file = cli.hooks.clone();
    }
    Ok(config)
}

fn build_pipeline(config: &AgentConfig, workdir: &Path) -> Result<ToolInvocationPipeline, String> {
    let mut registry = ToolRegistry::new();
    if let Some(path) = &config.tools_file {
        let tools = load_command_tools(path)?;
        info!("Loaded {} tool(s) from {}", tools.len(), path.display());
        for tool in tools {
            registry.register(tool);
        }
    }

    let mut gate = PolicyGate::new(config.approval.clone());
    if config.approval.mutating == Some(ApprovalMode::Ask)
        || config.approval.default == ApprovalMode::Ask
        || config.approval.tools.values().any(|m| *m == ApprovalMode::Ask)
    {
        gate = gate.with_prompter(Arc::new(StdinPrompter));
    }

    let mut pipeline = ToolInvocationPipeline::new(Arc::new(registry), Arc::new(gate));
    if let Some(path) = &config.hooks_file {
        pipeline = pipeline.with_hook(Arc::new(ExternalHookRunner::load(path, workdir)?));
    }
    Ok(pipeline)
}

async fn resolve_session(store: &SessionStore, resume: Option<&str>) -> Result<SessionSnapshot, String> {
    match resume {
        None => Ok(SessionSnapshot::new()),
        Some("latest") => store
            .latest()
            .await
            .ok_or_else(|| format!("No sessions in {}", store.dir().display())),
        Some(id) => store
            .load(id)
            .await
            .ok_or_else(|| format!("Session '{id}' not found")),
    }
}

/// Print an event to stdout/stderr.
fn render_event(event: &AgentEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
        return;
    }
    match event {
        AgentEvent::TextDelta { text } => {
            print!("{text}");
            let _ = io::stdout().flush();
        }
        AgentEvent::TextComplete { .. } => println!(),
        AgentEvent::ToolCallStart {
            name, arguments, ..
        } => eprintln!("  [tool] {name}({arguments})"),
        AgentEvent::ToolCallComplete { name, result, .. } if !result.success => {
            eprintln!(
                "  [tool] {name} failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        AgentEvent::AgentError { message } => eprintln!("  [error] {message}"),
        AgentEvent::Compacted {
            messages_before,
            messages_after,
        } => eprintln!("  [compacted] {messages_before} -> {messages_after} messages"),
        AgentEvent::AgentEnd { state, turns, usage } => eprintln!(
            "  [done] {state:?} after {turns} turn(s), {} tokens",
            usage.total()
        ),
        _ => {}
    }
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
}

// ── Run ────────────────────────────────────────────────────────────

async fn run(cli: Cli) -> Result<bool, String> {
    let config = load_config(&cli)?;
    let store = Arc::new(SessionStore::new(&config.session_dir)?);

    if cli.list_sessions {
        for session in store.list().await {
            println!(
                "{}  {}  {} turn(s)  {}",
                session.session_id,
                session.updated_at.format("%Y-%m-%d %H:%M"),
                session.turn_count,
                session.preview
            );
        }
        return Ok(true);
    }

    let task = build_task(&cli)?;
    let settings = config.provider_settings(
        std::env::var("OPENROUTER_KEY")
            .map_err(|_| "OPENROUTER_KEY environment variable is not set".to_string())?,
    );
    let llm = ProviderTable::with_builtin().build(&config.provider, &settings)?;
    let pipeline = build_pipeline(&config, &cli.workdir)?;

    let mut snapshot = resolve_session(&store, cli.resume.as_deref()).await?;
    let context = if snapshot.messages.is_empty() {
        ContextManager::new(config.context.clone()).with_system_prompt(&config.system_prompt)
    } else {
        info!(
            "Resuming session {} ({} messages)",
            snapshot.session_id,
            snapshot.messages.len()
        );
        ContextManager::restore(
            config.context.clone(),
            snapshot.messages.clone(),
            snapshot.total_usage,
        )
    };

    let turn_loop = TurnLoop::new(llm, pipeline, context, config.turn_config(&cli.workdir))
        .with_compaction(
            CompactionEngine::new(config.compaction.clone()),
            Summarizer::new(config.summarizer.clone()),
        );
    cancel_on_ctrl_c(turn_loop.cancellation_token());

    if cli.autonomous {
        let (events, mut rx) = EventSender::channel(EVENT_CHANNEL_CAPACITY);
        let json = cli.json;
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                render_event(&event, json);
            }
        });

        let mut autonomous = AutonomousLoop::new(turn_loop, task, config.autonomous.clone())
            .with_session(store.clone(), snapshot)
            .with_events(events);
        if let Some(path) = &config.shared_context_file {
            autonomous = autonomous.with_shared_context(SharedContextStore::load(path));
        }
        let summary = autonomous.run(config.autonomous.max_loops).await;
        drop(autonomous);
        let _ = printer.await;

        eprintln!(
            "  [autonomous] {} after {} loop(s), {} file(s) modified, {} tokens",
            summary.exit_reason,
            summary.loops_run,
            summary.files_modified.len(),
            summary.usage.total()
        );
        return Ok(summary.exit_reason == autopilot::autonomous::ExitReason::ExitSignal);
    }

    let mut stream = turn_loop.spawn(task);
    while let Some(event) = stream.next_event().await {
        render_event(&event, cli.json);
    }
    let (turn_loop, outcome) = stream.finish().await?;

    snapshot.update_from(turn_loop.context(), outcome.turns);
    let path = store.save(&snapshot).await?;
    info!("Session saved to {}", path.display());

    Ok(outcome.state == TurnState::FinalResponse)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(2);
        }
    }
}
