//! featherbot CLI — interactive chat, onboarding, status, cron, and bot
//! (gateway) commands.
//!
//! Usage:
//!   featherbot chat              — start an interactive terminal chat
//!   featherbot onboard           — write a default config template
//!   featherbot status            — show configuration and provider health
//!   featherbot cron list|add|rm  — manage scheduled jobs directly
//!   featherbot bot                — run the gateway (channels + cron + memory)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use featherbot_core::agent::{AgentConfig, AgentLoop, ProcessOptions};
use featherbot_core::bus::events::SessionKey;
use featherbot_core::bus::MessageBus;
use featherbot_core::config::Config;
use featherbot_core::cron::{CronPayload, CronSchedule, CronService};
use featherbot_core::gateway::{make_subagent_completion_hook, Gateway};
use featherbot_core::memory::MemoryExtractor;
use featherbot_core::provider::openai::OpenAiProvider;
use featherbot_core::provider::{FallbackProvider, LlmProvider};
use featherbot_core::subagent::SubagentManager;
use featherbot_core::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use featherbot_core::tools::schedule::{CancelScheduleTool, ListSchedulesTool, ScheduleTaskTool};
use featherbot_core::tools::shell::ExecTool;
use featherbot_core::tools::subagent::{GetSubagentResultTool, SpawnSubagentTool};
use featherbot_core::tools::web::{WebFetchTool, WebSearchTool};
use featherbot_core::tools::ToolRegistry;
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(
    name = "featherbot",
    version,
    about = "A persistent, multi-channel conversational agent runtime"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive terminal chat session
    Chat {
        /// Model to use (overrides config)
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Write a default configuration template
    Onboard,
    /// Show configuration and provider status
    Status,
    /// Manage scheduled jobs
    Cron {
        #[command(subcommand)]
        action: CronCommands,
    },
    /// Run the gateway: channel adapters, cron, and memory extraction
    Bot,
}

#[derive(Subcommand)]
enum CronCommands {
    /// List all scheduled jobs
    List,
    /// Add an interval or cron-expression job
    Add {
        #[arg(short, long)]
        name: String,
        /// Cron expression (e.g. "0 9 * * *") or interval with an 's' suffix (e.g. "3600s")
        #[arg(short, long)]
        schedule: String,
        #[arg(short, long)]
        message: String,
    },
    /// Remove a job by id
    Remove { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Chat { model }) => cmd_chat(model.as_deref()).await?,
        Some(Commands::Onboard) => cmd_onboard()?,
        Some(Commands::Status) => cmd_status().await?,
        Some(Commands::Cron { action }) => cmd_cron(action).await?,
        Some(Commands::Bot) => cmd_bot().await?,
        None => cmd_chat(None).await?,
    }

    Ok(())
}

// ── Shared setup ─────────────────────────────────────────────────────

/// Build the provider the agent loop and sub-agent manager share,
/// folding every configured credential into a [`FallbackProvider`].
fn build_provider(config: &Config, model_override: Option<&str>) -> Result<Arc<dyn LlmProvider>> {
    let active = config.providers.find_all_active();
    if active.is_empty() {
        anyhow::bail!(
            "No LLM provider configured with an API key. Run `featherbot onboard` first, \
             then edit ~/.featherbot/config.json"
        );
    }

    let model = model_override.unwrap_or(&config.agents.defaults.model);
    let client = reqwest::Client::new();
    let mut providers: Vec<(String, Box<dyn LlmProvider>)> = Vec::new();
    for (name, entry) in active {
        let provider = OpenAiProvider::new(name, &entry.api_key, entry.api_base.as_deref(), model, client.clone());
        providers.push((name.to_string(), Box::new(provider)));
    }

    Ok(Arc::new(FallbackProvider::new(providers)))
}

/// Register the built-in tools shared by every entry point: filesystem,
/// shell, web, and — when a cron service is available — the scheduling
/// tools. The sub-agent tools are registered by the caller once the
/// manager exists, since the manager itself needs a parent registry.
fn register_core_tools(tools: &mut ToolRegistry, config: &Config, workspace: &PathBuf) -> Result<()> {
    let restrict = config.tools.restrict_to_workspace;

    tools
        .register(Box::new(ReadFileTool::new(workspace.clone(), restrict)))
        .context("registering read_file")?;
    tools
        .register(Box::new(WriteFileTool::new(workspace.clone(), restrict)))
        .context("registering write_file")?;
    tools
        .register(Box::new(EditFileTool::new(workspace.clone(), restrict)))
        .context("registering edit_file")?;
    tools
        .register(Box::new(ListDirTool::new(workspace.clone(), restrict)))
        .context("registering list_dir")?;
    tools
        .register(Box::new(
            ExecTool::new(workspace.clone()).with_timeout(config.tools.exec.timeout_seconds),
        ))
        .context("registering shell_exec")?;
    tools
        .register(Box::new(WebFetchTool::new()))
        .context("registering web_fetch")?;
    tools
        .register(Box::new(WebSearchTool::new(
            &config.tools.web_search.api_key,
            config.tools.web_search.max_results,
        )))
        .context("registering web_search")?;

    Ok(())
}

fn agent_config_from(config: &Config, model_override: Option<&str>) -> AgentConfig {
    AgentConfig {
        model: model_override.map(str::to_string).or_else(|| Some(config.agents.defaults.model.clone())),
        max_tokens: config.agents.defaults.max_tokens,
        temperature: config.agents.defaults.temperature,
        max_tool_iterations: config.agents.defaults.max_tool_iterations,
        max_history_messages: config.agents.defaults.max_history_messages,
        ..AgentConfig::default()
    }
}

// ── chat ─────────────────────────────────────────────────────────────

async fn cmd_chat(model_override: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let workspace = config.workspace_path();
    std::fs::create_dir_all(&workspace).ok();

    let provider = build_provider(&config, model_override)?;
    let mut tools = ToolRegistry::new().with_eviction(Default::default());
    register_core_tools(&mut tools, &config, &workspace)?;

    let cron = Arc::new(Mutex::new(CronService::new(config.cron_store_path())));
    tools.register(Box::new(ScheduleTaskTool::new(Arc::clone(&cron), Some("cli".into()), Some("direct".into()))))?;
    tools.register(Box::new(ListSchedulesTool::new(Arc::clone(&cron))))?;
    tools.register(Box::new(CancelScheduleTool::new(Arc::clone(&cron))))?;

    let tools = Arc::new(tools);
    let agent_config = agent_config_from(&config, model_override);

    let subagents = Arc::new(SubagentManager::new(
        Arc::clone(&provider),
        Arc::clone(&tools),
        agent_config.clone(),
        Default::default(),
    ));
    let mut top_tools = (*tools).clone();
    top_tools.register(Box::new(SpawnSubagentTool::new(Arc::clone(&subagents))))?;
    top_tools.register(Box::new(GetSubagentResultTool::new(Arc::clone(&subagents))))?;

    let agent = Arc::new(Mutex::new(AgentLoop::new(
        Box::new(featherbot_core::provider::SharedProvider(provider)),
        top_tools,
        agent_config,
    )));

    println!();
    println!("  featherbot");
    println!("  Model: {}", config.agents.defaults.model);
    println!("  Workspace: {}", workspace.display());
    println!();
    println!("  Type your message, or /quit to exit, /clear to reset history.");
    println!("  ─────────────────────────────────────");
    println!();

    let session_key = SessionKey::direct_default();
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" | "/q" => {
                println!("Goodbye!");
                break;
            }
            "/clear" => {
                agent.lock().await.clear_session(&session_key);
                println!("History cleared.");
                continue;
            }
            _ => {}
        }

        let options = ProcessOptions { session_key: Some(session_key.clone()), ..Default::default() };
        let result = agent.lock().await.process_direct(input, options).await;
        println!("{}\n", result.text);
    }

    Ok(())
}

// ── onboard ──────────────────────────────────────────────────────────

fn cmd_onboard() -> Result<()> {
    let path = Config::write_default_template()?;
    println!();
    println!("Configuration written to {}", path.display());
    println!("Next: add a provider API key, then run `featherbot chat`.");
    println!();
    Ok(())
}

// ── status ───────────────────────────────────────────────────────────

async fn cmd_status() -> Result<()> {
    let config_path = Config::default_path();
    println!();
    println!("featherbot status");
    println!("─────────────────────────────────────");

    if !config_path.exists() {
        println!("Config:     not found (run `featherbot onboard`)");
        return Ok(());
    }
    println!("Config:     {}", config_path.display());

    let config = Config::load()?;
    match config.providers.find_active() {
        Some((name, _)) => println!("Provider:   {} configured", name),
        None => println!("Provider:   none configured"),
    }
    println!("Model:      {}", config.agents.defaults.model);

    let workspace = config.workspace_path();
    println!(
        "Workspace:  {} ({})",
        workspace.display(),
        if workspace.exists() { "exists" } else { "will be created" }
    );

    let cron = CronService::new(config.cron_store_path());
    let jobs = cron.list_jobs().await;
    println!("Cron jobs:  {} total, {} enabled", jobs.len(), jobs.iter().filter(|j| j.enabled).count());
    println!();
    Ok(())
}

// ── cron ─────────────────────────────────────────────────────────────

async fn cmd_cron(action: CronCommands) -> Result<()> {
    let config = Config::load()?;
    let cron = CronService::new(config.cron_store_path());

    match action {
        CronCommands::List => {
            let jobs = cron.list_jobs().await;
            if jobs.is_empty() {
                println!("No scheduled jobs.");
                return Ok(());
            }
            println!();
            for job in jobs {
                let status = if job.enabled { "enabled" } else { "disabled" };
                println!("{} [{}] ({})", job.name, job.id, status);
                println!("  message: {}", job.payload.message);
                if let Some(next) = job.state.next_run_at {
                    println!("  next run: {}", next);
                }
                println!();
            }
        }
        CronCommands::Add { name, schedule, message } => {
            let parsed = if let Some(secs) = schedule.strip_suffix('s') {
                let seconds: u64 = secs.parse().context("interval must be a number of seconds, e.g. '3600s'")?;
                CronSchedule::Every { every_seconds: seconds }
            } else {
                CronSchedule::Cron { cron_expr: schedule, timezone: None }
            };
            let payload = CronPayload::agent_turn(message, None, None);
            let job = cron.add_job(name, parsed, payload, false).await?;
            println!("Added job '{}' ({})", job.name, job.id);
        }
        CronCommands::Remove { id } => {
            if cron.remove_job(&id).await? {
                println!("Removed job {}", id);
            } else {
                println!("No job found with id {}", id);
            }
        }
    }

    Ok(())
}

// ── bot (gateway) ────────────────────────────────────────────────────

async fn cmd_bot() -> Result<()> {
    let config = Config::load()?;
    let workspace = config.workspace_path();
    std::fs::create_dir_all(&workspace).ok();

    let provider = build_provider(&config, None)?;
    let mut tools = ToolRegistry::new().with_eviction(Default::default());
    register_core_tools(&mut tools, &config, &workspace)?;

    let cron = Arc::new(Mutex::new(CronService::new(config.cron_store_path())));
    tools.register(Box::new(ScheduleTaskTool::new(Arc::clone(&cron), None, None)))?;
    tools.register(Box::new(ListSchedulesTool::new(Arc::clone(&cron))))?;
    tools.register(Box::new(CancelScheduleTool::new(Arc::clone(&cron))))?;

    let tools = Arc::new(tools);
    let agent_config = agent_config_from(&config, None);

    let bus = Arc::new(MessageBus::new());

    let agent = Arc::new(Mutex::new(AgentLoop::new(
        Box::new(featherbot_core::provider::SharedProvider(Arc::clone(&provider))),
        (*tools).clone(),
        agent_config.clone(),
    )));

    let completion_hook = make_subagent_completion_hook(Arc::clone(&agent), Arc::clone(&bus));
    let subagents = Arc::new(
        SubagentManager::new(Arc::clone(&provider), Arc::clone(&tools), agent_config.clone(), Default::default())
            .with_completion_hook(completion_hook),
    );

    {
        let mut agent = agent.lock().await;
        agent.tools_mut().register(Box::new(SpawnSubagentTool::new(Arc::clone(&subagents))))?;
        agent.tools_mut().register(Box::new(GetSubagentResultTool::new(Arc::clone(&subagents))))?;
    }

    let memory = if config.memory.enabled {
        Some(Arc::new(
            MemoryExtractor::new(Arc::clone(&agent)).with_idle(std::time::Duration::from_millis(config.memory.idle_ms)),
        ))
    } else {
        None
    };

    let mut gateway = Gateway::new(Arc::clone(&bus), agent, Arc::clone(&cron), memory);
    gateway.start(&config.channels).await?;

    println!("featherbot gateway running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    gateway.stop().await;

    Ok(())
}
