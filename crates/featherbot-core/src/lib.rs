//! featherbot-core: the runtime behind a persistent, multi-channel
//! conversational agent.
//!
//! - [`config`] — typed configuration loading from JSON
//! - [`provider`] — LLM provider trait and OpenAI-compatible implementation
//! - [`bus`] — async message bus decoupling channel adapters from the agent
//! - [`tools`] — tool trait, registry, and built-in tools
//! - [`agent`] — the multi-turn agent loop and per-session conversation history
//! - [`subagent`] — restricted, timed-out child agent turns
//! - [`memory`] — idle-triggered conversation summarization
//! - [`cron`] — scheduled task management
//! - [`gateway`] — composition root wiring the bus, channels, cron, sub-agents, and memory
//!
//! # Quick Start
//!
//! ```no_run
//! use featherbot_core::config::Config;
//! use featherbot_core::provider::openai::OpenAiProvider;
//! use featherbot_core::agent::{AgentLoop, AgentConfig};
//! use featherbot_core::tools::ToolRegistry;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//!
//! let (name, entry) = config.providers.find_active().expect("no provider configured");
//! let provider = OpenAiProvider::new(
//!     name,
//!     &entry.api_key,
//!     entry.api_base.as_deref(),
//!     &config.agents.defaults.model,
//!     reqwest::Client::new(),
//! );
//!
//! let tools = ToolRegistry::new();
//! let agent_config = AgentConfig {
//!     model: Some(config.agents.defaults.model.clone()),
//!     max_tokens: config.agents.defaults.max_tokens,
//!     temperature: config.agents.defaults.temperature,
//!     max_tool_iterations: config.agents.defaults.max_tool_iterations,
//!     ..Default::default()
//! };
//!
//! let mut agent = AgentLoop::new(Box::new(provider), tools, agent_config);
//! # let _ = agent;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod bus;
pub mod config;
pub mod cron;
pub mod gateway;
pub mod history;
pub mod memory;
pub mod provider;
pub mod subagent;
pub mod tools;
