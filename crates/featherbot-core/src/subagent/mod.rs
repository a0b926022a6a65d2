//! Sub-agent manager: spawns isolated, tool-restricted child agent turns.
//!
//! Grounded on the teacher's `CronService` (an owned, mutex-guarded
//! collection with deterministic mutation) for the `id -> state` table,
//! and on `AgentLoop::process_direct` as the turn primitive a child agent
//! drives through its own restricted [`ToolRegistry`]. Cancellation races
//! a timeout fuse via a `biased` `tokio::select!`, the same primitive the
//! teacher's `cron` re-arming loop uses for its own wakeups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{AgentConfig, AgentLoop, ProcessOptions};
use crate::bus::events::SessionKey;
use crate::history::{ConversationMessage, Role};
use crate::provider::{LlmProvider, SharedProvider};
use crate::tools::ToolRegistry;

/// Default wall-clock budget for a spawned sub-agent turn.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// At most this many terminal states are retained; oldest `completed_at`
/// evicted first.
pub const RETENTION_CAP: usize = 50;

/// Tools no sub-agent spec may ever inherit, regardless of its allow-list:
/// spawning further sub-agents, scheduling cron jobs, and messaging
/// channels directly remain reserved to the parent agent.
pub const GLOBALLY_BLOCKED_TOOLS: &[&str] =
    &["spawn_subagent", "schedule_task", "list_schedules", "cancel_schedule"];

/// The seven tools the default `general` preset allows.
pub const GENERAL_PRESET_TOOLS: &[&str] =
    &["shell_exec", "read_file", "write_file", "edit_file", "list_dir", "web_search", "web_fetch"];

/// A named bundle identifying a sub-agent persona.
#[derive(Debug, Clone)]
pub struct SubagentSpec {
    pub name: String,
    pub system_prompt: String,
    pub tool_allow_list: Vec<String>,
    pub model: Option<String>,
    pub max_iterations: Option<u32>,
}

impl SubagentSpec {
    /// The default persona: a generalist with the seven core tools.
    pub fn general() -> Self {
        Self {
            name: "general".into(),
            system_prompt: "You are a focused sub-agent completing one bounded task on \
                 behalf of a parent agent. Work efficiently, use only the tools available \
                 to you, and clearly state your result when you're done."
                .into(),
            tool_allow_list: GENERAL_PRESET_TOOLS.iter().map(|s| s.to_string()).collect(),
            model: None,
            max_iterations: None,
        }
    }

    /// This spec's allow-list with globally blocked tool names removed.
    fn effective_allow_list(&self) -> Vec<&str> {
        self.tool_allow_list
            .iter()
            .map(String::as_str)
            .filter(|name| !GLOBALLY_BLOCKED_TOOLS.contains(name))
            .collect()
    }
}

/// Lookup table of named specs. `resolve` falls back to `general` for any
/// name it doesn't recognize — the spec names `researcher` and other
/// presets without enumerating their allow-lists, so those are left to be
/// supplied by configuration via [`SpecRegistry::register`].
#[derive(Clone)]
pub struct SpecRegistry {
    specs: HashMap<String, SubagentSpec>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        let mut specs = HashMap::new();
        let general = SubagentSpec::general();
        specs.insert(general.name.clone(), general);
        Self { specs }
    }

    pub fn register(&mut self, spec: SubagentSpec) {
        self.specs.insert(spec.name.clone(), spec);
    }

    /// Resolve a spec by name, falling back to `general` for unknown names.
    pub fn resolve(&self, name: &str) -> SubagentSpec {
        self.specs.get(name).cloned().unwrap_or_else(SubagentSpec::general)
    }
}

impl Default for SpecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Point-in-time snapshot of one sub-agent's lifecycle.
#[derive(Debug, Clone)]
pub struct SubagentState {
    pub id: String,
    pub task: String,
    pub status: SubagentStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub origin_channel: Option<String>,
    pub origin_chat_id: Option<String>,
    pub spec_name: String,
}

/// What the caller hands [`SubagentManager::spawn`] to start a child turn.
pub struct SpawnOptions {
    pub task: String,
    pub spec_name: String,
    /// Rendered `"User: …\nAssistant: …"` block — see [`format_parent_context`].
    pub parent_context: Option<String>,
    pub memory_context: Option<String>,
    pub origin_channel: Option<String>,
    pub origin_chat_id: Option<String>,
    pub timeout: Option<Duration>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            task: String::new(),
            spec_name: "general".into(),
            parent_context: None,
            memory_context: None,
            origin_channel: None,
            origin_chat_id: None,
            timeout: None,
        }
    }
}

/// Invoked once a sub-agent reaches a terminal state. Runs inside the
/// background task, after `completed_at`/`status` are already committed —
/// never blocks the caller of `spawn`.
pub type CompletionHook = Arc<dyn Fn(SubagentState) + Send + Sync>;

struct Entry {
    state: SubagentState,
    cancel: CancellationToken,
}

/// Spawns child agent turns with restricted tool sets, per-agent timeout,
/// cancellation, and bounded retention. Exclusively owns the `id -> state`
/// mapping.
pub struct SubagentManager {
    provider: Arc<dyn LlmProvider>,
    parent_tools: Arc<ToolRegistry>,
    base_config: AgentConfig,
    specs: SpecRegistry,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    on_complete: Option<CompletionHook>,
    default_timeout: Duration,
}

impl SubagentManager {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        parent_tools: Arc<ToolRegistry>,
        base_config: AgentConfig,
        specs: SpecRegistry,
    ) -> Self {
        Self {
            provider,
            parent_tools,
            base_config,
            specs,
            entries: Arc::new(Mutex::new(HashMap::new())),
            on_complete: None,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_completion_hook(mut self, hook: CompletionHook) -> Self {
        self.on_complete = Some(hook);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Start a child turn in the background and return its id immediately.
    pub async fn spawn(&self, options: SpawnOptions) -> String {
        let id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let spec = self.specs.resolve(&options.spec_name);

        let state = SubagentState {
            id: id.clone(),
            task: options.task.clone(),
            status: SubagentStatus::Running,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            origin_channel: options.origin_channel.clone(),
            origin_chat_id: options.origin_chat_id.clone(),
            spec_name: spec.name.clone(),
        };

        {
            let mut entries = self.entries.lock().await;
            entries.insert(id.clone(), Entry { state, cancel: cancel.clone() });
            prune_terminal(&mut entries);
        }

        let restricted = self.parent_tools.restricted_to(&spec.effective_allow_list());
        let system_prompt = compose_system_prompt(&spec, options.parent_context.as_deref(), options.memory_context.as_deref());

        let mut child_config = self.base_config.clone();
        child_config.model = spec.model.clone().or_else(|| child_config.model.clone());
        if let Some(max_iter) = spec.max_iterations {
            child_config.max_tool_iterations = max_iter;
        }
        child_config.system_prompt = system_prompt.clone();

        let provider = Box::new(SharedProvider(Arc::clone(&self.provider)));
        let mut agent = AgentLoop::new(provider, restricted, child_config);

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let task = options.task.clone();
        let entries = Arc::clone(&self.entries);
        let on_complete = self.on_complete.clone();
        let session_key = SessionKey::new("subagent", &id);
        let id_for_task = id.clone();

        tokio::spawn(async move {
            let process_options = ProcessOptions {
                system_prompt: Some(system_prompt),
                session_key: Some(session_key),
                cancel: Some(cancel.clone()),
                skip_history: true,
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
                result = agent.process_direct(&task, process_options) => Outcome::Finished(result.text),
            };

            let mut entries = entries.lock().await;
            let Some(entry) = entries.get_mut(&id_for_task) else { return };

            let completed_at = Utc::now();
            entry.state.completed_at = Some(completed_at);
            match outcome {
                Outcome::Finished(text) => {
                    info!(id = %id_for_task, "sub-agent completed");
                    entry.state.status = SubagentStatus::Completed;
                    entry.state.result = Some(text);
                }
                Outcome::TimedOut => {
                    warn!(id = %id_for_task, "sub-agent timed out");
                    entry.state.status = SubagentStatus::Failed;
                    entry.state.error = Some("Sub-agent timed out".into());
                }
                Outcome::Cancelled => {
                    info!(id = %id_for_task, "sub-agent cancelled");
                    entry.state.status = SubagentStatus::Cancelled;
                    entry.state.error = Some("Cancelled by user".into());
                }
            }

            if let Some(hook) = &on_complete {
                hook(entry.state.clone());
            }
        });

        id
    }

    /// Flip the cancellation handle for `id`. Returns whether a running
    /// sub-agent with that id was found.
    pub async fn cancel(&self, id: &str) -> bool {
        let entries = self.entries.lock().await;
        match entries.get(id) {
            Some(entry) if entry.state.status == SubagentStatus::Running => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub async fn get_state(&self, id: &str) -> Option<SubagentState> {
        self.entries.lock().await.get(id).map(|e| e.state.clone())
    }

    pub async fn list_active(&self) -> Vec<SubagentState> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.state.status == SubagentStatus::Running)
            .map(|e| e.state.clone())
            .collect()
    }

    pub async fn list_all(&self) -> Vec<SubagentState> {
        self.entries.lock().await.values().map(|e| e.state.clone()).collect()
    }
}

enum Outcome {
    Finished(String),
    TimedOut,
    Cancelled,
}

/// Evict terminal entries in excess of [`RETENTION_CAP`], oldest
/// `completed_at` first.
fn prune_terminal(entries: &mut HashMap<String, Entry>) {
    let mut terminal: Vec<(String, DateTime<Utc>)> = entries
        .values()
        .filter_map(|e| e.state.completed_at.map(|t| (e.state.id.clone(), t)))
        .collect();

    if terminal.len() <= RETENTION_CAP {
        return;
    }

    terminal.sort_by_key(|(_, t)| *t);
    let excess = terminal.len() - RETENTION_CAP;
    for (id, _) in terminal.into_iter().take(excess) {
        entries.remove(&id);
    }
}

fn compose_system_prompt(spec: &SubagentSpec, parent_context: Option<&str>, memory_context: Option<&str>) -> String {
    let mut prompt = spec.system_prompt.clone();
    if let Some(ctx) = parent_context {
        if !ctx.is_empty() {
            prompt.push_str("\n\n## Conversation context\n");
            prompt.push_str(ctx);
        }
    }
    if let Some(mem) = memory_context {
        if !mem.is_empty() {
            prompt.push_str("\n\n## Memory\n");
            prompt.push_str(mem);
        }
    }
    prompt
}

/// Maximum characters kept from a single message before it's truncated
/// with an ellipsis in [`format_parent_context`].
const MAX_MESSAGE_CHARS: usize = 2_000;

/// Render the last `max_pairs` user/assistant pairs from `history` as
/// `"User: …\nAssistant: …\n…"`, excluding system and tool messages and
/// truncating any single message beyond [`MAX_MESSAGE_CHARS`].
pub fn format_parent_context(history: &[ConversationMessage], max_pairs: usize) -> String {
    let relevant: Vec<&ConversationMessage> =
        history.iter().filter(|m| matches!(m.role, Role::User | Role::Assistant)).collect();

    let max_messages = max_pairs.saturating_mul(2);
    let start = relevant.len().saturating_sub(max_messages);

    relevant[start..]
        .iter()
        .map(|m| {
            let label = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                _ => unreachable!("filtered to user/assistant above"),
            };
            format!("{}: {}", label, truncate(&m.content, MAX_MESSAGE_CHARS))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}…", head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::{ChatMessage, LlmResponse, ToolCallRequest, ToolDefinition, Usage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct SlowProvider {
        delay: Duration,
    }

    #[async_trait]
    impl LlmProvider for SlowProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            _model: Option<&str>,
            _max_tokens: u32,
            _temperature: f32,
        ) -> anyhow::Result<LlmResponse> {
            tokio::time::sleep(self.delay).await;
            Ok(LlmResponse {
                content: Some("done eventually".into()),
                tool_calls: Vec::new(),
                finish_reason: "stop".into(),
                usage: Usage::default(),
            })
        }

        fn default_model(&self) -> &str {
            "stub"
        }
    }

    struct InstantProvider;

    #[async_trait]
    impl LlmProvider for InstantProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            _model: Option<&str>,
            _max_tokens: u32,
            _temperature: f32,
        ) -> anyhow::Result<LlmResponse> {
            Ok(LlmResponse {
                content: Some("sub-agent result".into()),
                tool_calls: Vec::new(),
                finish_reason: "stop".into(),
                usage: Usage::default(),
            })
        }

        fn default_model(&self) -> &str {
            "stub"
        }
    }

    fn manager_with(provider: Arc<dyn LlmProvider>, timeout: Duration) -> SubagentManager {
        SubagentManager::new(
            provider,
            Arc::new(ToolRegistry::new()),
            AgentConfig::default(),
            SpecRegistry::new(),
        )
        .with_default_timeout(timeout)
    }

    #[tokio::test]
    async fn spawn_returns_immediately_and_completes_in_background() {
        let manager = manager_with(Arc::new(InstantProvider), Duration::from_secs(5));
        let id = manager.spawn(SpawnOptions { task: "do it".into(), ..Default::default() }).await;

        // Poll until terminal — the background task runs concurrently.
        let mut state = manager.get_state(&id).await.unwrap();
        for _ in 0..50 {
            if state.status != SubagentStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = manager.get_state(&id).await.unwrap();
        }

        assert_eq!(state.status, SubagentStatus::Completed);
        assert_eq!(state.result.as_deref(), Some("sub-agent result"));
        assert!(state.completed_at.unwrap() >= state.started_at);
    }

    #[tokio::test]
    async fn timeout_marks_failed_with_distinguished_message() {
        let manager = manager_with(Arc::new(SlowProvider { delay: Duration::from_secs(10) }), Duration::from_millis(50));
        let id = manager.spawn(SpawnOptions { task: "slow task".into(), ..Default::default() }).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        let state = manager.get_state(&id).await.unwrap();

        assert_eq!(state.status, SubagentStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("Sub-agent timed out"));
    }

    #[tokio::test]
    async fn cancel_wins_race_against_slow_task() {
        let manager = manager_with(Arc::new(SlowProvider { delay: Duration::from_secs(10) }), Duration::from_secs(5));
        let id = manager.spawn(SpawnOptions { task: "cancel me".into(), ..Default::default() }).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.cancel(&id).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = manager.get_state(&id).await.unwrap();
        assert_eq!(state.status, SubagentStatus::Cancelled);
        assert_eq!(state.error.as_deref(), Some("Cancelled by user"));
    }

    #[tokio::test]
    async fn cancel_on_unknown_id_returns_false() {
        let manager = manager_with(Arc::new(InstantProvider), Duration::from_secs(5));
        assert!(!manager.cancel("nonexistent").await);
    }

    #[tokio::test]
    async fn completion_hook_runs_exactly_once_per_terminal_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let manager = SubagentManager::new(
            Arc::new(InstantProvider),
            Arc::new(ToolRegistry::new()),
            AgentConfig::default(),
            SpecRegistry::new(),
        )
        .with_completion_hook(Arc::new(move |_state| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let id = manager.spawn(SpawnOptions { task: "go".into(), ..Default::default() }).await;

        for _ in 0..50 {
            if manager.get_state(&id).await.unwrap().status != SubagentStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retention_evicts_oldest_terminal_state_past_cap() {
        let manager = manager_with(Arc::new(InstantProvider), Duration::from_secs(5));

        let mut ids = Vec::new();
        for i in 0..RETENTION_CAP + 1 {
            let id = manager.spawn(SpawnOptions { task: format!("task {i}"), ..Default::default() }).await;
            // Let each finish before spawning the next so completed_at ordering is deterministic.
            loop {
                if manager.get_state(&id).await.unwrap().status != SubagentStatus::Running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            ids.push(id);
        }

        // Spawning one more should trigger the prune on the *next* spawn call
        // since pruning happens inside `spawn`; spawn a final no-op task.
        let final_id = manager.spawn(SpawnOptions { task: "trigger prune".into(), ..Default::default() }).await;
        loop {
            if manager.get_state(&final_id).await.unwrap().status != SubagentStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let all = manager.list_all().await;
        assert!(all.len() <= RETENTION_CAP + 1, "retention cap should bound terminal states plus the active one");
        assert!(manager.get_state(&ids[0]).await.is_none(), "oldest completed state should have been evicted");
    }

    #[test]
    fn parent_context_formats_user_assistant_pairs_and_excludes_system() {
        let history = vec![
            ConversationMessage::system("sys"),
            ConversationMessage::user("hi"),
            ConversationMessage::assistant("hello"),
            ConversationMessage::tool("call_1", "tool output"),
            ConversationMessage::user("what's the weather"),
            ConversationMessage::assistant("sunny"),
        ];

        let ctx = format_parent_context(&history, 10);
        assert_eq!(ctx, "User: hi\nAssistant: hello\nUser: what's the weather\nAssistant: sunny");
    }

    #[test]
    fn parent_context_truncates_long_messages() {
        let long = "x".repeat(3_000);
        let history = vec![ConversationMessage::user(long.clone()), ConversationMessage::assistant("ok")];
        let ctx = format_parent_context(&history, 10);
        let first_line = ctx.lines().next().unwrap();
        assert!(first_line.len() < long.len());
        assert!(first_line.ends_with('…'));
    }
}
