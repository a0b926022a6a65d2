//! Idle-triggered memory extraction: summarizes a session's conversation
//! into durable notes once it's gone quiet for a while.
//!
//! Grounded on the teacher's `CronService` re-arming timer: each session
//! gets its own debounce timer that's cancelled and re-armed on every new
//! activity, rather than a central tick loop polling "has it been long
//! enough yet" for every session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{AgentLoop, ProcessOptions};
use crate::bus::events::SessionKey;

/// Default quiet period before a session's history is extracted.
pub const DEFAULT_IDLE_MS: u64 = 300_000;

const EXTRACTION_PROMPT: &str = "The user has gone quiet for a while. Review this \
     conversation and note any durable facts, preferences, or commitments worth \
     remembering for next time. Keep it brief.";

/// Debounces idle-triggered memory extraction per session.
pub struct MemoryExtractor {
    agent: Arc<Mutex<AgentLoop>>,
    idle: Duration,
    enabled: bool,
    timers: Arc<Mutex<HashMap<SessionKey, Arc<CancellationToken>>>>,
    in_flight: Arc<Mutex<HashSet<SessionKey>>>,
}

impl MemoryExtractor {
    pub fn new(agent: Arc<Mutex<AgentLoop>>) -> Self {
        Self {
            agent,
            idle: Duration::from_millis(DEFAULT_IDLE_MS),
            enabled: true,
            timers: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// (Re-)arm the debounce timer for `session_key`. Any pending timer for
    /// the same key is cancelled first, so activity keeps pushing the
    /// extraction out rather than stacking up duplicate fires. A no-op
    /// when extraction is disabled.
    pub async fn schedule_extraction(&self, session_key: SessionKey) {
        if !self.enabled {
            return;
        }

        let cancel = Arc::new(CancellationToken::new());
        {
            let mut timers = self.timers.lock().await;
            if let Some(previous) = timers.insert(session_key.clone(), Arc::clone(&cancel)) {
                previous.cancel();
            }
        }

        let idle = self.idle;
        let timers = Arc::clone(&self.timers);
        let in_flight = Arc::clone(&self.in_flight);
        let agent = Arc::clone(&self.agent);
        let key_for_task = session_key.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(idle) => {}
            }

            {
                let mut timers = timers.lock().await;
                // Only remove the entry if it is still *our* token — by Arc
                // identity, not cancellation state. A newer schedule may have
                // already replaced (and cancelled) ours after we woke up but
                // before we took the lock; in that case the map holds a
                // different (live) token and we must leave it alone.
                match timers.get(&key_for_task) {
                    Some(current) if Arc::ptr_eq(current, &cancel) => {
                        timers.remove(&key_for_task);
                    }
                    _ => return,
                }
            }

            {
                let mut in_flight = in_flight.lock().await;
                if in_flight.contains(&key_for_task) {
                    debug!(session = %key_for_task, "extraction already in flight, skipping");
                    return;
                }
                in_flight.insert(key_for_task.clone());
            }

            debug!(session = %key_for_task, "running idle memory extraction");
            let options = ProcessOptions {
                session_key: Some(key_for_task.clone()),
                skip_history: true,
                ..Default::default()
            };

            let mut agent = agent.lock().await;
            let result = agent.process_direct(EXTRACTION_PROMPT, options).await;
            if result.finish_reason == "error" {
                warn!(session = %key_for_task, text = %result.text, "memory extraction turn failed");
            }
            drop(agent);

            in_flight.lock().await.remove(&key_for_task);
        });
    }

    /// Cancel every pending timer. Extractions already running are left to
    /// finish on their own.
    pub async fn dispose(&self) {
        let mut timers = self.timers.lock().await;
        for (_, cancel) in timers.drain() {
            cancel.cancel();
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::provider::types::{ChatMessage, LlmResponse, ToolDefinition, Usage};
    use crate::provider::LlmProvider;
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmProvider for CountingProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            _model: Option<&str>,
            _max_tokens: u32,
            _temperature: f32,
        ) -> anyhow::Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LlmResponse {
                content: Some("noted".into()),
                tool_calls: Vec::new(),
                finish_reason: "stop".into(),
                usage: Usage::default(),
            })
        }

        fn default_model(&self) -> &str {
            "stub"
        }
    }

    fn extractor_with(calls: Arc<AtomicUsize>, idle: Duration) -> MemoryExtractor {
        let provider = CountingProvider { calls };
        let agent = AgentLoop::new(Box::new(provider), ToolRegistry::new(), AgentConfig::default());
        MemoryExtractor::new(Arc::new(Mutex::new(agent))).with_idle(idle)
    }

    #[tokio::test]
    async fn fires_once_after_idle_period() {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = extractor_with(Arc::clone(&calls), Duration::from_millis(100));
        let key = SessionKey::new("telegram", "chat-1");

        extractor.schedule_extraction(key).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rescheduling_before_idle_elapses_debounces_to_a_single_fire() {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = extractor_with(Arc::clone(&calls), Duration::from_millis(150));
        let key = SessionKey::new("telegram", "chat-2");

        extractor.schedule_extraction(key.clone()).await;
        tokio::time::sleep(Duration::from_millis(90)).await;
        extractor.schedule_extraction(key.clone()).await;

        // By 150ms after the *second* schedule, exactly one extraction should have run.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_extractor_never_schedules() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider { calls: Arc::clone(&calls) };
        let agent = AgentLoop::new(Box::new(provider), ToolRegistry::new(), AgentConfig::default());
        let extractor = MemoryExtractor::new(Arc::new(Mutex::new(agent)))
            .with_idle(Duration::from_millis(20))
            .with_enabled(false);

        extractor.schedule_extraction(SessionKey::new("telegram", "chat-3")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(extractor.pending_count().await, 0);
    }

    #[tokio::test]
    async fn dispose_cancels_pending_timers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = extractor_with(Arc::clone(&calls), Duration::from_millis(100));
        let key = SessionKey::new("telegram", "chat-4");

        extractor.schedule_extraction(key).await;
        assert_eq!(extractor.pending_count().await, 1);

        extractor.dispose().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_fire_does_not_evict_a_newer_timer_or_double_fire() {
        // Regression: a woken task must only clear/proceed on its own
        // token, identified by Arc identity rather than cancellation
        // state — otherwise a fire that loses the race to a fresh
        // `schedule_extraction` could still run and would also remove the
        // newer (live) timer from the map out from under it.
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = extractor_with(Arc::clone(&calls), Duration::from_millis(60));
        let key = SessionKey::new("telegram", "race");

        extractor.schedule_extraction(key.clone()).await;
        // Reschedule repeatedly while the first timer is in flight so a
        // newer token keeps replacing the map entry right up to (and
        // past) the first timer's original deadline.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            extractor.schedule_extraction(key.clone()).await;
        }

        // No extraction should have run yet — every prior timer was
        // cancelled before its deadline.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(extractor.pending_count().await, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;

        // Exactly one extraction fires, from the final (live) timer, and
        // it is cleanly removed from the map afterward.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.pending_count().await, 0);
    }

    #[tokio::test]
    async fn independent_sessions_each_get_their_own_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = extractor_with(Arc::clone(&calls), Duration::from_millis(80));

        extractor.schedule_extraction(SessionKey::new("telegram", "a")).await;
        extractor.schedule_extraction(SessionKey::new("telegram", "b")).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
