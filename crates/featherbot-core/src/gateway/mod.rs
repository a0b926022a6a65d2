//! Composition root: wires the message bus, agent loop, cron service,
//! memory extractor, and channel adapters into one running process.
//!
//! Grounded on the teacher's `Gateway`/`run` entrypoint that starts the
//! bus bridge, transports, and background services in one place and
//! tears them down in reverse. Sub-agent spawning is intentionally not a
//! lifecycle step here — it is tool-call-driven, triggered from inside
//! an agent turn rather than started or stopped alongside the rest.

pub mod bridge;
pub mod channels;
pub mod utils;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentLoop, ProcessOptions};
use crate::bus::events::{BusEvent, EventType, OutboundMessage};
use crate::bus::{MessageBus, SubscriptionId};
use crate::config::ChannelsConfig;
use crate::bus::events::SessionKey;
use crate::cron::{CronJob, CronService, JobFireCallback};
use crate::memory::MemoryExtractor;
use crate::subagent::{CompletionHook, SubagentState};

/// A running FeatherBot process: the bus bridge, cron timer, memory
/// extractor, and whichever channel adapters are configured.
pub struct Gateway {
    bus: Arc<MessageBus>,
    agent: Arc<Mutex<AgentLoop>>,
    cron: Arc<Mutex<CronService>>,
    memory: Option<Arc<MemoryExtractor>>,
    cancel: CancellationToken,
    bridge_sub: Option<SubscriptionId>,
    channel_tasks: Vec<JoinHandle<()>>,
    start_time: Instant,
}

impl Gateway {
    pub fn new(
        bus: Arc<MessageBus>,
        agent: Arc<Mutex<AgentLoop>>,
        cron: Arc<Mutex<CronService>>,
        memory: Option<Arc<MemoryExtractor>>,
    ) -> Self {
        Self {
            bus,
            agent,
            cron,
            memory,
            cancel: CancellationToken::new(),
            bridge_sub: None,
            channel_tasks: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Start the bus bridge, arm the cron timer, and spawn whichever
    /// channel adapters are enabled in `channels`.
    pub async fn start(&mut self, channels: &ChannelsConfig) -> anyhow::Result<()> {
        let sub = bridge::register(
            Arc::clone(&self.bus),
            Arc::clone(&self.agent),
            Arc::clone(&self.cron),
            self.memory.clone(),
            self.start_time,
        )
        .await;
        self.bridge_sub = Some(sub);

        let on_fire = make_job_fire_callback(Arc::clone(&self.agent), Arc::clone(&self.bus));
        self.cron.lock().await.start(on_fire).await?;

        #[cfg(feature = "telegram")]
        if let Some(tg) = &channels.telegram {
            if tg.enabled && !tg.token.is_empty() {
                let transport = channels::telegram::TelegramTransport::new(
                    tg.token.clone(),
                    Arc::clone(&self.bus),
                    tg.allow_from.clone(),
                );
                self.channel_tasks.push(tokio::spawn(async move {
                    if let Err(e) = transport.run().await {
                        warn!(error = %e, "Telegram transport exited");
                    }
                }));
                info!("Telegram channel enabled");
            }
        }

        #[cfg(feature = "discord")]
        if let Some(dc) = &channels.discord {
            if dc.enabled && !dc.token.is_empty() {
                let transport = channels::discord::DiscordTransport::new(
                    dc.token.clone(),
                    Arc::clone(&self.bus),
                    dc.allow_from.clone(),
                );
                self.channel_tasks.push(tokio::spawn(async move {
                    if let Err(e) = transport.run().await {
                        warn!(error = %e, "Discord transport exited");
                    }
                }));
                info!("Discord channel enabled");
            }
        }

        info!("gateway started");
        Ok(())
    }

    /// Tear everything down in reverse order of `start`.
    pub async fn stop(&mut self) {
        for task in self.channel_tasks.drain(..) {
            task.abort();
        }

        self.cron.lock().await.stop();

        if let Some(id) = self.bridge_sub.take() {
            self.bus.unsubscribe(EventType::Inbound, id).await;
        }

        if let Some(memory) = &self.memory {
            memory.dispose().await;
        }

        self.bus.close().await;
        self.cancel.cancel();
        info!("gateway stopped");
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    pub fn agent(&self) -> Arc<Mutex<AgentLoop>> {
        Arc::clone(&self.agent)
    }

    pub fn cron(&self) -> Arc<Mutex<CronService>> {
        Arc::clone(&self.cron)
    }
}

/// Build the callback the cron service invokes for each due job:
/// synthesize an agent turn from the job's payload and, if it names an
/// origin channel and chat, publish the reply back onto the bus.
pub fn make_job_fire_callback(agent: Arc<Mutex<AgentLoop>>, bus: Arc<MessageBus>) -> JobFireCallback {
    Arc::new(move |job: CronJob| {
        let agent = Arc::clone(&agent);
        let bus = Arc::clone(&bus);
        Box::pin(async move {
            let session_key = match (&job.payload.channel, &job.payload.chat_id) {
                (Some(channel), Some(chat_id)) => SessionKey::new(channel, chat_id),
                _ => SessionKey::direct_default(),
            };

            let options = ProcessOptions { session_key: Some(session_key), ..Default::default() };
            let result = agent.lock().await.process_direct(&job.payload.message, options).await;

            if let (Some(channel), Some(chat_id)) = (&job.payload.channel, &job.payload.chat_id) {
                if !result.text.is_empty() {
                    bus.publish(BusEvent::Outbound(OutboundMessage::reply(
                        channel.clone(),
                        chat_id.clone(),
                        result.text.clone(),
                    )))
                    .await;
                }
            }

            if result.finish_reason == "error" {
                anyhow::bail!("cron job '{}' produced an agent error: {}", job.name, result.text);
            }
            Ok(())
        })
    })
}

/// Build the hook invoked when a sub-agent reaches a terminal state:
/// synthesize a follow-up turn from its result so the parent
/// conversation learns what the delegated task found, routed back to
/// wherever the sub-agent was spawned from.
pub fn make_subagent_completion_hook(agent: Arc<Mutex<AgentLoop>>, bus: Arc<MessageBus>) -> CompletionHook {
    Arc::new(move |state: SubagentState| {
        let agent = Arc::clone(&agent);
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let Some(channel) = state.origin_channel.clone() else { return };
            let Some(chat_id) = state.origin_chat_id.clone() else { return };

            let summary = match (&state.result, &state.error) {
                (Some(result), _) => format!("Sub-agent task \"{}\" completed:\n{}", state.task, result),
                (None, Some(err)) => format!("Sub-agent task \"{}\" failed: {}", state.task, err),
                (None, None) => return,
            };

            let session_key = SessionKey::new(&channel, &chat_id);
            let options = ProcessOptions { session_key: Some(session_key), ..Default::default() };
            let prompt = format!(
                "A background sub-agent task finished. Relay its outcome to the user:\n\n{}",
                summary
            );
            let result = agent.lock().await.process_direct(&prompt, options).await;

            if !result.text.is_empty() {
                bus.publish(BusEvent::Outbound(OutboundMessage::reply(channel, chat_id, result.text))).await;
            }
        });
    })
}
