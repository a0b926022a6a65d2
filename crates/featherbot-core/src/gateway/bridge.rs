//! Bridges the message bus to the agent loop.
//!
//! Grounded on the teacher's `AgentBridge`: subscribe to inbound traffic,
//! dispatch each message to the agent, publish the reply. Generalized
//! from the teacher's dedicated `mpsc` inbound channel to a direct
//! [`MessageBus`] subscription now that the bus itself carries inbound
//! events, and from `AgentLoop::process`'s `Result`-returning turn to the
//! new `TurnResult`-returning one that never throws — there is no
//! `format_agent_error` here because there is no error variant to format.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::debug;

use crate::agent::AgentLoop;
use crate::bus::events::{BusEvent, EventType, OutboundMessage};
use crate::bus::{MessageBus, SubscriptionId};
use crate::cron::CronService;
use crate::memory::MemoryExtractor;

/// Subscribe the agent loop to the bus's inbound events.
///
/// Each message is dispatched inline within the handler (the bus already
/// serializes handlers per event, and `AgentLoop` is itself behind a
/// `Mutex`, so there is nothing to gain from a second layer of spawned
/// tasks here beyond what `tokio::spawn`'d publishers already give the
/// bus). Recognized slash commands are answered directly; everything
/// else is handed to `AgentLoop::process_message`.
pub async fn register(
    bus: Arc<MessageBus>,
    agent: Arc<Mutex<AgentLoop>>,
    cron: Arc<Mutex<CronService>>,
    memory: Option<Arc<MemoryExtractor>>,
    start_time: Instant,
) -> SubscriptionId {
    let bus_out = Arc::clone(&bus);

    bus.subscribe(EventType::Inbound, move |event| {
        let bus = Arc::clone(&bus_out);
        let agent = Arc::clone(&agent);
        let cron = Arc::clone(&cron);
        let memory = memory.clone();

        async move {
            let BusEvent::Inbound(inbound) = event else {
                return Ok(());
            };

            debug!(channel = %inbound.channel, chat_id = %inbound.chat_id, "gateway dispatching inbound message");

            let channel = inbound.channel.clone();
            let chat_id = inbound.chat_id.clone();
            let session_key = inbound.session_key();

            if inbound.content.trim() == "/clear" {
                agent.lock().await.clear_session(&session_key);
                bus.publish(BusEvent::Outbound(OutboundMessage::reply(
                    channel,
                    chat_id,
                    "Conversation history cleared.",
                )))
                .await;
                return Ok(());
            }

            if let Some(response) = handle_command(&inbound.content, &cron, start_time).await {
                bus.publish(BusEvent::Outbound(OutboundMessage::reply(channel, chat_id, response)))
                    .await;
                return Ok(());
            }

            let result = agent.lock().await.process_message(&inbound).await;

            if let Some(memory) = &memory {
                memory.schedule_extraction(session_key).await;
            }

            if !result.text.is_empty() {
                bus.publish(BusEvent::Outbound(OutboundMessage::reply(channel, chat_id, result.text)))
                    .await;
            }

            Ok(())
        }
    })
    .await
}

/// Recognize a slash command and produce its direct response. Returns
/// `None` for anything that should instead pass through to the agent.
async fn handle_command(content: &str, cron: &Arc<Mutex<CronService>>, start_time: Instant) -> Option<String> {
    let trimmed = content.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let (cmd, _rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
    match cmd {
        "/help" | "/start" => Some(cmd_help()),
        "/status" => Some(cmd_status(cron, start_time).await),
        _ => None,
    }
}

fn cmd_help() -> String {
    "Commands:\n\
     /help — show this message\n\
     /status — uptime and scheduled job count\n\
     /clear — clear this conversation's history\n\n\
     Anything else is passed to the assistant."
        .to_string()
}

async fn cmd_status(cron: &Arc<Mutex<CronService>>, start_time: Instant) -> String {
    let uptime = start_time.elapsed().as_secs();
    let jobs = cron.lock().await.list_jobs().await;
    let enabled = jobs.iter().filter(|j| j.enabled).count();
    format!(
        "Uptime: {}s\nScheduled jobs: {} total, {} enabled",
        uptime,
        jobs.len(),
        enabled
    )
}
