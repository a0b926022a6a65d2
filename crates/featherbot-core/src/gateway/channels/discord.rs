//! Discord channel adapter: serenity events in, `message:outbound` out.
//!
//! Mirrors [`crate::gateway::channels::telegram`]'s shape: one `run()`
//! call that wires a bus subscription for outbound replies alongside a
//! gateway client for inbound messages, sharing the same `chunk_message`
//! helper for the platform's length limit.

use anyhow::Result;
use serenity::async_trait;
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::model::id::ChannelId;
use serenity::prelude::*;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bus::events::{BusEvent, EventType, InboundMessage};
use crate::bus::MessageBus;
use crate::gateway::utils::chunk_message;

const DISCORD_MAX_LEN: usize = 2000;
const CHANNEL: &str = "discord";

struct Handler {
    bus: Arc<MessageBus>,
    allow_from: Vec<String>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let user_id = msg.author.id.to_string();
        if !self.allow_from.is_empty() && !self.allow_from.contains(&user_id) {
            warn!(user_id, channel_id = %msg.channel_id, "rejected Discord message from user outside allow_from");
            return;
        }

        let mut inbound = InboundMessage::new(CHANNEL, msg.channel_id.to_string(), msg.content.clone());
        inbound.sender_id = format!("discord:{}", user_id);
        self.bus.publish(BusEvent::Inbound(inbound)).await;
    }

    async fn ready(&self, _: Context, ready: Ready) {
        info!(user = %ready.user.name, "Discord transport ready");
    }
}

pub struct DiscordTransport {
    token: String,
    bus: Arc<MessageBus>,
    allow_from: Vec<String>,
}

impl DiscordTransport {
    pub fn new(token: String, bus: Arc<MessageBus>, allow_from: Vec<String>) -> Self {
        Self { token, bus, allow_from }
    }

    pub async fn run(self) -> Result<()> {
        let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT | GatewayIntents::DIRECT_MESSAGES;
        let mut client = Client::builder(&self.token, intents)
            .event_handler(Handler { bus: Arc::clone(&self.bus), allow_from: self.allow_from })
            .await?;

        let http = Arc::clone(&client.http);
        self.bus
            .subscribe(EventType::Outbound, move |event| {
                let http = Arc::clone(&http);
                async move {
                    let BusEvent::Outbound(msg) = event else { return Ok(()) };
                    if msg.channel != CHANNEL {
                        return Ok(());
                    }

                    let Ok(channel_id) = msg.chat_id.parse::<u64>() else {
                        return Ok(());
                    };

                    for chunk in chunk_message(&msg.content, DISCORD_MAX_LEN) {
                        if let Err(e) = ChannelId::new(channel_id).say(&http, chunk).await {
                            error!(error = %e, "failed to send Discord message");
                        }
                    }
                    Ok(())
                }
            })
            .await;

        info!("Discord transport starting");
        client.start().await?;
        Ok(())
    }
}
