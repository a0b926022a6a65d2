//! Telegram channel adapter: teloxide updates in, `message:outbound` out.
//!
//! Grounded on the teacher's `TelegramTransport`: a dispatcher for
//! inbound updates plus a bus subscription for outbound replies, kept
//! alongside each other in one `run()` call. The progress-message-editing
//! pattern is dropped since [`crate::bus::events::OutboundMessage`] is a
//! single reply shape rather than a Reply/Progress/Typing enum.

use anyhow::Result;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{error, info, warn};

use crate::bus::events::{BusEvent, EventType, InboundMessage};
use crate::bus::MessageBus;
use crate::gateway::utils::chunk_message;

const TELEGRAM_MAX_LEN: usize = 4096;
const CHANNEL: &str = "telegram";

pub struct TelegramTransport {
    token: String,
    bus: Arc<MessageBus>,
    allow_from: Vec<String>,
}

impl TelegramTransport {
    pub fn new(token: String, bus: Arc<MessageBus>, allow_from: Vec<String>) -> Self {
        Self { token, bus, allow_from }
    }

    pub async fn run(self) -> Result<()> {
        let bot = Bot::new(&self.token);
        info!("Telegram transport started");

        let bot_out = bot.clone();
        self.bus
            .subscribe(EventType::Outbound, move |event| {
                let bot_out = bot_out.clone();
                async move {
                    let BusEvent::Outbound(msg) = event else { return Ok(()) };
                    if msg.channel != CHANNEL {
                        return Ok(());
                    }

                    let Ok(id) = msg.chat_id.parse::<i64>() else {
                        return Ok(());
                    };

                    for chunk in chunk_message(&msg.content, TELEGRAM_MAX_LEN) {
                        if let Err(e) = bot_out.send_message(ChatId(id), chunk).await {
                            error!(error = %e, "failed to send Telegram message");
                        }
                    }
                    Ok(())
                }
            })
            .await;

        let bus = Arc::clone(&self.bus);
        let allow_from = self.allow_from.clone();
        let handler = Update::filter_message().endpoint(
            move |_bot: Bot, msg: Message, bus: Arc<MessageBus>, allow_from: Vec<String>| async move {
                let user_id = msg.from.as_ref().map(|u| u.id.to_string()).unwrap_or_else(|| "unknown".to_owned());

                if !allow_from.is_empty() && !allow_from.contains(&user_id) {
                    warn!(user_id, chat_id = %msg.chat.id, "rejected Telegram message from user outside allow_from");
                    return respond(());
                }

                if let Some(text) = msg.text() {
                    let mut inbound = InboundMessage::new(CHANNEL, msg.chat.id.to_string(), text);
                    inbound.sender_id = format!("telegram:{}", user_id);
                    bus.publish(BusEvent::Inbound(inbound)).await;
                }
                respond(())
            },
        );

        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![bus, allow_from])
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;

        Ok(())
    }
}
