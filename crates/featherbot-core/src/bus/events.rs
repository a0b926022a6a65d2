//! Message bus event types.
//!
//! Defines the immutable events that flow between channel adapters and
//! the agent core: inbound messages from a chat channel, outbound
//! replies back to one, and the error events the bus synthesizes when a
//! subscriber fails.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

/// A media reference attached to an inbound or outbound message.
///
/// Kept intentionally thin — the core never decodes media, it only
/// threads the reference through to tools/channels that can.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: String,
    pub url_or_path: String,
}

/// An inbound message from a chat channel to the agent.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Source channel identifier (e.g. "telegram", "cli").
    pub channel: String,
    /// Sender identifier, channel-prefixed (e.g. "telegram:12345").
    pub sender_id: String,
    /// Chat/conversation identifier, native to the channel.
    pub chat_id: String,
    /// Message text content.
    pub content: String,
    pub timestamp: SystemTime,
    pub media: Vec<MediaRef>,
    pub metadata: HashMap<String, String>,
    /// Unique within the originating channel.
    pub message_id: String,
}

impl InboundMessage {
    /// Build a minimal inbound message for the local terminal channel
    /// and for tests.
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        let channel = channel.into();
        let chat_id = chat_id.into();
        Self {
            sender_id: format!("{}:user", channel),
            channel,
            chat_id,
            content: content.into(),
            timestamp: SystemTime::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
            message_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// `"<channel>:<chat_id>"` — the conversation/extraction partition key.
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.channel, &self.chat_id)
    }
}

/// An outbound message from the agent to a chat channel.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub reply_to: Option<String>,
    pub in_reply_to_message_id: Option<String>,
    pub media: Vec<MediaRef>,
    pub metadata: HashMap<String, String>,
    pub message_id: String,
}

impl OutboundMessage {
    pub fn reply(channel: impl Into<String>, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            in_reply_to_message_id: None,
            media: Vec::new(),
            metadata: HashMap::new(),
            message_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// The error the bus synthesizes when a handler throws while processing
/// a non-error event.
#[derive(Debug, Clone)]
pub struct BusErrorEvent {
    pub message: String,
    pub source_event: Box<BusEvent>,
    pub timestamp: SystemTime,
}

/// Tagged union of everything that can be published on the bus.
///
/// `bus:error` is a distinct variant so a handler erroring on a
/// `message:*` event can be routed to an error-only subscriber set
/// without that subscriber set ever seeing a `message:*` event itself.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Inbound(InboundMessage),
    Outbound(OutboundMessage),
    Error(BusErrorEvent),
}

impl BusEvent {
    /// The subscription key handlers register under.
    pub fn event_type(&self) -> EventType {
        match self {
            BusEvent::Inbound(_) => EventType::Inbound,
            BusEvent::Outbound(_) => EventType::Outbound,
            BusEvent::Error(_) => EventType::Error,
        }
    }
}

/// Subscription key. A plain enum rather than a free-form string: the
/// three variants are the entire dispatch surface the bus supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Inbound,
    Outbound,
    Error,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Inbound => "message:inbound",
            EventType::Outbound => "message:outbound",
            EventType::Error => "bus:error",
        };
        f.write_str(s)
    }
}

/// `"<channel>:<chat_id>"` — the conversation and extraction partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(channel: &str, chat_id: &str) -> Self {
        Self(format!("{}:{}", channel, chat_id))
    }

    /// The session key used for programmatic calls with no inbound event.
    pub fn direct_default() -> Self {
        Self("direct:default".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.0
    }
}
