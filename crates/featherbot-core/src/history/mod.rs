//! Per-session conversation history with a system-preserving trim policy.
//!
//! Grounded on the teacher's `session::Session` (JSONL-backed message
//! list) but scoped down to exactly what the agent loop needs: an
//! in-memory ordered list with a retention policy. Persistence, if a
//! caller wants it, lives above this module (the teacher's
//! `SessionManager` pattern of a `HashMap<key, Session>` cache is kept
//! at the `AgentLoop` layer instead — see `agent::AgentLoop`).

use serde::{Deserialize, Serialize};

/// The default `maxMessages` a fresh [`ConversationHistory`] is built with.
pub const DEFAULT_MAX_MESSAGES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry in a [`ConversationHistory`].
///
/// Invariant enforced by callers (the agent loop), not this type: tool
/// messages always follow the assistant tool-call they answer, in
/// insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ConversationMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), tool_call_id: None }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Ordered message history for one session.
///
/// Trim policy: after `add`, if the total count exceeds `max_messages`,
/// the oldest **non-system** entries are dropped one at a time until the
/// count is back to `max_messages`. System entries are never evicted —
/// they occupy slots but don't count against the trim target, so a
/// history with `k` system messages and `max_messages = n` can hold up
/// to `k + n` entries once full.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    messages: Vec<ConversationMessage>,
    max_messages: usize,
}

impl ConversationHistory {
    pub fn new(max_messages: usize) -> Self {
        Self { messages: Vec::new(), max_messages }
    }

    pub fn add(&mut self, message: ConversationMessage) {
        self.messages.push(message);
        self.trim();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Defensive copy — callers can't mutate this history by holding
    /// onto the returned vector.
    pub fn get_messages(&self) -> Vec<ConversationMessage> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn trim(&mut self) {
        while self.non_system_count() > self.max_messages {
            let Some(pos) = self.messages.iter().position(|m| m.role != Role::System) else {
                // Only system messages remain; nothing left to evict.
                break;
            };
            self.messages.remove(pos);
        }
    }

    fn non_system_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role != Role::System).count()
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_preserves_system_messages() {
        let mut history = ConversationHistory::new(3);
        history.add(ConversationMessage::system("S1"));
        history.add(ConversationMessage::user("U1"));
        history.add(ConversationMessage::assistant("A1"));
        history.add(ConversationMessage::user("U2"));
        history.add(ConversationMessage::assistant("A2"));

        let messages = history.get_messages();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["S1", "A1", "U2", "A2"]);
        assert_eq!(messages[0].role, Role::System);
    }

    #[test]
    fn trim_with_multiple_system_messages() {
        let mut history = ConversationHistory::new(3);
        history.add(ConversationMessage::system("S1"));
        history.add(ConversationMessage::system("S2"));
        history.add(ConversationMessage::system("S3"));
        history.add(ConversationMessage::user("U1"));
        history.add(ConversationMessage::user("U2"));
        history.add(ConversationMessage::user("U3"));
        history.add(ConversationMessage::user("U4"));

        // 3 system + 3 user = 6 (max_messages only bounds non-system count)
        let messages = history.get_messages();
        assert_eq!(messages.len(), 6);
        assert_eq!(messages.iter().filter(|m| m.role == Role::System).count(), 3);
        assert_eq!(
            messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["S1", "S2", "S3", "U2", "U3", "U4"]
        );
    }

    #[test]
    fn no_trim_under_the_limit() {
        let mut history = ConversationHistory::new(DEFAULT_MAX_MESSAGES);
        for i in 0..10 {
            history.add(ConversationMessage::user(format!("U{i}")));
        }
        assert_eq!(history.len(), 10);
    }

    #[test]
    fn clear_empties_history() {
        let mut history = ConversationHistory::new(10);
        history.add(ConversationMessage::user("hi"));
        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn get_messages_is_a_defensive_copy() {
        let mut history = ConversationHistory::new(10);
        history.add(ConversationMessage::user("hi"));
        let mut copy = history.get_messages();
        copy.push(ConversationMessage::user("mutated"));
        assert_eq!(history.len(), 1);
    }
}
