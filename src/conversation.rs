//! Running message history plus the truncation policy that bounds it.

use crate::llm::ChatMessage;

/// Markers whose presence (case-insensitive) protects a message from
/// truncation: pending clarifications must survive in any language the
/// runtime emits them in.
const CLARIFICATION_MARKERS: [&str; 2] = ["clarification", "уточнение"];

/// Ordered, role-tagged message history forming the model's input context.
/// Grows by append only, except for [`Conversation::truncate`], which
/// rewrites the whole sequence atomically.
#[derive(Debug, Default, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// One-shot destructive rewrite applied before every outbound request
    /// once the history exceeds `cap` messages.
    ///
    /// Always keeps the very first user message (the original task) and any
    /// clarification-marked message; otherwise keeps the most recent
    /// `max(cap - preserved, cap / 2)` messages and inserts one synthetic
    /// system notice recording how many were dropped. No summarization of
    /// dropped content is attempted. Returns the number of dropped messages,
    /// or `None` when the history was already within cap.
    pub fn truncate(&mut self, cap: usize) -> Option<usize> {
        if cap == 0 {
            return None;
        }
        // A rewrite always holds the task anchor, the notice, and at least
        // one recent message; smaller caps would re-fire on every call.
        let cap = cap.max(3);
        let total = self.messages.len();
        if total <= cap {
            return None;
        }

        let first_user = self
            .messages
            .iter()
            .position(|message| matches!(message, ChatMessage::User(_)));

        let preserved_head: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(index, message)| {
                Some(*index) == first_user || is_clarification(message)
            })
            .map(|(index, _)| index)
            .collect();

        // The synthetic notice occupies one slot of the cap as well.
        let recent_count = cap
            .saturating_sub(preserved_head.len() + 1)
            .max(cap / 2);
        let recent_start = total - recent_count.min(total);

        let mut kept: Vec<ChatMessage> = preserved_head
            .iter()
            .filter(|index| **index < recent_start)
            .map(|index| self.messages[*index].clone())
            .collect();

        let remaining = kept.len() + (total - recent_start);
        let dropped = total - remaining;
        kept.push(ChatMessage::System(format!(
            "[Conversation truncated: {dropped} earlier messages dropped, {remaining} retained]"
        )));
        kept.extend(self.messages[recent_start..].iter().cloned());

        self.messages = kept;
        Some(dropped)
    }
}

fn is_clarification(message: &ChatMessage) -> bool {
    let Some(content) = message.content() else {
        return false;
    };
    let lowered = content.to_lowercase();
    CLARIFICATION_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
