//! Per-process conversation state.

use std::path::Path;

use mcode_types::{Message, TokenUsage};

use crate::permissions::PermissionGate;

/// Everything a turn reads and mutates.
///
/// Owned by the caller and lent to [`crate::ConversationLoop::run_turn`].
pub struct Session {
    pub conversation: Vec<Message>,
    pub gate: PermissionGate,
    /// Usage of the most recent model call, reported or estimated.
    pub last_usage: Option<TokenUsage>,
    /// Tokens spent across the whole session; survives `/new`.
    pub total_tokens: u64,
}

impl Session {
    #[must_use]
    pub fn new(gate: PermissionGate) -> Self {
        Self {
            conversation: Vec::new(),
            gate,
            last_usage: None,
            total_tokens: 0,
        }
    }

    #[must_use]
    pub fn working_dir(&self) -> &Path {
        self.gate.working_dir()
    }

    /// Prompt size of the last model call, 0 before the first.
    #[must_use]
    pub fn context_tokens(&self) -> u32 {
        self.last_usage.map_or(0, |usage| usage.prompt_tokens)
    }

    /// Record usage the server reported.
    pub fn record_usage(&mut self, usage: TokenUsage) {
        self.last_usage = Some(usage);
        self.total_tokens = self.total_tokens.saturating_add(u64::from(usage.total()));
    }

    /// Record estimated usage. Only the completion counts toward the session
    /// total; the prompt estimate re-counts the whole history.
    pub fn record_estimated_usage(&mut self, usage: TokenUsage) {
        self.last_usage = Some(usage);
        self.total_tokens = self
            .total_tokens
            .saturating_add(u64::from(usage.completion_tokens));
    }

    /// Start a fresh conversation. The session total is kept.
    pub fn clear(&mut self) {
        self.conversation.clear();
        self.last_usage = None;
    }
}

#[cfg(test)]
mod tests {
    use crate::permissions::NoopFolderStore;

    use super::*;

    fn session() -> Session {
        Session::new(PermissionGate::new(
            "/work",
            Vec::<String>::new(),
            Box::new(NoopFolderStore),
        ))
    }

    #[test]
    fn usage_accumulates_and_clear_keeps_total() {
        let mut session = session();
        assert_eq!(session.context_tokens(), 0);

        session.record_usage(TokenUsage::new(100, 20));
        session.record_estimated_usage(TokenUsage::new(150, 5));
        assert_eq!(session.context_tokens(), 150);
        assert_eq!(session.total_tokens, 125);

        session.conversation.push(Message::user("hi"));
        session.clear();
        assert!(session.conversation.is_empty());
        assert!(session.last_usage.is_none());
        assert_eq!(session.total_tokens, 125);
    }

    #[test]
    fn working_dir_comes_from_gate() {
        assert_eq!(session().working_dir(), Path::new("/work"));
    }
}
