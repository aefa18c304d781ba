use kindred_llm::Turn;
use kindred_storage::{MessageRecord, MessageRole};

use super::message::Role;

pub const DEFAULT_CONTEXT_TURNS: usize = 20;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 16_000;

/// Bounds how much prior conversation is re-sent to the answer backend.
///
/// The most recent `max_turns` messages are kept first, then the oldest of
/// those are dropped until the rendered turns fit in `max_chars`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    pub max_turns: usize,
    pub max_chars: usize,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_CONTEXT_TURNS,
            max_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }
}

impl ContextWindow {
    pub fn new(max_turns: usize, max_chars: usize) -> Self {
        Self {
            max_turns,
            max_chars,
        }
    }

    /// Selects the tail of `history` that fits the window, oldest first.
    pub fn select<'a>(&self, history: &'a [MessageRecord]) -> &'a [MessageRecord] {
        let mut start = history.len().saturating_sub(self.max_turns);
        let mut rendered_chars = history[start..]
            .iter()
            .map(rendered_len)
            .sum::<usize>();

        while rendered_chars > self.max_chars && start < history.len() {
            rendered_chars -= rendered_len(&history[start]);
            start += 1;
        }

        &history[start..]
    }

    pub fn turns(&self, history: &[MessageRecord]) -> Vec<Turn> {
        self.select(history)
            .iter()
            .map(|record| Turn::new(turn_role(record.role), record.content.clone()))
            .collect()
    }
}

// Each line renders as `Role: content` plus a newline separator.
fn rendered_len(record: &MessageRecord) -> usize {
    Turn::new(turn_role(record.role), record.content.as_str()).rendered_len() + 1
}

fn turn_role(role: MessageRole) -> kindred_llm::Role {
    Role::from(role).into()
}
