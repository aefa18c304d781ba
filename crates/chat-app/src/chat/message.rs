use std::time::{SystemTime, UNIX_EPOCH};

use kindred_storage::{MessageId, MessageRecord, MessageRole};

/// Greeting shown when an account has no transcript yet.
pub const DEFAULT_GREETING: &str =
    "Hello! I'm your mental wellness coach. How are you feeling today?";

/// Apology shown in place of a reply when an exchange fails.
pub const APOLOGY_TEXT: &str = "I'm sorry, I encountered an error. Please try again.";

/// View-local identifier for one message in the in-memory list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalMessageId(pub u64);

impl LocalMessageId {
    /// Creates a typed local message identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier for one submitted exchange.
///
/// A new ticket is minted for every submission so a late completion for an
/// older exchange can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeTicket(pub u64);

impl ExchangeTicket {
    /// Creates a typed exchange ticket.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl From<MessageRole> for Role {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

impl From<Role> for kindred_llm::Role {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// Where an in-memory message stands relative to the durable transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Written to the transcript store under this id.
    Persisted(MessageId),
    /// Optimistic entry for an exchange that has not completed yet.
    Pending(ExchangeTicket),
    /// Shown to the user but never written to the transcript.
    LocalOnly,
    /// Synthetic welcome for an empty transcript.
    Greeting,
    /// Synthetic notice standing in for a failed reply.
    Apology,
}

/// One entry of the conversation view's message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: LocalMessageId,
    pub role: Role,
    pub content: String,
    pub timestamp_unix_millis: u64,
    pub status: MessageStatus,
}

impl ChatMessage {
    /// Creates a message with explicit status.
    pub fn new(
        id: LocalMessageId,
        role: Role,
        content: impl Into<String>,
        timestamp_unix_millis: u64,
        status: MessageStatus,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            timestamp_unix_millis,
            status,
        }
    }

    /// Hydrates a message loaded from the transcript store.
    pub fn from_record(id: LocalMessageId, record: MessageRecord) -> Self {
        Self::new(
            id,
            record.role.into(),
            record.content,
            record.created_at_unix_millis,
            MessageStatus::Persisted(record.id),
        )
    }

    /// True for entries that came from, or were accepted by, the answer backend
    /// or the user, as opposed to synthetic view notices.
    pub fn is_genuine(&self) -> bool {
        !matches!(self.status, MessageStatus::Greeting | MessageStatus::Apology)
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self.status, MessageStatus::Persisted(_))
    }
}

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
