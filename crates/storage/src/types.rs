use super::ids::{AccountId, MessageId};

/// Storage-local message role, decoupled from the chat-layer role enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub account_id: AccountId,
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    pub created_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    /// Creation instant as observed by the caller. The store never records an
    /// instant earlier than the latest message already in the transcript.
    pub created_at_unix_millis: u64,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, created_at_unix_millis: u64) -> Self {
        Self {
            role,
            content: content.into(),
            created_at_unix_millis,
        }
    }
}

/// Profile document for one account. Credentials are kept out of this record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: AccountId,
    pub email: String,
    pub display_name: String,
    pub subscription_plan: Option<String>,
    pub created_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
    pub password_salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCredentials {
    pub account_id: AccountId,
    pub password_hash: String,
    pub password_salt: String,
}
