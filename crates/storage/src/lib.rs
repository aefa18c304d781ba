use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{AccountId, MessageId};
pub use sqlite::SqliteStorage;
pub use types::{
    AccountCredentials, AccountRecord, MessageRecord, MessageRole, NewAccount, NewMessage,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable, append-only log of chat messages keyed by account.
pub trait TranscriptStore: Send + Sync {
    /// Appends one message. Unknown accounts fail with `Unauthenticated`.
    fn append(
        &self,
        account_id: AccountId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;

    /// Returns the whole transcript ordered by creation instant, ties broken by
    /// insertion order. An account without messages yields an empty vector.
    fn load_history(&self, account_id: AccountId) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
}

/// Account profile documents plus the credential material the identity layer checks.
pub trait AccountStore: Send + Sync {
    fn create_account(&self, input: NewAccount) -> BoxFuture<'_, StorageResult<AccountRecord>>;
    fn find_credentials_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<AccountCredentials>>>;
    fn get_account(&self, account_id: AccountId) -> BoxFuture<'_, StorageResult<Option<AccountRecord>>>;
    fn set_subscription_plan(
        &self,
        account_id: AccountId,
        plan_id: Option<String>,
    ) -> BoxFuture<'_, StorageResult<AccountRecord>>;
}

pub trait Storage: TranscriptStore + AccountStore {}

impl<T> Storage for T where T: TranscriptStore + AccountStore {}
