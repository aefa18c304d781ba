use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kindred_llm::{AnswerBackend, AnswerRequest, BoxFuture, ProviderError, ProviderResult};
use kindred_storage::{
    AccountId, AccountRecord, AccountStore, MessageRecord, NewAccount, NewMessage, SqliteStorage,
    StorageError, StorageResult, TranscriptStore,
};
use tokio::sync::watch;

use crate::session::{AuthState, IdentityError, IdentityProvider, IdentityResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Script {
    Echo,
    Reject,
    Unavailable,
    Hang,
}

/// Answer backend whose behaviour is chosen per test.
pub(crate) struct ScriptedBackend {
    script: Mutex<Script>,
    calls: AtomicUsize,
    last_request: Mutex<Option<AnswerRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    pub(crate) fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_request(&self) -> Option<AnswerRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

impl AnswerBackend for ScriptedBackend {
    fn id(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn answer<'a>(&'a self, request: AnswerRequest) -> BoxFuture<'a, ProviderResult<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = *self.script.lock().unwrap();
        let utterance = request.utterance.clone();
        *self.last_request.lock().unwrap() = Some(request);

        Box::pin(async move {
            match script {
                Script::Echo => Ok(format!("Message received: {utterance}")),
                Script::Reject => Err(ProviderError::EmptyReply {
                    stage: "scripted-answer",
                    provider_id: "scripted".to_string(),
                }),
                Script::Unavailable => Err(ProviderError::UnsupportedProvider {
                    stage: "scripted-answer",
                    provider_id: "scripted".to_string(),
                }),
                Script::Hang => std::future::pending().await,
            }
        })
    }
}

/// Transcript store that cannot be reached.
pub(crate) struct UnreachableStore;

impl UnreachableStore {
    fn error(stage: &'static str) -> StorageError {
        StorageError::SqliteQuery {
            stage,
            source: sqlx::Error::PoolTimedOut,
        }
    }
}

impl TranscriptStore for UnreachableStore {
    fn append(
        &self,
        _account_id: AccountId,
        _input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async { Err(Self::error("unreachable-append")) })
    }

    fn load_history(&self, _account_id: AccountId) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async { Err(Self::error("unreachable-load-history")) })
    }
}

/// Transcript store that reads through to SQLite but refuses every append.
pub(crate) struct ReadOnlyStore {
    inner: Arc<SqliteStorage>,
}

impl ReadOnlyStore {
    pub(crate) fn new(inner: Arc<SqliteStorage>) -> Self {
        Self { inner }
    }
}

impl TranscriptStore for ReadOnlyStore {
    fn append(
        &self,
        _account_id: AccountId,
        _input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async { Err(UnreachableStore::error("read-only-append")) })
    }

    fn load_history(&self, account_id: AccountId) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        self.inner.load_history(account_id)
    }
}

/// Pass-through store that counts calls.
pub(crate) struct CountingStore {
    inner: Arc<dyn TranscriptStore>,
    loads: AtomicUsize,
    appends: AtomicUsize,
}

impl CountingStore {
    pub(crate) fn new(inner: Arc<dyn TranscriptStore>) -> Self {
        Self {
            inner,
            loads: AtomicUsize::new(0),
            appends: AtomicUsize::new(0),
        }
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Successful appends only.
    pub(crate) fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

impl TranscriptStore for CountingStore {
    fn append(
        &self,
        account_id: AccountId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let record = self.inner.append(account_id, input).await?;
            self.appends.fetch_add(1, Ordering::SeqCst);
            Ok(record)
        })
    }

    fn load_history(&self, account_id: AccountId) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_history(account_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityMode {
    Answer,
    Fail,
    Hang,
}

/// Identity provider driven directly by the test.
pub(crate) struct FakeIdentity {
    mode: IdentityMode,
    state: watch::Sender<AuthState>,
    resolutions: AtomicUsize,
}

impl FakeIdentity {
    fn with_mode(mode: IdentityMode, initial: AuthState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            mode,
            state,
            resolutions: AtomicUsize::new(0),
        }
    }

    pub(crate) fn signed_in(account_id: AccountId) -> Self {
        Self::with_mode(IdentityMode::Answer, AuthState::SignedIn(account_id))
    }

    pub(crate) fn signed_out() -> Self {
        Self::with_mode(IdentityMode::Answer, AuthState::SignedOut)
    }

    pub(crate) fn failing() -> Self {
        Self::with_mode(IdentityMode::Fail, AuthState::SignedOut)
    }

    pub(crate) fn hanging() -> Self {
        Self::with_mode(IdentityMode::Hang, AuthState::SignedOut)
    }

    pub(crate) fn set_state(&self, state: AuthState) {
        self.state.send_replace(state);
    }

    pub(crate) fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }
}

impl IdentityProvider for FakeIdentity {
    fn current_account(&self) -> BoxFuture<'_, IdentityResult<Option<AccountId>>> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        let account_id = self.state.borrow().account_id();
        let mode = self.mode;
        Box::pin(async move {
            match mode {
                IdentityMode::Answer => Ok(account_id),
                IdentityMode::Fail => Err(IdentityError::IdentityStorage {
                    stage: "fake-identity-current-account",
                    source: UnreachableStore::error("fake-identity"),
                }),
                IdentityMode::Hang => std::future::pending().await,
            }
        })
    }

    fn watch_auth_state(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }
}

pub(crate) async fn storage_with_account() -> (Arc<SqliteStorage>, AccountRecord) {
    let storage = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
    let account = storage
        .create_account(NewAccount {
            email: "sam@example.com".to_string(),
            display_name: "Sam".to_string(),
            password_hash: "hash".to_string(),
            password_salt: "salt".to_string(),
        })
        .await
        .unwrap();
    (storage, account)
}
