use std::sync::Arc;
use std::time::Duration;

use kindred_storage::{AccountId, BoxFuture, StorageError};
use snafu::Snafu;
use tokio::sync::watch;

pub mod local;

pub use local::LocalIdentity;

pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Authentication state as published by an identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    SignedOut,
    SignedIn(AccountId),
}

impl AuthState {
    pub fn account_id(&self) -> Option<AccountId> {
        match self {
            Self::SignedIn(account_id) => Some(*account_id),
            Self::SignedOut => None,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self, Self::SignedIn(_))
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IdentityError {
    #[snafu(display("'{email}' is not a valid email address"))]
    InvalidEmail { stage: &'static str, email: String },
    #[snafu(display("password must be at least {min_chars} characters"))]
    WeakPassword {
        stage: &'static str,
        min_chars: usize,
    },
    #[snafu(display("an account already exists for '{email}'"))]
    EmailTaken {
        stage: &'static str,
        email: String,
        source: StorageError,
    },
    #[snafu(display("email or password is incorrect"))]
    InvalidCredentials { stage: &'static str },
    #[snafu(display("identity storage failed on `{stage}`: {source}"))]
    IdentityStorage {
        stage: &'static str,
        source: StorageError,
    },
}

pub type IdentityResult<T> = Result<T, IdentityError>;

/// External identity collaborator: resolves the signed-in account and
/// publishes changes to it.
pub trait IdentityProvider: Send + Sync {
    fn current_account(&self) -> BoxFuture<'_, IdentityResult<Option<AccountId>>>;
    fn watch_auth_state(&self) -> watch::Receiver<AuthState>;
}

/// Resolves whether the caller currently has an authenticated account.
///
/// Resolution never blocks past `resolve_timeout`: an unreachable or failing
/// provider reads as signed out.
#[derive(Clone)]
pub struct SessionGate {
    provider: Arc<dyn IdentityProvider>,
    resolve_timeout: Duration,
}

impl SessionGate {
    pub fn new(provider: Arc<dyn IdentityProvider>, resolve_timeout: Duration) -> Self {
        Self {
            provider,
            resolve_timeout,
        }
    }

    pub async fn current_account(&self) -> Option<AccountId> {
        match tokio::time::timeout(self.resolve_timeout, self.provider.current_account()).await {
            Ok(Ok(account_id)) => account_id,
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "identity provider failed; treating session as signed out");
                None
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.resolve_timeout.as_millis() as u64,
                    "identity provider timed out; treating session as signed out"
                );
                None
            }
        }
    }

    pub fn on_auth_state_change(&self) -> AuthSubscription {
        AuthSubscription::new(self.provider.watch_auth_state())
    }
}

/// Stream of auth state changes for one subscriber.
#[derive(Debug)]
pub struct AuthSubscription {
    receiver: watch::Receiver<AuthState>,
}

impl AuthSubscription {
    pub fn new(mut receiver: watch::Receiver<AuthState>) -> Self {
        // Only changes after subscription are reported.
        receiver.mark_unchanged();
        Self { receiver }
    }

    pub fn current(&self) -> AuthState {
        *self.receiver.borrow()
    }

    /// Returns the new state if it changed since the last call, without waiting.
    /// A provider that went away reads as signed out.
    pub fn take_change(&mut self) -> Option<AuthState> {
        match self.receiver.has_changed() {
            Ok(true) => Some(*self.receiver.borrow_and_update()),
            Ok(false) => None,
            Err(_) => Some(AuthState::SignedOut),
        }
    }

    /// Waits for the next change.
    pub async fn changed(&mut self) -> AuthState {
        match self.receiver.changed().await {
            Ok(()) => *self.receiver.borrow_and_update(),
            Err(_) => AuthState::SignedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::FakeIdentity;

    #[tokio::test]
    async fn gate_reports_the_signed_in_account() {
        let account_id = AccountId::new_v7();
        let identity = Arc::new(FakeIdentity::signed_in(account_id));
        let gate = SessionGate::new(identity, DEFAULT_RESOLVE_TIMEOUT);

        assert_eq!(gate.current_account().await, Some(account_id));
    }

    #[tokio::test]
    async fn unreachable_provider_reads_as_signed_out() {
        let identity = Arc::new(FakeIdentity::hanging());
        let gate = SessionGate::new(identity, Duration::from_millis(20));

        assert_eq!(gate.current_account().await, None);
    }

    #[tokio::test]
    async fn failing_provider_reads_as_signed_out() {
        let identity = Arc::new(FakeIdentity::failing());
        let gate = SessionGate::new(identity, DEFAULT_RESOLVE_TIMEOUT);

        assert_eq!(gate.current_account().await, None);
    }

    #[tokio::test]
    async fn subscription_reports_only_later_changes() {
        let account_id = AccountId::new_v7();
        let identity = Arc::new(FakeIdentity::signed_in(account_id));
        let gate = SessionGate::new(identity.clone(), DEFAULT_RESOLVE_TIMEOUT);

        let mut subscription = gate.on_auth_state_change();
        assert_eq!(subscription.current(), AuthState::SignedIn(account_id));
        assert_eq!(subscription.take_change(), None);

        identity.set_state(AuthState::SignedOut);
        assert_eq!(subscription.take_change(), Some(AuthState::SignedOut));
        assert_eq!(subscription.take_change(), None);

        identity.set_state(AuthState::SignedIn(account_id));
        assert_eq!(subscription.changed().await, AuthState::SignedIn(account_id));
    }
}
