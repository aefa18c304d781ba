use std::sync::Arc;

use kindred_storage::{AccountId, AccountRecord, AccountStore, BoxFuture, NewAccount, StorageError};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, ensure};
use tokio::sync::watch;
use uuid::Uuid;

use super::{
    AuthState, IdentityError, IdentityProvider, IdentityResult, IdentityStorageSnafu,
    InvalidCredentialsSnafu, InvalidEmailSnafu, WeakPasswordSnafu,
};

pub const MIN_PASSWORD_CHARS: usize = 6;

/// In-process identity provider backed by the account store.
pub struct LocalIdentity {
    accounts: Arc<dyn AccountStore>,
    state: watch::Sender<AuthState>,
}

impl LocalIdentity {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        let (state, _) = watch::channel(AuthState::SignedOut);
        Self { accounts, state }
    }

    pub fn auth_state(&self) -> AuthState {
        *self.state.borrow()
    }

    /// Registers a new account with no subscription and signs it in.
    pub async fn sign_up(
        &self,
        display_name: &str,
        email: &str,
        password: &str,
    ) -> IdentityResult<AccountRecord> {
        let email = normalize_email(email);
        ensure!(
            is_plausible_email(&email),
            InvalidEmailSnafu {
                stage: "sign-up-validate-email",
                email,
            }
        );
        ensure!(
            password.chars().count() >= MIN_PASSWORD_CHARS,
            WeakPasswordSnafu {
                stage: "sign-up-validate-password",
                min_chars: MIN_PASSWORD_CHARS,
            }
        );

        let password_salt = Uuid::new_v4().simple().to_string();
        let password_hash = hash_password(&password_salt, password);
        let display_name = match display_name.trim() {
            "" => email.split('@').next().unwrap_or_default().to_string(),
            name => name.to_string(),
        };

        let account = self
            .accounts
            .create_account(NewAccount {
                email: email.clone(),
                display_name,
                password_hash,
                password_salt,
            })
            .await
            .map_err(|source| match source {
                StorageError::Conflict { .. } => IdentityError::EmailTaken {
                    stage: "sign-up-create-account",
                    email: email.clone(),
                    source,
                },
                source => IdentityError::IdentityStorage {
                    stage: "sign-up-create-account",
                    source,
                },
            })?;

        tracing::info!(account_id = %account.id, "account signed up");
        self.state.send_replace(AuthState::SignedIn(account.id));
        Ok(account)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> IdentityResult<AccountId> {
        let email = normalize_email(email);
        let credentials = self
            .accounts
            .find_credentials_by_email(&email)
            .await
            .context(IdentityStorageSnafu {
                stage: "sign-in-find-credentials",
            })?;

        let Some(credentials) = credentials else {
            return InvalidCredentialsSnafu {
                stage: "sign-in-unknown-email",
            }
            .fail();
        };
        ensure!(
            hash_password(&credentials.password_salt, password) == credentials.password_hash,
            InvalidCredentialsSnafu {
                stage: "sign-in-verify-password",
            }
        );

        tracing::info!(account_id = %credentials.account_id, "account signed in");
        self.state
            .send_replace(AuthState::SignedIn(credentials.account_id));
        Ok(credentials.account_id)
    }

    pub fn sign_out(&self) {
        if let AuthState::SignedIn(account_id) = self.state.send_replace(AuthState::SignedOut) {
            tracing::info!(account_id = %account_id, "account signed out");
        }
    }

    /// Profile of the signed-in account, if any.
    pub async fn current_profile(&self) -> IdentityResult<Option<AccountRecord>> {
        let Some(account_id) = self.auth_state().account_id() else {
            return Ok(None);
        };
        self.accounts
            .get_account(account_id)
            .await
            .context(IdentityStorageSnafu {
                stage: "current-profile-get-account",
            })
    }
}

impl IdentityProvider for LocalIdentity {
    fn current_account(&self) -> BoxFuture<'_, IdentityResult<Option<AccountId>>> {
        let account_id = self.auth_state().account_id();
        Box::pin(async move { Ok(account_id) })
    }

    fn watch_auth_state(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.contains('.')
        && !email.chars().any(char::is_whitespace)
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use kindred_storage::SqliteStorage;

    use super::*;
    use crate::session::{DEFAULT_RESOLVE_TIMEOUT, SessionGate};

    async fn identity() -> (Arc<SqliteStorage>, LocalIdentity) {
        let storage = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
        let identity = LocalIdentity::new(storage.clone());
        (storage, identity)
    }

    #[tokio::test]
    async fn sign_up_creates_a_profile_and_signs_in() {
        let (storage, identity) = identity().await;

        let account = identity
            .sign_up("Sam", "  Sam@Example.com ", "hunter22")
            .await
            .unwrap();

        assert_eq!(account.email, "sam@example.com");
        assert_eq!(account.display_name, "Sam");
        assert_eq!(account.subscription_plan, None);
        assert_eq!(identity.auth_state(), AuthState::SignedIn(account.id));

        let credentials = storage
            .find_credentials_by_email("sam@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(credentials.password_hash, "hunter22");
        assert_eq!(credentials.password_hash.len(), 64);
    }

    #[tokio::test]
    async fn sign_up_validates_input() {
        let (_, identity) = identity().await;

        let email = identity.sign_up("Sam", "not-an-email", "hunter22").await;
        assert_matches!(email, Err(IdentityError::InvalidEmail { .. }));

        let password = identity.sign_up("Sam", "sam@example.com", "12345").await;
        assert_matches!(password, Err(IdentityError::WeakPassword { min_chars: 6, .. }));

        assert_eq!(identity.auth_state(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let (_, identity) = identity().await;
        identity.sign_up("Sam", "sam@example.com", "hunter22").await.unwrap();

        let duplicate = identity.sign_up("Other", "SAM@example.com", "hunter22").await;
        assert_matches!(duplicate, Err(IdentityError::EmailTaken { .. }));
    }

    #[tokio::test]
    async fn sign_in_checks_the_password() {
        let (_, identity) = identity().await;
        let account = identity.sign_up("Sam", "sam@example.com", "hunter22").await.unwrap();
        identity.sign_out();
        assert_eq!(identity.auth_state(), AuthState::SignedOut);

        let wrong = identity.sign_in("sam@example.com", "hunter23").await;
        assert_matches!(wrong, Err(IdentityError::InvalidCredentials { .. }));
        let unknown = identity.sign_in("nobody@example.com", "hunter22").await;
        assert_matches!(unknown, Err(IdentityError::InvalidCredentials { .. }));

        let signed_in = identity.sign_in("Sam@Example.com", "hunter22").await.unwrap();
        assert_eq!(signed_in, account.id);
        assert_eq!(
            identity.current_profile().await.unwrap().map(|profile| profile.id),
            Some(account.id)
        );
    }

    #[tokio::test]
    async fn gate_follows_sign_in_and_sign_out() {
        let (_, identity) = identity().await;
        let identity = Arc::new(identity);
        let gate = SessionGate::new(identity.clone(), DEFAULT_RESOLVE_TIMEOUT);
        let mut subscription = gate.on_auth_state_change();
        assert_eq!(gate.current_account().await, None);

        let account = identity.sign_up("Sam", "sam@example.com", "hunter22").await.unwrap();
        assert_eq!(gate.current_account().await, Some(account.id));
        assert_eq!(subscription.take_change(), Some(AuthState::SignedIn(account.id)));

        identity.sign_out();
        assert_eq!(gate.current_account().await, None);
        assert_eq!(subscription.take_change(), Some(AuthState::SignedOut));
        assert_eq!(identity.current_profile().await.unwrap(), None);
    }
}
