use std::sync::Arc;

use kindred_llm::{AnswerBackend, ProviderError, create_backend};
use kindred_storage::{SqliteStorage, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;

use crate::billing::{BillingBackend, StubBilling, SubscriptionFlow};
use crate::chat::{ConversationController, ExchangeClient, ViewEvent};
use crate::session::{LocalIdentity, SessionGate};
use crate::settings::Settings;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AppError {
    #[snafu(display("failed to open storage on `{stage}`: {source}"))]
    OpenStorage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to create answer backend on `{stage}`: {source}"))]
    CreateBackend {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

/// Long-lived collaborators shared by every view. Views are built from here
/// with their dependencies passed in explicitly.
#[derive(Clone)]
pub struct AppServices {
    settings: Arc<Settings>,
    storage: Arc<SqliteStorage>,
    identity: Arc<LocalIdentity>,
    backend: Arc<dyn AnswerBackend>,
    billing: Arc<dyn BillingBackend>,
}

impl AppServices {
    pub async fn bootstrap(settings: Arc<Settings>) -> AppResult<Self> {
        let storage = SqliteStorage::open(&settings.database_url)
            .await
            .context(OpenStorageSnafu {
                stage: "bootstrap-open-storage",
            })?;
        let backend = create_backend(
            settings.provider.to_provider_config(),
            settings.provider.echo_latency(),
        )
        .context(CreateBackendSnafu {
            stage: "bootstrap-create-backend",
        })?;
        let billing = Arc::new(StubBilling::new(settings.billing_delay()));

        tracing::info!(
            database_url = %storage.database_url(),
            backend_id = %backend.id(),
            "services ready"
        );
        Ok(Self::from_parts(settings, Arc::new(storage), backend, billing))
    }

    pub fn from_parts(
        settings: Arc<Settings>,
        storage: Arc<SqliteStorage>,
        backend: Arc<dyn AnswerBackend>,
        billing: Arc<dyn BillingBackend>,
    ) -> Self {
        let identity = Arc::new(LocalIdentity::new(storage.clone()));
        Self {
            settings,
            storage,
            identity,
            backend,
            billing,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn storage(&self) -> &Arc<SqliteStorage> {
        &self.storage
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn backend_id(&self) -> &str {
        self.backend.id()
    }

    pub fn session_gate(&self) -> SessionGate {
        SessionGate::new(self.identity.clone(), self.settings.resolve_timeout())
    }

    pub fn exchange_client(&self) -> ExchangeClient {
        ExchangeClient::new(
            self.storage.clone(),
            self.backend.clone(),
            self.settings.exchange_options(),
        )
    }

    /// A fresh conversation view in `CheckingAuth`.
    pub fn conversation(&self, events: mpsc::UnboundedSender<ViewEvent>) -> ConversationController {
        ConversationController::new(
            self.session_gate(),
            self.storage.clone(),
            self.exchange_client(),
            events,
        )
        .with_greeting(self.settings.greeting.clone())
    }

    pub fn subscription_flow(&self) -> SubscriptionFlow {
        SubscriptionFlow::new(self.billing.clone(), self.storage.clone())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::chat::{DEFAULT_GREETING, MessageStatus, Route, SendOutcome, ViewState};

    fn test_settings() -> Arc<Settings> {
        let mut settings = Settings::default();
        settings.database_url = ":memory:".to_string();
        settings.billing.stub_delay_ms = 0;
        Arc::new(settings)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<ViewEvent>) -> Vec<ViewEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[tokio::test]
    async fn bootstrap_uses_the_echo_backend_by_default() {
        let services = AppServices::bootstrap(test_settings()).await.unwrap();
        assert_eq!(services.backend_id(), "echo");
    }

    #[tokio::test]
    async fn bootstrap_rejects_an_unknown_provider() {
        let mut settings = (*test_settings()).clone();
        settings.provider.provider_id = "carrier-pigeon".to_string();

        let error = AppServices::bootstrap(Arc::new(settings)).await.err().unwrap();

        assert_matches!(error, AppError::CreateBackend { .. });
    }

    #[tokio::test]
    async fn signed_out_visitor_is_redirected() {
        let services = AppServices::bootstrap(test_settings()).await.unwrap();
        let (sender, mut events) = mpsc::unbounded_channel();
        let mut conversation = services.conversation(sender);

        conversation.activate().await;

        assert_eq!(conversation.state(), ViewState::Redirected);
        assert_eq!(
            drain(&mut events),
            [ViewEvent::Redirect {
                route: Route::Login
            }]
        );
    }

    #[tokio::test]
    async fn conversation_survives_a_new_view() {
        let services = AppServices::bootstrap(test_settings()).await.unwrap();
        services
            .identity()
            .sign_up("Sam", "sam@example.com", "hunter22")
            .await
            .unwrap();

        let (sender, _events) = mpsc::unbounded_channel();
        let mut first = services.conversation(sender);
        first.activate().await;
        assert_eq!(first.messages()[0].content, DEFAULT_GREETING);
        first.set_input("I feel anxious today");
        assert_eq!(first.send().await, SendOutcome::Replied);
        assert_eq!(
            first.messages().last().unwrap().content,
            "Message received: I feel anxious today"
        );

        let (sender, _events) = mpsc::unbounded_channel();
        let mut second = services.conversation(sender);
        second.activate().await;
        let contents = second
            .messages()
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            contents,
            ["I feel anxious today", "Message received: I feel anxious today"]
        );
        assert!(
            second
                .messages()
                .iter()
                .all(|message| matches!(message.status, MessageStatus::Persisted(_)))
        );
    }

    #[tokio::test]
    async fn subscription_is_recorded_on_the_profile() {
        let services = AppServices::bootstrap(test_settings()).await.unwrap();
        let account = services
            .identity()
            .sign_up("Sam", "sam@example.com", "hunter22")
            .await
            .unwrap();
        let flow = services.subscription_flow();

        flow.select("annual").unwrap();
        assert_eq!(flow.checkout(account.id).await.unwrap(), Route::Chat);

        let profile = services.identity().current_profile().await.unwrap().unwrap();
        assert_eq!(profile.subscription_plan.as_deref(), Some("annual"));
    }
}
