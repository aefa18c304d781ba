use std::sync::Arc;
use std::time::Duration;

use kindred_llm::{AnswerBackend, AnswerRequest, ProviderError};
use kindred_storage::{AccountId, StorageError, TranscriptStore};
use snafu::{Snafu, ensure};

use super::context::ContextWindow;

pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_UTTERANCE_CHARS: usize = 4_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOptions {
    pub window: ContextWindow,
    pub timeout: Duration,
    pub max_utterance_chars: usize,
    /// Model to request; blank defers to the backend default.
    pub model_id: String,
    pub preamble: Option<String>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            window: ContextWindow::default(),
            timeout: DEFAULT_EXCHANGE_TIMEOUT,
            max_utterance_chars: DEFAULT_MAX_UTTERANCE_CHARS,
            model_id: String::new(),
            preamble: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExchangeError {
    #[snafu(display("exchange requires an authenticated account: {source}"))]
    Unauthenticated {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("utterance rejected before sending: {reason}"))]
    InvalidUtterance {
        stage: &'static str,
        reason: &'static str,
    },
    #[snafu(display("transcript store unavailable on `{stage}`: {source}"))]
    StoreUnavailable {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("answer backend did not reply within {timeout_ms} ms"))]
    BackendTimeout { stage: &'static str, timeout_ms: u64 },
    #[snafu(display("answer backend rejected the request: {source}"))]
    BackendRejected {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("answer backend unavailable on `{stage}`: {source}"))]
    BackendUnavailable {
        stage: &'static str,
        source: ProviderError,
    },
}

impl ExchangeError {
    /// Timeouts and outages may clear up; resubmitting is the retry path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. }
                | Self::BackendTimeout { .. }
                | Self::BackendUnavailable { .. }
        )
    }

    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Unauthenticated { .. })
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Sends one utterance plus a bounded window of prior turns to the answer
/// backend and returns its single reply.
///
/// The client never writes to the transcript. Persisting the utterance and the
/// reply is the caller's job once the exchange has succeeded, so a failed
/// exchange cannot leave a one-sided record behind.
#[derive(Clone)]
pub struct ExchangeClient {
    store: Arc<dyn TranscriptStore>,
    backend: Arc<dyn AnswerBackend>,
    options: ExchangeOptions,
}

impl ExchangeClient {
    pub fn new(
        store: Arc<dyn TranscriptStore>,
        backend: Arc<dyn AnswerBackend>,
        options: ExchangeOptions,
    ) -> Self {
        Self {
            store,
            backend,
            options,
        }
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.options
    }

    pub async fn exchange(&self, account_id: AccountId, utterance: &str) -> ExchangeResult<String> {
        ensure!(
            !utterance.trim().is_empty(),
            InvalidUtteranceSnafu {
                stage: "exchange-validate-empty",
                reason: "utterance is empty",
            }
        );
        ensure!(
            utterance.chars().count() <= self.options.max_utterance_chars,
            InvalidUtteranceSnafu {
                stage: "exchange-validate-length",
                reason: "utterance exceeds the maximum length",
            }
        );

        let history = self
            .store
            .load_history(account_id)
            .await
            .map_err(|source| {
                if source.is_unauthenticated() {
                    ExchangeError::Unauthenticated {
                        stage: "exchange-load-history",
                        source,
                    }
                } else {
                    ExchangeError::StoreUnavailable {
                        stage: "exchange-load-history",
                        source,
                    }
                }
            })?;

        let prior_turns = self.options.window.turns(&history);
        let model_id = if self.options.model_id.trim().is_empty() {
            self.backend.default_model().to_string()
        } else {
            self.options.model_id.clone()
        };

        tracing::debug!(
            account_id = %account_id,
            history_len = history.len(),
            context_turns = prior_turns.len(),
            model_id = %model_id,
            "submitting exchange"
        );

        let mut request = AnswerRequest::new(model_id, prior_turns, utterance);
        if let Some(preamble) = &self.options.preamble {
            request = request.with_preamble(preamble.clone());
        }
        if let Some(max_tokens) = self.options.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = self.options.temperature {
            request = request.with_temperature(temperature);
        }

        let answer = tokio::time::timeout(self.options.timeout, self.backend.answer(request)).await;
        let reply = match answer {
            Ok(Ok(reply)) => reply,
            Ok(Err(source)) if source.is_rejection() => {
                return Err(ExchangeError::BackendRejected {
                    stage: "exchange-backend-answer",
                    source,
                });
            }
            Ok(Err(source)) => {
                return Err(ExchangeError::BackendUnavailable {
                    stage: "exchange-backend-answer",
                    source,
                });
            }
            Err(_) => {
                tracing::warn!(
                    account_id = %account_id,
                    backend_id = %self.backend.id(),
                    timeout_ms = self.options.timeout.as_millis() as u64,
                    "answer backend timed out"
                );
                return BackendTimeoutSnafu {
                    stage: "exchange-backend-timeout",
                    timeout_ms: self.options.timeout.as_millis() as u64,
                }
                .fail();
            }
        };

        tracing::info!(
            account_id = %account_id,
            backend_id = %self.backend.id(),
            reply_chars = reply.chars().count(),
            "exchange completed"
        );
        Ok(reply)
    }
}
