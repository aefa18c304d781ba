use std::time::Duration;

use snafu::ensure;

use super::provider::{
    AnswerBackend, AnswerRequest, BoxFuture, EmptyUtteranceSnafu, ProviderResult,
};

pub const ECHO_PROVIDER_ID: &str = "echo";
pub const ECHO_REPLY_PREFIX: &str = "Message received: ";

/// Placeholder backend that acknowledges the utterance verbatim.
///
/// The prompt is still rendered and logged so context windowing behaves the
/// same as it would against a real provider.
#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    latency: Duration,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl AnswerBackend for EchoBackend {
    fn id(&self) -> &str {
        ECHO_PROVIDER_ID
    }

    fn default_model(&self) -> &str {
        ECHO_PROVIDER_ID
    }

    fn answer<'a>(&'a self, request: AnswerRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            ensure!(
                !request.utterance.trim().is_empty(),
                EmptyUtteranceSnafu {
                    stage: "echo-answer",
                }
            );

            let prompt = request.prompt();
            tracing::debug!(
                prior_turn_count = request.prior_turns.len(),
                prompt_chars = prompt.chars().count(),
                "echo backend received prompt"
            );

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            Ok(format!("{ECHO_REPLY_PREFIX}{}", request.utterance))
        })
    }
}
