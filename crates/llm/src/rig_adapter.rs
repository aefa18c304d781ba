use rig::completion::{AssistantContent, CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use snafu::{ResultExt, ensure};

use super::provider::{
    AnswerBackend, AnswerRequest, BoxFuture, CompletionsFailedSnafu, DEFAULT_OPENAI_MODEL,
    EmptyReplySnafu, EmptyUtteranceSnafu, HttpClientSnafu, MissingApiKeySnafu, ProviderConfig,
    ProviderResult, Role, Turn,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

pub struct RigAnswerBackend {
    config: ProviderConfig,
}

impl RigAnswerBackend {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-backend-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(turn: &Turn) -> RigMessage {
        match turn.role {
            Role::User => RigMessage::user(turn.content.clone()),
            Role::Assistant => RigMessage::assistant(turn.content.clone()),
        }
    }

    fn reply_text(choice: impl IntoIterator<Item = AssistantContent>) -> String {
        // Tool calls and reasoning parts carry no user-facing text.
        choice
            .into_iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    async fn complete(config: &ProviderConfig, request: AnswerRequest) -> ProviderResult<String> {
        ensure!(
            !request.utterance.trim().is_empty(),
            EmptyUtteranceSnafu {
                stage: "rig-complete-validate",
            }
        );

        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        // The backend is stateless: prior turns travel as chat history on every call.
        let history = request
            .prior_turns
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let mut builder = model
            .completion_request(RigMessage::user(request.utterance.clone()))
            .messages(history);

        if let Some(preamble) = request
            .preamble
            .as_ref()
            .filter(|preamble| !preamble.trim().is_empty())
        {
            builder = builder.preamble(preamble.clone());
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        let response = builder.send().await.context(CompletionsFailedSnafu {
            stage: "send-completion",
        })?;

        let reply = Self::reply_text(response.choice);
        if reply.trim().is_empty() {
            tracing::warn!(
                provider_id = %config.provider_id,
                model_id = %request.model_id,
                "provider reply contained no text"
            );
            return EmptyReplySnafu {
                stage: "read-completion-text",
                provider_id: config.provider_id.clone(),
            }
            .fail();
        }

        Ok(reply)
    }
}

impl AnswerBackend for RigAnswerBackend {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn default_model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or(DEFAULT_OPENAI_MODEL)
    }

    fn answer<'a>(&'a self, request: AnswerRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            let model_id = request.model_id.clone();
            let prior_turn_count = request.prior_turns.len();

            match Self::complete(&self.config, request).await {
                Ok(reply) => {
                    tracing::debug!(
                        provider_id = %self.config.provider_id,
                        model_id = %model_id,
                        prior_turn_count,
                        reply_chars = reply.chars().count(),
                        "provider completion finished"
                    );
                    Ok(reply)
                }
                Err(error) => {
                    tracing::error!(
                        provider_id = %self.config.provider_id,
                        model_id = %model_id,
                        error = %error,
                        "provider completion failed"
                    );
                    Err(error)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::provider::ProviderError;

    #[test]
    fn backend_requires_an_api_key() {
        let error = RigAnswerBackend::new(ProviderConfig::new("openai", "", ""))
            .err()
            .unwrap();
        assert_matches!(error, ProviderError::MissingApiKey { .. });
    }

    #[test]
    fn default_model_falls_back_to_openai_default() {
        let backend = RigAnswerBackend::new(ProviderConfig::new("openai", "sk-test", "")).unwrap();
        assert_eq!(backend.default_model(), DEFAULT_OPENAI_MODEL);

        let backend = RigAnswerBackend::new(
            ProviderConfig::new("openai", "sk-test", "").with_default_model("gpt-4o"),
        )
        .unwrap();
        assert_eq!(backend.default_model(), "gpt-4o");
    }
}
