use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            default_model: None,
        }
    }

    pub fn with_default_model(mut self, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into().trim().to_string();
        self.default_model = (!model_id.is_empty()).then_some(model_id);
        self
    }
}

/// Speaker of one prior turn re-supplied to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn rendered_len(&self) -> usize {
        self.role.label().len() + 2 + self.content.chars().count()
    }
}

/// One stateless answer request: prior turns plus the new utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerRequest {
    pub model_id: String,
    pub prior_turns: Vec<Turn>,
    pub utterance: String,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl AnswerRequest {
    pub fn new(
        model_id: impl Into<String>,
        prior_turns: Vec<Turn>,
        utterance: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            prior_turns,
            utterance: utterance.into(),
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Renders prior turns as `Role: content` lines.
    pub fn prior_turns_text(&self) -> String {
        self.prior_turns
            .iter()
            .map(|turn| format!("{}: {}", turn.role.label(), turn.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Flat prompt for backends that take a single text input.
    pub fn prompt(&self) -> String {
        format!(
            "Previous conversation:\n{}\n\nUser: {}",
            self.prior_turns_text(),
            self.utterance
        )
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("answer request has an empty utterance"))]
    EmptyUtterance { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("provider '{provider_id}' returned a reply without text"))]
    EmptyReply {
        stage: &'static str,
        provider_id: String,
    },
}

impl ProviderError {
    /// True when the provider refused the request itself; retrying the same
    /// request is not expected to help.
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::EmptyUtterance { .. } | Self::EmptyReply { .. } => true,
            Self::CompletionsFailed { source, .. } => matches!(
                source,
                rig::completion::CompletionError::ProviderError(_)
                    | rig::completion::CompletionError::RequestError(_)
            ),
            Self::MissingApiKey { .. }
            | Self::UnsupportedProvider { .. }
            | Self::HttpClient { .. } => false,
        }
    }
}

pub trait AnswerBackend: Send + Sync {
    fn id(&self) -> &str;
    fn default_model(&self) -> &str;
    fn answer<'a>(&'a self, request: AnswerRequest) -> BoxFuture<'a, ProviderResult<String>>;
}
