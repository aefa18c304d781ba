use std::sync::Arc;
use std::time::Duration;

mod echo;
mod provider;
mod rig_adapter;

pub use echo::{ECHO_PROVIDER_ID, ECHO_REPLY_PREFIX, EchoBackend};
pub use provider::{
    AnswerBackend, AnswerRequest, BoxFuture, DEFAULT_OPENAI_MODEL, ProviderConfig, ProviderError,
    ProviderResult, Role, Turn,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigAnswerBackend};

/// Builds the answer backend named by `config.provider_id`.
///
/// A blank provider id selects the echo placeholder. `echo_latency` only
/// applies to the placeholder.
pub fn create_backend(
    mut config: ProviderConfig,
    echo_latency: Duration,
) -> ProviderResult<Arc<dyn AnswerBackend>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = ECHO_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        ECHO_PROVIDER_ID => Ok(Arc::new(EchoBackend::new().with_latency(echo_latency))),
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigAnswerBackend::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-backend",
            provider_id: config.provider_id,
        }),
    }
}
