use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use kindred_llm::{ECHO_PROVIDER_ID, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::context::{ContextWindow, DEFAULT_CONTEXT_TURNS, DEFAULT_MAX_CONTEXT_CHARS};
use crate::chat::exchange::{DEFAULT_MAX_UTTERANCE_CHARS, ExchangeOptions};
use crate::chat::message::DEFAULT_GREETING;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "kindred";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "kindred.sqlite3";
pub const ENV_PREFIX: &str = "KINDRED_";

const DEFAULT_EXCHANGE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STUB_DELAY_MS: u64 = 1_000;
const MAX_TEMPERATURE: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    /// Blank selects the backend's default model.
    pub model: String,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub preamble: Option<String>,
    pub echo_latency_ms: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: ECHO_PROVIDER_ID.to_string(),
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: String::new(),
            max_tokens: None,
            temperature: None,
            preamble: None,
            echo_latency_ms: 0,
        }
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint)
            .with_default_model(&self.model)
    }

    pub fn echo_latency(&self) -> Duration {
        Duration::from_millis(self.echo_latency_ms)
    }

    fn normalized(mut self) -> Self {
        self.provider_id = match self.provider_id.trim() {
            "" => ECHO_PROVIDER_ID.to_string(),
            provider_id => provider_id.to_lowercase(),
        };
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = match self.endpoint.trim() {
            "" => DEFAULT_ENDPOINT.to_string(),
            endpoint => endpoint.to_string(),
        };
        self.model = self.model.trim().to_string();
        self.max_tokens = self.max_tokens.filter(|tokens| *tokens > 0);
        self.temperature = self
            .temperature
            .filter(|temperature| (0.0..=MAX_TEMPERATURE).contains(temperature));
        self.preamble = self
            .preamble
            .map(|preamble| preamble.trim().to_string())
            .filter(|preamble| !preamble.is_empty());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub context_turns: usize,
    pub max_context_chars: usize,
    pub max_utterance_chars: usize,
    pub timeout_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            context_turns: DEFAULT_CONTEXT_TURNS,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            max_utterance_chars: DEFAULT_MAX_UTTERANCE_CHARS,
            timeout_secs: DEFAULT_EXCHANGE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub resolve_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            resolve_timeout_ms: DEFAULT_RESOLVE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingSettings {
    pub stub_delay_ms: u64,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            stub_delay_ms: DEFAULT_STUB_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// SQLite file path or `sqlite:` URL.
    pub database_url: String,
    pub greeting: String,
    pub provider: ProviderSettings,
    pub exchange: ExchangeSettings,
    pub session: SessionSettings,
    pub billing: BillingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: default_database_path().to_string_lossy().into_owned(),
            greeting: DEFAULT_GREETING.to_string(),
            provider: ProviderSettings::default(),
            exchange: ExchangeSettings::default(),
            session: SessionSettings::default(),
            billing: BillingSettings::default(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.database_url = match self.database_url.trim() {
            "" => default_database_path().to_string_lossy().into_owned(),
            url => url.to_string(),
        };
        if self.greeting.trim().is_empty() {
            self.greeting = DEFAULT_GREETING.to_string();
        }
        self.provider = self.provider.normalized();

        // Zero caps fall back to the defaults.
        if self.exchange.max_utterance_chars == 0 {
            self.exchange.max_utterance_chars = DEFAULT_MAX_UTTERANCE_CHARS;
        }
        if self.exchange.timeout_secs == 0 {
            self.exchange.timeout_secs = DEFAULT_EXCHANGE_TIMEOUT_SECS;
        }
        if self.session.resolve_timeout_ms == 0 {
            self.session.resolve_timeout_ms = DEFAULT_RESOLVE_TIMEOUT_MS;
        }
        self
    }

    pub fn exchange_options(&self) -> ExchangeOptions {
        ExchangeOptions {
            window: ContextWindow::new(
                self.exchange.context_turns,
                self.exchange.max_context_chars,
            ),
            timeout: Duration::from_secs(self.exchange.timeout_secs),
            max_utterance_chars: self.exchange.max_utterance_chars,
            model_id: self.provider.model.clone(),
            preamble: self.provider.preamble.clone(),
            max_tokens: self.provider.max_tokens,
            temperature: self.provider.temperature,
        }
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.session.resolve_timeout_ms)
    }

    pub fn billing_delay(&self) -> Duration {
        Duration::from_millis(self.billing.stub_delay_ms)
    }
}

/// Layered settings: defaults, then the JSON file, then `KINDRED_*` variables
/// with `__` separating nested keys (`KINDRED_PROVIDER__API_KEY`).
pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".kindred"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        Self::with_env_prefix(config_path, ENV_PREFIX)
    }

    pub fn with_env_prefix(config_path: PathBuf, env_prefix: &str) -> Self {
        let settings = Self::load_layers(&config_path, env_prefix);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_layers(path: &Path, env_prefix: &str) -> Settings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(env_prefix).split("__"));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".kindred"))
        .join(DATABASE_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own prefix so ambient KINDRED_* variables never leak in.
    fn store(path: PathBuf, prefix: &str) -> SettingsStore {
        SettingsStore::with_env_prefix(path, prefix)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path().join(SETTINGS_FILE_NAME), "KINDRED_TEST_MISSING_");

        let settings = store.settings();
        assert_eq!(settings.provider.provider_id, ECHO_PROVIDER_ID);
        assert_eq!(settings.exchange, ExchangeSettings::default());
        assert_eq!(settings.greeting, DEFAULT_GREETING);
        assert!(settings.database_url.ends_with(DATABASE_FILE_NAME));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{ "provider": { "provider_id": " OpenAI ", "api_key": " sk-test " }, "exchange": { "context_turns": 4 } }"#,
        )
        .unwrap();

        let settings = store(path, "KINDRED_TEST_FILE_").settings();

        assert_eq!(settings.provider.provider_id, "openai");
        assert_eq!(settings.provider.api_key, "sk-test");
        assert_eq!(settings.provider.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.exchange.context_turns, 4);
        assert_eq!(settings.exchange.max_context_chars, DEFAULT_MAX_CONTEXT_CHARS);
    }

    #[test]
    fn environment_overrides_the_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                SETTINGS_FILE_NAME,
                r#"{ "session": { "resolve_timeout_ms": 100 }, "provider": { "temperature": 0.2 } }"#,
            )?;
            jail.set_env("KINDRED_TEST_ENV_SESSION__RESOLVE_TIMEOUT_MS", "250");
            jail.set_env("KINDRED_TEST_ENV_BILLING__STUB_DELAY_MS", "0");

            let path = jail.directory().join(SETTINGS_FILE_NAME);
            let settings = store(path, "KINDRED_TEST_ENV_").settings();

            assert_eq!(settings.resolve_timeout(), Duration::from_millis(250));
            assert_eq!(settings.billing_delay(), Duration::ZERO);
            assert_eq!(settings.provider.temperature, Some(0.2));
            Ok(())
        });
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        let settings = store(path, "KINDRED_TEST_BROKEN_").settings();

        assert_eq!(*settings, Settings::default());
    }

    #[test]
    fn update_persists_normalized_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = store(path.clone(), "KINDRED_TEST_UPDATE_");

        let mut settings = (*store.settings()).clone();
        settings.provider.model = "  gpt-4o  ".to_string();
        settings.exchange.timeout_secs = 0;
        settings.provider.temperature = Some(7.5);
        settings.greeting = "   ".to_string();
        store.update(settings).unwrap();

        let current = store.settings();
        assert_eq!(current.provider.model, "gpt-4o");
        assert_eq!(current.exchange.timeout_secs, DEFAULT_EXCHANGE_TIMEOUT_SECS);
        assert_eq!(current.provider.temperature, None);
        assert_eq!(current.greeting, DEFAULT_GREETING);
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::with_env_prefix(path, "KINDRED_TEST_UPDATE_").settings();
        assert_eq!(*reloaded, *current);
    }

    #[test]
    fn exchange_options_follow_settings() {
        let mut settings = Settings::default();
        settings.exchange.context_turns = 6;
        settings.exchange.max_context_chars = 900;
        settings.exchange.timeout_secs = 12;
        settings.provider.model = "gpt-4o".to_string();
        settings.provider.max_tokens = Some(256);
        settings.provider.temperature = Some(0.7);

        let options = settings.exchange_options();

        assert_eq!(options.window, ContextWindow::new(6, 900));
        assert_eq!(options.timeout, Duration::from_secs(12));
        assert_eq!(options.model_id, "gpt-4o");
        assert_eq!(options.max_tokens, Some(256));
        assert_eq!(options.temperature, Some(0.7));

        let config = settings.provider.to_provider_config();
        assert_eq!(config.default_model.as_deref(), Some("gpt-4o"));
    }
}
