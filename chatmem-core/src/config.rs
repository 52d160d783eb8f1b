use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_API_KEY_ENV: &str = "ZEP_API_KEY";
pub const DEFAULT_BASE_URL: &str = "https://api.getzep.com/api/v2";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChatmemConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub zep: ZepConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Connection settings for the Zep Cloud client.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ZepConfig {
    pub base_url: String,
    /// Explicit credential. When absent, `api_key_env` is consulted.
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for ZepConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

impl ZepConfig {
    /// The explicit key if set and non-empty, otherwise the environment fallback.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RepositoryConfig {
    /// How many history entries `get_user_session` loads into a session.
    pub message_window: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self { message_window: 50 }
    }
}

impl ChatmemConfig {
    /// Load from a TOML file (optional) with `CHATMEM_` environment overrides,
    /// e.g. `CHATMEM_ZEP__BASE_URL`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("CHATMEM")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        s.try_deserialize()
    }
}
