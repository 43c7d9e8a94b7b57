//! Engine configuration: JSON file with environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::model::{LanguageProfile, LanguageSet};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    pub min_interval_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".into(),
            api_key_env: Some("LINGOSYNC_API_KEY".into()),
            timeout_secs: 30,
            min_interval_ms: 100, // 10 req/s
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Distinct texts per batch; batches run one after another.
    pub batch_size: usize,
    /// Concurrent provider calls inside a batch. Defaults to, and is capped at, `batch_size`.
    pub max_concurrency: Option<usize>,
    pub max_retries: u32,
    pub rate_limit_cooldown_ms: u64,
    pub ephemeral_capacity: usize,
    pub ephemeral_ttl_secs: u64,
    /// SQLite file for the durable store; in-memory store when absent.
    pub store_path: Option<PathBuf>,
    pub retention_days: u64,
    pub reap_interval_secs: u64,
    pub languages: Vec<LanguageProfile>,
    pub provider: ProviderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_concurrency: None,
            max_retries: crate::circuit::DEFAULT_MAX_RETRIES,
            rate_limit_cooldown_ms: 2000,
            ephemeral_capacity: 512,
            ephemeral_ttl_secs: 600,
            store_path: None,
            retention_days: 7,
            reap_interval_secs: 3600,
            languages: LanguageSet::default().all().to_vec(),
            provider: ProviderConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        info!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Apply `LINGOSYNC_*` environment overrides. Unparseable values are
    /// logged and ignored.
    pub fn apply_env(mut self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok());
        self
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(var = name, value = %raw, "ignoring unparseable override");
                    None
                }
            }
        }

        if let Some(v) = parse("LINGOSYNC_BATCH_SIZE", lookup("LINGOSYNC_BATCH_SIZE")) {
            self.batch_size = v;
        }
        if let Some(v) = parse("LINGOSYNC_MAX_RETRIES", lookup("LINGOSYNC_MAX_RETRIES")) {
            self.max_retries = v;
        }
        if let Some(v) = parse("LINGOSYNC_COOLDOWN_MS", lookup("LINGOSYNC_COOLDOWN_MS")) {
            self.rate_limit_cooldown_ms = v;
        }
        if let Some(v) = lookup("LINGOSYNC_STORE_PATH").filter(|s| !s.is_empty()) {
            self.store_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("LINGOSYNC_PROVIDER_URL").filter(|s| !s.is_empty()) {
            self.provider.base_url = v;
        }
    }

    pub fn validate(&self) -> Result<LanguageSet, ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".into()));
        }
        if self.max_concurrency == Some(0) {
            return Err(ConfigError::Invalid("max_concurrency must be > 0".into()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be > 0".into()));
        }
        if self.ephemeral_capacity == 0 {
            return Err(ConfigError::Invalid("ephemeral_capacity must be > 0".into()));
        }
        LanguageSet::new(self.languages.clone())
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrency
            .unwrap_or(self.batch_size)
            .min(self.batch_size)
            .max(1)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    pub fn ephemeral_ttl(&self) -> Duration {
        Duration::from_secs(self.ephemeral_ttl_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 3600))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}
