//! Configuration management
//!
//! A YAML file supplies the base values; environment keys override them.
//! Only the bot token is required. Optional values that fail to parse are
//! logged and replaced by their defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::application::errors::ConfigError;

pub const ENV_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const ENV_API_ENDPOINT: &str = "TELEGRAM_API_ENDPOINT";
pub const ENV_DEBUG: &str = "BOT_DEBUG";
pub const ENV_MAX_SUB_DATA_COUNT: &str = "MAX_SUB_DATA_COUNT";
pub const ENV_WORKERS: &str = "NUM_WORKERS";
/// Older name for [`ENV_WORKERS`]; `NUM_WORKERS` wins when both are set
pub const ENV_LISTEN_GOROUTINES: &str = "NUM_LISTEN_GOROUTINES";
pub const ENV_DATABASE_PATH: &str = "DATABASE_PATH";

/// Default Telegram Bot API base URL
pub const DEFAULT_API_ENDPOINT: &str = "https://api.telegram.org";

/// Stored payloads kept per chat unless configured otherwise
pub const DEFAULT_MAX_SUB_DATA_COUNT: usize = 20;

/// Bot configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub dispatch: DispatchConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TelegramConfig {
    pub token: Option<String>,
    pub api_endpoint: String,
    pub debug: bool,
    /// Long-poll timeout for getUpdates, seconds
    pub poll_timeout: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DispatchConfig {
    /// Worker count; unset means available parallelism
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub max_sub_data_count: usize,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            debug: false,
            poll_timeout: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mqtg-bot.db"),
            max_sub_data_count: DEFAULT_MAX_SUB_DATA_COUNT,
        }
    }
}

impl Config {
    /// Load a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("Failed to read {}: {}", path.display(), e)))?;

        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// File (if present and readable) overlaid by the process environment.
    pub fn load_with_env(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let config = if path.exists() {
            Config::load(path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Config::default()
            })
        } else {
            Config::default()
        };

        config.with_env(|key| std::env::var(key).ok())
    }

    /// Overlays environment-style values taken from `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(ENV_TOKEN).filter(|t| !t.trim().is_empty()) {
            self.telegram.token = Some(token.trim().to_string());
        }

        if let Some(endpoint) = lookup(ENV_API_ENDPOINT).filter(|e| !e.trim().is_empty()) {
            self.telegram.api_endpoint = endpoint.trim().trim_end_matches('/').to_string();
        }

        if let Some(debug) = lookup(ENV_DEBUG) {
            self.telegram.debug = debug.trim() == "true";
        }

        if let Some(raw) = lookup(ENV_MAX_SUB_DATA_COUNT) {
            match parse_positive(&raw) {
                Some(count) => self.storage.max_sub_data_count = count,
                None => tracing::warn!(
                    "Ignoring {}={:?}: expected a positive integer, keeping {}",
                    ENV_MAX_SUB_DATA_COUNT, raw, self.storage.max_sub_data_count
                ),
            }
        }

        for key in [ENV_LISTEN_GOROUTINES, ENV_WORKERS] {
            if let Some(raw) = lookup(key) {
                match parse_positive(&raw) {
                    Some(workers) => self.dispatch.workers = Some(workers),
                    None => tracing::warn!("Bad {} value {:?}: expected a positive integer", key, raw),
                }
            }
        }

        if let Some(path) = lookup(ENV_DATABASE_PATH).filter(|p| !p.trim().is_empty()) {
            self.storage.path = PathBuf::from(path.trim());
        }

        if self.storage.max_sub_data_count == 0 {
            tracing::warn!(
                "storage.max-sub-data-count must be positive, using {}",
                DEFAULT_MAX_SUB_DATA_COUNT
            );
            self.storage.max_sub_data_count = DEFAULT_MAX_SUB_DATA_COUNT;
        }

        self
    }

    /// Fails only when the token is missing. Must pass before anything starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.token().map(|_| ())
    }

    /// Payloads kept per chat; a zero count means the default.
    pub fn max_sub_data_count(&self) -> usize {
        match self.storage.max_sub_data_count {
            0 => DEFAULT_MAX_SUB_DATA_COUNT,
            n => n,
        }
    }

    /// Validated token
    pub fn token(&self) -> Result<&str, ConfigError> {
        self.telegram
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingField(ENV_TOKEN.to_string()))
    }

    /// Configured worker count, or the number of available CPUs.
    pub fn worker_count(&self) -> usize {
        match self.dispatch.workers.filter(|w| *w > 0) {
            Some(workers) => workers,
            None => {
                let workers = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                tracing::info!("{} is not set, defaulting to available parallelism ({})", ENV_WORKERS, workers);
                workers
            }
        }
    }

    /// Default config as YAML, used by `init-config`
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

fn parse_positive(raw: &str) -> Option<usize> {
    raw.trim().parse::<i64>().ok().filter(|n| *n > 0).map(|n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_token_is_fatal() {
        let config = Config::default().with_env(env(&[]));
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(ref f)) if f == ENV_TOKEN));

        let config = Config::default().with_env(env(&[(ENV_TOKEN, "   ")]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_defaults() {
        let config = Config::default().with_env(env(&[
            (ENV_TOKEN, "123:abc"),
            (ENV_API_ENDPOINT, "http://localhost:8081/"),
            (ENV_DEBUG, "true"),
            (ENV_MAX_SUB_DATA_COUNT, "5"),
            (ENV_LISTEN_GOROUTINES, "8"),
            (ENV_WORKERS, "3"),
            (ENV_DATABASE_PATH, "/tmp/bot.db"),
        ]));

        assert!(config.validate().is_ok());
        assert_eq!(config.token().unwrap(), "123:abc");
        assert_eq!(config.telegram.api_endpoint, "http://localhost:8081");
        assert!(config.telegram.debug);
        assert_eq!(config.storage.max_sub_data_count, 5);
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.storage.path, PathBuf::from("/tmp/bot.db"));
    }

    #[test]
    fn malformed_optional_values_fall_back() {
        let config = Config::default().with_env(env(&[
            (ENV_TOKEN, "t"),
            (ENV_WORKERS, "lots"),
            (ENV_MAX_SUB_DATA_COUNT, "-4"),
            (ENV_DEBUG, "yes please"),
        ]));

        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.workers, None);
        assert!(config.worker_count() >= 1);
        assert_eq!(config.storage.max_sub_data_count, DEFAULT_MAX_SUB_DATA_COUNT);
        assert!(!config.telegram.debug);

        let config = Config::default().with_env(env(&[(ENV_TOKEN, "t"), (ENV_WORKERS, "0")]));
        assert_eq!(config.dispatch.workers, None);
    }

    #[test]
    fn zero_sub_data_count_in_file_is_not_fatal() {
        let parsed: Config =
            serde_yaml::from_str("telegram:\n  token: t\nstorage:\n  max-sub-data-count: 0\n").unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.max_sub_data_count(), DEFAULT_MAX_SUB_DATA_COUNT);

        let config = parsed.with_env(env(&[]));
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.max_sub_data_count, DEFAULT_MAX_SUB_DATA_COUNT);
    }

    #[test]
    fn listen_goroutines_key_sets_workers() {
        let config = Config::default().with_env(env(&[(ENV_TOKEN, "t"), (ENV_LISTEN_GOROUTINES, "7")]));
        assert_eq!(config.worker_count(), 7);

        let config = Config::default().with_env(env(&[
            (ENV_TOKEN, "t"),
            (ENV_LISTEN_GOROUTINES, "7"),
            (ENV_WORKERS, "3"),
        ]));
        assert_eq!(config.worker_count(), 3);

        // a bad alias does not clobber a good primary key
        let config = Config::default().with_env(env(&[
            (ENV_TOKEN, "t"),
            (ENV_LISTEN_GOROUTINES, "many"),
            (ENV_WORKERS, "2"),
        ]));
        assert_eq!(config.worker_count(), 2);
    }

    #[test]
    fn yaml_round_trip_keeps_defaults() {
        let yaml = Config::default().to_yaml().unwrap();
        assert!(yaml.contains("api-endpoint"));

        let parsed: Config = serde_yaml::from_str("telegram:\n  token: from-file\n").unwrap();
        assert_eq!(parsed.telegram.token.as_deref(), Some("from-file"));
        assert_eq!(parsed.telegram.api_endpoint, DEFAULT_API_ENDPOINT);
        assert_eq!(parsed.storage.max_sub_data_count, DEFAULT_MAX_SUB_DATA_COUNT);
    }

    #[test]
    fn env_wins_over_file() {
        let parsed: Config = serde_yaml::from_str("telegram:\n  token: from-file\ndispatch:\n  workers: 2\n").unwrap();
        let config = parsed.with_env(env(&[(ENV_TOKEN, "from-env")]));
        assert_eq!(config.token().unwrap(), "from-env");
        assert_eq!(config.worker_count(), 2);
    }
}
