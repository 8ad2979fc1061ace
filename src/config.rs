//! Configuration loader and validator for the catalog delivery bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub origin: Origin,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// How often the scheduler re-reads the batch table when nothing is
    /// scheduled, so newly added batches get picked up.
    pub rescan_interval_secs: u64,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    pub allowed_users: Vec<i64>,
}

/// Origin server the catalogs are fetched from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Origin {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.rescan_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.rescan_interval_secs must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.telegram.allowed_users.is_empty() {
        return Err(ConfigError::Invalid("telegram.allowed_users must list at least one user"));
    }

    if cfg.origin.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("origin.base_url must be non-empty"));
    }
    if !cfg.origin.base_url.starts_with("http://") && !cfg.origin.base_url.starts_with("https://") {
        return Err(ConfigError::Invalid("origin.base_url must be an http(s) URL"));
    }
    if cfg.origin.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("origin.request_timeout_secs must be > 0"));
    }

    Ok(())
}

/// Example YAML used by tests and `--print-example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  rescan_interval_secs: 60

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  allowed_users:
    - 123456789

origin:
  base_url: "https://backend.example-origin.site/"
  request_timeout_secs: 30
"#
}
