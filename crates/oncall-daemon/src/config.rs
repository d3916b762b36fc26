use std::path::{Path, PathBuf};

use oncall::escalation::EscalationConfig;
use oncall::router::RouterConfig;
use oncall::store::Channel;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: String, value: String },
}

/// Per-channel webhook endpoints. Channels without one use the log adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub email: Option<String>,
    pub chat: Option<String>,
    pub push: Option<String>,
    pub sms: Option<String>,
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            email: None,
            chat: None,
            push: None,
            sms: None,
            timeout_secs: 10,
        }
    }
}

impl WebhookConfig {
    pub fn endpoint(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Chat => self.chat.as_deref(),
            Channel::Push => self.push.as_deref(),
            Channel::Sms => self.sms.as_deref(),
        }
    }

    fn endpoint_mut(&mut self, channel: Channel) -> &mut Option<String> {
        match channel {
            Channel::Email => &mut self.email,
            Channel::Chat => &mut self.chat,
            Channel::Push => &mut self.push,
            Channel::Sms => &mut self.sms,
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Seconds between escalation timeout scans
    pub tick_interval_secs: u64,
    /// Emit JSON log lines
    pub log_json: bool,
    pub escalation: EscalationConfig,
    pub router: RouterConfig,
    pub webhooks: WebhookConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("oncall.db"),
            tick_interval_secs: 15,
            log_json: false,
            escalation: EscalationConfig::default(),
            router: RouterConfig::default(),
            webhooks: WebhookConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from an optional TOML file, then apply `ONCALL_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment-style overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(path) = lookup("ONCALL_DATABASE") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(v) = lookup("ONCALL_LOG_JSON") {
            self.log_json = parse("ONCALL_LOG_JSON", &v)?;
        }
        override_parsed(&lookup, "ONCALL_TICK_SECS", &mut self.tick_interval_secs)?;

        override_parsed(
            &lookup,
            "ONCALL_DEFAULT_TIMEOUT_MINUTES",
            &mut self.escalation.default_timeout_minutes,
        )?;
        if let Some(v) = lookup("ONCALL_DEFAULT_CHANNELS") {
            self.escalation.default_channels = parse_channels("ONCALL_DEFAULT_CHANNELS", &v)?;
        }

        let router = &mut self.router;
        override_parsed(&lookup, "ONCALL_WORKERS", &mut router.worker_count)?;
        override_parsed(&lookup, "ONCALL_BATCH_SIZE", &mut router.batch_size)?;
        override_parsed(&lookup, "ONCALL_VISIBILITY_SECS", &mut router.visibility_timeout_secs)?;
        override_parsed(&lookup, "ONCALL_POLL_MS", &mut router.poll_interval_ms)?;
        override_parsed(&lookup, "ONCALL_MAX_DELIVERIES", &mut router.max_deliveries)?;
        override_parsed(&lookup, "ONCALL_MAX_RETRIES", &mut router.retry.max_retries)?;
        override_parsed(&lookup, "ONCALL_BACKOFF_MS", &mut router.retry.initial_backoff_ms)?;
        override_parsed(&lookup, "ONCALL_MAX_BACKOFF_MS", &mut router.retry.max_backoff_ms)?;

        for channel in Channel::all() {
            let key = format!("ONCALL_WEBHOOK_{}", channel.as_str().to_uppercase());
            if let Some(url) = lookup(&key) {
                *self.webhooks.endpoint_mut(*channel) = Some(url).filter(|u| !u.is_empty());
            }
        }
        override_parsed(&lookup, "ONCALL_WEBHOOK_TIMEOUT_SECS", &mut self.webhooks.timeout_secs)?;
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(key) {
        *slot = parse(key, &value)?;
    }
    Ok(())
}

fn parse_channels(key: &str, value: &str) -> Result<Vec<Channel>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse(key, s))
        .collect()
}
