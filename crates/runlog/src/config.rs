// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::alerts::AlertLevel;
use crate::constants::{
    DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_FLUSH_TIMEOUT_MS, DEFAULT_MAX_BATCH, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_BASE_MS, DEFAULT_SHUTDOWN_TIMEOUT_MS, DEFAULT_TIMEOUT_MS,
};
use crate::delivery::{RemoteTarget, RetryStrategy};
use crate::errors::ConfigError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory holding the local durable store
    pub store_dir: PathBuf,
    /// Remote collector base address; `None` keeps the pipeline local-only
    pub server_url: Option<String>,
    /// Optional write token sent with every delivery
    pub write_token: Option<String>,
    /// Per-attempt request timeout
    pub timeout: Duration,
    /// Buffered records per run that trigger an immediate drain
    pub max_batch: usize,
    /// Periodic drain interval
    pub flush_interval: Duration,
    /// Delivery attempts per batch
    pub max_retries: u32,
    /// Base delay of the exponential backoff
    pub retry_base: Duration,
    /// Upper bound for an explicit flush
    pub flush_timeout: Duration,
    /// Upper bound for the final flush on shutdown
    pub shutdown_timeout: Duration,
    /// Default alert webhook
    pub webhook_url: Option<String>,
    /// Alerts below this level are not sent to webhooks
    pub webhook_min_level: AlertLevel,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    pub project: Option<String>,
    pub run: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(None, None),
            server_url: None,
            write_token: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_batch: DEFAULT_MAX_BATCH,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            flush_timeout: Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            webhook_url: None,
            webhook_min_level: AlertLevel::Info,
            log_level: "info".to_string(),
            project: None,
            run: None,
        }
    }
}

impl PipelineConfig {
    /// Create configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_iter(std::env::vars())
    }

    /// Create configuration from an explicit list of variables.
    ///
    /// Unparseable numbers fall back to their defaults; the result is validated.
    pub fn from_env_iter<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let millis = |key: &str, default: u64| {
            Duration::from_millis(parse_or(get(key).as_deref(), default))
        };

        let store_dir = get("RUNLOG_DIR").map(PathBuf::from).unwrap_or_else(|| {
            default_store_dir(
                get("XDG_CACHE_HOME").as_deref(),
                get("HOME").as_deref(),
            )
        });

        let webhook_min_level = match get("RUNLOG_WEBHOOK_MIN_LEVEL") {
            Some(level) => AlertLevel::from_str(&level).map_err(ConfigError::Invalid)?,
            None => AlertLevel::Info,
        };

        let config = Self {
            store_dir,
            server_url: get("RUNLOG_SERVER_URL").map(|url| url.trim_end_matches('/').to_string()),
            write_token: get("RUNLOG_WRITE_TOKEN"),
            timeout: millis("RUNLOG_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),
            max_batch: parse_or(get("RUNLOG_MAX_BATCH").as_deref(), DEFAULT_MAX_BATCH),
            flush_interval: millis("RUNLOG_FLUSH_INTERVAL_MS", DEFAULT_FLUSH_INTERVAL_MS),
            max_retries: parse_or(get("RUNLOG_MAX_RETRIES").as_deref(), DEFAULT_MAX_RETRIES),
            retry_base: millis("RUNLOG_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS),
            flush_timeout: millis("RUNLOG_FLUSH_TIMEOUT_MS", DEFAULT_FLUSH_TIMEOUT_MS),
            shutdown_timeout: millis("RUNLOG_SHUTDOWN_TIMEOUT_MS", DEFAULT_SHUTDOWN_TIMEOUT_MS),
            webhook_url: get("RUNLOG_WEBHOOK_URL"),
            webhook_min_level,
            log_level: get("RUNLOG_LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or_else(|| "info".to_string()),
            project: get("RUNLOG_PROJECT"),
            run: get("RUNLOG_RUN"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch == 0 {
            return Err(ConfigError::Invalid(
                "max batch must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "flush interval must be greater than 0".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "max retries must allow at least one attempt".to_string(),
            ));
        }
        if let Some(url) = &self.server_url {
            validate_http_url("server url", url)?;
        }
        if let Some(url) = &self.webhook_url {
            validate_http_url("webhook url", url)?;
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::ExponentialBackoff {
            attempts: self.max_retries,
            base_delay_ms: u64::try_from(self.retry_base.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// The configured remote collector, if any.
    #[must_use]
    pub fn remote_target(&self) -> Option<RemoteTarget> {
        self.server_url
            .as_ref()
            .map(|url| RemoteTarget::new(url.clone(), self.write_token.clone()))
    }
}

fn parse_or<T: FromStr>(value: Option<&str>, default: T) -> T {
    value.and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

fn validate_http_url(what: &str, url: &str) -> Result<(), ConfigError> {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(parsed) => Err(ConfigError::Invalid(format!(
            "{what} '{url}' must use http or https, got '{}'",
            parsed.scheme()
        ))),
        Err(e) => Err(ConfigError::Invalid(format!("{what} '{url}' is invalid: {e}"))),
    }
}

fn default_store_dir(xdg_cache_home: Option<&str>, home: Option<&str>) -> PathBuf {
    match (xdg_cache_home, home) {
        (Some(cache), _) => PathBuf::from(cache).join("runlog"),
        (None, Some(home)) => PathBuf::from(home).join(".cache").join("runlog"),
        (None, None) => PathBuf::from(".runlog"),
    }
}
