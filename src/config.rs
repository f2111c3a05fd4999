//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (the market-data API key) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`. Per-screen option
//! tables are kept raw here and validated by each strategy.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::fetcher::{FetcherConfig, RetryPolicy, DEFAULT_WORKERS};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Raw option tables keyed by screen name.
    #[serde(default)]
    pub screens: BTreeMap<String, toml::Table>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.polygon.io".to_string(),
            api_key_env: "POLYGON_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FetchConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Rows per page for queries that do not set their own.
    pub page_size: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            workers: DEFAULT_WORKERS,
            max_attempts: retry.max_attempts,
            base_backoff_ms: retry.base_backoff.as_millis() as u64,
            max_backoff_ms: retry.max_backoff.as_millis() as u64,
            page_size: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Partitions written longer ago are removed after each run; 0 keeps them.
    pub ttl_hours: u64,
    /// Size ceiling enforced after each run by evicting least recently used
    /// partitions; 0 disables eviction.
    pub max_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache"),
            ttl_hours: 168,
            max_size_mb: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    /// Deadline for one screening run.
    pub timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { timeout_secs: 900 }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Validated fetcher settings.
    pub fn fetcher_config(&self) -> Result<FetcherConfig> {
        let config = FetcherConfig {
            workers: self.fetch.workers,
            retry: RetryPolicy {
                max_attempts: self.fetch.max_attempts,
                base_backoff: Duration::from_millis(self.fetch.base_backoff_ms),
                max_backoff: Duration::from_millis(self.fetch.max_backoff_ms),
            },
        };
        config.validate().context("Invalid [fetch] configuration")?;
        Ok(config)
    }

    /// Option table for `screen`, if configured.
    pub fn screen_options(&self, screen: &str) -> Option<&toml::Table> {
        self.screens.get(screen)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source.timeout_secs)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.timeout_secs)
    }

    /// Cache time-to-live, `None` when expiry is disabled.
    pub fn cache_ttl(&self) -> Option<chrono::Duration> {
        let hours = i64::try_from(self.cache.ttl_hours).ok().filter(|h| *h > 0)?;
        chrono::Duration::try_hours(hours)
    }

    /// Cache size ceiling in bytes, `None` when eviction is disabled.
    pub fn cache_max_bytes(&self) -> Option<u64> {
        (self.cache.max_size_mb > 0).then(|| self.cache.max_size_mb.saturating_mul(1024 * 1024))
    }
}
