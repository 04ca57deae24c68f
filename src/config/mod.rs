//! Configuration management for feedwire
//!
//! Configuration is loaded from a TOML file or from `FEEDWIRE_*` environment
//! variables. Every section has defaults, so a file only needs the values it
//! changes. [`Config::validate`] must pass before anything is started.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::cycle::{CycleSettings, DebugTargets, WorkerSettings};
use crate::delivery::DeliveryMode;
use crate::identity::DetectOptions;
use crate::scheduler::{FastTier, Schedule, ScheduleSet};
use crate::utils::is_http_url;
use crate::utils::retry::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cycle: CycleConfig,

    /// Custom schedules in precedence order
    pub schedules: Vec<Schedule>,

    /// Optional supporter fast tier
    pub fast_tier: Option<FastTier>,

    pub rate_limits: RateLimitConfig,
    pub delivery: DeliveryConfig,
    pub storage: StorageConfig,
    pub fetch: FetchConfig,
    pub debug: DebugTargets,
    pub logging: LoggingConfig,
}

/// Cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// URLs per batch
    pub batch_size: usize,

    /// Batch groups running at once
    pub parallel_batches: usize,

    /// Hours a URL may fail before it is alerted on and excluded, 0 disables
    pub hours_until_fail: f64,

    /// Refresh rate of the default schedule
    pub refresh_rate_minutes: f64,

    /// Optional upper bound on one batch
    pub batch_timeout_secs: Option<u64>,

    /// Deliver items on the very first fetch of a feed
    pub send_on_first_fetch: bool,

    /// Items older than this are never delivered
    pub max_item_age_days: Option<u32>,

    /// URLs fetched concurrently inside one batch
    pub url_concurrency: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            parallel_batches: 4,
            hours_until_fail: 24.0,
            refresh_rate_minutes: 10.0,
            batch_timeout_secs: None,
            send_on_first_fetch: false,
            max_item_age_days: None,
            url_concurrency: 10,
        }
    }
}

/// Per-destination send budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub standard_per_minute: u32,
    pub supporter_per_minute: u32,

    /// Supporter guilds in addition to the fast tier's guilds
    pub supporter_guild_ids: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            standard_per_minute: 30,
            supporter_per_minute: 90,
            supporter_guild_ids: Vec::new(),
        }
    }
}

/// Delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub mode: DeliveryMode,

    /// Request broker endpoint, required in brokered mode
    pub broker_url: Option<String>,

    /// Platform REST API base URL
    pub api_base: String,

    /// Bot token for channel media
    pub token: Option<String>,

    pub max_message_length: usize,

    /// Shards owned by this process, empty for all
    pub shard_ids: Vec<u32>,
    pub shard_count: u32,

    /// Outbound request timeout in seconds
    pub timeout_secs: u64,

    /// Capacity of the cycle to pipeline channel
    pub channel_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::InProcess,
            broker_url: None,
            api_base: String::from("https://discord.com/api/v10"),
            token: None,
            max_message_length: crate::delivery::render::DEFAULT_MAX_MESSAGE_LENGTH,
            shard_ids: Vec::new(),
            shard_count: 1,
            timeout_secs: 15,
            channel_capacity: 1000,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    File,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "file" | "files" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown storage backend: {other}"),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// SQLite database path
    pub sqlite_path: PathBuf,

    /// Directory of the file backend
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: PathBuf::from("data/feedwire.db"),
            data_dir: PathBuf::from("data/feedwire"),
        }
    }
}

/// Feed fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            connect_timeout_secs: 5,
            user_agent: format!("feedwire/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse::<T>().ok())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let var = |key: &str| lookup(key);

        if let Some(v) = parse_var(&lookup, "FEEDWIRE_BATCH_SIZE") {
            config.cycle.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "FEEDWIRE_PARALLEL_BATCHES") {
            config.cycle.parallel_batches = v;
        }
        if let Some(v) = parse_var(&lookup, "FEEDWIRE_HOURS_UNTIL_FAIL") {
            config.cycle.hours_until_fail = v;
        }
        if let Some(v) = parse_var(&lookup, "FEEDWIRE_REFRESH_RATE_MINUTES") {
            config.cycle.refresh_rate_minutes = v;
        }
        if let Some(v) = parse_var(&lookup, "FEEDWIRE_BATCH_TIMEOUT_SECS") {
            config.cycle.batch_timeout_secs = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "FEEDWIRE_SEND_ON_FIRST_FETCH") {
            config.cycle.send_on_first_fetch = v;
        }
        if let Some(v) = parse_var(&lookup, "FEEDWIRE_MAX_ITEM_AGE_DAYS") {
            config.cycle.max_item_age_days = Some(v);
        }

        if let Some(rate) = parse_var::<f64>(&lookup, "FEEDWIRE_SUPPORTER_REFRESH_RATE_MINUTES") {
            let guilds = var("FEEDWIRE_SUPPORTER_GUILDS")
                .map(|v| parse_list(&v))
                .unwrap_or_default();
            config.fast_tier = Some(FastTier::new(rate).with_guilds(guilds));
        }

        if let Some(v) = parse_var(&lookup, "FEEDWIRE_RATE_LIMIT_STANDARD") {
            config.rate_limits.standard_per_minute = v;
        }
        if let Some(v) = parse_var(&lookup, "FEEDWIRE_RATE_LIMIT_SUPPORTER") {
            config.rate_limits.supporter_per_minute = v;
        }

        if let Some(mode) = var("FEEDWIRE_DELIVERY_MODE") {
            config.delivery.mode = mode
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid FEEDWIRE_DELIVERY_MODE")?;
        }
        config.delivery.broker_url = var("FEEDWIRE_BROKER_URL").or(config.delivery.broker_url);
        if let Some(v) = var("FEEDWIRE_API_BASE") {
            config.delivery.api_base = v;
        }
        config.delivery.token = var("FEEDWIRE_BOT_TOKEN").or(config.delivery.token);
        if let Some(v) = var("FEEDWIRE_SHARD_IDS") {
            config.delivery.shard_ids = parse_list(&v)
                .iter()
                .map(|s| s.parse::<u32>())
                .collect::<std::result::Result<_, _>>()
                .context("Invalid FEEDWIRE_SHARD_IDS")?;
        }
        if let Some(v) = parse_var(&lookup, "FEEDWIRE_SHARD_COUNT") {
            config.delivery.shard_count = v;
        }

        if let Some(backend) = var("FEEDWIRE_STORAGE_BACKEND") {
            config.storage.backend = backend.parse()?;
        }
        if let Some(v) = var("FEEDWIRE_SQLITE_PATH") {
            config.storage.sqlite_path = v.into();
        }
        if let Some(v) = var("FEEDWIRE_DATA_DIR") {
            config.storage.data_dir = v.into();
        }

        if let Some(v) = parse_var(&lookup, "FEEDWIRE_FETCH_TIMEOUT") {
            config.fetch.timeout_secs = v;
        }
        if let Some(v) = var("FEEDWIRE_USER_AGENT") {
            config.fetch.user_agent = v;
        }

        if let Some(v) = var("FEEDWIRE_DEBUG_SUBSCRIPTIONS") {
            config.debug.subscription_ids = parse_list(&v).into_iter().collect();
        }
        if let Some(v) = var("FEEDWIRE_DEBUG_URLS") {
            config.debug.urls = parse_list(&v).into_iter().collect();
        }

        if let Some(v) = var("FEEDWIRE_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = var("FEEDWIRE_LOG_FORMAT") {
            config.logging.format = v;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.cycle.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.cycle.parallel_batches == 0 {
            anyhow::bail!("parallel_batches must be greater than 0");
        }

        if self.cycle.url_concurrency == 0 {
            anyhow::bail!("url_concurrency must be greater than 0");
        }

        if !self.cycle.hours_until_fail.is_finite() || self.cycle.hours_until_fail < 0.0 {
            anyhow::bail!("hours_until_fail must be 0 or positive");
        }

        if self.rate_limits.standard_per_minute == 0 || self.rate_limits.supporter_per_minute == 0 {
            anyhow::bail!("rate limit budgets must be greater than 0");
        }

        if self.delivery.max_message_length == 0 {
            anyhow::bail!("max_message_length must be greater than 0");
        }

        if self.delivery.mode == DeliveryMode::Brokered {
            match &self.delivery.broker_url {
                Some(url) if is_http_url(url) => {}
                Some(url) => anyhow::bail!("broker_url is not an http(s) URL: {url}"),
                None => anyhow::bail!("broker_url is required in brokered mode"),
            }
        }

        if let Some(shard) = self
            .delivery
            .shard_ids
            .iter()
            .find(|&&id| id >= self.delivery.shard_count.max(1))
        {
            anyhow::bail!(
                "shard id {shard} is out of range for shard_count {}",
                self.delivery.shard_count
            );
        }

        self.schedule_set().context("Invalid schedule configuration")?;

        Ok(())
    }

    /// Validated schedule set
    pub fn schedule_set(&self) -> Result<ScheduleSet> {
        Ok(ScheduleSet::new(
            self.cycle.refresh_rate_minutes,
            self.schedules.clone(),
            self.fast_tier.clone(),
        )?)
    }

    /// Guilds with the larger send budget
    pub fn supporter_guilds(&self) -> HashSet<String> {
        let mut guilds: HashSet<String> = self.rate_limits.supporter_guild_ids.iter().cloned().collect();
        if let Some(tier) = &self.fast_tier {
            guilds.extend(tier.guild_ids.iter().cloned());
        }
        guilds
    }

    /// Cycle settings for the orchestrators
    pub fn cycle_settings(&self, shard: u32) -> CycleSettings {
        CycleSettings {
            batch_size: self.cycle.batch_size,
            parallel_batches: self.cycle.parallel_batches,
            batch_timeout: self.cycle.batch_timeout_secs.map(Duration::from_secs),
            worker: WorkerSettings {
                shard,
                detect: DetectOptions {
                    send_on_first_fetch: self.cycle.send_on_first_fetch,
                    max_item_age: self
                        .cycle
                        .max_item_age_days
                        .map(|days| chrono::Duration::days(i64::from(days))),
                },
                url_concurrency: self.cycle.url_concurrency,
            },
            debug: self.debug.clone(),
            load_retry: RetryConfig::default(),
        }
    }

    /// Get delivery timeout as Duration
    #[must_use]
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery.timeout_secs)
    }
}
