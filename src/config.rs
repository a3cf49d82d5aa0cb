use serde::Deserialize;
use std::path::Path;

use chrono::Duration;

use crate::lifecycle::RetentionWindows;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_db_path() -> String {
    "triggerd.db".to_string()
}
fn default_max_connections() -> u32 {
    5
}

/// Lifecycle windows and sweep cadence. Tests compress these to seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_active_window_secs")]
    pub active_window_secs: u64,
    #[serde(default = "default_archive_window_secs")]
    pub archive_window_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            active_window_secs: default_active_window_secs(),
            archive_window_secs: default_archive_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_active_window_secs() -> u64 {
    2 * 3600
}
fn default_archive_window_secs() -> u64 {
    48 * 3600
}
fn default_sweep_interval_secs() -> u64 {
    30 * 60
}

impl RetentionConfig {
    pub fn windows(&self) -> anyhow::Result<RetentionWindows> {
        RetentionWindows::new(
            seconds("retention.active_window_secs", self.active_window_secs)?,
            seconds("retention.archive_window_secs", self.archive_window_secs)?,
        )
    }
}

fn seconds(field: &str, value: u64) -> anyhow::Result<Duration> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| anyhow::anyhow!("{} is out of range: {}", field, value))
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Extra attempts for a cache-miss read that hits a storage error.
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            read_retries: default_read_retries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> anyhow::Result<Duration> {
        seconds("cache.ttl_secs", self.ttl_secs)
    }
}

fn default_cache_ttl_secs() -> u64 {
    60
}
fn default_read_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Scheduled triggers registered at startup when no trigger of the same name exists.
    #[serde(default)]
    pub triggers: Vec<ScheduledTriggerConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_interval_secs: default_tick_interval_secs(),
            triggers: Vec::new(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_tick_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduledTriggerConfig {
    pub name: String,
    pub schedule: String,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.retention.windows()?;
        if self.retention.sweep_interval_secs == 0 {
            anyhow::bail!("retention.sweep_interval_secs must be greater than zero");
        }
        if self.scheduler.tick_interval_secs == 0 {
            anyhow::bail!("scheduler.tick_interval_secs must be greater than zero");
        }
        if self.cache.ttl_secs == 0 {
            anyhow::bail!("cache.ttl_secs must be greater than zero");
        }
        self.cache.ttl()?;
        Ok(())
    }
}
