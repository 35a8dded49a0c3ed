//! Service configuration.
//!
//! Loaded from `$PULT_CONFIG` or `~/.pult/config.json`. Every field has a
//! default, so a missing file (or a partial one) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PulseError;
use crate::resilience::RetryPolicy;
use crate::types::JobId;

pub const CONFIG_ENV_VAR: &str = "PULT_CONFIG";

// Upper bounds for values that become chrono/tokio durations
const MAX_RETENTION_DAYS: i64 = 3650;
const MAX_CACHE_TTL_MINUTES: i64 = 7 * 24 * 60;
const MAX_RATE_WINDOW_SECS: i64 = 24 * 60 * 60;
const MAX_RESET_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const MAX_BACKOFF_BASE_SECS: u64 = 60 * 60;
const MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PulseConfig {
    pub schedules: Schedules,
    pub scheduler: SchedulerSettings,
    pub scoring: ScoringSettings,
    pub rate_limit: RateLimitSettings,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
}

/// Job schedules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedules {
    #[serde(default = "ScheduleEntry::default_score_refresh")]
    pub score_refresh: ScheduleEntry,
    #[serde(default = "ScheduleEntry::default_retention_cleanup")]
    pub retention_cleanup: ScheduleEntry,
    #[serde(default = "ScheduleEntry::default_aggregate_summary")]
    pub aggregate_summary: ScheduleEntry,
}

impl Default for Schedules {
    fn default() -> Self {
        Self {
            score_refresh: ScheduleEntry::default_score_refresh(),
            retention_cleanup: ScheduleEntry::default_retention_cleanup(),
            aggregate_summary: ScheduleEntry::default_aggregate_summary(),
        }
    }
}

impl Schedules {
    pub fn entry(&self, job: JobId) -> &ScheduleEntry {
        match job {
            JobId::ScoreRefresh => &self.score_refresh,
            JobId::RetentionCleanup => &self.retention_cleanup,
            JobId::AggregateSummary => &self.aggregate_summary,
        }
    }
}

/// A single schedule entry (5-field cron, evaluated in `timezone`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub enabled: bool,
    pub cron: String,
    pub timezone: String,
}

impl ScheduleEntry {
    /// Top of every hour
    pub fn default_score_refresh() -> Self {
        Self::utc("0 * * * *")
    }

    /// Midnight daily
    pub fn default_retention_cleanup() -> Self {
        Self::utc("0 0 * * *")
    }

    /// Every 15 minutes
    pub fn default_aggregate_summary() -> Self {
        Self::utc("*/15 * * * *")
    }

    fn utc(cron: &str) -> Self {
        Self {
            enabled: true,
            cron: cron.to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    pub poll_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringSettings {
    pub retention_days: i64,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub requests_per_minute: usize,
    pub window_secs: i64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: crate::rate_limit::DEFAULT_REQUESTS_PER_MINUTE,
            window_secs: crate::rate_limit::DEFAULT_WINDOW_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: crate::resilience::DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_secs: crate::resilience::DEFAULT_RESET_TIMEOUT.as_secs(),
        }
    }
}

impl BreakerSettings {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub retries: u32,
    pub backoff_base_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_base_secs: 1,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            backoff_base: Duration::from_secs(self.backoff_base_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub summary_ttl_minutes: i64,
    pub enterprise_ttl_minutes: i64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            summary_ttl_minutes: 15,
            enterprise_ttl_minutes: 5,
        }
    }
}

impl PulseConfig {
    /// Check everything that would otherwise fail later inside the scheduler
    pub fn validate(&self) -> Result<(), PulseError> {
        for job in JobId::ALL {
            let entry = self.schedules.entry(job);
            crate::scheduler::parse_cron(&entry.cron)?;
            crate::scheduler::parse_timezone(&entry.timezone)?;
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(PulseError::Configuration(
                "scheduler.pollIntervalSecs must be positive".to_string(),
            ));
        }
        if self.rate_limit.requests_per_minute == 0
            || !(1..=MAX_RATE_WINDOW_SECS).contains(&self.rate_limit.window_secs)
        {
            return Err(PulseError::Configuration(format!(
                "rateLimit requires a positive limit and a window of 1..={} seconds",
                MAX_RATE_WINDOW_SECS
            )));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.scoring.retention_days) {
            return Err(PulseError::Configuration(format!(
                "scoring.retentionDays must be in 1..={}",
                MAX_RETENTION_DAYS
            )));
        }
        for (field, ttl) in [
            ("summaryTtlMinutes", self.cache.summary_ttl_minutes),
            ("enterpriseTtlMinutes", self.cache.enterprise_ttl_minutes),
        ] {
            if !(1..=MAX_CACHE_TTL_MINUTES).contains(&ttl) {
                return Err(PulseError::Configuration(format!(
                    "cache.{} must be in 1..={}",
                    field, MAX_CACHE_TTL_MINUTES
                )));
            }
        }
        if self.breaker.reset_timeout_secs > MAX_RESET_TIMEOUT_SECS {
            return Err(PulseError::Configuration(format!(
                "breaker.resetTimeoutSecs must be at most {}",
                MAX_RESET_TIMEOUT_SECS
            )));
        }
        if self.retry.retries > MAX_RETRIES || self.retry.backoff_base_secs > MAX_BACKOFF_BASE_SECS {
            return Err(PulseError::Configuration(format!(
                "retry allows at most {} retries and a {}s backoff base",
                MAX_RETRIES, MAX_BACKOFF_BASE_SECS
            )));
        }
        Ok(())
    }
}

/// Default config location: `$PULT_CONFIG`, else `~/.pult/config.json`
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_default()
        .join(".pult")
        .join("config.json")
}

/// Load and validate config from the default location
pub fn load_config() -> Result<PulseConfig, PulseError> {
    load_config_from(&config_path())
}

/// Load and validate config from `path`; a missing file yields defaults
pub fn load_config_from(path: &Path) -> Result<PulseConfig, PulseError> {
    let config = match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<PulseConfig>(&content).map_err(|e| {
            PulseError::Configuration(format!("Invalid config at {}: {}", path.display(), e))
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("Config not found at {}, using defaults", path.display());
            PulseConfig::default()
        }
        Err(e) => {
            return Err(PulseError::Configuration(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    config.validate()?;
    Ok(config)
}
