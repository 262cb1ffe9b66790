//! SQLite database models

use crate::error::{AppError, Result};
use crate::sync::retry::RetryPolicy;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration, stored as the single `sync_settings` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub auto_sync_enabled: bool,
    pub sweep_hour: u32,
    pub sweep_minute: u32,
    pub timezone: String,
    /// Maximum sync jobs running at once
    pub concurrency: u32,
    /// Bound on fetch plus write for one job
    pub timeout_secs: u64,
    /// A series is due when its last sync is older than this
    pub staleness_secs: i64,
    pub failure_threshold: u32,
    pub base_backoff_secs: i64,
    pub max_backoff_secs: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_enabled: true,
            sweep_hour: 15,
            sweep_minute: 10,
            timezone: "Asia/Shanghai".to_string(),
            concurrency: 4,
            timeout_secs: 120,
            staleness_secs: 12 * 60 * 60,
            failure_threshold: 3,
            base_backoff_secs: 5 * 60,
            max_backoff_secs: 6 * 60 * 60,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sweep_hour > 23 || self.sweep_minute > 59 {
            return Err(AppError::Config(format!(
                "Invalid sweep time {:02}:{:02}",
                self.sweep_hour, self.sweep_minute
            )));
        }
        if self.concurrency == 0 {
            return Err(AppError::Config("concurrency must be at least 1".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(AppError::Config("timeout_secs must be positive".to_string()));
        }
        if self.staleness_secs < 0 {
            return Err(AppError::Config("staleness_secs must not be negative".to_string()));
        }
        if self.base_backoff_secs < 0 || self.max_backoff_secs < self.base_backoff_secs {
            return Err(AppError::Config(format!(
                "Invalid backoff range {}s..{}s",
                self.base_backoff_secs, self.max_backoff_secs
            )));
        }
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| AppError::Config(format!("Unknown timezone: {}", self.timezone)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            failure_threshold: self.failure_threshold,
            base_backoff: chrono::Duration::seconds(self.base_backoff_secs),
            max_backoff: chrono::Duration::seconds(self.max_backoff_secs),
        }
    }
}

/// Partial update of [`SyncConfig`]; `None` leaves the field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfigUpdate {
    pub auto_sync_enabled: Option<bool>,
    pub sweep_hour: Option<u32>,
    pub sweep_minute: Option<u32>,
    pub timezone: Option<String>,
    pub concurrency: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub staleness_secs: Option<i64>,
    pub failure_threshold: Option<u32>,
    pub base_backoff_secs: Option<i64>,
    pub max_backoff_secs: Option<i64>,
}

impl SyncConfigUpdate {
    /// Apply the update on top of `current`
    pub fn apply(&self, current: &SyncConfig) -> SyncConfig {
        SyncConfig {
            auto_sync_enabled: self.auto_sync_enabled.unwrap_or(current.auto_sync_enabled),
            sweep_hour: self.sweep_hour.unwrap_or(current.sweep_hour),
            sweep_minute: self.sweep_minute.unwrap_or(current.sweep_minute),
            timezone: self.timezone.clone().unwrap_or_else(|| current.timezone.clone()),
            concurrency: self.concurrency.unwrap_or(current.concurrency),
            timeout_secs: self.timeout_secs.unwrap_or(current.timeout_secs),
            staleness_secs: self.staleness_secs.unwrap_or(current.staleness_secs),
            failure_threshold: self.failure_threshold.unwrap_or(current.failure_threshold),
            base_backoff_secs: self.base_backoff_secs.unwrap_or(current.base_backoff_secs),
            max_backoff_secs: self.max_backoff_secs.unwrap_or(current.max_backoff_secs),
        }
    }
}
