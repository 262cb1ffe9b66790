//! Daily sync scheduler
//!
//! Sweeps every due series once a day at the configured local time
//! (default 15:10 Asia/Shanghai, after the futures close). With a series
//! source attached, the tracked series are refreshed before each sweep.

use crate::db::models::SeriesId;
use crate::error::Result;
use crate::providers::SeriesSource;
use crate::services::SyncService;
use crate::state::AppState;
use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Re-check interval while auto sync is disabled
const DISABLED_POLL: Duration = Duration::from_secs(15 * 60);

/// Daily sweep scheduler
pub struct DailySyncScheduler {
    state: Arc<AppState>,
    service: SyncService,
    source: Option<Arc<dyn SeriesSource>>,
    defaults: Vec<SeriesId>,
}

impl DailySyncScheduler {
    pub fn new(state: Arc<AppState>, service: SyncService) -> Self {
        Self {
            state,
            service,
            source: None,
            defaults: Vec::new(),
        }
    }

    /// Refresh tracked series from `source` before every sweep, seeding an
    /// empty registry with `defaults` when the source has nothing
    pub fn with_series_source(
        mut self,
        source: Arc<dyn SeriesSource>,
        defaults: Vec<SeriesId>,
    ) -> Self {
        self.source = Some(source);
        self.defaults = defaults;
        self
    }

    /// Time from `now` until the next `hour:minute` in `tz`
    pub fn duration_until(now: DateTime<Utc>, hour: u32, minute: u32, tz: Tz) -> Result<Duration> {
        let target_time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
            crate::error::AppError::Config(format!("Invalid sweep time {:02}:{:02}", hour, minute))
        })?;

        let today = now.with_timezone(&tz).date_naive();
        // A DST gap can swallow the target on one day, never on two in a row
        for offset in 0..3 {
            let Some(day) = today.checked_add_days(Days::new(offset)) else {
                break;
            };
            let Some(target) = tz.from_local_datetime(&day.and_time(target_time)).earliest() else {
                continue;
            };
            let target = target.with_timezone(&Utc);
            if target > now {
                return Ok((target - now).to_std().unwrap_or_default());
            }
        }

        Err(crate::error::AppError::Internal(format!(
            "No upcoming {:02}:{:02} in {}",
            hour, minute, tz
        )))
    }

    /// Start the scheduler on the current runtime
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Daily sync scheduler started");

            loop {
                let config = self.state.get_sync_config();
                if !config.auto_sync_enabled {
                    tokio::time::sleep(DISABLED_POLL).await;
                    continue;
                }

                let wait = match config
                    .timezone()
                    .and_then(|tz| Self::duration_until(Utc::now(), config.sweep_hour, config.sweep_minute, tz))
                {
                    Ok(wait) => wait,
                    Err(e) => {
                        error!("Daily sync schedule is invalid: {}", e);
                        tokio::time::sleep(DISABLED_POLL).await;
                        continue;
                    }
                };

                info!(
                    "Next daily sync in {} hours {} minutes",
                    wait.as_secs() / 3600,
                    (wait.as_secs() % 3600) / 60
                );
                tokio::time::sleep(wait).await;

                // Settings may have changed while sleeping
                let config = self.state.get_sync_config();
                if !config.auto_sync_enabled {
                    continue;
                }
                self.run_sweep(config.staleness()).await;
            }
        })
    }

    async fn run_sweep(&self, staleness: chrono::Duration) {
        info!("Executing daily sync");

        if let Some(source) = &self.source {
            if let Err(e) = self
                .service
                .refresh_registry(source.as_ref(), &self.defaults)
                .await
            {
                warn!("Could not refresh tracked series: {}", e);
            }
        }

        let ticket = match self.service.request_sweep(staleness) {
            Ok(ticket) => ticket,
            Err(e) => {
                error!("Could not queue daily sync: {}", e);
                return;
            }
        };

        match ticket.wait().await {
            Ok(summary) => info!(
                "Daily sync completed: {} succeeded, {} partial, {} failed, {} backed off",
                summary.succeeded,
                summary.partial,
                summary.failed,
                summary.backed_off.len()
            ),
            Err(e) => warn!("Daily sync failed: {}", e),
        }
    }
}
