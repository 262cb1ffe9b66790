//! History Service
//!
//! Read-only access to stored bars, cursors and the job ledger.
//! Nothing here ever triggers a sync.

use crate::db::models::{
    parse_date_only, parse_ts, Bar, SeriesCatalogEntry, SeriesCursor, SeriesId, StoredBar, SyncJob,
};
use crate::error::{AppError, Result};
use crate::services::quality_service::{QualityReport, QualityService};
use crate::state::AppState;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bars for one series and range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResult {
    pub series: SeriesId,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub bars: Vec<StoredBar>,
}

/// History service for business logic
pub struct HistoryService;

impl HistoryService {
    /// Get stored bars with `start <= ts <= end`, ascending.
    ///
    /// Bounds accept the same formats providers use (`2024-01-05`,
    /// `2024-01-05 09:30:00`, ...). An end given as a bare date includes
    /// every bar on that day.
    pub fn get_bars(
        state: &AppState,
        series: &SeriesId,
        start: &str,
        end: &str,
    ) -> Result<HistoryResult> {
        let (start, end) = parse_range(start, end)?;
        debug!("HistoryService::get_bars - {} {} to {}", series, start, end);

        let bars = state.stores.bars.query_range(series, start, end)?;

        Ok(HistoryResult {
            series: series.clone(),
            start,
            end,
            bars,
        })
    }

    /// Get the sync cursor, `None` if the series was never synced
    pub fn get_cursor(state: &AppState, series: &SeriesId) -> Result<Option<SeriesCursor>> {
        state.stores.cursors.get(series)
    }

    /// Catalog of every stored series
    pub fn list_series(state: &AppState) -> Result<Vec<SeriesCatalogEntry>> {
        state.stores.bars.list_series()
    }

    /// Most recent sync jobs, newest first
    pub fn recent_jobs(state: &AppState, series: &SeriesId, limit: usize) -> Result<Vec<SyncJob>> {
        state.stores.ledger.recent(series, limit)
    }

    /// Single sync job
    pub fn get_job(state: &AppState, job_id: i64) -> Result<SyncJob> {
        state
            .stores
            .ledger
            .get(job_id)?
            .ok_or_else(|| AppError::NotFound(format!("Sync job {} not found", job_id)))
    }

    /// Quality report over a stored range
    pub fn data_quality(
        state: &AppState,
        series: &SeriesId,
        start: &str,
        end: &str,
    ) -> Result<QualityReport> {
        let result = Self::get_bars(state, series, start, end)?;
        let bars: Vec<Bar> = result.bars.into_iter().map(|b| b.bar).collect();
        Ok(QualityService::assess(&bars))
    }
}

fn parse_range(start: &str, end: &str) -> Result<(NaiveDateTime, NaiveDateTime)> {
    let start_ts = parse_ts(start)
        .ok_or_else(|| AppError::Validation(format!("Invalid start: '{}'", start)))?;
    // A bare end date covers that whole day
    let end_ts = match parse_date_only(end) {
        Some(day) => day.and_hms_opt(23, 59, 59),
        None => parse_ts(end),
    }
    .ok_or_else(|| AppError::Validation(format!("Invalid end: '{}'", end)))?;

    if start_ts > end_ts {
        return Err(AppError::Validation(format!(
            "start {} is after end {}",
            start, end
        )));
    }

    Ok((start_ts, end_ts))
}
