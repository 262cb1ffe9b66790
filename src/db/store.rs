//! Storage seams used by the sync engine
//!
//! The engine only talks to these traits, so the DuckDB/SQLite backends and
//! the in-memory backends in [`crate::db::memory`] are interchangeable.

use crate::db::models::*;
use crate::error::Result;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Durable bar storage with idempotent batch writes
pub trait BarStore: Send + Sync {
    /// Insert-or-overwrite every bar of the batch in one transaction.
    ///
    /// An empty batch still registers the series as known.
    fn upsert_batch(
        &self,
        series: &SeriesId,
        bars: &[Bar],
        now: DateTime<Utc>,
    ) -> Result<UpsertCounts>;

    /// Bars with `start <= ts <= end`, ascending. `NotFound` if the series
    /// was never synced.
    fn query_range(
        &self,
        series: &SeriesId,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<StoredBar>>;

    /// Highest persisted timestamp for the series
    fn latest_ts(&self, series: &SeriesId) -> Result<Option<NaiveDateTime>>;

    /// Catalog of every series known to the store
    fn list_series(&self) -> Result<Vec<SeriesCatalogEntry>>;
}

/// Per-series synchronization watermark
pub trait CursorStore: Send + Sync {
    fn get(&self, series: &SeriesId) -> Result<Option<SeriesCursor>>;

    /// Move the watermark according to `mode` and stamp `last_sync`.
    /// Creates the cursor on first use.
    fn advance(
        &self,
        series: &SeriesId,
        mode: SyncMode,
        new_last_ts: Option<NaiveDateTime>,
        now: DateTime<Utc>,
    ) -> Result<SeriesCursor>;

    fn list(&self) -> Result<Vec<SeriesCursor>>;
}

/// Append-then-finalize log of sync attempts
pub trait JobLedger: Send + Sync {
    fn begin(&self, series: &SeriesId, mode: SyncMode, now: DateTime<Utc>) -> Result<i64>;

    /// Write the single terminal update. A second call is an invariant violation.
    fn finish(&self, job_id: i64, finish: &JobFinish, now: DateTime<Utc>) -> Result<()>;

    /// Most recent jobs for a series, newest first
    fn recent(&self, series: &SeriesId, limit: usize) -> Result<Vec<SyncJob>>;

    fn get(&self, job_id: i64) -> Result<Option<SyncJob>>;

    /// Finalize jobs left `running` by a previous process as failed
    fn abandon_running(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Series the operator wants kept current
pub trait SeriesRegistry: Send + Sync {
    /// Returns false if the series was already registered
    fn register(&self, series: &SeriesId, now: DateTime<Utc>) -> Result<bool>;

    /// Returns false if the series was not registered
    fn unregister(&self, series: &SeriesId) -> Result<bool>;

    fn list(&self) -> Result<Vec<SeriesId>>;
}

/// Error text stored for jobs recovered by `abandon_running`
pub const ABANDONED_JOB_ERROR: &str = "abandoned: process exited before the job finished";

/// Reject batches that carry the same timestamp twice; the merger dedups
/// before writing, so a duplicate here is a caller bug.
pub fn ensure_unique_ts(series: &SeriesId, bars: &[Bar]) -> Result<()> {
    let mut seen = std::collections::HashSet::with_capacity(bars.len());
    for bar in bars {
        if !seen.insert(bar.ts) {
            return Err(crate::error::AppError::Validation(format!(
                "Batch for {} contains duplicate ts {}",
                series,
                format_ts(&bar.ts)
            )));
        }
    }
    Ok(())
}
