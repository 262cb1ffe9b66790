//! In-memory store backends
//!
//! Same contracts as the DuckDB/SQLite stores. Used for throwaway runs and
//! for exercising the sync engine without touching disk.

use crate::db::models::*;
use crate::db::store::*;
use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Default)]
struct SeriesBars {
    bars: BTreeMap<NaiveDateTime, StoredBar>,
    last_updated: Option<DateTime<Utc>>,
}

/// Bar store kept in a map per series
#[derive(Default)]
pub struct MemoryBarStore {
    series: Mutex<BTreeMap<SeriesId, SeriesBars>>,
    fail_writes: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl MemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `upsert_batch` fail with a storage error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Hold the next `upsert_batch` for `delay` before it lands
    pub fn delay_next_write(&self, delay: Duration) {
        *self.write_delay.lock() = Some(delay);
    }
}

impl BarStore for MemoryBarStore {
    fn upsert_batch(
        &self,
        series: &SeriesId,
        bars: &[Bar],
        now: DateTime<Utc>,
    ) -> Result<UpsertCounts> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "bar store unavailable",
            )));
        }
        ensure_unique_ts(series, bars)?;

        let delay = self.write_delay.lock().take();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut all = self.series.lock();
        let entry = all.entry(series.clone()).or_default();

        let mut counts = UpsertCounts::default();
        for bar in bars {
            let stored = StoredBar {
                bar: bar.clone(),
                update_time: now,
            };
            if entry.bars.insert(bar.ts, stored).is_some() {
                counts.updated += 1;
            } else {
                counts.inserted += 1;
            }
        }
        entry.last_updated = Some(now);

        Ok(counts)
    }

    fn query_range(
        &self,
        series: &SeriesId,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<StoredBar>> {
        let all = self.series.lock();
        let entry = all
            .get(series)
            .ok_or_else(|| AppError::NotFound(format!("Series {} has never been synced", series)))?;

        if start > end {
            return Ok(Vec::new());
        }
        Ok(entry.bars.range(start..=end).map(|(_, b)| b.clone()).collect())
    }

    fn latest_ts(&self, series: &SeriesId) -> Result<Option<NaiveDateTime>> {
        let all = self.series.lock();
        Ok(all
            .get(series)
            .and_then(|e| e.bars.keys().next_back().copied()))
    }

    fn list_series(&self) -> Result<Vec<SeriesCatalogEntry>> {
        let all = self.series.lock();
        Ok(all
            .iter()
            .map(|(id, e)| SeriesCatalogEntry {
                series: id.clone(),
                row_count: e.bars.len() as i64,
                first_ts: e.bars.keys().next().copied(),
                last_ts: e.bars.keys().next_back().copied(),
                last_updated: e.last_updated.unwrap_or_default(),
            })
            .collect())
    }
}

/// Cursor store kept in a map
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<BTreeMap<SeriesId, SeriesCursor>>,
    fail_advance: AtomicBool,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `advance` fail with a storage error
    pub fn set_fail_advance(&self, fail: bool) {
        self.fail_advance.store(fail, Ordering::SeqCst);
    }
}

impl CursorStore for MemoryCursorStore {
    fn get(&self, series: &SeriesId) -> Result<Option<SeriesCursor>> {
        Ok(self.cursors.lock().get(series).cloned())
    }

    fn advance(
        &self,
        series: &SeriesId,
        mode: SyncMode,
        new_last_ts: Option<NaiveDateTime>,
        now: DateTime<Utc>,
    ) -> Result<SeriesCursor> {
        if self.fail_advance.load(Ordering::SeqCst) {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "cursor store unavailable",
            )));
        }
        let mut cursors = self.cursors.lock();
        let current = cursors.get(series).and_then(|c| c.last_ts);
        let cursor = SeriesCursor {
            series: series.clone(),
            last_ts: mode.next_watermark(current, new_last_ts),
            last_sync: now,
        };
        cursors.insert(series.clone(), cursor.clone());
        Ok(cursor)
    }

    fn list(&self) -> Result<Vec<SeriesCursor>> {
        Ok(self.cursors.lock().values().cloned().collect())
    }
}

/// Job ledger kept in a vector, ids start at 1
#[derive(Default)]
pub struct MemoryJobLedger {
    jobs: Mutex<Vec<SyncJob>>,
}

impl MemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobLedger for MemoryJobLedger {
    fn begin(&self, series: &SeriesId, mode: SyncMode, now: DateTime<Utc>) -> Result<i64> {
        let mut jobs = self.jobs.lock();
        let id = jobs.len() as i64 + 1;
        jobs.push(SyncJob {
            id,
            series: series.clone(),
            mode,
            start_time: now,
            end_time: None,
            status: JobStatus::Running,
            rows_fetched: 0,
            rows_written: 0,
            error: None,
        });
        Ok(id)
    }

    fn finish(&self, job_id: i64, finish: &JobFinish, now: DateTime<Utc>) -> Result<()> {
        finish.validate(job_id)?;

        let mut jobs = self.jobs.lock();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| AppError::NotFound(format!("Sync job {} not found", job_id)))?;

        if job.status.is_terminal() {
            tracing::error!(
                "Refusing second terminal update for job {} (already {})",
                job_id,
                job.status
            );
            return Err(AppError::Invariant(format!(
                "job {} was already finalized as '{}'",
                job_id, job.status
            )));
        }

        job.end_time = Some(now);
        job.status = finish.status;
        job.rows_fetched = finish.rows_fetched;
        job.rows_written = finish.rows_written;
        job.error = finish.error.clone();
        Ok(())
    }

    fn recent(&self, series: &SeriesId, limit: usize) -> Result<Vec<SyncJob>> {
        Ok(self
            .jobs
            .lock()
            .iter()
            .rev()
            .filter(|j| &j.series == series)
            .take(limit)
            .cloned()
            .collect())
    }

    fn get(&self, job_id: i64) -> Result<Option<SyncJob>> {
        Ok(self.jobs.lock().iter().find(|j| j.id == job_id).cloned())
    }

    fn abandon_running(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.jobs.lock();
        let mut count = 0;
        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
            job.status = JobStatus::Failed;
            job.end_time = Some(now);
            job.error = Some(ABANDONED_JOB_ERROR.to_string());
            count += 1;
        }
        Ok(count)
    }
}

/// Series registry kept in a set
#[derive(Default)]
pub struct MemorySeriesRegistry {
    series: Mutex<BTreeSet<SeriesId>>,
}

impl MemorySeriesRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeriesRegistry for MemorySeriesRegistry {
    fn register(&self, series: &SeriesId, _now: DateTime<Utc>) -> Result<bool> {
        Ok(self.series.lock().insert(series.clone()))
    }

    fn unregister(&self, series: &SeriesId) -> Result<bool> {
        Ok(self.series.lock().remove(series))
    }

    fn list(&self) -> Result<Vec<SeriesId>> {
        Ok(self.series.lock().iter().cloned().collect())
    }
}
