//! Series synchronization engine
//!
//! Drives one attempt per series: lease, permit, ledger row, fetch, merge,
//! durable write, cursor advance, terminal ledger update. The sweep selects
//! due series and runs attempts concurrently, bounded by the worker pool.

pub mod clock;
pub mod lease;
pub mod merger;
pub mod retry;

#[cfg(test)]
mod tests;

use crate::db::models::{
    format_ts, JobFinish, JobStatus, SeriesCursor, SeriesId, SyncMode, UpsertCounts,
};
use crate::db::sqlite::SyncConfig;
use crate::db::store::{BarStore, CursorStore, JobLedger, SeriesRegistry};
use crate::error::{AppError, Result};
use crate::providers::{FetchError, FetcherRegistry};
use chrono::{DateTime, NaiveDateTime, Utc};
use clock::Clock;
use futures_util::{stream, StreamExt};
use lease::LeaseTable;
use merger::{Merger, PreparedBatch};
use retry::{RetryPolicy, SyncDecision};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Engine knobs derived from [`SyncConfig`]
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub concurrency: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1) as usize,
            timeout: config.timeout(),
            retry: config.retry_policy(),
        }
    }
}

/// Store handles shared by the engine and the query side
#[derive(Clone)]
pub struct SyncStores {
    pub bars: Arc<dyn BarStore>,
    pub cursors: Arc<dyn CursorStore>,
    pub ledger: Arc<dyn JobLedger>,
    pub registry: Arc<dyn SeriesRegistry>,
}

/// What one finished attempt did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub job_id: i64,
    pub series: SeriesId,
    pub mode: SyncMode,
    pub status: JobStatus,
    pub rows_fetched: i64,
    pub rows_written: i64,
    pub inserted: usize,
    pub updated: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub repaired: usize,
    /// Cursor watermark after the attempt
    pub last_ts: Option<NaiveDateTime>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Another attempt holds the series lease; nothing was recorded
    Skipped { series: SeriesId },
    Completed(SyncReport),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Skipped { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackedOff {
    pub series: SeriesId,
    pub until: DateTime<Utc>,
    pub consecutive_failures: u32,
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepSummary {
    pub considered: usize,
    pub fresh: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub backed_off: Vec<BackedOff>,
    /// Series whose attempt could not be run or recorded
    pub errors: Vec<String>,
}

/// Bars written by a fetch-merge-write
struct Written {
    rows_fetched: usize,
    counts: UpsertCounts,
    max_ts: Option<NaiveDateTime>,
    rejected: usize,
    duplicates: usize,
    repaired: usize,
    notes: Vec<String>,
    /// Set when the write only finished after the deadline
    late: Option<String>,
}

/// Fetched and merged bars, not yet written
struct Prepared {
    rows_fetched: usize,
    batch: PreparedBatch,
    notes: Vec<String>,
}

/// An attempt that ends as failed
struct Failure {
    rows_fetched: usize,
    rejected: usize,
    message: String,
}

impl Failure {
    fn new(message: String) -> Self {
        Self {
            rows_fetched: 0,
            rejected: 0,
            message,
        }
    }

    fn fetch(err: FetchError) -> Self {
        let kind = if err.is_transient() { "transient" } else { "permanent" };
        Self::new(format!("fetch failed ({}): {}", kind, err))
    }
}

pub struct SyncEngine {
    stores: SyncStores,
    fetchers: FetcherRegistry,
    merger: Merger,
    clock: Arc<dyn Clock>,
    leases: Arc<LeaseTable>,
    permits: Arc<Semaphore>,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(
        stores: SyncStores,
        fetchers: FetcherRegistry,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        let merger = Merger::new(Arc::clone(&stores.bars));
        let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));

        Self {
            stores,
            fetchers,
            merger,
            clock,
            leases: LeaseTable::new(),
            permits,
            settings,
        }
    }

    pub fn stores(&self) -> &SyncStores {
        &self.stores
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_syncing(&self, series: &SeriesId) -> bool {
        self.leases.is_held(series)
    }

    /// Run one sync attempt for `series`.
    ///
    /// Returns `Skipped` without touching the ledger if the series is
    /// already being synced. Fetch, merge and storage failures end up in the
    /// ledger and the report; only ledger failures and invariant violations
    /// are returned as errors.
    ///
    /// The deadline starts once the lease is held and covers the wait for a
    /// worker permit, the fetch, the merge and the write. A write that is
    /// already running when the deadline passes is awaited before the lease
    /// is released, so a later attempt can never be overwritten by it.
    pub async fn sync_one(&self, series: &SeriesId, mode: SyncMode) -> Result<SyncOutcome> {
        let Some(lease) = self.leases.try_acquire(series) else {
            tracing::debug!("Sync for {} skipped, lease held", series);
            return Ok(SyncOutcome::Skipped {
                series: series.clone(),
            });
        };
        let deadline = Instant::now() + self.settings.timeout;

        let permit = match tokio::time::timeout_at(deadline, self.permits.acquire()).await {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_)) => return Err(AppError::Internal("Sync worker pool closed".to_string())),
            Err(_) => None,
        };

        let job_id = self.stores.ledger.begin(series, mode, self.clock.now())?;
        tracing::debug!("Job {} started: {} sync of {}", job_id, mode, series);

        let result = match permit {
            Some(_permit) => self.attempt(series, mode, deadline).await,
            None => Err(Failure::new(self.timed_out("waiting for a worker"))),
        };

        let report = self.conclude(job_id, series, mode, result)?;
        lease.release()?;

        match report.status {
            JobStatus::Success => tracing::info!(
                "Job {} {} {}: {} fetched, {} inserted, {} updated",
                job_id, series, report.status, report.rows_fetched, report.inserted, report.updated
            ),
            _ => tracing::warn!(
                "Job {} {} {}: {}",
                job_id,
                series,
                report.status,
                report.error.as_deref().unwrap_or("")
            ),
        }

        Ok(SyncOutcome::Completed(report))
    }

    fn timed_out(&self, stage: &str) -> String {
        format!(
            "timed out after {}s {}",
            self.settings.timeout.as_secs_f64(),
            stage
        )
    }

    /// Fetch and merge under the deadline, then write
    async fn attempt(
        &self,
        series: &SeriesId,
        mode: SyncMode,
        deadline: Instant,
    ) -> std::result::Result<Written, Failure> {
        let prepared = tokio::time::timeout_at(deadline, self.fetch_and_prepare(series, mode))
            .await
            .map_err(|_| Failure::new(self.timed_out("fetching")))??;

        let Prepared {
            rows_fetched,
            batch,
            notes,
        } = prepared;
        let max_ts = batch.max_ts();
        let rejected = batch.rejected.len();
        let (duplicates, repaired) = (batch.duplicates, batch.repaired);

        // Once started, the write runs to completion
        let mut write = self.merger.spawn_write(series, batch.bars, self.clock.now());
        let (joined, late) = match tokio::time::timeout_at(deadline, &mut write).await {
            Ok(joined) => (joined, None),
            Err(_) => {
                tracing::warn!(
                    "Deadline for {} passed during the bar write, waiting for it to finish",
                    series
                );
                (write.await, Some(self.timed_out("writing bars")))
            }
        };

        let counts = merger::join_write(joined).map_err(|e| Failure {
            rows_fetched,
            rejected,
            message: format!("storage write failed: {}", e),
        })?;

        Ok(Written {
            rows_fetched,
            counts,
            max_ts,
            rejected,
            duplicates,
            repaired,
            notes,
            late,
        })
    }

    async fn fetch_and_prepare(
        &self,
        series: &SeriesId,
        mode: SyncMode,
    ) -> std::result::Result<Prepared, Failure> {
        let cursor = self
            .stores
            .cursors
            .get(series)
            .map_err(|e| Failure::new(format!("cursor read failed: {}", e)))?;
        self.check_cursor(series, cursor.as_ref());

        let fetcher = self.fetchers.get(&series.asset_type).ok_or_else(|| {
            Failure::new(format!(
                "no fetcher registered for asset type '{}'",
                series.asset_type
            ))
        })?;

        let window = mode.window(cursor.as_ref());
        tracing::debug!("Fetching {} via {} ({:?})", series, fetcher.id(), window);

        let outcome = fetcher.fetch(series, window).await.map_err(Failure::fetch)?;
        let rows_fetched = outcome.bars.len();

        let batch = self.merger.prepare(&outcome.bars, self.clock.now());
        let rejection = batch.rejection_summary(rows_fetched);

        if batch.bars.is_empty() && rows_fetched > 0 {
            return Err(Failure {
                rows_fetched,
                rejected: batch.rejected.len(),
                message: rejection
                    .unwrap_or_else(|| format!("all {} bars rejected", rows_fetched)),
            });
        }
        if batch.bars.is_empty() {
            if let Some(reason) = &outcome.truncated {
                return Err(Failure::new(format!(
                    "truncated fetch returned no bars: {}",
                    reason
                )));
            }
        }

        let mut notes = Vec::new();
        if let Some(reason) = outcome.truncated {
            notes.push(format!("truncated fetch: {}", reason));
        }
        notes.extend(rejection);

        Ok(Prepared {
            rows_fetched,
            batch,
            notes,
        })
    }

    /// Cursor and store should agree on the newest bar
    fn check_cursor(&self, series: &SeriesId, cursor: Option<&SeriesCursor>) {
        let Some(cursor) = cursor else {
            return;
        };
        match self.stores.bars.latest_ts(series) {
            Ok(latest) if latest != cursor.last_ts => tracing::warn!(
                "Cursor for {} is at {} but the store's latest bar is {}",
                series,
                cursor.last_ts.as_ref().map(format_ts).unwrap_or_else(|| "none".into()),
                latest.as_ref().map(format_ts).unwrap_or_else(|| "none".into())
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not read latest ts for {}: {}", series, e),
        }
    }

    fn current_watermark(&self, series: &SeriesId) -> Option<NaiveDateTime> {
        self.stores
            .cursors
            .get(series)
            .ok()
            .flatten()
            .and_then(|c| c.last_ts)
    }

    /// Advance the cursor after a durable write and write the terminal ledger row
    fn conclude(
        &self,
        job_id: i64,
        series: &SeriesId,
        mode: SyncMode,
        result: std::result::Result<Written, Failure>,
    ) -> Result<SyncReport> {
        let mut report = SyncReport {
            job_id,
            series: series.clone(),
            mode,
            status: JobStatus::Failed,
            rows_fetched: 0,
            rows_written: 0,
            inserted: 0,
            updated: 0,
            rejected: 0,
            duplicates: 0,
            repaired: 0,
            last_ts: None,
            error: None,
        };

        match result {
            Ok(mut written) => {
                report.rows_fetched = written.rows_fetched as i64;
                report.rows_written = written.counts.written() as i64;
                report.inserted = written.counts.inserted;
                report.updated = written.counts.updated;
                report.rejected = written.rejected;
                report.duplicates = written.duplicates;
                report.repaired = written.repaired;

                // Bars that are stored but not covered by the cursor make the job partial
                let stuck = match written.late.take() {
                    Some(late) => Some(format!("{}; cursor not advanced", late)),
                    None => match self
                        .stores
                        .cursors
                        .advance(series, mode, written.max_ts, self.clock.now())
                    {
                        Ok(cursor) => {
                            report.last_ts = cursor.last_ts;
                            None
                        }
                        Err(e) => Some(format!("cursor update failed after write: {}", e)),
                    },
                };

                match stuck {
                    None if written.notes.is_empty() => report.status = JobStatus::Success,
                    None => {
                        report.status = JobStatus::Partial;
                        report.error = Some(written.notes.join("; "));
                    }
                    Some(reason) => {
                        report.status = if report.rows_written > 0 {
                            JobStatus::Partial
                        } else {
                            JobStatus::Failed
                        };
                        written.notes.insert(0, reason);
                        report.error = Some(written.notes.join("; "));
                        report.last_ts = self.current_watermark(series);
                    }
                }
            }
            Err(failure) => {
                report.rows_fetched = failure.rows_fetched as i64;
                report.rejected = failure.rejected;
                report.error = Some(failure.message);
                report.last_ts = self.current_watermark(series);
            }
        }

        let finish = JobFinish {
            status: report.status,
            rows_fetched: report.rows_fetched,
            rows_written: report.rows_written,
            error: report.error.clone(),
        };
        self.stores.ledger.finish(job_id, &finish, self.clock.now())?;

        Ok(report)
    }

    /// Series whose last sync is at least `staleness` old, or that were never synced
    pub fn due_series(
        &self,
        now: DateTime<Utc>,
        staleness: chrono::Duration,
    ) -> Result<(Vec<SeriesId>, usize)> {
        let cursors: HashMap<SeriesId, SeriesCursor> = self
            .stores
            .cursors
            .list()?
            .into_iter()
            .map(|c| (c.series.clone(), c))
            .collect();

        let mut known: BTreeSet<SeriesId> = self.stores.registry.list()?.into_iter().collect();
        known.extend(cursors.keys().cloned());

        let due: Vec<SeriesId> = known
            .iter()
            .filter(|s| match cursors.get(*s) {
                None => true,
                Some(c) => now - c.last_sync >= staleness,
            })
            .cloned()
            .collect();

        Ok((due, known.len()))
    }

    /// Sweep: sync every due series incrementally.
    ///
    /// A failing series never aborts the sweep; only failing to enumerate
    /// the known series does.
    pub async fn sync_due(
        &self,
        now: DateTime<Utc>,
        staleness: chrono::Duration,
    ) -> Result<SweepSummary> {
        let (due, considered) = self.due_series(now, staleness)?;
        let mut summary = SweepSummary {
            considered,
            fresh: considered - due.len(),
            ..Default::default()
        };

        let policy = self.settings.retry;
        let mut dispatch = Vec::with_capacity(due.len());
        for series in due {
            let recent = match self.stores.ledger.recent(&series, policy.history_window()) {
                Ok(recent) => recent,
                Err(e) => {
                    summary.errors.push(format!("{}: {}", series, e));
                    continue;
                }
            };
            match retry::decide(&recent, now, &policy) {
                SyncDecision::Proceed => dispatch.push(series),
                SyncDecision::BackOff {
                    until,
                    consecutive_failures,
                } => {
                    tracing::debug!(
                        "Backing off {} until {} after {} failures",
                        series,
                        until,
                        consecutive_failures
                    );
                    summary.backed_off.push(BackedOff {
                        series,
                        until,
                        consecutive_failures,
                    });
                }
            }
        }

        summary.dispatched = dispatch.len();
        tracing::info!(
            "Sweep: {} known, {} due, {} backed off, dispatching {}",
            summary.considered,
            considered - summary.fresh,
            summary.backed_off.len(),
            summary.dispatched
        );

        let mut results = stream::iter(dispatch.into_iter().map(|series| async move {
            let outcome = self.sync_one(&series, SyncMode::Incremental).await;
            (series, outcome)
        }))
        .buffer_unordered(self.settings.concurrency.max(1));

        while let Some((series, outcome)) = results.next().await {
            match outcome {
                Ok(SyncOutcome::Skipped { .. }) => summary.skipped += 1,
                Ok(SyncOutcome::Completed(report)) => match report.status {
                    JobStatus::Success => summary.succeeded += 1,
                    JobStatus::Partial => summary.partial += 1,
                    _ => summary.failed += 1,
                },
                Err(e) => {
                    tracing::error!("Sync of {} could not be recorded: {}", series, e);
                    summary.errors.push(format!("{}: {}", series, e));
                }
            }
        }

        tracing::info!(
            "Sweep finished: {} succeeded, {} partial, {} failed, {} skipped",
            summary.succeeded,
            summary.partial,
            summary.failed,
            summary.skipped
        );

        Ok(summary)
    }
}
