//! Sync job ledger

use crate::db::models::{
    format_instant, parse_instant, JobFinish, JobStatus, SeriesId, SyncJob, SyncMode,
};
use crate::db::store::ABANDONED_JOB_ERROR;
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

const JOB_COLUMNS: &str = "id, asset_type, symbol, period, mode, start_time, end_time, status,
                           rows_fetched, rows_written, error";

struct RawJob {
    id: i64,
    asset_type: String,
    symbol: String,
    period: String,
    mode: String,
    start_time: String,
    end_time: Option<String>,
    status: String,
    rows_fetched: i64,
    rows_written: i64,
    error: Option<String>,
}

impl RawJob {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            asset_type: row.get(1)?,
            symbol: row.get(2)?,
            period: row.get(3)?,
            mode: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
            status: row.get(7)?,
            rows_fetched: row.get(8)?,
            rows_written: row.get(9)?,
            error: row.get(10)?,
        })
    }

    fn into_job(self) -> Result<SyncJob> {
        Ok(SyncJob {
            id: self.id,
            series: SeriesId {
                asset_type: self.asset_type,
                symbol: self.symbol,
                period: self.period,
            },
            mode: SyncMode::parse(&self.mode)?,
            start_time: parse_instant(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_instant).transpose()?,
            status: JobStatus::parse(&self.status)?,
            rows_fetched: self.rows_fetched,
            rows_written: self.rows_written,
            error: self.error,
        })
    }
}

/// Append a running job and return its id
pub fn begin_job(
    conn: &Connection,
    series: &SeriesId,
    mode: SyncMode,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_jobs (asset_type, symbol, period, mode, start_time, status)
         VALUES (?, ?, ?, ?, ?, 'running')",
        rusqlite::params![
            series.asset_type,
            series.symbol,
            series.period,
            mode.as_str(),
            format_instant(&now),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Write the terminal update for a running job
pub fn finish_job(
    conn: &Connection,
    job_id: i64,
    finish: &JobFinish,
    now: DateTime<Utc>,
) -> Result<()> {
    finish.validate(job_id)?;

    let changed = conn.execute(
        "UPDATE sync_jobs
         SET end_time = ?, status = ?, rows_fetched = ?, rows_written = ?, error = ?
         WHERE id = ? AND status = 'running'",
        rusqlite::params![
            format_instant(&now),
            finish.status.as_str(),
            finish.rows_fetched,
            finish.rows_written,
            finish.error,
            job_id,
        ],
    )?;

    if changed == 0 {
        return match get_job(conn, job_id)? {
            None => Err(AppError::NotFound(format!("Sync job {} not found", job_id))),
            Some(job) => {
                tracing::error!(
                    "Refusing second terminal update for job {} (already {})",
                    job_id,
                    job.status
                );
                Err(AppError::Invariant(format!(
                    "job {} was already finalized as '{}'",
                    job_id, job.status
                )))
            }
        };
    }

    Ok(())
}

/// Most recent jobs for a series, newest first
pub fn recent_jobs(conn: &Connection, series: &SeriesId, limit: usize) -> Result<Vec<SyncJob>> {
    let sql = format!(
        "SELECT {} FROM sync_jobs
         WHERE asset_type = ? AND symbol = ? AND period = ?
         ORDER BY id DESC LIMIT ?",
        JOB_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;

    let raws = stmt
        .query_map(
            rusqlite::params![series.asset_type, series.symbol, series.period, limit as i64],
            RawJob::from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raws.into_iter().map(RawJob::into_job).collect()
}

/// Get a job by id
pub fn get_job(conn: &Connection, job_id: i64) -> Result<Option<SyncJob>> {
    let sql = format!("SELECT {} FROM sync_jobs WHERE id = ?", JOB_COLUMNS);
    match conn.query_row(&sql, [job_id], RawJob::from_row) {
        Ok(raw) => raw.into_job().map(Some),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Mark every job still `running` as failed
pub fn abandon_running(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE sync_jobs SET end_time = ?, status = 'failed', error = ?
         WHERE status = 'running'",
        rusqlite::params![format_instant(&now), ABANDONED_JOB_ERROR],
    )?;

    if changed > 0 {
        tracing::warn!("Marked {} interrupted sync job(s) as failed", changed);
    }

    Ok(changed)
}
