//! SQLite database module
//!
//! Holds the engine's bookkeeping: series cursors, the sync job ledger,
//! the tracked-series registry and the sync settings row.

pub mod models;
mod cursor;
mod jobs;
mod migrations;
mod series;
mod settings;

use crate::db::models::{JobFinish, SeriesCursor, SeriesId, SyncJob, SyncMode};
use crate::db::store::{CursorStore, JobLedger, SeriesRegistry};
use crate::error::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
pub use models::{SyncConfig, SyncConfigUpdate};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

/// SQLite database wrapper
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Create new SQLite database connection
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        // Run migrations
        db.run_migrations()?;

        Ok(db)
    }

    /// In-memory database, used by tests and throwaway runs
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();
        migrations::run_migrations(&conn)
    }

    // ========== Settings Methods ==========

    /// Get sync settings
    pub fn get_sync_config(&self) -> Result<SyncConfig> {
        let conn = self.conn.lock();
        settings::get_sync_config(&conn)
    }

    /// Update sync settings
    pub fn update_sync_config(&self, update: &SyncConfigUpdate) -> Result<SyncConfig> {
        let conn = self.conn.lock();
        settings::update_sync_config(&conn, update)
    }
}

// ========== Cursor Methods ==========

impl CursorStore for SqliteDb {
    fn get(&self, series: &SeriesId) -> Result<Option<SeriesCursor>> {
        let conn = self.conn.lock();
        cursor::get_cursor(&conn, series)
    }

    fn advance(
        &self,
        series: &SeriesId,
        mode: SyncMode,
        new_last_ts: Option<NaiveDateTime>,
        now: DateTime<Utc>,
    ) -> Result<SeriesCursor> {
        let mut conn = self.conn.lock();
        cursor::advance_cursor(&mut conn, series, mode, new_last_ts, now)
    }

    fn list(&self) -> Result<Vec<SeriesCursor>> {
        let conn = self.conn.lock();
        cursor::list_cursors(&conn)
    }
}

// ========== Job Ledger Methods ==========

impl JobLedger for SqliteDb {
    fn begin(&self, series: &SeriesId, mode: SyncMode, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock();
        jobs::begin_job(&conn, series, mode, now)
    }

    fn finish(&self, job_id: i64, finish: &JobFinish, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        jobs::finish_job(&conn, job_id, finish, now)
    }

    fn recent(&self, series: &SeriesId, limit: usize) -> Result<Vec<SyncJob>> {
        let conn = self.conn.lock();
        jobs::recent_jobs(&conn, series, limit)
    }

    fn get(&self, job_id: i64) -> Result<Option<SyncJob>> {
        let conn = self.conn.lock();
        jobs::get_job(&conn, job_id)
    }

    fn abandon_running(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        jobs::abandon_running(&conn, now)
    }
}

// ========== Series Registry Methods ==========

impl SeriesRegistry for SqliteDb {
    fn register(&self, series: &SeriesId, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        series::register_series(&conn, series, now)
    }

    fn unregister(&self, series: &SeriesId) -> Result<bool> {
        let conn = self.conn.lock();
        series::unregister_series(&conn, series)
    }

    fn list(&self) -> Result<Vec<SeriesId>> {
        let conn = self.conn.lock();
        series::list_series(&conn)
    }
}
