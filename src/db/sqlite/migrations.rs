//! SQLite database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Run all database migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    // Create migrations table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    // Run each migration
    run_migration(conn, "001_series_cursor", CREATE_SERIES_CURSOR_TABLE)?;
    run_migration(conn, "002_sync_jobs", CREATE_SYNC_JOBS_TABLE)?;
    run_migration(conn, "003_tracked_series", CREATE_TRACKED_SERIES_TABLE)?;
    run_migration(conn, "004_sync_settings", CREATE_SYNC_SETTINGS_TABLE)?;

    tracing::info!("Database migrations completed");
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
    // Check if migration already applied
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?)",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        tracing::info!("Running migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO migrations (name) VALUES (?)",
            [name],
        )?;
    }

    Ok(())
}

const CREATE_SERIES_CURSOR_TABLE: &str = r#"
CREATE TABLE series_cursor (
    asset_type TEXT NOT NULL,
    symbol TEXT NOT NULL,
    period TEXT NOT NULL,
    last_ts TEXT,
    last_sync TEXT NOT NULL,
    PRIMARY KEY (asset_type, symbol, period)
);
"#;

/// One row per sync attempt; `end_time` stays NULL while running
const CREATE_SYNC_JOBS_TABLE: &str = r#"
CREATE TABLE sync_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_type TEXT NOT NULL,
    symbol TEXT NOT NULL,
    period TEXT NOT NULL,
    mode TEXT NOT NULL CHECK (mode IN ('full', 'incremental')),
    start_time TEXT NOT NULL,
    end_time TEXT,
    status TEXT NOT NULL DEFAULT 'running'
        CHECK (status IN ('running', 'success', 'partial', 'failed')),
    rows_fetched INTEGER NOT NULL DEFAULT 0,
    rows_written INTEGER NOT NULL DEFAULT 0,
    error TEXT
);

CREATE INDEX idx_sync_jobs_series ON sync_jobs(asset_type, symbol, period, id DESC);
CREATE INDEX idx_sync_jobs_status ON sync_jobs(status);
"#;

const CREATE_TRACKED_SERIES_TABLE: &str = r#"
CREATE TABLE tracked_series (
    asset_type TEXT NOT NULL,
    symbol TEXT NOT NULL,
    period TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (asset_type, symbol, period)
);
"#;

/// Single-row engine configuration; defaults sweep after the 15:00 close
const CREATE_SYNC_SETTINGS_TABLE: &str = r#"
CREATE TABLE sync_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    auto_sync_enabled INTEGER NOT NULL DEFAULT 1,
    sweep_hour INTEGER NOT NULL DEFAULT 15,
    sweep_minute INTEGER NOT NULL DEFAULT 10,
    timezone TEXT NOT NULL DEFAULT 'Asia/Shanghai',
    concurrency INTEGER NOT NULL DEFAULT 4,
    timeout_secs INTEGER NOT NULL DEFAULT 120,
    staleness_secs INTEGER NOT NULL DEFAULT 43200,
    failure_threshold INTEGER NOT NULL DEFAULT 3,
    base_backoff_secs INTEGER NOT NULL DEFAULT 300,
    max_backoff_secs INTEGER NOT NULL DEFAULT 21600,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

INSERT INTO sync_settings (id) VALUES (1);
"#;
