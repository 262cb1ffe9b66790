//! DuckDB migrations

use crate::error::Result;
use duckdb::Connection;

/// Run all DuckDB migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    // Migration name is the primary key, no auto-increment needed
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            name VARCHAR PRIMARY KEY,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )?;

    run_migration(conn, "001_bars", CREATE_BARS)?;
    run_migration(conn, "002_bar_series", CREATE_BAR_SERIES)?;

    tracing::info!("DuckDB migrations completed");
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM migrations WHERE name = ?",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        tracing::info!("Running DuckDB migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;
    }

    Ok(())
}

const CREATE_BARS: &str = r#"
CREATE TABLE IF NOT EXISTS bars (
    asset_type VARCHAR NOT NULL,
    symbol VARCHAR NOT NULL,
    period VARCHAR NOT NULL,
    ts VARCHAR NOT NULL,
    open DOUBLE,
    high DOUBLE,
    low DOUBLE,
    close DOUBLE,
    volume DOUBLE,
    open_interest DOUBLE,
    amount DOUBLE,
    update_time VARCHAR NOT NULL,
    PRIMARY KEY (asset_type, symbol, period, ts)
);
"#;

const CREATE_BAR_SERIES: &str = r#"
CREATE TABLE IF NOT EXISTS bar_series (
    asset_type VARCHAR NOT NULL,
    symbol VARCHAR NOT NULL,
    period VARCHAR NOT NULL,
    row_count BIGINT NOT NULL DEFAULT 0,
    first_ts VARCHAR,
    last_ts VARCHAR,
    last_updated VARCHAR NOT NULL,
    PRIMARY KEY (asset_type, symbol, period)
);
"#;
