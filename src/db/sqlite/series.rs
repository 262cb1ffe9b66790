//! Tracked series registry

use crate::db::models::{format_instant, SeriesId};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

/// Register a series for scheduled syncing
pub fn register_series(conn: &Connection, series: &SeriesId, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO tracked_series (asset_type, symbol, period, created_at)
         VALUES (?, ?, ?, ?)",
        rusqlite::params![
            series.asset_type,
            series.symbol,
            series.period,
            format_instant(&now),
        ],
    )?;

    Ok(changed > 0)
}

/// Remove a series from scheduled syncing. Stored bars are kept.
pub fn unregister_series(conn: &Connection, series: &SeriesId) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM tracked_series WHERE asset_type = ? AND symbol = ? AND period = ?",
        rusqlite::params![series.asset_type, series.symbol, series.period],
    )?;

    Ok(changed > 0)
}

/// List tracked series
pub fn list_series(conn: &Connection) -> Result<Vec<SeriesId>> {
    let mut stmt = conn.prepare(
        "SELECT asset_type, symbol, period FROM tracked_series
         ORDER BY asset_type, symbol, period",
    )?;

    let series = stmt
        .query_map([], |row| {
            Ok(SeriesId {
                asset_type: row.get(0)?,
                symbol: row.get(1)?,
                period: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(series)
}
