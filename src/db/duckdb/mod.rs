//! DuckDB database module for historical bars (Historify)

mod migrations;

use crate::db::models::*;
use crate::db::store::{ensure_unique_ts, BarStore};
use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{params, Connection};
use parking_lot::Mutex;
use std::path::Path;

const UPSERT_BAR: &str = "INSERT INTO bars (asset_type, symbol, period, ts, open, high, low, close, volume, open_interest, amount, update_time)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT (asset_type, symbol, period, ts) DO UPDATE SET
       open = excluded.open, high = excluded.high, low = excluded.low,
       close = excluded.close, volume = excluded.volume,
       open_interest = excluded.open_interest, amount = excluded.amount,
       update_time = excluded.update_time";

/// DuckDB database wrapper
pub struct DuckDb {
    conn: Mutex<Connection>,
}

impl DuckDb {
    /// Create new DuckDB connection
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Open a throwaway in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };

        // Run migrations
        db.run_migrations()?;

        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();
        migrations::run_migrations(&conn)
    }
}

impl BarStore for DuckDb {
    fn upsert_batch(
        &self,
        series: &SeriesId,
        bars: &[Bar],
        now: DateTime<Utc>,
    ) -> Result<UpsertCounts> {
        ensure_unique_ts(series, bars)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let before = count_rows(&tx, series)?;
        let update_time = format_instant(&now);

        {
            let mut stmt = tx.prepare(UPSERT_BAR)?;
            for bar in bars {
                stmt.execute(params![
                    series.asset_type,
                    series.symbol,
                    series.period,
                    format_ts(&bar.ts),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                    bar.open_interest,
                    bar.amount,
                    update_time,
                ])?;
            }
        }

        let after = count_rows(&tx, series)?;
        refresh_catalog(&tx, series, &update_time)?;

        tx.commit()?;

        let inserted = (after - before).max(0) as usize;
        let counts = UpsertCounts {
            inserted,
            updated: bars.len().saturating_sub(inserted),
        };

        tracing::debug!(
            "Upserted {} bars for {} ({} inserted, {} updated)",
            bars.len(),
            series,
            counts.inserted,
            counts.updated
        );

        Ok(counts)
    }

    fn query_range(
        &self,
        series: &SeriesId,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<StoredBar>> {
        let conn = self.conn.lock();

        if !is_known(&conn, series)? {
            return Err(AppError::NotFound(format!("Series {} has never been synced", series)));
        }

        let mut stmt = conn.prepare(
            "SELECT ts, open, high, low, close, volume, open_interest, amount, update_time
             FROM bars
             WHERE asset_type = ? AND symbol = ? AND period = ?
               AND ts >= ? AND ts <= ?
             ORDER BY ts ASC",
        )?;

        let rows = stmt
            .query_map(
                params![
                    series.asset_type,
                    series.symbol,
                    series.period,
                    format_ts(&start),
                    format_ts(&end),
                ],
                |row| {
                    Ok(RawRow {
                        ts: row.get(0)?,
                        values: [
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ],
                        update_time: row.get(8)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(RawRow::into_stored).collect()
    }

    fn latest_ts(&self, series: &SeriesId) -> Result<Option<NaiveDateTime>> {
        let conn = self.conn.lock();

        let latest: Option<String> = conn.query_row(
            "SELECT MAX(ts) FROM bars WHERE asset_type = ? AND symbol = ? AND period = ?",
            params![series.asset_type, series.symbol, series.period],
            |row| row.get(0),
        )?;

        latest.as_deref().map(parse_stored_ts).transpose()
    }

    fn list_series(&self) -> Result<Vec<SeriesCatalogEntry>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT asset_type, symbol, period, row_count, first_ts, last_ts, last_updated
             FROM bar_series
             ORDER BY asset_type, symbol, period",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    SeriesId {
                        asset_type: row.get(0)?,
                        symbol: row.get(1)?,
                        period: row.get(2)?,
                    },
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(series, row_count, first_ts, last_ts, last_updated)| {
                Ok(SeriesCatalogEntry {
                    series,
                    row_count,
                    first_ts: first_ts.as_deref().map(parse_stored_ts).transpose()?,
                    last_ts: last_ts.as_deref().map(parse_stored_ts).transpose()?,
                    last_updated: parse_instant(&last_updated)?,
                })
            })
            .collect()
    }
}

/// Bar row as read from DuckDB, before timestamp parsing
struct RawRow {
    ts: String,
    values: [Option<f64>; 7],
    update_time: String,
}

impl RawRow {
    fn into_stored(self) -> Result<StoredBar> {
        let [open, high, low, close, volume, open_interest, amount] = self.values;
        Ok(StoredBar {
            bar: Bar {
                ts: parse_stored_ts(&self.ts)?,
                open,
                high,
                low,
                close,
                volume,
                open_interest,
                amount,
            },
            update_time: parse_instant(&self.update_time)?,
        })
    }
}

fn count_rows(conn: &Connection, series: &SeriesId) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM bars WHERE asset_type = ? AND symbol = ? AND period = ?",
        params![series.asset_type, series.symbol, series.period],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn is_known(conn: &Connection, series: &SeriesId) -> Result<bool> {
    let known = conn.query_row(
        "SELECT COUNT(*) > 0 FROM bar_series WHERE asset_type = ? AND symbol = ? AND period = ?",
        params![series.asset_type, series.symbol, series.period],
        |row| row.get(0),
    )?;
    Ok(known)
}

/// Recompute the catalog row for a series inside the batch transaction
fn refresh_catalog(conn: &Connection, series: &SeriesId, updated_at: &str) -> Result<()> {
    let (row_count, first_ts, last_ts): (i64, Option<String>, Option<String>) = conn.query_row(
        "SELECT COUNT(*), MIN(ts), MAX(ts) FROM bars
         WHERE asset_type = ? AND symbol = ? AND period = ?",
        params![series.asset_type, series.symbol, series.period],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    conn.execute(
        "INSERT INTO bar_series (asset_type, symbol, period, row_count, first_ts, last_ts, last_updated)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (asset_type, symbol, period) DO UPDATE SET
           row_count = excluded.row_count, first_ts = excluded.first_ts,
           last_ts = excluded.last_ts, last_updated = excluded.last_updated",
        params![
            series.asset_type,
            series.symbol,
            series.period,
            row_count,
            first_ts,
            last_ts,
            updated_at,
        ],
    )?;

    Ok(())
}
