//! Series cursor management

use crate::db::models::{
    format_instant, format_ts, parse_instant, parse_stored_ts, SeriesCursor, SeriesId, SyncMode,
};
use crate::error::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;

struct RawCursor {
    asset_type: String,
    symbol: String,
    period: String,
    last_ts: Option<String>,
    last_sync: String,
}

impl RawCursor {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            asset_type: row.get(0)?,
            symbol: row.get(1)?,
            period: row.get(2)?,
            last_ts: row.get(3)?,
            last_sync: row.get(4)?,
        })
    }

    fn into_cursor(self) -> Result<SeriesCursor> {
        Ok(SeriesCursor {
            series: SeriesId {
                asset_type: self.asset_type,
                symbol: self.symbol,
                period: self.period,
            },
            last_ts: self.last_ts.as_deref().map(parse_stored_ts).transpose()?,
            last_sync: parse_instant(&self.last_sync)?,
        })
    }
}

/// Get the cursor for a series
pub fn get_cursor(conn: &Connection, series: &SeriesId) -> Result<Option<SeriesCursor>> {
    let result = conn.query_row(
        "SELECT asset_type, symbol, period, last_ts, last_sync
         FROM series_cursor WHERE asset_type = ? AND symbol = ? AND period = ?",
        rusqlite::params![series.asset_type, series.symbol, series.period],
        RawCursor::from_row,
    );

    match result {
        Ok(raw) => raw.into_cursor().map(Some),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Advance the cursor in one transaction: read, apply the mode's watermark rule, write back
pub fn advance_cursor(
    conn: &mut Connection,
    series: &SeriesId,
    mode: SyncMode,
    new_last_ts: Option<NaiveDateTime>,
    now: DateTime<Utc>,
) -> Result<SeriesCursor> {
    let tx = conn.transaction()?;

    let current = get_cursor(&tx, series)?;
    let last_ts = mode.next_watermark(current.as_ref().and_then(|c| c.last_ts), new_last_ts);

    tx.execute(
        "INSERT INTO series_cursor (asset_type, symbol, period, last_ts, last_sync)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(asset_type, symbol, period)
         DO UPDATE SET last_ts = excluded.last_ts, last_sync = excluded.last_sync",
        rusqlite::params![
            series.asset_type,
            series.symbol,
            series.period,
            last_ts.as_ref().map(format_ts),
            format_instant(&now),
        ],
    )?;

    tx.commit()?;

    if let (Some(before), Some(after)) = (current.as_ref().and_then(|c| c.last_ts), last_ts) {
        if after < before {
            tracing::info!(
                "Cursor for {} moved back from {} to {} after {} sync",
                series,
                format_ts(&before),
                format_ts(&after),
                mode
            );
        }
    }

    Ok(SeriesCursor {
        series: series.clone(),
        last_ts,
        last_sync: now,
    })
}

/// List all cursors
pub fn list_cursors(conn: &Connection) -> Result<Vec<SeriesCursor>> {
    let mut stmt = conn.prepare(
        "SELECT asset_type, symbol, period, last_ts, last_sync
         FROM series_cursor ORDER BY asset_type, symbol, period",
    )?;

    let raws = stmt
        .query_map([], RawCursor::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raws.into_iter().map(RawCursor::into_cursor).collect()
}
