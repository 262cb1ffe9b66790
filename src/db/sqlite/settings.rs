//! Sync settings management

use crate::db::sqlite::models::{SyncConfig, SyncConfigUpdate};
use crate::error::Result;
use rusqlite::Connection;

/// Get sync settings
pub fn get_sync_config(conn: &Connection) -> Result<SyncConfig> {
    let config = conn.query_row(
        "SELECT auto_sync_enabled, sweep_hour, sweep_minute, timezone, concurrency, timeout_secs,
                staleness_secs, failure_threshold, base_backoff_secs, max_backoff_secs
         FROM sync_settings WHERE id = 1",
        [],
        |row| {
            Ok(SyncConfig {
                auto_sync_enabled: row.get::<_, i32>(0)? == 1,
                sweep_hour: row.get::<_, i64>(1)? as u32,
                sweep_minute: row.get::<_, i64>(2)? as u32,
                timezone: row.get(3)?,
                concurrency: row.get::<_, i64>(4)? as u32,
                timeout_secs: row.get::<_, i64>(5)? as u64,
                staleness_secs: row.get(6)?,
                failure_threshold: row.get::<_, i64>(7)? as u32,
                base_backoff_secs: row.get(8)?,
                max_backoff_secs: row.get(9)?,
            })
        },
    )?;

    Ok(config)
}

/// Update sync settings. The merged result is validated before anything is written.
pub fn update_sync_config(conn: &Connection, update: &SyncConfigUpdate) -> Result<SyncConfig> {
    let current = get_sync_config(conn)?;
    let next = update.apply(&current);
    next.validate()?;

    if next == current {
        return Ok(current);
    }

    conn.execute(
        "UPDATE sync_settings SET
            auto_sync_enabled = ?, sweep_hour = ?, sweep_minute = ?, timezone = ?,
            concurrency = ?, timeout_secs = ?, staleness_secs = ?, failure_threshold = ?,
            base_backoff_secs = ?, max_backoff_secs = ?, updated_at = datetime('now')
         WHERE id = 1",
        rusqlite::params![
            next.auto_sync_enabled as i32,
            next.sweep_hour as i64,
            next.sweep_minute as i64,
            next.timezone,
            next.concurrency as i64,
            next.timeout_secs as i64,
            next.staleness_secs,
            next.failure_threshold as i64,
            next.base_backoff_secs,
            next.max_backoff_secs,
        ],
    )?;

    tracing::info!(
        "Sync settings updated: sweep {:02}:{:02} {}, concurrency {}",
        next.sweep_hour,
        next.sweep_minute,
        next.timezone,
        next.concurrency
    );

    get_sync_config(conn)
}
