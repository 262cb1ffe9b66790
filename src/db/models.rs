//! Data models shared by the bar store, cursor store and job ledger

use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted text format for bar timestamps. Fixed width, so lexical order
/// matches chronological order in both databases.
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Identity of one time series: (asset_type, symbol, period)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesId {
    pub asset_type: String,
    pub symbol: String,
    pub period: String,
}

impl SeriesId {
    /// Create a series identity, rejecting blank components
    pub fn new(
        asset_type: impl Into<String>,
        symbol: impl Into<String>,
        period: impl Into<String>,
    ) -> Result<Self> {
        let id = Self {
            asset_type: asset_type.into().trim().to_string(),
            symbol: symbol.into().trim().to_string(),
            period: period.into().trim().to_string(),
        };

        if id.asset_type.is_empty() || id.symbol.is_empty() || id.period.is_empty() {
            return Err(AppError::Validation(format!(
                "Series identity must have non-empty asset_type, symbol and period (got '{}')",
                id
            )));
        }

        Ok(id)
    }
}

impl std::str::FromStr for SeriesId {
    type Err = AppError;

    /// Parse the `asset_type:symbol:period` form
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(asset_type), Some(symbol), Some(period)) => {
                SeriesId::new(asset_type, symbol, period)
            }
            _ => Err(AppError::Validation(format!(
                "Expected asset_type:symbol:period, got '{}'",
                s
            ))),
        }
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.asset_type, self.symbol, self.period)
    }
}

/// A validated OHLCV observation, ready for the bar store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: NaiveDateTime,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub open_interest: Option<f64>,
    pub amount: Option<f64>,
}

impl Bar {
    /// Bar with only a timestamp set
    pub fn at(ts: NaiveDateTime) -> Self {
        Self {
            ts,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            open_interest: None,
            amount: None,
        }
    }
}

/// A bar as read back from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBar {
    #[serde(flatten)]
    pub bar: Bar,
    pub update_time: DateTime<Utc>,
}

/// Result of one batch upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertCounts {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Catalog entry for a series known to the bar store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesCatalogEntry {
    pub series: SeriesId,
    pub row_count: i64,
    pub first_ts: Option<NaiveDateTime>,
    pub last_ts: Option<NaiveDateTime>,
    pub last_updated: DateTime<Utc>,
}

/// Synchronization watermark for one series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesCursor {
    pub series: SeriesId,
    pub last_ts: Option<NaiveDateTime>,
    pub last_sync: DateTime<Utc>,
}

/// What the fetcher is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchWindow {
    /// The provider's entire available history
    Full,
    /// Everything strictly after the given timestamp
    Since(NaiveDateTime),
}

/// Synchronization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(AppError::Validation(format!("Unknown sync mode: {}", other))),
        }
    }

    /// Fetch window for this mode given the series' current cursor
    pub fn window(&self, cursor: Option<&SeriesCursor>) -> FetchWindow {
        match self {
            SyncMode::Full => FetchWindow::Full,
            SyncMode::Incremental => match cursor.and_then(|c| c.last_ts) {
                Some(ts) => FetchWindow::Since(ts),
                None => FetchWindow::Full,
            },
        }
    }

    /// New watermark after a durable write.
    ///
    /// Incremental never moves backward; full replaces the watermark with the
    /// candidate because the whole history was re-fetched.
    pub fn next_watermark(
        &self,
        current: Option<NaiveDateTime>,
        candidate: Option<NaiveDateTime>,
    ) -> Option<NaiveDateTime> {
        match self {
            SyncMode::Incremental => match (current, candidate) {
                (Some(c), Some(n)) => Some(c.max(n)),
                (c, n) => c.or(n),
            },
            SyncMode::Full => candidate.or(current),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger status of a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "partial" => Ok(JobStatus::Partial),
            "failed" => Ok(JobStatus::Failed),
            other => Err(AppError::Validation(format!("Unknown job status: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded synchronization attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub series: SeriesId,
    pub mode: SyncMode,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub rows_fetched: i64,
    pub rows_written: i64,
    pub error: Option<String>,
}

/// Terminal values written by `JobLedger::finish`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFinish {
    pub status: JobStatus,
    pub rows_fetched: i64,
    pub rows_written: i64,
    pub error: Option<String>,
}

impl JobFinish {
    /// Check the finish values before they reach the ledger
    pub fn validate(&self, job_id: i64) -> Result<()> {
        if !self.status.is_terminal() {
            return Err(AppError::Invariant(format!(
                "job {} cannot be finished with non-terminal status '{}'",
                job_id, self.status
            )));
        }
        if self.rows_written > self.rows_fetched {
            return Err(AppError::Invariant(format!(
                "job {} reports rows_written {} > rows_fetched {}",
                job_id, self.rows_written, self.rows_fetched
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Timestamp helpers
// ============================================================================

/// Format a bar timestamp for storage
pub fn format_ts(ts: &NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse a bar timestamp from the formats providers commonly emit.
///
/// Accepts dates, date-times with optional fractional seconds, `T`-separated
/// date-times, RFC 3339 (converted to UTC) and epoch seconds or milliseconds.
pub fn parse_ts(value: &str) -> Option<NaiveDateTime> {
    let s = value.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }

    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }

    if let Some(date) = parse_date_only(s) {
        return date.and_hms_opt(0, 0, 0);
    }

    if let Ok(epoch) = s.parse::<i64>() {
        // Anything past year ~5138 in seconds is treated as milliseconds
        let dt = if epoch.abs() >= 100_000_000_000 {
            Utc.timestamp_millis_opt(epoch).single()
        } else {
            Utc.timestamp_opt(epoch, 0).single()
        };
        return dt.map(|d| d.naive_utc());
    }

    None
}

/// Parse a value that names a whole day and carries no time of day
pub fn parse_date_only(value: &str) -> Option<NaiveDate> {
    let s = value.trim();
    ["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d"]
        .into_iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Format a wall-clock instant for storage
pub fn format_instant(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored wall-clock instant
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Internal(format!("Corrupt stored instant '{}': {}", value, e)))
}

/// Parse a stored bar timestamp
pub fn parse_stored_ts(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, TS_FORMAT)
        .map_err(|e| AppError::Internal(format!("Corrupt stored timestamp '{}': {}", value, e)))
}
