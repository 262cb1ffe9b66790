//! Bar merger
//!
//! Turns a provider batch into store-ready bars: validate timestamps,
//! normalize values, dedup by ts (later bar wins) and sort ascending.
//! Works within one series only.

use crate::db::models::{format_ts, parse_ts, Bar, SeriesId, UpsertCounts};
use crate::db::store::BarStore;
use crate::error::{AppError, Result};
use crate::providers::RawBar;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};

/// Rejection reasons surfaced in the job error text
const MAX_SAMPLED_REASONS: usize = 3;

/// How far past `now` a bar may be stamped
const FUTURE_TOLERANCE_DAYS: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingTs,
    Unparseable(String),
    OutOfRange(NaiveDateTime),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingTs => write!(f, "missing ts"),
            RejectReason::Unparseable(raw) => write!(f, "unparseable ts '{}'", raw),
            RejectReason::OutOfRange(ts) => write!(f, "ts {} out of range", format_ts(ts)),
        }
    }
}

/// A raw bar that did not make it into the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Position in the provider batch
    pub index: usize,
    pub reason: RejectReason,
}

/// Validated, normalized, deduplicated batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedBatch {
    /// Sorted by ts ascending, unique ts
    pub bars: Vec<Bar>,
    pub rejected: Vec<Rejection>,
    /// Bars dropped because a later bar had the same ts
    pub duplicates: usize,
    /// Bars whose values were repaired during normalization
    pub repaired: usize,
}

impl PreparedBatch {
    pub fn max_ts(&self) -> Option<NaiveDateTime> {
        self.bars.last().map(|b| b.ts)
    }

    /// e.g. "2 of 5 bars rejected: missing ts; unparseable ts 'abc'"
    pub fn rejection_summary(&self, fetched: usize) -> Option<String> {
        if self.rejected.is_empty() {
            return None;
        }

        let sample: Vec<String> = self
            .rejected
            .iter()
            .take(MAX_SAMPLED_REASONS)
            .map(|r| format!("#{} {}", r.index, r.reason))
            .collect();

        Some(format!(
            "{} of {} bars rejected: {}",
            self.rejected.len(),
            fetched,
            sample.join("; ")
        ))
    }
}

/// Validate, normalize and dedup a provider batch
pub fn prepare(raw: &[RawBar], now: DateTime<Utc>) -> PreparedBatch {
    let min_ts = NaiveDate::from_ymd_opt(1970, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0));
    let max_ts = now.naive_utc() + Duration::days(FUTURE_TOLERANCE_DAYS);

    let mut batch = PreparedBatch::default();
    let mut by_ts: BTreeMap<NaiveDateTime, Bar> = BTreeMap::new();

    for (index, item) in raw.iter().enumerate() {
        let ts = match item.ts.as_deref().map(str::trim) {
            None | Some("") => {
                batch.rejected.push(Rejection {
                    index,
                    reason: RejectReason::MissingTs,
                });
                continue;
            }
            Some(text) => match parse_ts(text) {
                Some(ts) => ts,
                None => {
                    batch.rejected.push(Rejection {
                        index,
                        reason: RejectReason::Unparseable(text.to_string()),
                    });
                    continue;
                }
            },
        };

        if min_ts.map_or(false, |min| ts < min) || ts > max_ts {
            batch.rejected.push(Rejection {
                index,
                reason: RejectReason::OutOfRange(ts),
            });
            continue;
        }

        let (bar, repaired) = normalize(ts, item);
        if repaired {
            batch.repaired += 1;
        }
        if by_ts.insert(ts, bar).is_some() {
            batch.duplicates += 1;
        }
    }

    batch.bars = by_ts.into_values().collect();
    batch
}

fn finite(value: Option<f64>, repaired: &mut bool) -> Option<f64> {
    match value {
        Some(v) if !v.is_finite() => {
            *repaired = true;
            None
        }
        other => other,
    }
}

fn normalize(ts: NaiveDateTime, raw: &RawBar) -> (Bar, bool) {
    let mut repaired = false;
    let mut bar = Bar {
        ts,
        open: finite(raw.open, &mut repaired),
        high: finite(raw.high, &mut repaired),
        low: finite(raw.low, &mut repaired),
        close: finite(raw.close, &mut repaired),
        volume: finite(raw.volume, &mut repaired),
        open_interest: finite(raw.open_interest, &mut repaired),
        amount: finite(raw.amount, &mut repaired),
    };

    if let (Some(high), Some(low)) = (bar.high, bar.low) {
        if high < low {
            bar.high = Some(low);
            bar.low = Some(high);
            repaired = true;
        }
    }

    if matches!(bar.volume, Some(v) if v < 0.0) {
        bar.volume = Some(0.0);
        repaired = true;
    }

    (bar, repaired)
}

/// Owns writes to the bar store
#[derive(Clone)]
pub struct Merger {
    store: Arc<dyn BarStore>,
}

impl Merger {
    pub fn new(store: Arc<dyn BarStore>) -> Self {
        Self { store }
    }

    pub fn prepare(&self, raw: &[RawBar], now: DateTime<Utc>) -> PreparedBatch {
        prepare(raw, now)
    }

    /// Start an upsert of a prepared batch on the blocking pool
    pub fn spawn_write(
        &self,
        series: &SeriesId,
        bars: Vec<Bar>,
        now: DateTime<Utc>,
    ) -> JoinHandle<Result<UpsertCounts>> {
        let store = Arc::clone(&self.store);
        let series = series.clone();

        tokio::task::spawn_blocking(move || store.upsert_batch(&series, &bars, now))
    }

    pub async fn write(
        &self,
        series: &SeriesId,
        bars: Vec<Bar>,
        now: DateTime<Utc>,
    ) -> Result<UpsertCounts> {
        join_write(self.spawn_write(series, bars, now).await)
    }
}

/// Flatten a finished write task into its upsert result
pub fn join_write(
    joined: std::result::Result<Result<UpsertCounts>, JoinError>,
) -> Result<UpsertCounts> {
    joined.map_err(|e| AppError::Internal(format!("Bar write task failed: {}", e)))?
}
