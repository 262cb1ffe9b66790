//! Weekly bars built from daily bars
//!
//! Weeks end on Friday and are labelled with that Friday's date. Saturday and
//! Sunday bars belong to the following week. A week is only emitted once it
//! is complete, so its label never moves past the data it summarizes.

use super::{FetchError, FetchOutcome, Fetcher, RawBar};
use crate::db::models::{parse_ts, FetchWindow, SeriesId};
use crate::sync::clock::Clock;
use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const WEEKLY_PERIOD: &str = "weekly";
const DAILY_PERIOD: &str = "daily";

/// Serves `weekly` series by resampling the inner fetcher's daily bars.
/// Every other period goes straight through.
pub struct WeeklyFetcher {
    inner: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    id: String,
}

impl WeeklyFetcher {
    pub fn new(inner: Arc<dyn Fetcher>, clock: Arc<dyn Clock>) -> Self {
        let id = format!("{}+weekly", inner.id());
        Self { inner, clock, id }
    }
}

#[async_trait]
impl Fetcher for WeeklyFetcher {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(
        &self,
        series: &SeriesId,
        window: FetchWindow,
    ) -> std::result::Result<FetchOutcome, FetchError> {
        if series.period != WEEKLY_PERIOD {
            return self.inner.fetch(series, window).await;
        }

        let daily = SeriesId {
            period: DAILY_PERIOD.to_string(),
            ..series.clone()
        };
        let outcome = self.inner.fetch(&daily, window).await?;

        let since = match window {
            FetchWindow::Full => None,
            FetchWindow::Since(ts) => Some(ts),
        };
        let today = self.clock.now().date_naive();
        let bars = resample_weekly(outcome.bars, today, since);

        tracing::debug!("Resampled {} daily bars into {} weeks", daily, bars.len());
        Ok(FetchOutcome {
            bars,
            truncated: outcome.truncated,
        })
    }
}

/// The Friday on or after `date`
pub fn week_ending(date: NaiveDate) -> NaiveDate {
    let ahead = (Weekday::Fri.num_days_from_monday() + 7
        - date.weekday().num_days_from_monday())
        % 7;
    date + Duration::days(ahead as i64)
}

/// Group daily bars into Friday-ending weeks.
///
/// Bars whose ts does not parse are passed through untouched. Weeks that are
/// still open on `today`, lack an open or close, or end at or before `since`
/// are dropped.
pub fn resample_weekly(
    daily: Vec<RawBar>,
    today: NaiveDate,
    since: Option<NaiveDateTime>,
) -> Vec<RawBar> {
    let mut unparsed = Vec::new();
    let mut weeks: BTreeMap<NaiveDate, Vec<(NaiveDateTime, RawBar)>> = BTreeMap::new();

    for bar in daily {
        match bar.ts.as_deref().and_then(parse_ts) {
            Some(ts) => weeks
                .entry(week_ending(ts.date()))
                .or_default()
                .push((ts, bar)),
            None => unparsed.push(bar),
        }
    }

    let mut out = unparsed;
    for (label, mut days) in weeks {
        let closed = label < today || days.iter().any(|(ts, _)| ts.date() >= label);
        let seen = since.map_or(false, |s| label <= s.date());
        if !closed || seen {
            continue;
        }

        days.sort_by_key(|(ts, _)| *ts);
        if let Some(week) = aggregate(label, days.into_iter().map(|(_, bar)| bar)) {
            out.push(week);
        }
    }
    out
}

fn aggregate(label: NaiveDate, days: impl Iterator<Item = RawBar>) -> Option<RawBar> {
    let mut week = RawBar::at(label.format("%Y-%m-%d").to_string());

    for day in days {
        week.open = week.open.or(day.open);
        week.high = max_of(week.high, day.high);
        week.low = min_of(week.low, day.low);
        week.close = day.close.or(week.close);
        week.open_interest = day.open_interest.or(week.open_interest);
        week.volume = sum_of(week.volume, day.volume);
        week.amount = sum_of(week.amount, day.amount);
    }

    (week.open.is_some() && week.close.is_some()).then_some(week)
}

fn max_of(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn min_of(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn sum_of(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}
