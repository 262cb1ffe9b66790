use super::clock::ManualClock;
use super::*;
use crate::db::memory::{MemoryBarStore, MemoryCursorStore, MemoryJobLedger, MemorySeriesRegistry};
use crate::db::models::{parse_ts, FetchWindow};
use crate::providers::{FetchOutcome, Fetcher, RawBar};
use async_trait::async_trait;
use chrono::TimeZone;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

enum Step {
    Reply(std::result::Result<FetchOutcome, FetchError>),
    /// Signal `entered`, then wait for `gate` before replying
    Gated {
        entered: Arc<Notify>,
        gate: Arc<Notify>,
        reply: FetchOutcome,
    },
    Hang(Duration),
}

/// Fetcher that replays scripted replies per symbol; unscripted calls return no bars
#[derive(Default)]
struct ScriptedFetcher {
    script: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(SeriesId, FetchWindow)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Counts a fetch as in flight until dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedFetcher {
    fn push(&self, symbol: &str, step: Step) {
        self.script
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .push_back(step);
    }

    fn reply(&self, symbol: &str, bars: Vec<RawBar>) {
        self.push(symbol, Step::Reply(Ok(FetchOutcome::complete(bars))));
    }

    fn windows(&self) -> Vec<FetchWindow> {
        self.calls.lock().iter().map(|(_, w)| *w).collect()
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn fetch(
        &self,
        series: &SeriesId,
        window: FetchWindow,
    ) -> std::result::Result<FetchOutcome, FetchError> {
        self.calls.lock().push((series.clone(), window));
        let _in_flight = self.enter();
        let step = self
            .script
            .lock()
            .get_mut(&series.symbol)
            .and_then(|q| q.pop_front());

        match step {
            None => Ok(FetchOutcome::default()),
            Some(Step::Reply(reply)) => reply,
            Some(Step::Gated {
                entered,
                gate,
                reply,
            }) => {
                entered.notify_one();
                gate.notified().await;
                Ok(reply)
            }
            Some(Step::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(FetchOutcome::default())
            }
        }
    }
}

struct Harness {
    engine: Arc<SyncEngine>,
    fetcher: Arc<ScriptedFetcher>,
    bars: Arc<MemoryBarStore>,
    cursors: Arc<MemoryCursorStore>,
    ledger: Arc<MemoryJobLedger>,
    registry: Arc<MemorySeriesRegistry>,
    clock: Arc<ManualClock>,
}

fn harness_with(settings: SyncSettings) -> Harness {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let bars = Arc::new(MemoryBarStore::new());
    let cursors = Arc::new(MemoryCursorStore::new());
    let ledger = Arc::new(MemoryJobLedger::new());
    let registry = Arc::new(MemorySeriesRegistry::new());
    let clock = Arc::new(ManualClock::new(t0()));

    let stores = SyncStores {
        bars: bars.clone(),
        cursors: cursors.clone(),
        ledger: ledger.clone(),
        registry: registry.clone(),
    };
    let engine = SyncEngine::new(
        stores,
        FetcherRegistry::with_default(fetcher.clone()),
        clock.clone(),
        settings,
    );

    Harness {
        engine: Arc::new(engine),
        fetcher,
        bars,
        cursors,
        ledger,
        registry,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(SyncSettings::default())
}

impl Harness {
    async fn sync(&self, series: &SeriesId, mode: SyncMode) -> SyncReport {
        match self.engine.sync_one(series, mode).await.unwrap() {
            SyncOutcome::Completed(report) => report,
            other => panic!("expected a completed sync, got {:?}", other),
        }
    }

    fn cursor(&self, series: &SeriesId) -> Option<SeriesCursor> {
        self.engine.stores().cursors.get(series).unwrap()
    }

    fn closes(&self, series: &SeriesId) -> Vec<(String, Option<f64>)> {
        self.bars
            .query_range(series, ts("1990-01-01"), ts("2100-01-01"))
            .unwrap()
            .into_iter()
            .map(|b| (format_ts(&b.bar.ts)[..10].to_string(), b.bar.close))
            .collect()
    }
}

/// 2024-01-08 15:10 Asia/Shanghai
fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 8, 7, 10, 0).unwrap()
}

fn ts(s: &str) -> NaiveDateTime {
    parse_ts(s).unwrap()
}

fn rb2401() -> SeriesId {
    SeriesId::new("future", "RB2401", "daily").unwrap()
}

fn bar(day: &str, close: f64) -> RawBar {
    RawBar::at(day).with_ohlc(close, close + 10.0, close - 10.0, close)
}

#[tokio::test]
async fn test_rb2401_incremental_resume() {
    let h = harness();
    let series = rb2401();

    h.fetcher.reply(
        "RB2401",
        vec![bar("2024-01-03", 3900.0), bar("2024-01-04", 3910.0), bar("2024-01-05", 3920.0)],
    );
    let first = h.sync(&series, SyncMode::Incremental).await;
    assert_eq!(first.status, JobStatus::Success);
    assert_eq!((first.inserted, first.updated), (3, 0));
    assert_eq!(first.last_ts, Some(ts("2024-01-05")));

    // The provider revises 01-05 and adds 01-08
    h.clock.advance(chrono::Duration::days(1));
    h.fetcher
        .reply("RB2401", vec![bar("2024-01-05", 3925.0), bar("2024-01-08", 3950.0)]);
    let second = h.sync(&series, SyncMode::Incremental).await;

    assert_eq!(second.status, JobStatus::Success);
    assert_eq!((second.inserted, second.updated), (1, 1));
    assert_eq!(second.rows_fetched, 2);
    assert_eq!(second.rows_written, 2);
    assert_eq!(second.last_ts, Some(ts("2024-01-08")));

    assert_eq!(
        h.fetcher.windows(),
        vec![FetchWindow::Full, FetchWindow::Since(ts("2024-01-05"))]
    );
    assert_eq!(
        h.closes(&series),
        vec![
            ("2024-01-03".to_string(), Some(3900.0)),
            ("2024-01-04".to_string(), Some(3910.0)),
            ("2024-01-05".to_string(), Some(3925.0)),
            ("2024-01-08".to_string(), Some(3950.0)),
        ]
    );

    let jobs = h.ledger.recent(&series, 10).unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Success && j.end_time.is_some()));
    assert_eq!(jobs[0].rows_written, 2);
}

#[tokio::test]
async fn test_resync_is_idempotent() {
    let h = harness();
    let series = rb2401();
    let batch = vec![bar("2024-01-03", 1.0), bar("2024-01-04", 2.0)];

    h.fetcher.reply("RB2401", batch.clone());
    h.sync(&series, SyncMode::Full).await;
    let before = h.closes(&series);

    h.fetcher.reply("RB2401", batch);
    let again = h.sync(&series, SyncMode::Full).await;

    assert_eq!((again.inserted, again.updated), (0, 2));
    assert_eq!(again.rows_written as usize, again.inserted + again.updated);
    assert_eq!(h.closes(&series), before);
}

#[tokio::test]
async fn test_overlapping_fetch_does_not_duplicate() {
    let h = harness();
    let series = rb2401();

    h.fetcher
        .reply("RB2401", vec![bar("2024-01-03", 1.0), bar("2024-01-04", 2.0)]);
    h.sync(&series, SyncMode::Incremental).await;

    // A provider that ignores `since` and resends everything
    h.fetcher.reply(
        "RB2401",
        vec![bar("2024-01-03", 1.0), bar("2024-01-04", 2.0), bar("2024-01-05", 3.0)],
    );
    let report = h.sync(&series, SyncMode::Incremental).await;

    assert_eq!((report.inserted, report.updated), (1, 2));
    assert_eq!(h.closes(&series).len(), 3);
}

#[tokio::test]
async fn test_duplicate_ts_in_batch_later_wins() {
    let h = harness();
    let series = rb2401();

    h.fetcher
        .reply("RB2401", vec![bar("2024-01-05", 100.0), bar("2024-01-05", 101.0)]);
    let report = h.sync(&series, SyncMode::Incremental).await;

    assert_eq!(report.status, JobStatus::Success);
    assert_eq!(report.rows_fetched, 2);
    assert_eq!(report.rows_written, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(h.closes(&series), vec![("2024-01-05".to_string(), Some(101.0))]);
}

#[tokio::test]
async fn test_lease_contention_skips_second_attempt() {
    let h = harness();
    let series = rb2401();
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());

    h.fetcher.push(
        "RB2401",
        Step::Gated {
            entered: entered.clone(),
            gate: gate.clone(),
            reply: FetchOutcome::complete(vec![bar("2024-01-05", 1.0)]),
        },
    );

    let engine = h.engine.clone();
    let first_series = series.clone();
    let first = tokio::spawn(async move {
        engine.sync_one(&first_series, SyncMode::Incremental).await
    });

    entered.notified().await;
    assert!(h.engine.is_syncing(&series));

    let second = h.engine.sync_one(&series, SyncMode::Incremental).await.unwrap();
    assert_eq!(second, SyncOutcome::Skipped { series: series.clone() });
    assert_eq!(h.ledger.recent(&series, 10).unwrap().len(), 1);

    gate.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.report().unwrap().status, JobStatus::Success);
    assert!(!h.engine.is_syncing(&series));
    assert_eq!(h.ledger.recent(&series, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_storage_failure_leaves_cursor_alone() {
    let h = harness();
    let series = rb2401();

    h.fetcher.reply("RB2401", vec![bar("2024-01-03", 1.0)]);
    h.sync(&series, SyncMode::Incremental).await;
    let cursor = h.cursor(&series);

    h.bars.set_fail_writes(true);
    h.clock.advance(chrono::Duration::hours(1));
    h.fetcher.reply("RB2401", vec![bar("2024-01-04", 2.0)]);
    let report = h.sync(&series, SyncMode::Incremental).await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.rows_fetched, 1);
    assert_eq!(report.rows_written, 0);
    assert!(report.error.unwrap().contains("storage write failed"));
    assert_eq!(h.cursor(&series), cursor);
}

#[tokio::test]
async fn test_timeout_fails_job_and_releases_lease() {
    let h = harness_with(SyncSettings {
        timeout: Duration::from_millis(50),
        ..Default::default()
    });
    let series = rb2401();

    h.fetcher.push("RB2401", Step::Hang(Duration::from_secs(30)));
    let report = h.sync(&series, SyncMode::Incremental).await;

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.error.unwrap().contains("timed out"));
    assert!(h.cursor(&series).is_none());
    assert!(!h.engine.is_syncing(&series));

    // The series can be synced again right away
    h.fetcher.reply("RB2401", vec![bar("2024-01-05", 1.0)]);
    assert_eq!(h.sync(&series, SyncMode::Incremental).await.status, JobStatus::Success);
}

#[tokio::test]
async fn test_late_write_holds_lease_until_done() {
    let h = harness_with(SyncSettings {
        timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let series = rb2401();

    h.bars.delay_next_write(Duration::from_millis(400));
    h.fetcher.reply("RB2401", vec![bar("2024-01-05", 1.0)]);
    let engine = Arc::clone(&h.engine);
    let first = {
        let series = series.clone();
        tokio::spawn(async move { engine.sync_one(&series, SyncMode::Incremental).await })
    };

    // While the slow write runs, the series stays leased
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.engine.is_syncing(&series));
    assert!(matches!(
        h.engine.sync_one(&series, SyncMode::Incremental).await.unwrap(),
        SyncOutcome::Skipped { .. }
    ));

    let SyncOutcome::Completed(report) = first.await.unwrap().unwrap() else {
        panic!("expected a completed sync");
    };
    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.rows_written, 1);
    let error = report.error.unwrap();
    assert!(error.contains("timed out"));
    assert!(error.contains("cursor not advanced"));
    assert!(h.cursor(&series).is_none());

    // A later attempt is not overwritten by the slow one
    h.fetcher.reply("RB2401", vec![bar("2024-01-05", 2.0)]);
    let second = h.sync(&series, SyncMode::Incremental).await;
    assert_eq!(second.status, JobStatus::Success);
    assert_eq!(h.closes(&series), vec![("2024-01-05".to_string(), Some(2.0))]);
    assert_eq!(h.cursor(&series).unwrap().last_ts, Some(ts("2024-01-05")));
}

#[tokio::test]
async fn test_cursor_failure_after_write_is_partial() {
    let h = harness();
    let series = rb2401();

    h.cursors.set_fail_advance(true);
    h.fetcher.reply("RB2401", vec![bar("2024-01-05", 1.0)]);
    let report = h.sync(&series, SyncMode::Incremental).await;

    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.rows_written, 1);
    assert!(report.error.unwrap().contains("cursor update failed"));
    assert_eq!(h.closes(&series).len(), 1);

    let jobs = h.ledger.recent(&series, 10).unwrap();
    assert_eq!(jobs[0].status, JobStatus::Partial);
    assert_eq!(jobs[0].rows_written, 1);

    // The next run rewrites the same bar and moves the cursor
    h.cursors.set_fail_advance(false);
    h.fetcher.reply("RB2401", vec![bar("2024-01-05", 1.0)]);
    let report = h.sync(&series, SyncMode::Incremental).await;
    assert_eq!(report.status, JobStatus::Success);
    assert_eq!(h.cursor(&series).unwrap().last_ts, Some(ts("2024-01-05")));
}

#[tokio::test]
async fn test_worker_pool_bounds_direct_syncs() {
    let h = harness_with(SyncSettings {
        concurrency: 1,
        ..Default::default()
    });

    let mut handles = Vec::new();
    for symbol in ["RB2401", "RB2405", "RB2410"] {
        h.fetcher.push(symbol, Step::Hang(Duration::from_millis(50)));
        let engine = Arc::clone(&h.engine);
        let series = SeriesId::new("future", symbol, "daily").unwrap();
        handles.push(tokio::spawn(async move {
            engine.sync_one(&series, SyncMode::Incremental).await
        }));
    }
    for handle in handles {
        assert!(matches!(
            handle.await.unwrap().unwrap(),
            SyncOutcome::Completed(_)
        ));
    }

    assert_eq!(h.fetcher.calls.lock().len(), 3);
    assert_eq!(h.fetcher.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_worker_wait_counts_against_timeout() {
    let h = harness_with(SyncSettings {
        concurrency: 1,
        timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let busy = rb2401();
    let waiting = SeriesId::new("future", "RB2405", "daily").unwrap();

    // The only worker is held by a slow write
    h.bars.delay_next_write(Duration::from_millis(400));
    h.fetcher.reply("RB2401", vec![bar("2024-01-05", 1.0)]);
    let engine = Arc::clone(&h.engine);
    let first = {
        let busy = busy.clone();
        tokio::spawn(async move { engine.sync_one(&busy, SyncMode::Incremental).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = h.sync(&waiting, SyncMode::Incremental).await;
    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.error.unwrap().contains("waiting for a worker"));
    assert!(!h.fetcher.windows().is_empty());
    assert_eq!(h.fetcher.calls.lock().iter().filter(|(s, _)| s == &waiting).count(), 0);
    assert_eq!(h.ledger.recent(&waiting, 10).unwrap()[0].status, JobStatus::Failed);
    assert!(!h.engine.is_syncing(&waiting));

    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_transient_fetch_error_fails_job() {
    let h = harness();
    let series = rb2401();

    h.fetcher.push(
        "RB2401",
        Step::Reply(Err(FetchError::Unavailable("HTTP 503".into()))),
    );
    let report = h.sync(&series, SyncMode::Incremental).await;

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.error.unwrap().contains("transient"));
    assert!(h.cursor(&series).is_none());
}

#[tokio::test]
async fn test_truncated_fetch_is_partial_and_advances() {
    let h = harness();
    let series = rb2401();

    h.fetcher.push(
        "RB2401",
        Step::Reply(Ok(FetchOutcome::truncated(
            vec![bar("2024-01-03", 1.0), bar("2024-01-04", 2.0)],
            "page limit reached",
        ))),
    );
    let report = h.sync(&series, SyncMode::Incremental).await;

    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.rows_written, 2);
    assert!(report.error.unwrap().contains("page limit reached"));
    assert_eq!(h.cursor(&series).unwrap().last_ts, Some(ts("2024-01-04")));
}

#[tokio::test]
async fn test_rejected_bars() {
    let h = harness();
    let series = rb2401();

    // Some bad: partial
    h.fetcher.reply(
        "RB2401",
        vec![bar("2024-01-03", 1.0), RawBar::at("garbage"), bar("2024-01-04", 2.0)],
    );
    let report = h.sync(&series, SyncMode::Incremental).await;
    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.rows_written, 2);
    assert!(report.error.unwrap().contains("unparseable ts 'garbage'"));

    // All bad: failed, nothing written, cursor untouched
    let other = SeriesId::new("future", "RB2405", "daily").unwrap();
    h.fetcher
        .reply("RB2405", vec![RawBar::default(), RawBar::at("2099-01-01")]);
    let report = h.sync(&other, SyncMode::Incremental).await;
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.rows_fetched, 2);
    assert!(report.error.unwrap().starts_with("2 of 2 bars rejected"));
    assert!(h.cursor(&other).is_none());
    assert!(h.bars.query_range(&other, ts("1990-01-01"), ts("2100-01-01")).is_err());
}

#[tokio::test]
async fn test_full_resync_can_move_cursor_backward() {
    let h = harness();
    let series = rb2401();

    h.fetcher
        .reply("RB2401", vec![bar("2024-01-05", 1.0), bar("2024-01-08", 2.0)]);
    h.sync(&series, SyncMode::Incremental).await;
    assert_eq!(h.cursor(&series).unwrap().last_ts, Some(ts("2024-01-08")));

    // Provider withdrew the 01-08 bar
    h.fetcher.reply("RB2401", vec![bar("2024-01-05", 1.0)]);
    let report = h.sync(&series, SyncMode::Full).await;

    assert_eq!(report.status, JobStatus::Success);
    assert_eq!(report.last_ts, Some(ts("2024-01-05")));
    assert_eq!(h.fetcher.windows().last(), Some(&FetchWindow::Full));

    // An incremental sync never moves it backward
    h.fetcher.reply("RB2401", vec![bar("2024-01-04", 1.0)]);
    let report = h.sync(&series, SyncMode::Incremental).await;
    assert_eq!(report.last_ts, Some(ts("2024-01-05")));
}

#[tokio::test]
async fn test_empty_fetch_registers_series() {
    let h = harness();
    let series = rb2401();

    let report = h.sync(&series, SyncMode::Incremental).await;
    assert_eq!(report.status, JobStatus::Success);
    assert_eq!(report.rows_fetched, 0);

    let cursor = h.cursor(&series).unwrap();
    assert_eq!(cursor.last_ts, None);
    assert_eq!(cursor.last_sync, t0());
    assert!(h
        .bars
        .query_range(&series, ts("1990-01-01"), ts("2100-01-01"))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_missing_fetcher_fails_job() {
    let stores = SyncStores {
        bars: Arc::new(MemoryBarStore::new()),
        cursors: Arc::new(MemoryCursorStore::new()),
        ledger: Arc::new(MemoryJobLedger::new()),
        registry: Arc::new(MemorySeriesRegistry::new()),
    };
    let engine = SyncEngine::new(
        stores,
        FetcherRegistry::new(),
        Arc::new(ManualClock::new(t0())),
        SyncSettings::default(),
    );

    let outcome = engine.sync_one(&rb2401(), SyncMode::Full).await.unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("no fetcher"));
}

#[tokio::test]
async fn test_sweep_selects_due_series() {
    let h = harness();
    let fresh = SeriesId::new("future", "RB2401", "daily").unwrap();
    let stale = SeriesId::new("future", "RB2405", "daily").unwrap();
    let new = SeriesId::new("stock", "600000", "daily").unwrap();
    let failing = SeriesId::new("stock", "000001", "daily").unwrap();

    // `stale` synced a day ago, `fresh` an hour ago
    h.fetcher.reply("RB2405", vec![bar("2024-01-05", 1.0)]);
    h.sync(&stale, SyncMode::Incremental).await;
    h.clock.advance(chrono::Duration::hours(23));
    h.fetcher.reply("RB2401", vec![bar("2024-01-05", 1.0)]);
    h.sync(&fresh, SyncMode::Incremental).await;
    h.clock.advance(chrono::Duration::hours(1));

    h.registry.register(&new, t0()).unwrap();
    h.registry.register(&failing, t0()).unwrap();
    h.fetcher.reply("RB2405", vec![bar("2024-01-08", 2.0)]);
    h.fetcher.reply("600000", vec![bar("2024-01-08", 9.0)]);
    h.fetcher.push(
        "000001",
        Step::Reply(Err(FetchError::Rejected("HTTP 404".into()))),
    );

    let summary = h
        .engine
        .sync_due(h.clock.now(), chrono::Duration::hours(12))
        .await
        .unwrap();

    assert_eq!(summary.considered, 4);
    assert_eq!(summary.fresh, 1);
    assert_eq!(summary.dispatched, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert!(summary.errors.is_empty());

    assert_eq!(h.cursor(&stale).unwrap().last_ts, Some(ts("2024-01-08")));
    assert_eq!(h.cursor(&new).unwrap().last_ts, Some(ts("2024-01-08")));
    assert_eq!(h.ledger.recent(&fresh, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_sweep_backs_off_repeated_failures() {
    let h = harness();
    let series = rb2401();
    h.registry.register(&series, t0()).unwrap();

    for _ in 0..3 {
        h.fetcher.push(
            "RB2401",
            Step::Reply(Err(FetchError::RateLimited("HTTP 429".into()))),
        );
        h.sync(&series, SyncMode::Incremental).await;
    }

    let summary = h
        .engine
        .sync_due(h.clock.now(), chrono::Duration::hours(12))
        .await
        .unwrap();
    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.backed_off.len(), 1);
    assert_eq!(summary.backed_off[0].consecutive_failures, 3);
    assert_eq!(summary.backed_off[0].until, t0() + chrono::Duration::minutes(5));

    // Once the window passes the series is tried again
    h.clock.advance(chrono::Duration::minutes(5));
    h.fetcher.reply("RB2401", vec![bar("2024-01-05", 1.0)]);
    let summary = h
        .engine
        .sync_due(h.clock.now(), chrono::Duration::hours(12))
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
}
