//! Sync Service
//!
//! Trigger side of the engine. Requests are queued to a dispatcher task
//! and each one runs on its own task; callers get a ticket they may await
//! or drop.

use crate::db::models::{SeriesId, SyncMode};
use crate::error::{AppError, Result};
use crate::providers::SeriesSource;
use crate::sync::{SweepSummary, SyncEngine, SyncOutcome};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

enum SyncRequest {
    Sync {
        series: SeriesId,
        mode: SyncMode,
        reply: oneshot::Sender<Result<SyncOutcome>>,
    },
    Sweep {
        staleness: chrono::Duration,
        reply: oneshot::Sender<Result<SweepSummary>>,
    },
}

/// Pending result of a queued request
#[derive(Debug)]
pub struct SyncTicket<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> SyncTicket<T> {
    /// Wait for the request to finish
    pub async fn wait(self) -> Result<T> {
        self.rx
            .await
            .map_err(|_| AppError::Internal("Sync request was dropped before finishing".to_string()))?
    }
}

/// Handle for queueing syncs
#[derive(Clone)]
pub struct SyncService {
    tx: mpsc::UnboundedSender<SyncRequest>,
    engine: Arc<SyncEngine>,
}

impl SyncService {
    /// Start the dispatcher on the current runtime
    pub fn start(engine: Arc<SyncEngine>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SyncRequest>();
        let dispatcher_engine = Arc::clone(&engine);

        tokio::spawn(async move {
            info!("Sync dispatcher started");
            while let Some(request) = rx.recv().await {
                let engine = Arc::clone(&dispatcher_engine);
                tokio::spawn(async move { handle(engine, request).await });
            }
            info!("Sync dispatcher stopped");
        });

        Self { tx, engine }
    }

    /// Queue one `sync_one`
    pub fn request_sync(&self, series: SeriesId, mode: SyncMode) -> Result<SyncTicket<SyncOutcome>> {
        let (reply, rx) = oneshot::channel();
        debug!("Queueing {} sync of {}", mode, series);
        self.send(SyncRequest::Sync { series, mode, reply })?;
        Ok(SyncTicket { rx })
    }

    /// Queue one sweep over every due series
    pub fn request_sweep(&self, staleness: chrono::Duration) -> Result<SyncTicket<SweepSummary>> {
        let (reply, rx) = oneshot::channel();
        debug!("Queueing sweep (staleness {}s)", staleness.num_seconds());
        self.send(SyncRequest::Sweep { staleness, reply })?;
        Ok(SyncTicket { rx })
    }

    /// Track a series so sweeps keep it current
    pub fn register_series(&self, series: &SeriesId) -> Result<bool> {
        let now = self.engine.now();
        let added = self.engine.stores().registry.register(series, now)?;
        if added {
            info!("Tracking {}", series);
        }
        Ok(added)
    }

    /// Stop tracking a series; stored bars are kept
    pub fn unregister_series(&self, series: &SeriesId) -> Result<bool> {
        let removed = self.engine.stores().registry.unregister(series)?;
        if removed {
            info!("No longer tracking {}", series);
        }
        Ok(removed)
    }

    pub fn tracked_series(&self) -> Result<Vec<SeriesId>> {
        self.engine.stores().registry.list()
    }

    /// Track every series `source` lists; returns how many were new.
    ///
    /// Series are only ever added. When the source fails or lists nothing the
    /// registry already on disk stays in use, and an empty registry is seeded
    /// with `defaults`.
    pub async fn refresh_registry(
        &self,
        source: &dyn SeriesSource,
        defaults: &[SeriesId],
    ) -> Result<usize> {
        let listed = match source.list_series().await {
            Ok(listed) if !listed.is_empty() => listed,
            Ok(_) => {
                warn!("Symbol list is empty, keeping tracked series");
                Vec::new()
            }
            Err(e) => {
                warn!("Symbol list refresh failed, keeping tracked series: {}", e);
                Vec::new()
            }
        };

        let mut added = 0;
        for series in &listed {
            if self.register_series(series)? {
                added += 1;
            }
        }

        if listed.is_empty() && self.tracked_series()?.is_empty() {
            for series in defaults {
                if self.register_series(series)? {
                    added += 1;
                }
            }
        }

        if added > 0 {
            info!("Symbol refresh added {} series", added);
        }
        Ok(added)
    }

    fn send(&self, request: SyncRequest) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| AppError::Internal("Sync dispatcher is not running".to_string()))
    }
}

async fn handle(engine: Arc<SyncEngine>, request: SyncRequest) {
    match request {
        SyncRequest::Sync { series, mode, reply } => {
            let result = engine.sync_one(&series, mode).await;
            // Callers may drop their ticket
            let _ = reply.send(result);
        }
        SyncRequest::Sweep { staleness, reply } => {
            let result = engine.sync_due(engine.now(), staleness).await;
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryBarStore, MemoryCursorStore, MemoryJobLedger, MemorySeriesRegistry};
    use crate::db::models::{FetchWindow, JobStatus};
    use crate::providers::{FetchError, FetchOutcome, Fetcher, FetcherRegistry, RawBar};
    use parking_lot::Mutex;
    use crate::sync::clock::ManualClock;
    use crate::sync::{SyncSettings, SyncStores};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    struct OneBar;

    #[async_trait]
    impl Fetcher for OneBar {
        fn id(&self) -> &str {
            "one-bar"
        }

        async fn fetch(
            &self,
            _series: &SeriesId,
            _window: FetchWindow,
        ) -> std::result::Result<FetchOutcome, FetchError> {
            Ok(FetchOutcome::complete(vec![
                RawBar::at("2024-01-05").with_ohlc(1.0, 2.0, 0.5, 1.5)
            ]))
        }
    }

    fn service() -> SyncService {
        let stores = SyncStores {
            bars: Arc::new(MemoryBarStore::new()),
            cursors: Arc::new(MemoryCursorStore::new()),
            ledger: Arc::new(MemoryJobLedger::new()),
            registry: Arc::new(MemorySeriesRegistry::new()),
        };
        let engine = SyncEngine::new(
            stores,
            FetcherRegistry::with_default(Arc::new(OneBar)),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 8, 7, 10, 0).unwrap())),
            SyncSettings::default(),
        );
        SyncService::start(Arc::new(engine))
    }

    #[tokio::test]
    async fn test_request_sync_ticket() {
        let service = service();
        let series = SeriesId::new("future", "RB2401", "daily").unwrap();

        let outcome = service
            .request_sync(series, SyncMode::Full)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.report().unwrap().status, JobStatus::Success);
    }

    #[tokio::test]
    async fn test_request_sweep_covers_tracked_series() {
        let service = service();
        let a = SeriesId::new("future", "RB2401", "daily").unwrap();
        let b = SeriesId::new("stock", "600000", "daily").unwrap();

        assert!(service.register_series(&a).unwrap());
        assert!(service.register_series(&b).unwrap());
        assert!(!service.register_series(&a).unwrap());
        assert_eq!(service.tracked_series().unwrap().len(), 2);

        let summary = service
            .request_sweep(chrono::Duration::hours(12))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 2);

        // Both are fresh now
        let summary = service
            .request_sweep(chrono::Duration::hours(12))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.fresh, 2);

        assert!(service.unregister_series(&b).unwrap());
        assert_eq!(service.tracked_series().unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_dropped_ticket_does_not_stop_the_sync() {
        let service = service();
        let series = SeriesId::new("future", "RB2401", "daily").unwrap();

        drop(service.request_sync(series.clone(), SyncMode::Full).unwrap());

        // A later request is still served
        let outcome = service
            .request_sync(series, SyncMode::Incremental)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(outcome.report().is_some() || matches!(outcome, SyncOutcome::Skipped { .. }));
    }

    /// Replays one symbol list reply per call
    struct Listing(Mutex<Vec<std::result::Result<Vec<SeriesId>, FetchError>>>);

    #[async_trait]
    impl SeriesSource for Listing {
        async fn list_series(&self) -> std::result::Result<Vec<SeriesId>, FetchError> {
            self.0.lock().remove(0)
        }
    }

    fn daily(symbol: &str) -> SeriesId {
        SeriesId::new("future", symbol, "daily").unwrap()
    }

    #[tokio::test]
    async fn test_refresh_registry_adds_and_keeps_cache() {
        let service = service();
        let defaults = vec![daily("RB0"), daily("IF0")];
        let source = Listing(Mutex::new(vec![
            Err(FetchError::Unavailable("HTTP 503".into())),
            Ok(vec![daily("LH0"), daily("RB0")]),
            Err(FetchError::Timeout),
            Ok(vec![daily("LH0")]),
        ]));

        // Nothing tracked and no list: the defaults seed the registry
        assert_eq!(service.refresh_registry(&source, &defaults).await.unwrap(), 2);
        assert_eq!(service.tracked_series().unwrap().len(), 2);

        assert_eq!(service.refresh_registry(&source, &defaults).await.unwrap(), 1);
        assert_eq!(service.tracked_series().unwrap().len(), 3);

        // A failed refresh leaves the known series in place
        assert_eq!(service.refresh_registry(&source, &defaults).await.unwrap(), 0);
        assert_eq!(service.tracked_series().unwrap().len(), 3);

        // Series missing from a later list are not dropped
        assert_eq!(service.refresh_registry(&source, &defaults).await.unwrap(), 0);
        assert_eq!(service.tracked_series().unwrap().len(), 3);
    }
}
