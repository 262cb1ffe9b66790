//! Application state management

use crate::db::duckdb::DuckDb;
use crate::db::sqlite::{SqliteDb, SyncConfig, SyncConfigUpdate};
use crate::db::store::JobLedger;
use crate::error::Result;
use crate::providers::FetcherRegistry;
use crate::sync::clock::{Clock, SystemClock};
use crate::sync::{SyncEngine, SyncSettings, SyncStores};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application state shared by the services and the scheduler
pub struct AppState {
    /// SQLite database: cursors, job ledger, tracked series, settings
    pub sqlite: Arc<SqliteDb>,

    /// DuckDB connection for historical bars
    pub duckdb: Arc<DuckDb>,

    /// Store handles as the engine sees them
    pub stores: SyncStores,

    pub engine: Arc<SyncEngine>,

    /// Cached copy of the `sync_settings` row
    config: RwLock<SyncConfig>,

    /// Application data directory, `None` for in-memory state
    pub data_dir: Option<PathBuf>,
}

impl AppState {
    /// Open (or create) the databases under `data_dir`
    pub fn new(data_dir: &Path, fetchers: FetcherRegistry) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(data_dir)?;

        tracing::info!("Data directory: {:?}", data_dir);

        // Initialize SQLite database
        let sqlite = Arc::new(SqliteDb::new(&data_dir.join("historify.db"))?);

        // Initialize DuckDB for historical bars
        let duckdb = Arc::new(DuckDb::new(&data_dir.join("historify.duckdb"))?);

        Self::assemble(
            sqlite,
            duckdb,
            fetchers,
            Arc::new(SystemClock),
            Some(data_dir.to_path_buf()),
        )
    }

    /// Throwaway state backed by in-memory databases
    pub fn open_in_memory(fetchers: FetcherRegistry, clock: Arc<dyn Clock>) -> Result<Self> {
        let sqlite = Arc::new(SqliteDb::open_in_memory()?);
        let duckdb = Arc::new(DuckDb::open_in_memory()?);
        Self::assemble(sqlite, duckdb, fetchers, clock, None)
    }

    fn assemble(
        sqlite: Arc<SqliteDb>,
        duckdb: Arc<DuckDb>,
        fetchers: FetcherRegistry,
        clock: Arc<dyn Clock>,
        data_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let config = sqlite.get_sync_config()?;

        // Jobs a previous process left running can never finish now
        sqlite.abandon_running(clock.now())?;

        let stores = SyncStores {
            bars: duckdb.clone(),
            cursors: sqlite.clone(),
            ledger: sqlite.clone(),
            registry: sqlite.clone(),
        };
        let engine = Arc::new(SyncEngine::new(
            stores.clone(),
            fetchers,
            clock,
            SyncSettings::from(&config),
        ));

        Ok(Self {
            sqlite,
            duckdb,
            stores,
            engine,
            config: RwLock::new(config),
            data_dir,
        })
    }

    /// Current sync settings
    pub fn get_sync_config(&self) -> SyncConfig {
        self.config.read().clone()
    }

    /// Persist a settings update. Concurrency, timeout and retry changes
    /// apply to engines built after the update.
    pub fn update_sync_config(&self, update: &SyncConfigUpdate) -> Result<SyncConfig> {
        let config = self.sqlite.update_sync_config(update)?;
        *self.config.write() = config.clone();
        Ok(config)
    }
}
