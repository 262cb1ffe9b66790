//! Database modules
//!
//! Bars live in DuckDB, engine bookkeeping lives in SQLite.

pub mod duckdb;
pub mod memory;
pub mod models;
pub mod sqlite;
pub mod store;

pub use self::duckdb::DuckDb;
pub use self::sqlite::SqliteDb;
pub use store::{BarStore, CursorStore, JobLedger, SeriesRegistry};
