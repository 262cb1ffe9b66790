//! Services Layer
//!
//! Entry points shared by the binary, the scheduler and embedding code.
//!
//! # Services
//!
//! - `SyncService` - Queue single-series syncs and sweeps, manage tracked series
//! - `HistoryService` - Read bars, cursors and the job ledger
//! - `QualityService` - Score a stored series for gaps and bad rows

pub mod history_service;
pub mod quality_service;
pub mod sync_service;

pub use history_service::{HistoryResult, HistoryService};
pub use quality_service::{QualityReport, QualityService};
pub use sync_service::{SyncService, SyncTicket};
