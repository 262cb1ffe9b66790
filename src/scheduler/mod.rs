//! Scheduler module for time-based tasks

pub mod daily_sync;

pub use daily_sync::DailySyncScheduler;
