//! Per-series leases
//!
//! At most one sync attempt may run for a series at a time. A lease is an
//! RAII guard: dropping it releases the series on every exit path.

use crate::db::models::SeriesId;
use crate::error::{AppError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Leases currently held, keyed by series with the holder's token
#[derive(Debug, Default)]
pub struct LeaseTable {
    held: DashMap<SeriesId, u64>,
    next_token: AtomicU64,
}

impl LeaseTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lease for `series`, or `None` if another attempt holds it
    pub fn try_acquire(self: &Arc<Self>, series: &SeriesId) -> Option<Lease> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;

        match self.held.entry(series.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(token);
                Some(Lease {
                    table: Arc::clone(self),
                    series: series.clone(),
                    token,
                    released: false,
                })
            }
        }
    }

    pub fn is_held(&self, series: &SeriesId) -> bool {
        self.held.contains_key(series)
    }

    fn release(&self, series: &SeriesId, token: u64) -> Result<()> {
        if self.held.remove_if(series, |_, held| *held == token).is_some() {
            return Ok(());
        }

        tracing::error!(
            "Lease release for {} with token {} does not match the holder",
            series,
            token
        );
        Err(AppError::Invariant(format!(
            "lease for {} released by a non-holder",
            series
        )))
    }
}

/// Exclusive right to sync one series
#[derive(Debug)]
pub struct Lease {
    table: Arc<LeaseTable>,
    series: SeriesId,
    token: u64,
    released: bool,
}

impl Lease {
    pub fn series(&self) -> &SeriesId {
        &self.series
    }

    /// Release explicitly, surfacing a foreign-release violation to the caller
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.table.release(&self.series, self.token)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            // Violations are already logged by the table
            let _ = self.table.release(&self.series, self.token);
        }
    }
}
