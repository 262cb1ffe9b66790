//! Market data provider adapters

pub mod http;
pub mod types;
pub mod weekly;

use crate::db::models::{FetchWindow, SeriesId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
pub use types::*;

/// Fetcher trait that all provider implementations must implement
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Provider ID (e.g., "tdx-http")
    fn id(&self) -> &str;

    /// Fetch bars for a series. `Since(ts)` is exclusive of `ts`.
    async fn fetch(
        &self,
        series: &SeriesId,
        window: FetchWindow,
    ) -> std::result::Result<FetchOutcome, FetchError>;
}

/// Source of the series a provider can serve
#[async_trait]
pub trait SeriesSource: Send + Sync {
    async fn list_series(&self) -> std::result::Result<Vec<SeriesId>, FetchError>;
}

/// Fetcher registry keyed by asset type
#[derive(Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn Fetcher>>,
    default: Option<Arc<dyn Fetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that sends every asset type to one fetcher
    pub fn with_default(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetchers: HashMap::new(),
            default: Some(fetcher),
        }
    }

    /// Register a fetcher for one asset type, replacing any previous one
    pub fn register(&mut self, asset_type: &str, fetcher: Arc<dyn Fetcher>) {
        self.fetchers.insert(asset_type.to_string(), fetcher);
    }

    pub fn set_default(&mut self, fetcher: Arc<dyn Fetcher>) {
        self.default = Some(fetcher);
    }

    /// Get the fetcher for an asset type, falling back to the default
    pub fn get(&self, asset_type: &str) -> Option<Arc<dyn Fetcher>> {
        self.fetchers
            .get(asset_type)
            .or(self.default.as_ref())
            .cloned()
    }
}
