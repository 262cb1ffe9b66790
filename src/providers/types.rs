//! Common provider types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A bar exactly as the provider sent it, before validation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub ts: Option<String>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub open_interest: Option<f64>,
    pub amount: Option<f64>,
}

impl RawBar {
    /// Raw bar with only a timestamp
    pub fn at(ts: impl Into<String>) -> Self {
        Self {
            ts: Some(ts.into()),
            ..Default::default()
        }
    }

    pub fn with_ohlc(mut self, open: f64, high: f64, low: f64, close: f64) -> Self {
        self.open = Some(open);
        self.high = Some(high);
        self.low = Some(low);
        self.close = Some(close);
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }
}

/// Successful fetch result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    /// Bars in non-decreasing ts order; empty means no new data
    pub bars: Vec<RawBar>,
    /// Set when the provider returned only part of the requested window
    pub truncated: Option<String>,
}

impl FetchOutcome {
    pub fn complete(bars: Vec<RawBar>) -> Self {
        Self {
            bars,
            truncated: None,
        }
    }

    pub fn truncated(bars: Vec<RawBar>, reason: impl Into<String>) -> Self {
        Self {
            bars,
            truncated: Some(reason.into()),
        }
    }
}

/// Fetch failures
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Provider request timed out")]
    Timeout,

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider rejected request: {0}")]
    Rejected(String),

    #[error("Could not decode provider response: {0}")]
    Decode(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl FetchError {
    /// Whether a later retry may succeed without any change on our side
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::RateLimited(_) | FetchError::Unavailable(_) => true,
            FetchError::Http(e) => e.is_timeout() || e.is_connect(),
            FetchError::Rejected(_) | FetchError::Decode(_) => false,
        }
    }
}
