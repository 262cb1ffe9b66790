//! Process configuration from flags and the environment

use crate::db::models::SeriesId;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "historify")]
#[command(about = "Keeps local OHLCV bar series in sync with a kline provider", long_about = None)]
pub struct Config {
    /// Directory holding the SQLite and DuckDB files
    #[arg(long, env = "HISTORIFY_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Base URL of the kline provider
    #[arg(long, env = "HISTORIFY_PROVIDER_URL", default_value = "http://localhost:8080")]
    pub provider_url: String,

    /// Series registered for tracking at startup, e.g. `future:RB2401:daily,stock:600000:daily`
    #[arg(long, env = "HISTORIFY_SERIES", value_delimiter = ',', value_parser = parse_series)]
    pub series: Vec<SeriesId>,

    /// Refresh tracked series from the provider's symbol list before each sweep
    #[arg(long, env = "HISTORIFY_REFRESH_SERIES")]
    pub refresh_series: bool,
}

/// Main contracts tracked when nothing else is known
const FALLBACK_SYMBOLS: &[&str] = &["LH0", "SH0", "RB0", "M0", "IF0"];

impl Config {
    /// Series that seed an empty registry when the symbol list is unavailable
    pub fn seed_series(&self) -> Vec<SeriesId> {
        if !self.series.is_empty() {
            return self.series.clone();
        }
        FALLBACK_SYMBOLS
            .iter()
            .filter_map(|code| SeriesId::new("future", *code, "daily").ok())
            .collect()
    }
}

fn parse_series(value: &str) -> Result<SeriesId, String> {
    value.trim().parse::<SeriesId>().map_err(|e| e.to_string())
}
