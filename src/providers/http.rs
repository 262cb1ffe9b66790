//! HTTP kline provider
//!
//! Talks to a local kline service: `GET {base}/api/kline?code=&asset_type=&period=[&since=]`
//! for bars and `GET {base}/api/symbols` for the tradable symbol list.

use super::{FetchError, FetchOutcome, Fetcher, RawBar, SeriesSource};
use crate::db::models::{format_ts, parse_ts, FetchWindow, SeriesId};
use std::collections::BTreeSet;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;
use url::Url;

const TS_KEYS: &[&str] = &["Date", "date", "Time", "time", "datetime", "ts"];
const OPEN_KEYS: &[&str] = &["Open", "open"];
const HIGH_KEYS: &[&str] = &["High", "high"];
const LOW_KEYS: &[&str] = &["Low", "low"];
const CLOSE_KEYS: &[&str] = &["Close", "close"];
const VOLUME_KEYS: &[&str] = &["Vol", "vol", "Volume", "volume"];
const AMOUNT_KEYS: &[&str] = &["Amount", "amount"];
const OI_KEYS: &[&str] = &["OpenInterest", "open_interest", "hold"];

/// Fetcher backed by the kline HTTP service
pub struct HttpFetcher {
    client: Client,
    endpoint: Url,
    symbols_endpoint: Url,
}

impl HttpFetcher {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("Invalid provider URL '{}': {}", base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let join = |path: &str| {
            base.join(path).map_err(|e| {
                AppError::Config(format!("Invalid provider URL '{}': {}", base_url, e))
            })
        };
        let endpoint = join("api/kline")?;
        let symbols_endpoint = join("api/symbols")?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            symbols_endpoint,
        })
    }

    /// Request URL for one series and window
    pub fn request_url(&self, series: &SeriesId, window: FetchWindow) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("code", &series.symbol)
                .append_pair("asset_type", &series.asset_type)
                .append_pair("period", &series.period);
            if let FetchWindow::Since(ts) = window {
                query.append_pair("since", &format_ts(&ts));
            }
        }
        url
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn id(&self) -> &str {
        "tdx-http"
    }

    async fn fetch(
        &self,
        series: &SeriesId,
        window: FetchWindow,
    ) -> std::result::Result<FetchOutcome, FetchError> {
        let url = self.request_url(series, window);
        tracing::debug!("Fetching {} from {}", series, url);

        let response = self.client.get(url).send().await.map_err(classify_send_error)?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        let outcome = parse_kline_response(&body)?;
        Ok(match window {
            FetchWindow::Since(since) => drop_seen(outcome, since),
            FetchWindow::Full => outcome,
        })
    }
}

#[async_trait]
impl SeriesSource for HttpFetcher {
    async fn list_series(&self) -> std::result::Result<Vec<SeriesId>, FetchError> {
        tracing::debug!("Fetching symbol list from {}", self.symbols_endpoint);

        let response = self
            .client
            .get(self.symbols_endpoint.clone())
            .send()
            .await
            .map_err(classify_send_error)?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        parse_symbol_list(&body)
    }
}

/// Drop bars at or before `since`; the provider may ignore the parameter.
/// Bars whose ts does not parse are kept so the merger can reject them.
pub fn drop_seen(mut outcome: FetchOutcome, since: chrono::NaiveDateTime) -> FetchOutcome {
    let before = outcome.bars.len();
    outcome
        .bars
        .retain(|bar| bar.ts.as_deref().and_then(parse_ts).map_or(true, |ts| ts > since));

    let dropped = before - outcome.bars.len();
    if dropped > 0 {
        tracing::debug!("Dropped {} bars at or before {}", dropped, format_ts(&since));
    }
    outcome
}

/// Decode `{"futures": [{"code": "RB0", ...}], "stocks": [...]}` into daily series.
///
/// Each key names an asset type in the plural. Entries without a code are skipped.
pub fn parse_symbol_list(body: &Value) -> std::result::Result<Vec<SeriesId>, FetchError> {
    let groups = body
        .as_object()
        .ok_or_else(|| FetchError::Decode("expected an object of symbol lists".to_string()))?;

    let mut series = BTreeSet::new();
    for (key, items) in groups {
        let Some(items) = items.as_array() else {
            continue;
        };
        let asset_type = key.strip_suffix('s').unwrap_or(key);
        for item in items {
            let code = item.get("code").and_then(Value::as_str).map(str::trim);
            if let Some(Ok(id)) = code.map(|c| SeriesId::new(asset_type, c, "daily")) {
                series.insert(id);
            }
        }
    }

    Ok(series.into_iter().collect())
}

fn classify_send_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_connect() {
        FetchError::Unavailable(e.to_string())
    } else {
        FetchError::Http(e)
    }
}

/// Map a non-success HTTP status to a fetch error
pub fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Some(FetchError::RateLimited(format!("HTTP {}", status)))
    } else if status.is_server_error() {
        Some(FetchError::Unavailable(format!("HTTP {}", status)))
    } else if status.is_client_error() {
        Some(FetchError::Rejected(format!("HTTP {}", status)))
    } else {
        None
    }
}

/// Decode a kline body into raw bars.
///
/// Accepts a bare list, `{"data": [...]}`, `{"data": {"List": [...]}}` and
/// `{"list": [...]}`. Items that are not objects come through with no ts so
/// the merger rejects them.
pub fn parse_kline_response(body: &Value) -> std::result::Result<FetchOutcome, FetchError> {
    let items = kline_items(body).ok_or_else(|| {
        FetchError::Decode("expected a kline list, data.List, data or list array".to_string())
    })?;

    let bars = items
        .iter()
        .map(|item| match item.as_object() {
            Some(obj) => raw_bar(obj),
            None => RawBar::default(),
        })
        .collect();

    let truncated = match body.get("truncated") {
        Some(Value::Bool(true)) => Some(
            body.get("truncated_reason")
                .and_then(Value::as_str)
                .unwrap_or("provider returned a partial result")
                .to_string(),
        ),
        _ => None,
    };

    Ok(FetchOutcome { bars, truncated })
}

fn kline_items(body: &Value) -> Option<&Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(obj) => match obj.get("data") {
            Some(Value::Array(items)) => Some(items),
            Some(Value::Object(data)) => data
                .get("List")
                .or_else(|| data.get("list"))
                .and_then(Value::as_array),
            _ => obj.get("list").and_then(Value::as_array),
        },
        _ => None,
    }
}

fn raw_bar(obj: &Map<String, Value>) -> RawBar {
    RawBar {
        ts: first_value(obj, TS_KEYS).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }),
        open: number(obj, OPEN_KEYS),
        high: number(obj, HIGH_KEYS),
        low: number(obj, LOW_KEYS),
        close: number(obj, CLOSE_KEYS),
        volume: number(obj, VOLUME_KEYS),
        open_interest: number(obj, OI_KEYS),
        amount: number(obj, AMOUNT_KEYS),
    }
}

fn first_value<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn number(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    match first_value(obj, keys)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
