//! Historical klines from the Binance REST API, used to backfill the candle
//! archive at start-up.

use crate::services::CandleStore;
use crate::types::{Candle, StreamKey};
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default Binance REST base.
pub const DEFAULT_FEED_REST_URL: &str = "https://api.binance.com/api/v3";

/// Binance caps a klines request at this many rows.
const MAX_LIMIT: u32 = 1000;

/// How much of a failed response body ends up in the log.
const ERROR_EXCERPT_CHARS: usize = 200;

/// Binance REST klines client.
#[derive(Clone)]
pub struct KlineHistoryClient {
    client: Client,
    base_url: String,
}

impl KlineHistoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .user_agent("tickvault/0.1")
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Fetch the most recent `limit` bars and keep the closed ones.
    pub async fn fetch_closed(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> anyhow::Result<Vec<Candle>> {
        let key = StreamKey::new(symbol, interval);
        let url = format!("{}/klines", self.base_url.trim_end_matches('/'));
        let limit = limit.clamp(1, MAX_LIMIT).to_string();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", key.symbol.as_str()),
                ("interval", key.interval.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(
                "Klines API returned {} for {}: {}",
                status,
                key,
                error_excerpt(&text)
            );
            return Err(anyhow::anyhow!("klines API error: {}", status));
        }

        let rows: Vec<Vec<serde_json::Value>> = response.json().await?;
        parse_kline_rows(&key, &rows, Utc::now())
    }

    /// Fetch and store closed bars. Returns how many were new.
    pub async fn backfill(
        &self,
        store: &CandleStore,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> anyhow::Result<usize> {
        let candles = self.fetch_closed(symbol, interval, limit).await?;
        let mut inserted = 0;
        for candle in &candles {
            if store.insert_with_retry(candle).await? {
                inserted += 1;
            }
        }
        info!(
            "Backfilled {}@{}: {} fetched, {} new",
            symbol.to_uppercase(),
            interval,
            candles.len(),
            inserted
        );
        Ok(inserted)
    }
}

/// First characters of an error body, for logging.
fn error_excerpt(text: &str) -> String {
    text.chars().take(ERROR_EXCERPT_CHARS).collect()
}

/// Turn REST rows `[openTime, open, high, low, close, volume, closeTime, ..]`
/// into candles. Rows whose close time is not yet past are still forming and
/// are skipped.
pub fn parse_kline_rows(
    key: &StreamKey,
    rows: &[Vec<serde_json::Value>],
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<Candle>> {
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 7 {
            return Err(anyhow::anyhow!("kline row has {} fields, expected at least 7", row.len()));
        }

        let close_time = millis_at(row, 6)?;
        if close_time >= now {
            debug!("Skipping forming bar of {} closing at {}", key, close_time);
            continue;
        }

        candles.push(Candle {
            symbol: key.symbol.clone(),
            interval: key.interval.clone(),
            open: decimal_at(row, 1)?,
            high: decimal_at(row, 2)?,
            low: decimal_at(row, 3)?,
            close: decimal_at(row, 4)?,
            volume: decimal_at(row, 5)?,
            open_time: millis_at(row, 0)?,
            close_time,
        });
    }
    Ok(candles)
}

fn decimal_at(row: &[serde_json::Value], idx: usize) -> anyhow::Result<Decimal> {
    match &row[idx] {
        serde_json::Value::String(s) => Ok(Decimal::from_str(s)?),
        serde_json::Value::Number(n) => Ok(Decimal::from_str(&n.to_string())?),
        other => Err(anyhow::anyhow!("field {} is not a decimal: {}", idx, other)),
    }
}

fn millis_at(row: &[serde_json::Value], idx: usize) -> anyhow::Result<DateTime<Utc>> {
    row[idx]
        .as_i64()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| anyhow::anyhow!("field {} is not an epoch millisecond timestamp", idx))
}
