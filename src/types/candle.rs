use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one kline stream: a trading pair at a fixed bar interval.
///
/// Symbols are normalised to upper case (`BTCUSDT`), matching the exchange
/// payloads. Intervals are kept verbatim because they are case sensitive
/// (`1m` is one minute, `1M` is one month).
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamKey {
    pub symbol: String,
    pub interval: String,
}

impl StreamKey {
    pub fn new(symbol: &str, interval: &str) -> Self {
        Self {
            symbol: symbol.trim().to_uppercase(),
            interval: interval.trim().to_string(),
        }
    }

    /// Parse a `symbol@interval` pair such as `btcusdt@1m`.
    pub fn parse(value: &str) -> Option<Self> {
        let (symbol, interval) = value.trim().split_once('@')?;
        if symbol.is_empty() || interval.is_empty() {
            return None;
        }
        Some(Self::new(symbol, interval))
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// A finalized OHLCV bar. Only bars the exchange flagged as closed are ever
/// turned into a `Candle`; they are never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
}

impl Candle {
    pub fn key(&self) -> StreamKey {
        StreamKey::new(&self.symbol, &self.interval)
    }
}

/// Latest known price for a stream, pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestPrice {
    pub symbol: String,
    pub interval: String,
    pub price: Decimal,
    pub close_time: DateTime<Utc>,
}

impl From<&Candle> for LatestPrice {
    fn from(candle: &Candle) -> Self {
        Self {
            symbol: candle.symbol.clone(),
            interval: candle.interval.clone(),
            price: candle.close,
            close_time: candle.close_time,
        }
    }
}
