//! Binance kline decoding and the closed-candle filter.
//!
//! Accepts single-stream payloads:
//!
//! ```text
//! { "e": "kline", "s": "BTCUSDT", "k": { "t": .., "T": .., "i": "1m", "o": "..", "x": false, .. } }
//! ```
//!
//! and the combined-stream envelope `{ "stream": "btcusdt@kline_1m", "data": { .. } }`.

use crate::error::StreamError;
use crate::types::{Candle, StreamKey};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: RawKline,
}

/// One kline update as sent by the exchange. Prices arrive as decimal strings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawKline {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Whether this bar is final.
    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl RawKline {
    /// Project into a [`Candle`], converting epoch milliseconds.
    pub fn into_candle(self) -> Result<Candle, StreamError> {
        Ok(Candle {
            symbol: self.symbol.to_uppercase(),
            interval: self.interval,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            open_time: millis(self.open_time)?,
            close_time: millis(self.close_time)?,
        })
    }
}

/// Decode one text frame. `Ok(None)` for anything that is not a kline event
/// (subscription acks, other event types).
pub fn decode_frame(text: &str) -> Result<Option<RawKline>, StreamError> {
    let mut root: serde_json::Value =
        serde_json::from_str(text).map_err(|e| StreamError::Decode(format!("invalid JSON: {}", e)))?;

    let combined = root.get_mut("data").map(serde_json::Value::take);
    if let Some(data) = combined {
        root = data;
    }

    if root.get("e").and_then(|e| e.as_str()) != Some("kline") || root.get("k").is_none() {
        return Ok(None);
    }

    let event: KlineEvent = serde_json::from_value(root)
        .map_err(|e| StreamError::Decode(format!("malformed kline: {}", e)))?;
    Ok(Some(event.kline))
}

fn millis(ms: i64) -> Result<DateTime<Utc>, StreamError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StreamError::Decode(format!("timestamp out of range: {}", ms)))
}

/// Passes closed bars only, at most once per close time and stream. A bar
/// counts as emitted once the caller confirms it with [`mark_emitted`].
///
/// [`mark_emitted`]: CandleAggregator::mark_emitted
#[derive(Debug, Default)]
pub struct CandleAggregator {
    last_emitted: HashMap<StreamKey, DateTime<Utc>>,
}

impl CandleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a frame and filter it.
    pub fn process_frame(&mut self, text: &str) -> Result<Option<Candle>, StreamError> {
        match decode_frame(text)? {
            Some(raw) => self.accept(raw),
            None => Ok(None),
        }
    }

    /// Returns the candle when the bar is closed and newer than the last one
    /// emitted for its stream. In-progress bars are dropped.
    ///
    /// Accepting does not record the bar; a candle that never reaches the
    /// queue is accepted again when the feed redelivers it.
    pub fn accept(&mut self, raw: RawKline) -> Result<Option<Candle>, StreamError> {
        if !raw.is_closed {
            return Ok(None);
        }

        let candle = raw.into_candle()?;
        let key = candle.key();
        if let Some(last) = self.last_emitted.get(&key) {
            if candle.close_time <= *last {
                debug!(key = %key, close_time = %candle.close_time, "replayed closed bar dropped");
                return Ok(None);
            }
        }

        Ok(Some(candle))
    }

    /// Record a candle as handed downstream.
    pub fn mark_emitted(&mut self, candle: &Candle) {
        let last = self.last_emitted.entry(candle.key()).or_insert(candle.close_time);
        if candle.close_time > *last {
            *last = candle.close_time;
        }
    }

    /// Close time of the last emitted bar of a stream.
    pub fn last_close_time(&self, key: &StreamKey) -> Option<DateTime<Utc>> {
        self.last_emitted.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn frame(close_ms: i64, close: &str, is_closed: bool) -> String {
        serde_json::json!({
            "e": "kline",
            "E": close_ms - 10,
            "s": "BTCUSDT",
            "k": {
                "t": close_ms - 59_999,
                "T": close_ms,
                "s": "BTCUSDT",
                "i": "1m",
                "f": 100,
                "L": 200,
                "o": "43000.10",
                "c": close,
                "h": "43100.00",
                "l": "42950.55",
                "v": "12.00345678",
                "n": 100,
                "x": is_closed,
                "q": "516000.0",
                "V": "6.0",
                "Q": "258000.0",
                "B": "0"
            }
        })
        .to_string()
    }

    #[test]
    fn test_decode_single_stream() {
        let raw = decode_frame(&frame(1_700_000_059_999, "43050.25", true)).unwrap().unwrap();
        assert_eq!(raw.symbol, "BTCUSDT");
        assert_eq!(raw.interval, "1m");
        assert_eq!(raw.close, dec!(43050.25));
        assert_eq!(raw.volume, dec!(12.00345678));
        assert!(raw.is_closed);

        let candle = raw.into_candle().unwrap();
        assert_eq!(candle.close_time.timestamp_millis(), 1_700_000_059_999);
        assert_eq!(candle.open_time.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_decode_combined_envelope() {
        let inner: serde_json::Value =
            serde_json::from_str(&frame(1_700_000_059_999, "1.5", false)).unwrap();
        let text = serde_json::json!({ "stream": "btcusdt@kline_1m", "data": inner }).to_string();

        let raw = decode_frame(&text).unwrap().unwrap();
        assert!(!raw.is_closed);
        assert_eq!(raw.close, dec!(1.5));
    }

    #[test]
    fn test_non_kline_messages_ignored() {
        assert!(decode_frame(r#"{"result":null,"id":1}"#).unwrap().is_none());
        assert!(decode_frame(r#"{"e":"trade","s":"BTCUSDT","p":"1"}"#).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frames_are_decode_errors() {
        assert!(matches!(decode_frame("not json"), Err(StreamError::Decode(_))));

        let bad_price = frame(1_700_000_059_999, "abc", true);
        assert!(matches!(decode_frame(&bad_price), Err(StreamError::Decode(_))));
    }

    #[test]
    fn test_only_closed_bar_passes() {
        let mut aggregator = CandleAggregator::new();
        let close_ms = 1_700_000_059_999;

        let mut emitted = Vec::new();
        for i in 0..10 {
            let price = format!("43000.{}", i);
            if let Some(c) = aggregator.process_frame(&frame(close_ms, &price, false)).unwrap() {
                emitted.push(c);
            }
        }
        if let Some(c) = aggregator.process_frame(&frame(close_ms, "43009.99", true)).unwrap() {
            emitted.push(c);
        }

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].close, dec!(43009.99));
    }

    #[test]
    fn test_replayed_close_dropped() {
        let mut aggregator = CandleAggregator::new();
        let first = frame(1_700_000_059_999, "1", true);
        let second = frame(1_700_000_119_999, "2", true);

        let candle = aggregator.process_frame(&first).unwrap().unwrap();
        aggregator.mark_emitted(&candle);
        assert!(aggregator.process_frame(&first).unwrap().is_none());

        let candle = aggregator.process_frame(&second).unwrap().unwrap();
        aggregator.mark_emitted(&candle);
        assert!(aggregator.process_frame(&first).unwrap().is_none());
        assert!(aggregator.process_frame(&second).unwrap().is_none());

        let key = StreamKey::new("btcusdt", "1m");
        assert_eq!(
            aggregator.last_close_time(&key).unwrap().timestamp_millis(),
            1_700_000_119_999
        );
    }

    #[test]
    fn test_unconfirmed_bar_is_accepted_again() {
        let mut aggregator = CandleAggregator::new();
        let first = frame(1_700_000_059_999, "1", true);

        assert!(aggregator.process_frame(&first).unwrap().is_some());
        assert!(aggregator.process_frame(&first).unwrap().is_some());
        assert!(aggregator.last_close_time(&StreamKey::new("BTCUSDT", "1m")).is_none());
    }
}
