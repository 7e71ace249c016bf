//! Closed-candle archive plus the in-memory latest-candle cache.
//!
//! The stream side hands closed candles over a bounded queue to a single writer
//! task ([`CandleStore::spawn_writer`]); inserts are idempotent on
//! (symbol, interval, close_time), so a bar replayed after a reconnect is a no-op.

use crate::error::StreamError;
use crate::services::SqliteStore;
use crate::types::{Candle, LatestPrice, StreamKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Append-only candle storage with a latest-candle cache.
pub struct CandleStore {
    sqlite: Arc<SqliteStore>,
    latest: DashMap<StreamKey, Candle>,
    candle_tx: broadcast::Sender<Candle>,
}

impl CandleStore {
    pub fn new(sqlite: Arc<SqliteStore>) -> Arc<Self> {
        let (candle_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            sqlite,
            latest: DashMap::new(),
            candle_tx,
        })
    }

    /// Store a closed candle. Returns `Ok(false)` when the bar was already
    /// stored; duplicates are not an error.
    pub fn insert(&self, candle: &Candle) -> Result<bool, StreamError> {
        let inserted = self.sqlite.insert_candle(candle)?;
        if !inserted {
            debug!(key = %candle.key(), close_time = %candle.close_time, "duplicate candle ignored");
            return Ok(false);
        }

        let key = candle.key();
        let is_newer = self
            .latest
            .get(&key)
            .map(|cached| candle.close_time > cached.close_time)
            .unwrap_or(true);
        if is_newer {
            self.latest.insert(key, candle.clone());
        }

        // No receivers is fine.
        let _ = self.candle_tx.send(candle.clone());
        Ok(true)
    }

    /// Insert with a bounded number of retries on transient failures.
    pub async fn insert_with_retry(&self, candle: &Candle) -> Result<bool, StreamError> {
        let mut attempt = 1;
        loop {
            match self.insert(candle) {
                Ok(inserted) => return Ok(inserted),
                Err(StreamError::TransientIo(e)) if attempt < WRITE_ATTEMPTS => {
                    warn!(attempt, error = %e, "candle insert failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(WRITE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Candles with `close_time` in the inclusive range, oldest first.
    pub fn range(
        &self,
        symbol: &str,
        interval: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, StreamError> {
        let key = StreamKey::new(symbol, interval);
        Ok(self.sqlite.get_candles(&key.symbol, &key.interval, from, to, None)?)
    }

    /// Latest closed candle for a stream, from cache or storage.
    pub fn latest(&self, symbol: &str, interval: &str) -> Option<Candle> {
        let key = StreamKey::new(symbol, interval);
        if let Some(candle) = self.latest.get(&key) {
            return Some(candle.clone());
        }

        match self.sqlite.latest_candle(&key.symbol, &key.interval) {
            Ok(Some(candle)) => {
                self.latest.insert(key, candle.clone());
                Some(candle)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Error loading latest candle for {}: {}", key, e);
                None
            }
        }
    }

    /// Latest close of every cached stream.
    pub fn latest_prices(&self) -> Vec<LatestPrice> {
        let mut prices: Vec<LatestPrice> = self
            .latest
            .iter()
            .map(|entry| LatestPrice::from(entry.value()))
            .collect();
        prices.sort_by(|a, b| (&a.symbol, &a.interval).cmp(&(&b.symbol, &b.interval)));
        prices
    }

    /// Number of stored candles for a stream.
    pub fn count(&self, symbol: &str, interval: &str) -> Result<usize, StreamError> {
        let key = StreamKey::new(symbol, interval);
        Ok(self.sqlite.candle_count(&key.symbol, &key.interval)?)
    }

    /// Receive every newly stored closed candle.
    pub fn subscribe(&self) -> broadcast::Receiver<Candle> {
        self.candle_tx.subscribe()
    }

    /// Drain the candle queue into storage until every sender is gone.
    pub fn spawn_writer(self: &Arc<Self>, mut rx: mpsc::Receiver<Candle>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            info!("Candle writer started");
            while let Some(candle) = rx.recv().await {
                match store.insert_with_retry(&candle).await {
                    Ok(true) => {
                        debug!(key = %candle.key(), close = %candle.close, "candle stored")
                    }
                    Ok(false) => {}
                    Err(e) => error!(key = %candle.key(), error = %e, "dropping candle after failed insert"),
                }
            }
            info!("Candle writer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn candle(symbol: &str, close_ms: i64, close: Decimal) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            interval: "1m".to_string(),
            open: dec!(1),
            high: dec!(2),
            low: dec!(0.5),
            close,
            volume: dec!(10),
            open_time: DateTime::<Utc>::from_timestamp_millis(close_ms - 59_999).unwrap(),
            close_time: DateTime::<Utc>::from_timestamp_millis(close_ms).unwrap(),
        }
    }

    fn store() -> Arc<CandleStore> {
        CandleStore::new(Arc::new(SqliteStore::new_in_memory().unwrap()))
    }

    #[test]
    fn test_insert_updates_latest_only_forward() {
        let store = store();
        store.insert(&candle("BTCUSDT", 120_000, dec!(2))).unwrap();
        store.insert(&candle("BTCUSDT", 60_000, dec!(1))).unwrap();

        let latest = store.latest("btcusdt", "1m").unwrap();
        assert_eq!(latest.close, dec!(2));
        assert_eq!(store.count("BTCUSDT", "1m").unwrap(), 2);
    }

    #[test]
    fn test_duplicate_insert_not_broadcast() {
        let store = store();
        let mut rx = store.subscribe();
        let bar = candle("ETHUSDT", 60_000, dec!(3000));

        assert!(store.insert(&bar).unwrap());
        assert!(!store.insert(&bar).unwrap());

        assert_eq!(rx.try_recv().unwrap(), bar);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_latest_prices_sorted() {
        let store = store();
        store.insert(&candle("SOLUSDT", 60_000, dec!(150))).unwrap();
        store.insert(&candle("BTCUSDT", 60_000, dec!(43000))).unwrap();

        let prices = store.latest_prices();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0].symbol, "BTCUSDT");
        assert_eq!(prices[1].price, dec!(150));
    }

    #[test]
    fn test_latest_falls_back_to_storage() {
        let sqlite = Arc::new(SqliteStore::new_in_memory().unwrap());
        sqlite.insert_candle(&candle("BTCUSDT", 60_000, dec!(7))).unwrap();

        let store = CandleStore::new(sqlite);
        assert_eq!(store.latest("BTCUSDT", "1m").unwrap().close, dec!(7));
        assert!(store.latest("BTCUSDT", "5m").is_none());
    }

    #[tokio::test]
    async fn test_writer_drains_queue() {
        let store = store();
        let (tx, rx) = mpsc::channel(8);
        let writer = store.spawn_writer(rx);

        tx.send(candle("BTCUSDT", 60_000, dec!(1))).await.unwrap();
        tx.send(candle("BTCUSDT", 60_000, dec!(1))).await.unwrap();
        tx.send(candle("BTCUSDT", 120_000, dec!(2))).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        assert_eq!(store.count("BTCUSDT", "1m").unwrap(), 2);
    }
}
