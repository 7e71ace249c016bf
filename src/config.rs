use crate::services::MonitorConfig;
use crate::services::order_book::DEFAULT_EXECUTION_REPORTER;
use crate::sources::feed::DEFAULT_FEED_WS_URL;
use crate::sources::history::DEFAULT_FEED_REST_URL;
use crate::sources::ReconnectPolicy;
use crate::types::StreamKey;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Market-data feed configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket base; `/<symbol>@kline_<interval>` is appended per stream.
    pub ws_url: String,
    /// REST base used for backfill.
    pub rest_url: String,
    /// Streams to subscribe at start-up.
    pub subscriptions: Vec<StreamKey>,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Consecutive failed reconnects before giving up (None = unlimited).
    pub max_reconnect_attempts: Option<u32>,
    /// Capacity of the closed-candle queue.
    pub queue_capacity: usize,
    /// How long a stream task waits on a full queue before dropping a candle.
    pub queue_timeout: Duration,
    /// Bars fetched per stream at start-up (0 = no backfill).
    pub backfill_limit: u32,
}

impl FeedConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_delay, self.max_reconnect_attempts)
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// SQLite database file.
    pub database_path: String,
    pub feed: FeedConfig,
    /// Starting balance of demo accounts.
    pub demo_seed_balance: Decimal,
    /// Transactions strictly above this amount are flagged.
    pub suspicious_amount_threshold: Decimal,
    /// Interval of the live-price snapshot push.
    pub price_push_interval: Duration,
    /// User ids allowed to report order executions.
    pub execution_reporters: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3001);

        let subscriptions = env::var("SUBSCRIPTIONS")
            .map(|s| parse_subscriptions(&s))
            .unwrap_or_else(|_| parse_subscriptions("btcusdt@1m"));

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "tickvault.db".to_string()),
            feed: FeedConfig {
                ws_url: env::var("FEED_WS_URL").unwrap_or_else(|_| DEFAULT_FEED_WS_URL.to_string()),
                rest_url: env::var("FEED_REST_URL")
                    .unwrap_or_else(|_| DEFAULT_FEED_REST_URL.to_string()),
                subscriptions,
                reconnect_delay: Duration::from_secs(
                    env::var("RECONNECT_DELAY_SECS")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(5),
                ),
                max_reconnect_attempts: env::var("MAX_RECONNECT_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse::<u32>().ok())
                    .filter(|n| *n > 0),
                queue_capacity: env::var("CANDLE_QUEUE_CAPACITY")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(1024),
                queue_timeout: Duration::from_millis(
                    env::var("CANDLE_QUEUE_TIMEOUT_MS")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(2000),
                ),
                backfill_limit: env::var("BACKFILL_LIMIT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            },
            demo_seed_balance: env_decimal("DEMO_SEED_BALANCE", dec!(10000)),
            suspicious_amount_threshold: env_decimal("SUSPICIOUS_AMOUNT_THRESHOLD", dec!(10000)),
            price_push_interval: Duration::from_secs(
                env::var("PRICE_PUSH_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(5),
            ),
            execution_reporters: parse_list(
                &env::var("EXECUTION_REPORTERS")
                    .unwrap_or_else(|_| DEFAULT_EXECUTION_REPORTER.to_string()),
            ),
        }
    }

    /// Suspicious activity rules derived from this configuration.
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            amount_threshold: self.suspicious_amount_threshold,
            ..MonitorConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Parse `symbol@interval` pairs separated by commas. Malformed entries are skipped.
pub fn parse_subscriptions(value: &str) -> Vec<StreamKey> {
    let mut keys: Vec<StreamKey> = Vec::new();
    for key in value.split(',').filter_map(|s| StreamKey::parse(s.trim())) {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Split a comma separated list, dropping blanks.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_decimal(name: &str, default: Decimal) -> Decimal {
    env::var(name)
        .ok()
        .and_then(|v| Decimal::from_str(v.trim()).ok())
        .filter(|d| *d >= Decimal::ZERO)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Subscription Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_subscriptions() {
        let keys = parse_subscriptions("btcusdt@1m, ETHUSDT@5m,bad,solusdt@");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].to_string(), "BTCUSDT@1m");
        assert_eq!(keys[1].to_string(), "ETHUSDT@5m");
    }

    #[test]
    fn test_parse_subscriptions_dedupes() {
        let keys = parse_subscriptions("btcusdt@1m,BTCUSDT@1m");
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_parse_subscriptions_empty() {
        assert!(parse_subscriptions("").is_empty());
    }

    #[test]
    fn test_parse_reporter_list() {
        assert_eq!(parse_list(" exchange, desk ,,"), vec!["exchange", "desk"]);
        assert!(parse_list(" ").is_empty());
    }

    // =========================================================================
    // Derived Settings Tests
    // =========================================================================

    #[test]
    fn test_reconnect_policy_from_feed_config() {
        let feed = FeedConfig {
            ws_url: DEFAULT_FEED_WS_URL.to_string(),
            rest_url: DEFAULT_FEED_REST_URL.to_string(),
            subscriptions: vec![],
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: None,
            queue_capacity: 1024,
            queue_timeout: Duration::from_millis(2000),
            backfill_limit: 0,
        };
        let policy = feed.reconnect_policy();
        assert_eq!(policy.delay, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, None);
    }
}
