//! Tickvault - closed-candle market data ingestion and a demo/real account ledger

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod sources;
pub mod types;
pub mod websocket;

use axum::{routing::get, Router};
use config::Config;
use services::{
    AccountLedger, CandleStore, OrderBook, SqliteStore, SuspiciousActivityMonitor, TransactionSink,
};
use sources::{FeedConnector, StreamSupervisor};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use types::{Candle, TransactionDescriptor};

/// Capacity of the ledger-to-monitor transaction queue.
const TRANSACTION_QUEUE_CAPACITY: usize = 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: Arc<AccountLedger>,
    pub orders: Arc<OrderBook>,
    pub candles: Arc<CandleStore>,
    pub monitor: Arc<SuspiciousActivityMonitor>,
    pub supervisor: Arc<StreamSupervisor>,
}

/// Receiving ends of the internal queues, drained by the background tasks.
pub struct Pipelines {
    pub candle_rx: mpsc::Receiver<Candle>,
    pub transaction_rx: mpsc::Receiver<TransactionDescriptor>,
}

impl AppState {
    /// Wire every service onto one store.
    pub fn new(
        config: Config,
        sqlite: Arc<SqliteStore>,
        connector: Arc<dyn FeedConnector>,
    ) -> (Self, Pipelines) {
        let (sink, transaction_rx) = TransactionSink::channel(TRANSACTION_QUEUE_CAPACITY);
        let (candle_tx, candle_rx) = mpsc::channel(config.feed.queue_capacity);

        let ledger = AccountLedger::new(Arc::clone(&sqlite))
            .with_demo_seed(config.demo_seed_balance)
            .with_sink(sink.clone());
        let orders = OrderBook::new(Arc::clone(&sqlite))
            .with_sink(sink)
            .with_reporters(config.execution_reporters.clone());
        let candles = CandleStore::new(Arc::clone(&sqlite));
        let monitor = SuspiciousActivityMonitor::new(Arc::clone(&sqlite), config.monitor_config());
        let supervisor = StreamSupervisor::new(
            connector,
            config.feed.ws_url.clone(),
            config.feed.reconnect_policy(),
            candle_tx,
            config.feed.queue_timeout,
        );

        let state = Self {
            config: Arc::new(config),
            ledger: Arc::new(ledger),
            orders: Arc::new(orders),
            candles,
            monitor,
            supervisor: Arc::new(supervisor),
        };
        let pipelines = Pipelines {
            candle_rx,
            transaction_rx,
        };
        (state, pipelines)
    }

    /// Start the candle writer and the suspicious activity monitor.
    pub fn spawn_background(&self, pipelines: Pipelines) -> Vec<JoinHandle<()>> {
        vec![
            self.candles.spawn_writer(pipelines.candle_rx),
            self.monitor.spawn(pipelines.transaction_rx),
        ]
    }
}

/// HTTP and WebSocket routes, without middleware.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(api::router())
        .route("/ws", get(websocket::ws_handler))
        .with_state(state)
}
