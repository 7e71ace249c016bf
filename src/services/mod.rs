pub mod candle_store;
pub mod ledger;
pub mod monitor;
pub mod order_book;
pub mod sqlite_store;

pub use candle_store::CandleStore;
pub use ledger::AccountLedger;
pub use monitor::{MonitorConfig, SuspiciousActivityMonitor, TransactionSink};
pub use order_book::OrderBook;
pub use sqlite_store::{now_ms, SqliteStore};
