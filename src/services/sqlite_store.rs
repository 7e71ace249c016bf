//! SQLite persistence layer.
//!
//! One store owns every table so each entity has exactly one authoritative home:
//! - `candles`: append-only archive of closed bars, unique per (symbol, interval, close_time)
//! - `accounts`: demo and real balance rows, one per (user_id, kind)
//! - `orders`: order records and their status
//! - `suspicious_activities`: flags raised by the monitor and manual reports
//!
//! Decimal values are stored as TEXT so nothing passes through floating point.
//! Anything that reads and then writes runs in an IMMEDIATE transaction while the
//! connection lock is held.

use crate::types::{
    Account, AccountKind, ActivityStatus, Candle, Order, OrderStatus, SuspiciousActivityRecord,
};
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Current time truncated to the millisecond precision the store keeps.
pub fn now_ms() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Result of an atomic balance adjustment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceChange {
    /// Applied; carries the new balance.
    Applied(Decimal),
    /// No row for this (user, kind).
    NoAccount,
    /// Applying the delta would take the balance below zero.
    Insufficient { available: Decimal },
    /// The new balance does not fit a `Decimal`; nothing changed.
    Overflow,
}

/// Result of the execute-and-settle transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Order moved to executed; carries the new account balance.
    Executed(Decimal),
    /// Order was no longer open; nothing changed.
    NotOpen,
    /// Settlement account missing; nothing changed.
    NoAccount,
    /// Settlement would overdraw the account; nothing changed.
    Insufficient { available: Decimal },
    /// Notional or resulting balance out of `Decimal` range; nothing changed.
    Overflow,
}

/// SQLite store for candles, accounts, orders and suspicious activities.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                close_time INTEGER NOT NULL,
                PRIMARY KEY (symbol, interval, close_time)
            );

            CREATE TABLE IF NOT EXISTS accounts (
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                balance TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, kind)
            );

            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                side TEXT NOT NULL,
                asset TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                account TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                executed_at INTEGER,
                canceled_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status, created_at DESC);

            CREATE TABLE IF NOT EXISTS suspicious_activities (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                transaction_ref TEXT,
                reason TEXT NOT NULL,
                status TEXT NOT NULL,
                comments TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_suspicious_created
                ON suspicious_activities(created_at DESC);",
        )?;

        info!("SQLite schema initialized");
        Ok(())
    }

    // ========== Candle Methods ==========

    /// Insert a closed candle unless one with the same (symbol, interval,
    /// close_time) already exists. Returns whether a row was written.
    pub fn insert_candle(&self, candle: &Candle) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO candles
             (symbol, interval, open, high, low, close, volume, open_time, close_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(symbol, interval, close_time) DO NOTHING",
            params![
                candle.symbol,
                candle.interval,
                candle.open.to_string(),
                candle.high.to_string(),
                candle.low.to_string(),
                candle.close.to_string(),
                candle.volume.to_string(),
                candle.open_time.timestamp_millis(),
                candle.close_time.timestamp_millis(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Candles for a stream with `close_time` inside the inclusive bounds,
    /// oldest first.
    pub fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>, rusqlite::Error> {
        let conn = self.conn.lock();
        let from_ms = from.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
        let to_ms = to.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX);
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let mut stmt = conn.prepare(
            "SELECT symbol, interval, open, high, low, close, volume, open_time, close_time
             FROM candles
             WHERE symbol = ?1 AND interval = ?2 AND close_time BETWEEN ?3 AND ?4
             ORDER BY close_time ASC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(params![symbol, interval, from_ms, to_ms, limit], candle_from_row)?;
        rows.collect()
    }

    /// Most recent stored candle for a stream.
    pub fn latest_candle(
        &self,
        symbol: &str,
        interval: &str,
    ) -> Result<Option<Candle>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT symbol, interval, open, high, low, close, volume, open_time, close_time
             FROM candles WHERE symbol = ?1 AND interval = ?2
             ORDER BY close_time DESC LIMIT 1",
            params![symbol, interval],
            candle_from_row,
        )
        .optional()
    }

    /// Number of stored candles for a stream.
    pub fn candle_count(&self, symbol: &str, interval: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM candles WHERE symbol = ?1 AND interval = ?2",
            params![symbol, interval],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========== Account Methods ==========

    /// Create an account row unless it exists. Returns whether a row was written.
    pub fn create_account_if_absent(
        &self,
        user_id: &str,
        kind: AccountKind,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO accounts (user_id, kind, balance, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(user_id, kind) DO NOTHING",
            params![user_id, kind.as_str(), balance.to_string(), now.timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    /// Get one account row.
    pub fn get_account(
        &self,
        user_id: &str,
        kind: AccountKind,
    ) -> Result<Option<Account>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, kind, balance, created_at, updated_at
             FROM accounts WHERE user_id = ?1 AND kind = ?2",
            params![user_id, kind.as_str()],
            |row| {
                Ok(Account {
                    user_id: row.get(0)?,
                    kind: parse_text(row, 1)?,
                    balance: decimal_at(row, 2)?,
                    created_at: time_at(row, 3)?,
                    updated_at: time_at(row, 4)?,
                })
            },
        )
        .optional()
    }

    /// Atomically add `delta` (which may be negative) to a balance. The balance
    /// never goes below zero.
    pub fn adjust_balance(
        &self,
        user_id: &str,
        kind: AccountKind,
        delta: Decimal,
        now: DateTime<Utc>,
    ) -> Result<BalanceChange, rusqlite::Error> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let change = apply_delta(&tx, user_id, kind, delta, now)?;
        if matches!(change, BalanceChange::Applied(_)) {
            tx.commit()?;
        }
        Ok(change)
    }

    // ========== Order Methods ==========

    /// Persist a new order.
    pub fn insert_order(&self, order: &Order) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders
             (id, user_id, side, asset, quantity, price, account, status,
              created_at, executed_at, canceled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                order.id,
                order.user_id,
                order.side.as_str(),
                order.asset,
                order.quantity.to_string(),
                order.price.to_string(),
                order.account.as_str(),
                order.status.as_str(),
                order.created_at.timestamp_millis(),
                order.executed_at.map(|t| t.timestamp_millis()),
                order.canceled_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        debug!("Stored order {} for user {}", order.id, order.user_id);
        Ok(())
    }

    /// Get an order by ID.
    pub fn get_order(&self, order_id: &str) -> Result<Option<Order>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{} WHERE id = ?1", ORDER_SELECT),
            params![order_id],
            order_from_row,
        )
        .optional()
    }

    /// All orders of a user, newest first.
    pub fn get_user_orders(&self, user_id: &str) -> Result<Vec<Order>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
            ORDER_SELECT
        ))?;
        let rows = stmt.query_map(params![user_id], order_from_row)?;
        rows.collect()
    }

    /// Open orders across all users, newest first.
    pub fn get_open_orders(&self) -> Result<Vec<Order>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status = 'open' ORDER BY created_at DESC, rowid DESC",
            ORDER_SELECT
        ))?;
        let rows = stmt.query_map([], order_from_row)?;
        rows.collect()
    }

    /// Compare-and-set `open -> canceled`. Returns false when the order was not
    /// open any more (or does not exist).
    pub fn cancel_order_if_open(
        &self,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE orders SET status = 'canceled', canceled_at = ?2
             WHERE id = ?1 AND status = 'open'",
            params![order_id, now.timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    /// Compare-and-set `open -> executed` and apply the settlement delta to the
    /// order's account in one transaction. Nothing is written unless both succeed.
    pub fn execute_order_if_open(
        &self,
        order: &Order,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, rusqlite::Error> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE orders SET status = 'executed', executed_at = ?2
             WHERE id = ?1 AND status = 'open'",
            params![order.id, now.timestamp_millis()],
        )?;
        if changed == 0 {
            return Ok(ExecutionOutcome::NotOpen);
        }

        let Some(delta) = order.settlement_delta() else {
            return Ok(ExecutionOutcome::Overflow);
        };
        let outcome = match apply_delta(&tx, &order.user_id, order.account, delta, now)? {
            BalanceChange::Applied(balance) => ExecutionOutcome::Executed(balance),
            BalanceChange::NoAccount => ExecutionOutcome::NoAccount,
            BalanceChange::Insufficient { available } => ExecutionOutcome::Insufficient { available },
            BalanceChange::Overflow => ExecutionOutcome::Overflow,
        };

        // Dropping the transaction without commit rolls the status change back.
        if matches!(outcome, ExecutionOutcome::Executed(_)) {
            tx.commit()?;
        }
        Ok(outcome)
    }

    // ========== Suspicious Activity Methods ==========

    /// Persist a suspicious-activity record.
    pub fn insert_activity(&self, record: &SuspiciousActivityRecord) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO suspicious_activities
             (id, user_id, transaction_ref, reason, status, comments, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.user_id,
                record.transaction_ref,
                record.reason,
                record.status.as_str(),
                record.comments,
                record.created_at.timestamp_millis(),
                record.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Get a record by ID.
    pub fn get_activity(&self, id: &str) -> Result<Option<SuspiciousActivityRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{} WHERE id = ?1", ACTIVITY_SELECT),
            params![id],
            activity_from_row,
        )
        .optional()
    }

    /// All records, newest first.
    pub fn list_activities(&self) -> Result<Vec<SuspiciousActivityRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY created_at DESC, rowid DESC",
            ACTIVITY_SELECT
        ))?;
        let rows = stmt.query_map([], activity_from_row)?;
        rows.collect()
    }

    /// Set status and comments of a record. Returns the updated record, or
    /// `None` if no such record exists.
    pub fn update_activity_status(
        &self,
        id: &str,
        status: ActivityStatus,
        comments: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<SuspiciousActivityRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE suspicious_activities
             SET status = ?2, comments = COALESCE(?3, comments), updated_at = ?4
             WHERE id = ?1",
            params![id, status.as_str(), comments, now.timestamp_millis()],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        conn.query_row(
            &format!("{} WHERE id = ?1", ACTIVITY_SELECT),
            params![id],
            activity_from_row,
        )
        .optional()
    }
}

const ORDER_SELECT: &str = "SELECT id, user_id, side, asset, quantity, price, account, status,
        created_at, executed_at, canceled_at
 FROM orders";

const ACTIVITY_SELECT: &str = "SELECT id, user_id, transaction_ref, reason, status, comments,
        created_at, updated_at
 FROM suspicious_activities";

/// Read-check-write of one balance row inside an open transaction.
fn apply_delta(
    tx: &Transaction<'_>,
    user_id: &str,
    kind: AccountKind,
    delta: Decimal,
    now: DateTime<Utc>,
) -> Result<BalanceChange, rusqlite::Error> {
    let current = tx
        .query_row(
            "SELECT balance FROM accounts WHERE user_id = ?1 AND kind = ?2",
            params![user_id, kind.as_str()],
            |row| decimal_at(row, 0),
        )
        .optional()?;

    let Some(current) = current else {
        return Ok(BalanceChange::NoAccount);
    };

    let Some(next) = current.checked_add(delta) else {
        return Ok(BalanceChange::Overflow);
    };
    if next < Decimal::ZERO {
        return Ok(BalanceChange::Insufficient { available: current });
    }

    tx.execute(
        "UPDATE accounts SET balance = ?3, updated_at = ?4 WHERE user_id = ?1 AND kind = ?2",
        params![user_id, kind.as_str(), next.to_string(), now.timestamp_millis()],
    )?;
    Ok(BalanceChange::Applied(next))
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn decimal_at(row: &Row<'_>, idx: usize) -> Result<Decimal, rusqlite::Error> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_error(idx, format!("bad decimal {}: {}", text, e)))
}

fn time_at(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let ms: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {}", ms)))
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => time_at(row, idx).map(Some),
        None => Ok(None),
    }
}

fn parse_text<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> Result<T, rusqlite::Error> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn candle_from_row(row: &Row<'_>) -> Result<Candle, rusqlite::Error> {
    Ok(Candle {
        symbol: row.get(0)?,
        interval: row.get(1)?,
        open: decimal_at(row, 2)?,
        high: decimal_at(row, 3)?,
        low: decimal_at(row, 4)?,
        close: decimal_at(row, 5)?,
        volume: decimal_at(row, 6)?,
        open_time: time_at(row, 7)?,
        close_time: time_at(row, 8)?,
    })
}

fn order_from_row(row: &Row<'_>) -> Result<Order, rusqlite::Error> {
    Ok(Order {
        id: row.get(0)?,
        user_id: row.get(1)?,
        side: parse_text(row, 2)?,
        asset: row.get(3)?,
        quantity: decimal_at(row, 4)?,
        price: decimal_at(row, 5)?,
        account: parse_text(row, 6)?,
        status: parse_text::<OrderStatus>(row, 7)?,
        created_at: time_at(row, 8)?,
        executed_at: opt_time_at(row, 9)?,
        canceled_at: opt_time_at(row, 10)?,
    })
}

fn activity_from_row(row: &Row<'_>) -> Result<SuspiciousActivityRecord, rusqlite::Error> {
    Ok(SuspiciousActivityRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        transaction_ref: row.get(2)?,
        reason: row.get(3)?,
        status: parse_text(row, 4)?,
        comments: row.get(5)?,
        created_at: time_at(row, 6)?,
        updated_at: time_at(row, 7)?,
    })
}
