//! Order book.
//!
//! Orders are recorded, not matched. The only caller-triggered transition is
//! `open -> canceled`; `open -> executed` arrives as an external execution
//! report and settles the order's notional against the user's account.
//! Reports are accepted only from configured reporter identities, never from
//! the order's owner.
//! Both transitions are compare-and-set updates in storage, so concurrent
//! attempts on one order apply at most once.

use crate::error::LedgerError;
use crate::services::monitor::TransactionSink;
use crate::services::sqlite_store::{now_ms, ExecutionOutcome};
use crate::services::SqliteStore;
use crate::types::{CreateOrderRequest, Order, OrderSide, OrderStatus, TransactionDescriptor};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity allowed to report executions unless configured otherwise.
pub const DEFAULT_EXECUTION_REPORTER: &str = "exchange";

pub struct OrderBook {
    sqlite: Arc<SqliteStore>,
    sink: Option<TransactionSink>,
    reporters: Vec<String>,
}

impl OrderBook {
    pub fn new(sqlite: Arc<SqliteStore>) -> Self {
        Self {
            sqlite,
            sink: None,
            reporters: vec![DEFAULT_EXECUTION_REPORTER.to_string()],
        }
    }

    /// Replace the identities trusted to report executions. An empty list
    /// disables execution reports.
    pub fn with_reporters(mut self, reporters: Vec<String>) -> Self {
        self.reporters = reporters;
        self
    }

    /// Emit a descriptor to the suspicious activity monitor after each execution.
    pub fn with_sink(mut self, sink: TransactionSink) -> Self {
        self.sink = Some(sink);
        self
    }

    // ========== Order Lifecycle ==========

    /// Validate and record a new open order. No funds are reserved.
    pub fn create_order(
        &self,
        user_id: &str,
        request: CreateOrderRequest,
    ) -> Result<Order, LedgerError> {
        if user_id.trim().is_empty() {
            return Err(LedgerError::Validation("user id is required".to_string()));
        }

        let mut missing = Vec::new();
        if request.side.is_none() {
            missing.push("type");
        }
        if request.asset.as_deref().map(str::trim).unwrap_or("").is_empty() {
            missing.push("asset");
        }
        if request.quantity.is_none() {
            missing.push("quantity");
        }
        if request.price.is_none() {
            missing.push("price");
        }
        let fields = (request.side, request.asset, request.quantity, request.price);
        let (Some(side), Some(asset), Some(quantity), Some(price)) = fields else {
            return Err(missing_fields(&missing));
        };
        if !missing.is_empty() {
            return Err(missing_fields(&missing));
        }

        let side: OrderSide = side.trim().to_lowercase().parse().map_err(LedgerError::Validation)?;
        if quantity <= Decimal::ZERO {
            return Err(LedgerError::Validation(format!(
                "quantity must be greater than zero, got {}",
                quantity
            )));
        }
        if price <= Decimal::ZERO {
            return Err(LedgerError::Validation(format!(
                "price must be greater than zero, got {}",
                price
            )));
        }
        if quantity.checked_mul(price).is_none() {
            return Err(LedgerError::Validation(format!(
                "order value {} x {} is out of range",
                quantity, price
            )));
        }

        let order = Order {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            side,
            asset: asset.trim().to_string(),
            quantity,
            price,
            account: request.account.unwrap_or_default(),
            status: OrderStatus::Open,
            created_at: now_ms(),
            executed_at: None,
            canceled_at: None,
        };
        self.sqlite.insert_order(&order)?;

        info!(
            "Order {} created: {} {} {} @ {} ({} account) for user {}",
            order.id, order.side, order.quantity, order.asset, order.price, order.account, user_id
        );
        Ok(order)
    }

    /// Cancel an open order owned by `user_id`.
    pub fn cancel_order(&self, order_id: &str, user_id: &str) -> Result<Order, LedgerError> {
        let order = self.get_order(order_id, user_id)?;
        if !order.can_cancel() {
            return Err(LedgerError::InvalidState(order.status.to_string()));
        }

        if !self.sqlite.cancel_order_if_open(order_id, now_ms())? {
            // Lost the race to another cancel or an execution report.
            let current = self.load(order_id)?;
            return Err(LedgerError::InvalidState(current.status.to_string()));
        }

        let order = self.load(order_id)?;
        info!("Order {} canceled by user {}", order.id, user_id);
        Ok(order)
    }

    /// Apply an execution report from `reporter` to an open order.
    pub fn execute_order(&self, order_id: &str, reporter: &str) -> Result<Order, LedgerError> {
        if !self.reporters.iter().any(|r| r == reporter) {
            warn!("Execution report for order {} rejected: {} is not a reporter", order_id, reporter);
            return Err(LedgerError::Forbidden(format!(
                "{} may not report executions",
                reporter
            )));
        }

        let order = self.load(order_id)?;
        if order.user_id == reporter {
            warn!("Execution report for order {} rejected: reported by its owner", order_id);
            return Err(LedgerError::Forbidden(format!(
                "order {} cannot be executed by its owner",
                order_id
            )));
        }
        if !order.can_cancel() {
            return Err(LedgerError::InvalidState(order.status.to_string()));
        }
        let notional = order.notional().ok_or_else(|| {
            LedgerError::Validation(format!("order {} value is out of range", order.id))
        })?;

        match self.sqlite.execute_order_if_open(&order, now_ms())? {
            ExecutionOutcome::Executed(balance) => {
                info!(
                    "Order {} executed: {} {} settled, {} balance of user {} is {}",
                    order.id,
                    order.side,
                    notional,
                    order.account,
                    order.user_id,
                    balance
                );
            }
            ExecutionOutcome::NotOpen => {
                let current = self.load(order_id)?;
                return Err(LedgerError::InvalidState(current.status.to_string()));
            }
            ExecutionOutcome::NoAccount => {
                return Err(LedgerError::AccountNotFound {
                    user_id: order.user_id.clone(),
                    kind: order.account.to_string(),
                })
            }
            ExecutionOutcome::Insufficient { available } => {
                warn!(
                    "Order {} not executed: needs {}, {} account of user {} has {}",
                    order.id,
                    notional,
                    order.account,
                    order.user_id,
                    available
                );
                return Err(LedgerError::InsufficientFunds {
                    needed: notional,
                    available,
                });
            }
            ExecutionOutcome::Overflow => {
                warn!(
                    "Order {} not executed: {} balance of user {} would overflow",
                    order.id, order.account, order.user_id
                );
                return Err(LedgerError::Validation(format!(
                    "settling order {} would overflow the {} balance",
                    order.id, order.account
                )));
            }
        }

        let executed = self.load(order_id)?;
        if let Some(sink) = &self.sink {
            sink.notify(TransactionDescriptor {
                user_id: executed.user_id.clone(),
                reference: executed.id.clone(),
                amount: notional,
                location: None,
                occurred_at: executed.executed_at.unwrap_or_else(now_ms),
            });
        }
        Ok(executed)
    }

    // ========== Queries ==========

    /// One order, visible only to its owner.
    pub fn get_order(&self, order_id: &str, user_id: &str) -> Result<Order, LedgerError> {
        let order = self.load(order_id)?;
        if order.user_id != user_id {
            debug!("User {} denied access to order {}", user_id, order_id);
            return Err(LedgerError::Forbidden(format!(
                "order {} does not belong to user {}",
                order_id, user_id
            )));
        }
        Ok(order)
    }

    /// All orders of a user, newest first.
    pub fn list_user_orders(&self, user_id: &str) -> Result<Vec<Order>, LedgerError> {
        Ok(self.sqlite.get_user_orders(user_id)?)
    }

    /// Open orders of every user, newest first.
    pub fn list_open_orders(&self) -> Result<Vec<Order>, LedgerError> {
        Ok(self.sqlite.get_open_orders()?)
    }

    fn load(&self, order_id: &str) -> Result<Order, LedgerError> {
        self.sqlite
            .get_order(order_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("order {}", order_id)))
    }
}

fn missing_fields(missing: &[&str]) -> LedgerError {
    LedgerError::Validation(format!("missing required fields: {}", missing.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::AccountLedger;
    use crate::types::AccountKind;
    use rust_decimal_macros::dec;
    use std::sync::Barrier;
    use std::thread;

    fn setup() -> (Arc<SqliteStore>, OrderBook) {
        let sqlite = Arc::new(SqliteStore::new_in_memory().unwrap());
        (Arc::clone(&sqlite), OrderBook::new(sqlite))
    }

    const REPORTER: &str = DEFAULT_EXECUTION_REPORTER;

    fn buy(qty: Decimal, price: Decimal) -> CreateOrderRequest {
        CreateOrderRequest::new("buy", "BTC", qty, price)
    }

    #[test]
    fn test_create_order_is_open() {
        let (_, book) = setup();
        let order = book.create_order("alice", buy(dec!(2), dec!(100))).unwrap();

        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.account, AccountKind::Demo);
        assert!(order.executed_at.is_none());
        assert!(order.canceled_at.is_none());
    }

    #[test]
    fn test_create_order_validation() {
        let (_, book) = setup();

        let err = book.create_order("alice", CreateOrderRequest::default()).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("type, asset, quantity, price"));

        let bad_side = CreateOrderRequest::new("hold", "BTC", dec!(1), dec!(1));
        assert_eq!(book.create_order("alice", bad_side).unwrap_err().kind(), "validation_error");

        assert!(book.create_order("alice", buy(dec!(0), dec!(1))).is_err());
        assert!(book.create_order("alice", buy(dec!(1), dec!(-1))).is_err());
        assert!(book.list_user_orders("alice").unwrap().is_empty());
    }

    #[test]
    fn test_cancel_then_cancel_again() {
        let (_, book) = setup();
        let order = book.create_order("alice", buy(dec!(2), dec!(100))).unwrap();

        let canceled = book.cancel_order(&order.id, "alice").unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        assert!(canceled.canceled_at.is_some());

        let err = book.cancel_order(&order.id, "alice").unwrap_err();
        assert_eq!(err, LedgerError::InvalidState("canceled".to_string()));
    }

    #[test]
    fn test_cancel_errors_in_order() {
        let (_, book) = setup();
        assert_eq!(book.cancel_order("missing", "alice").unwrap_err().kind(), "not_found");

        let order = book.create_order("alice", buy(dec!(1), dec!(1))).unwrap();
        assert_eq!(book.cancel_order(&order.id, "mallory").unwrap_err().kind(), "forbidden");

        // Ownership is checked before state.
        book.cancel_order(&order.id, "alice").unwrap();
        assert_eq!(book.cancel_order(&order.id, "mallory").unwrap_err().kind(), "forbidden");
    }

    #[test]
    fn test_concurrent_cancel_applies_once() {
        let (_, book) = setup();
        let book = Arc::new(book);
        let order = book.create_order("alice", buy(dec!(1), dec!(1))).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let book = Arc::clone(&book);
                let barrier = Arc::clone(&barrier);
                let id = order.id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    book.cancel_order(&id, "alice")
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.into_iter().find_map(Result::err).unwrap();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[test]
    fn test_execute_buy_debits_account() {
        let (sqlite, book) = setup();
        let ledger = AccountLedger::new(Arc::clone(&sqlite));
        ledger.create_accounts("alice").unwrap();

        let order = book.create_order("alice", buy(dec!(2), dec!(100))).unwrap();
        let executed = book.execute_order(&order.id, REPORTER).unwrap();

        assert_eq!(executed.status, OrderStatus::Executed);
        assert!(executed.executed_at.is_some());
        assert_eq!(ledger.get_balance("alice", AccountKind::Demo).unwrap(), dec!(9800));

        // Terminal.
        assert_eq!(book.execute_order(&order.id, REPORTER).unwrap_err().kind(), "invalid_state");
        assert_eq!(book.cancel_order(&order.id, "alice").unwrap_err().kind(), "invalid_state");
    }

    #[test]
    fn test_execute_insufficient_leaves_order_open() {
        let (sqlite, book) = setup();
        let ledger = AccountLedger::new(Arc::clone(&sqlite));
        ledger.create_accounts("alice").unwrap();

        let request = buy(dec!(1), dec!(50)).with_account(AccountKind::Real);
        let order = book.create_order("alice", request).unwrap();

        let err = book.execute_order(&order.id, REPORTER).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                needed: dec!(50),
                available: dec!(0)
            }
        );
        assert_eq!(book.get_order(&order.id, "alice").unwrap().status, OrderStatus::Open);
    }

    #[test]
    fn test_execute_sell_emits_descriptor() {
        let (sqlite, book) = setup();
        let (sink, mut rx) = TransactionSink::channel(4);
        let book = book.with_sink(sink);
        AccountLedger::new(Arc::clone(&sqlite)).create_accounts("bob").unwrap();

        let sell = CreateOrderRequest::new("sell", "ETH", dec!(3), dec!(5000));
        let order = book.create_order("bob", sell).unwrap();
        book.execute_order(&order.id, REPORTER).unwrap();

        let descriptor = rx.try_recv().unwrap();
        assert_eq!(descriptor.reference, order.id);
        assert_eq!(descriptor.amount, dec!(15000));
    }

    #[test]
    fn test_order_value_overflow_rejected_at_creation() {
        let (_, book) = setup();
        let sell = CreateOrderRequest::new("sell", "BTC", Decimal::MAX, dec!(2));

        let err = book.create_order("alice", sell).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(book.list_user_orders("alice").unwrap().is_empty());
    }

    #[test]
    fn test_execute_overflowing_credit_leaves_order_open() {
        let (sqlite, book) = setup();
        let ledger = AccountLedger::new(Arc::clone(&sqlite));
        ledger.create_accounts("alice").unwrap();
        ledger.deposit("alice", Decimal::MAX).unwrap();

        let sell = CreateOrderRequest::new("sell", "BTC", dec!(1), dec!(1))
            .with_account(AccountKind::Real);
        let order = book.create_order("alice", sell).unwrap();

        let err = book.execute_order(&order.id, REPORTER).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(book.get_order(&order.id, "alice").unwrap().status, OrderStatus::Open);
        assert_eq!(ledger.get_balance("alice", AccountKind::Real).unwrap(), Decimal::MAX);
    }

    #[test]
    fn test_execution_reports_need_a_trusted_reporter() {
        let (sqlite, book) = setup();
        let book = book.with_reporters(vec!["desk".to_string(), "alice".to_string()]);
        let ledger = AccountLedger::new(Arc::clone(&sqlite));
        ledger.create_accounts("alice").unwrap();

        let sell = CreateOrderRequest::new("sell", "BTC", dec!(1000), dec!(1000))
            .with_account(AccountKind::Real);
        let order = book.create_order("alice", sell).unwrap();

        // Unknown reporter, and the owner even when listed as a reporter.
        assert_eq!(book.execute_order(&order.id, "mallory").unwrap_err().kind(), "forbidden");
        assert_eq!(book.execute_order(&order.id, "alice").unwrap_err().kind(), "forbidden");
        assert_eq!(book.get_order(&order.id, "alice").unwrap().status, OrderStatus::Open);
        assert_eq!(ledger.get_balance("alice", AccountKind::Real).unwrap(), Decimal::ZERO);

        book.execute_order(&order.id, "desk").unwrap();
        assert_eq!(ledger.get_balance("alice", AccountKind::Real).unwrap(), dec!(1000000));
    }

    #[test]
    fn test_list_open_orders_across_users() {
        let (_, book) = setup();
        let a = book.create_order("alice", buy(dec!(1), dec!(1))).unwrap();
        let b = book.create_order("bob", buy(dec!(1), dec!(1))).unwrap();
        book.cancel_order(&a.id, "alice").unwrap();

        let open = book.list_open_orders().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, b.id);
        assert_eq!(book.list_user_orders("alice").unwrap().len(), 1);
    }
}
