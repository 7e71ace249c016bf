//! Account ledger.
//!
//! Every user owns exactly two balance buckets, `demo` and `real`. Balances only
//! move through deposits and order settlement, and every mutation goes through
//! an atomic storage-level increment so concurrent writers never lose updates.

use crate::error::LedgerError;
use crate::services::monitor::TransactionSink;
use crate::services::sqlite_store::{now_ms, BalanceChange};
use crate::services::SqliteStore;
use crate::types::{Account, AccountBalances, AccountKind, TransactionDescriptor};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Starting balance of a freshly created demo account.
pub const DEFAULT_DEMO_SEED: Decimal = dec!(10000);

/// Demo and real balances per user.
pub struct AccountLedger {
    sqlite: Arc<SqliteStore>,
    demo_seed_balance: Decimal,
    sink: Option<TransactionSink>,
}

impl AccountLedger {
    pub fn new(sqlite: Arc<SqliteStore>) -> Self {
        Self {
            sqlite,
            demo_seed_balance: DEFAULT_DEMO_SEED,
            sink: None,
        }
    }

    /// Override the demo seed balance.
    pub fn with_demo_seed(mut self, seed: Decimal) -> Self {
        self.demo_seed_balance = seed;
        self
    }

    /// Emit a descriptor to the suspicious activity monitor after each deposit.
    pub fn with_sink(mut self, sink: TransactionSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Create the demo and real accounts of a user. Calling this again is a
    /// no-op; existing balances are never reset.
    pub fn create_accounts(&self, user_id: &str) -> Result<AccountBalances, LedgerError> {
        validate_user(user_id)?;
        let now = now_ms();

        let demo_created = self.sqlite.create_account_if_absent(
            user_id,
            AccountKind::Demo,
            self.demo_seed_balance,
            now,
        )?;
        let real_created =
            self.sqlite
                .create_account_if_absent(user_id, AccountKind::Real, Decimal::ZERO, now)?;

        if demo_created || real_created {
            info!(
                "Created accounts for user {} (demo: {}, real: {})",
                user_id, demo_created, real_created
            );
        } else {
            debug!("Accounts for user {} already exist", user_id);
        }

        self.get_accounts(user_id)
    }

    /// Credit the real account. Returns the new balance.
    pub fn deposit(&self, user_id: &str, amount: Decimal) -> Result<Decimal, LedgerError> {
        self.deposit_from(user_id, amount, None)
    }

    /// Credit the real account, tagging the transaction with the client location.
    pub fn deposit_from(
        &self,
        user_id: &str,
        amount: Decimal,
        location: Option<&str>,
    ) -> Result<Decimal, LedgerError> {
        validate_user(user_id)?;
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let balance = match self
            .sqlite
            .adjust_balance(user_id, AccountKind::Real, amount, now_ms())?
        {
            BalanceChange::Applied(balance) => balance,
            BalanceChange::NoAccount => {
                return Err(LedgerError::AccountNotFound {
                    user_id: user_id.to_string(),
                    kind: AccountKind::Real.to_string(),
                })
            }
            // Not produced by a positive delta.
            BalanceChange::Insufficient { available } => {
                return Err(LedgerError::InsufficientFunds {
                    needed: amount,
                    available,
                })
            }
            BalanceChange::Overflow => {
                warn!("Deposit of {} rejected: real balance of user {} would overflow", amount, user_id);
                return Err(LedgerError::Validation(format!(
                    "deposit of {} would overflow the real balance",
                    amount
                )));
            }
        };

        info!("Deposit of {} to real account of user {}: balance {}", amount, user_id, balance);

        self.emit(TransactionDescriptor {
            user_id: user_id.to_string(),
            reference: uuid::Uuid::new_v4().to_string(),
            amount,
            location: location.map(str::to_string),
            occurred_at: now_ms(),
        });

        Ok(balance)
    }

    /// Current balance, or zero when the account does not exist.
    pub fn get_balance(&self, user_id: &str, kind: AccountKind) -> Result<Decimal, LedgerError> {
        Ok(self
            .sqlite
            .get_account(user_id, kind)?
            .map(|account| account.balance)
            .unwrap_or(Decimal::ZERO))
    }

    /// Both balances of a user (zero for missing accounts).
    pub fn get_accounts(&self, user_id: &str) -> Result<AccountBalances, LedgerError> {
        Ok(AccountBalances {
            user_id: user_id.to_string(),
            demo: self.get_balance(user_id, AccountKind::Demo)?,
            real: self.get_balance(user_id, AccountKind::Real)?,
        })
    }

    /// Full account row, if it exists.
    pub fn get_account(
        &self,
        user_id: &str,
        kind: AccountKind,
    ) -> Result<Option<Account>, LedgerError> {
        Ok(self.sqlite.get_account(user_id, kind)?)
    }

    pub(crate) fn emit(&self, descriptor: TransactionDescriptor) {
        if let Some(sink) = &self.sink {
            sink.notify(descriptor);
        }
    }
}

fn validate_user(user_id: &str) -> Result<(), LedgerError> {
    if user_id.trim().is_empty() {
        return Err(LedgerError::Validation("user id is required".to_string()));
    }
    Ok(())
}
