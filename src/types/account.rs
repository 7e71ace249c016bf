use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two balance buckets every user owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    /// Seeded with simulated funds, isolated from real money flows.
    Demo,
    /// Backed by actual deposits.
    Real,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Demo => "demo",
            AccountKind::Real => "real",
        }
    }
}

impl Default for AccountKind {
    fn default() -> Self {
        AccountKind::Demo
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "demo" => Ok(AccountKind::Demo),
            "real" => Ok(AccountKind::Real),
            other => Err(format!("unknown account kind: {}", other)),
        }
    }
}

/// One balance bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub user_id: String,
    pub kind: AccountKind,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Both balances of a user, as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalances {
    pub user_id: String,
    pub demo: Decimal,
    pub real: Decimal,
}

/// Ledger-affecting transaction handed to the suspicious-activity monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDescriptor {
    pub user_id: String,
    /// Deposit id or order id that produced the transaction.
    pub reference: String,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub occurred_at: DateTime<Utc>,
}
