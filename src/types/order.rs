use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::AccountKind;

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(format!("invalid order type '{}': must be \"buy\" or \"sell\"", other)),
        }
    }
}

/// Order lifecycle: `open -> executed` or `open -> canceled`, both terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Executed,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Executed => "executed",
            OrderStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Open)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "executed" => Ok(OrderStatus::Executed),
            "canceled" => Ok(OrderStatus::Canceled),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// A recorded intent to buy or sell. Immutable apart from status and the
/// matching timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub side: OrderSide,
    pub asset: String,
    pub quantity: Decimal,
    pub price: Decimal,
    /// Account the order settles against when executed.
    pub account: AccountKind,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Quantity times price, or `None` when the product does not fit a `Decimal`.
    pub fn notional(&self) -> Option<Decimal> {
        self.quantity.checked_mul(self.price)
    }

    pub fn can_cancel(&self) -> bool {
        self.status == OrderStatus::Open
    }

    /// Signed balance change applied when the order executes.
    pub fn settlement_delta(&self) -> Option<Decimal> {
        let notional = self.notional()?;
        Some(match self.side {
            OrderSide::Buy => -notional,
            OrderSide::Sell => notional,
        })
    }
}

/// Order creation request as received from a caller. Every field is optional
/// here so that missing input is reported as a validation failure rather than
/// a decode error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateOrderRequest {
    #[serde(rename = "type")]
    pub side: Option<String>,
    pub asset: Option<String>,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    #[serde(default)]
    pub account: Option<AccountKind>,
}

impl CreateOrderRequest {
    pub fn new(side: &str, asset: &str, quantity: Decimal, price: Decimal) -> Self {
        Self {
            side: Some(side.to_string()),
            asset: Some(asset.to_string()),
            quantity: Some(quantity),
            price: Some(price),
            account: None,
        }
    }

    pub fn with_account(mut self, account: AccountKind) -> Self {
        self.account = Some(account);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_order(side: OrderSide) -> Order {
        Order {
            id: "order-1".to_string(),
            user_id: "user-1".to_string(),
            side,
            asset: "BTC".to_string(),
            quantity: dec!(2),
            price: dec!(100.5),
            account: AccountKind::Demo,
            status: OrderStatus::Open,
            created_at: Utc::now(),
            executed_at: None,
            canceled_at: None,
        }
    }

    #[test]
    fn test_settlement_delta_sign() {
        assert_eq!(sample_order(OrderSide::Buy).settlement_delta(), Some(dec!(-201.0)));
        assert_eq!(sample_order(OrderSide::Sell).settlement_delta(), Some(dec!(201.0)));
    }

    #[test]
    fn test_notional_overflow_is_none() {
        let mut order = sample_order(OrderSide::Sell);
        order.quantity = Decimal::MAX;
        order.price = dec!(2);
        assert_eq!(order.notional(), None);
        assert_eq!(order.settlement_delta(), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OrderStatus::Open.is_terminal());
        assert!(OrderStatus::Executed.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_order_serializes_side_as_type() {
        let json = serde_json::to_value(sample_order(OrderSide::Buy)).unwrap();
        assert_eq!(json["type"], "buy");
        assert_eq!(json["status"], "open");
        assert!(json.get("canceledAt").is_none());
    }

    #[test]
    fn test_order_side_rejects_unknown() {
        assert!("hold".parse::<OrderSide>().is_err());
        assert_eq!("sell".parse::<OrderSide>(), Ok(OrderSide::Sell));
    }
}
