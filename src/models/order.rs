use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market::TokenType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    GTC, // Good-Til-Cancelled: standard limit
    GTD, // Good-Til-Date: expires at timestamp
    FOK, // Fill-Or-Kill: all or nothing
    FAK, // Fill-And-Kill: partial fills OK, rest cancelled
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::GTC => "GTC",
            OrderType::GTD => "GTD",
            OrderType::FOK => "FOK",
            OrderType::FAK => "FAK",
        }
    }

    pub fn is_market_style(&self) -> bool {
        matches!(self, OrderType::FOK | OrderType::FAK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BUY" | "buy" => Some(OrderSide::Buy),
            "SELL" | "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

/// Runtime order status. Terminal states are sticky: once an order reaches
/// Filled, Cancelled or Rejected it never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Live,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// A strategy's order intent, before rounding and signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub market_slug: String,
    pub token_id: String,
    pub token_type: TokenType,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub order_type: OrderType,
    pub fee_rate_bps: Option<u32>,
    pub nonce: Option<u64>,
    pub expiration: Option<u64>,
    pub taker: Option<String>,
}

impl OrderIntent {
    pub fn limit(
        market_slug: &str,
        token_id: &str,
        token_type: TokenType,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
        order_type: OrderType,
    ) -> Self {
        Self {
            market_slug: market_slug.to_string(),
            token_id: token_id.to_string(),
            token_type,
            side,
            price,
            size,
            order_type,
            fee_rate_bps: None,
            nonce: None,
            expiration: None,
            taker: None,
        }
    }
}

/// EIP-712 signed order in the CLOB submission shape. Amounts are decimal
/// strings of 1e6 base units; side is "BUY"/"SELL"; signature is 0x-hex.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOrder {
    pub salt: u64,
    pub maker: String,
    pub signer: String,
    pub taker: String,
    pub token_id: String,
    pub maker_amount: String,
    pub taker_amount: String,
    pub expiration: String,
    pub nonce: String,
    pub fee_rate_bps: String,
    pub side: String,
    pub signature_type: u8,
    pub signature: String,
}

/// An order as tracked by the engine after acceptance by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub market_slug: String,
    pub asset_id: String,
    pub token_type: TokenType,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Decimal,
    pub original_size: Decimal,
    pub filled_size: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining_size(&self) -> Decimal {
        (self.original_size - self.filled_size).max(Decimal::ZERO)
    }

    /// Transition to a new status, honoring terminal stickiness.
    /// Returns false when the transition was suppressed.
    pub fn transition(&mut self, next: OrderStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = next;
        true
    }
}

/// A single fill, idempotent by `id` across WS replays and reconciles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub order_id: String,
    pub asset_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub token_type: TokenType,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(status: OrderStatus) -> Order {
        Order {
            order_id: "o1".into(),
            market_slug: "btc-updown-15m-1700000000".into(),
            asset_id: "tok".into(),
            token_type: TokenType::Up,
            side: OrderSide::Buy,
            order_type: OrderType::GTC,
            price: dec!(0.55),
            original_size: dec!(10),
            filled_size: dec!(4),
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn terminal_statuses_are_sticky() {
        let mut o = order(OrderStatus::Filled);
        assert!(!o.transition(OrderStatus::Live));
        assert_eq!(o.status, OrderStatus::Filled);

        let mut o = order(OrderStatus::Cancelled);
        assert!(!o.transition(OrderStatus::PartiallyFilled));
        assert_eq!(o.status, OrderStatus::Cancelled);

        let mut o = order(OrderStatus::Live);
        assert!(o.transition(OrderStatus::PartiallyFilled));
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn remaining_never_negative() {
        let mut o = order(OrderStatus::Live);
        o.filled_size = dec!(12);
        assert_eq!(o.remaining_size(), Decimal::ZERO);
    }
}
