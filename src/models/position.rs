use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market::TokenType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Net position per (market slug, token type), aggregated from trades.
/// Open iff `size > 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub market_slug: String,
    pub token_type: TokenType,
    pub size: Decimal,
    pub average_entry_price: Decimal,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn new(market_slug: String, token_type: TokenType) -> Self {
        Self {
            market_slug,
            token_type,
            size: Decimal::ZERO,
            average_entry_price: Decimal::ZERO,
            status: PositionStatus::Closed,
            opened_at: Utc::now(),
        }
    }

    pub fn cost_basis(&self) -> Decimal {
        self.size * self.average_entry_price
    }

    /// Apply a buy: average in at the fill price.
    pub fn apply_buy(&mut self, price: Decimal, size: Decimal) {
        let total_cost = self.average_entry_price * self.size + price * size;
        self.size += size;
        if self.size > Decimal::ZERO {
            self.average_entry_price = total_cost / self.size;
        }
        self.status = PositionStatus::Open;
    }

    /// Apply a sell: reduce size, closing at zero. Entry price is kept for
    /// the remaining size.
    pub fn apply_sell(&mut self, size: Decimal) {
        self.size = (self.size - size).max(Decimal::ZERO);
        if self.size == Decimal::ZERO {
            self.status = PositionStatus::Closed;
            self.average_entry_price = Decimal::ZERO;
        }
    }

    pub fn is_open(&self) -> bool {
        self.size > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn buy_averages_in() {
        let mut p = Position::new("slug".into(), TokenType::Up);
        p.apply_buy(dec!(0.50), dec!(10));
        p.apply_buy(dec!(0.60), dec!(10));
        assert_eq!(p.size, dec!(20));
        assert_eq!(p.average_entry_price, dec!(0.55));
        assert!(p.is_open());
    }

    #[test]
    fn sell_to_zero_closes() {
        let mut p = Position::new("slug".into(), TokenType::Down);
        p.apply_buy(dec!(0.40), dec!(5));
        p.apply_sell(dec!(5));
        assert!(!p.is_open());
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.average_entry_price, Decimal::ZERO);
    }
}
