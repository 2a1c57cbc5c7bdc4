use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which of the two outcome tokens a price or position refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenType {
    Up,
    Down,
}

impl TokenType {
    pub fn opposite(&self) -> Self {
        match self {
            TokenType::Up => TokenType::Down,
            TokenType::Down => TokenType::Up,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TokenType::Up => "UP",
            TokenType::Down => "DOWN",
        }
    }
}

/// One time-boxed market cycle. Immutable after construction; at any instant
/// at most one market is current and start times only move forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub slug: String,
    pub condition_id: String,
    pub up_token_id: String,
    pub down_token_id: String,
    pub start_unix: u64,
    pub duration_secs: u64,
    /// Minimum price increment; drives rounding decimals. Defaults to $0.01.
    pub tick_size: Decimal,
}

impl Market {
    pub fn new(
        slug: String,
        condition_id: String,
        up_token_id: String,
        down_token_id: String,
        start_unix: u64,
        duration_secs: u64,
    ) -> Self {
        Self {
            slug,
            condition_id,
            up_token_id,
            down_token_id,
            start_unix,
            duration_secs,
            tick_size: Decimal::new(1, 2),
        }
    }

    pub fn end_unix(&self) -> u64 {
        self.start_unix + self.duration_secs
    }

    /// Map an asset id to its token type, if it belongs to this market.
    pub fn token_type_of(&self, asset_id: &str) -> Option<TokenType> {
        if asset_id == self.up_token_id {
            Some(TokenType::Up)
        } else if asset_id == self.down_token_id {
            Some(TokenType::Down)
        } else {
            None
        }
    }

    pub fn token_id(&self, token_type: TokenType) -> &str {
        match token_type {
            TokenType::Up => &self.up_token_id,
            TokenType::Down => &self.down_token_id,
        }
    }

    pub fn asset_ids(&self) -> [&str; 2] {
        [&self.up_token_id, &self.down_token_id]
    }

    pub fn contains_asset(&self, asset_id: &str) -> bool {
        self.token_type_of(asset_id).is_some()
    }

    pub fn time_remaining_secs(&self) -> f64 {
        let now = Utc::now().timestamp();
        let end = self.end_unix() as i64;
        if now >= end {
            return 0.0;
        }
        (end - now) as f64
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() as u64 >= self.end_unix()
    }
}

/// Atomic top-of-book snapshot for one asset. Readers get a copy; the stream
/// task is the only writer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BestBook {
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub ts_ms: i64,
}

impl BestBook {
    pub fn mid(&self) -> Option<f64> {
        if self.bid > 0.0 && self.ask > 0.0 {
            Some((self.bid + self.ask) / 2.0)
        } else {
            None
        }
    }
}

/// Full depth book, used for market-order synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub token_id: String,
    pub bids: BTreeMap<Decimal, Decimal>,
    pub asks: BTreeMap<Decimal, Decimal>,
}

impl OrderBook {
    pub fn new(token_id: String) -> Self {
        Self {
            token_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(&p, &s)| (p, s))
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(&p, &s)| (p, s))
    }

    /// Apply one price level; size 0 removes the level.
    pub fn apply_level(&mut self, is_bid: bool, price: Decimal, size: Decimal) {
        let side = if is_bid { &mut self.bids } else { &mut self.asks };
        if size == Decimal::ZERO {
            side.remove(&price);
        } else {
            side.insert(price, size);
        }
    }

    /// Walk the ask side accumulating fills until `collateral` dollars are
    /// consumed. Returns (total_size, total_spent) of the synthetic fill, or
    /// None when the book has no asks.
    pub fn walk_asks_for_collateral(&self, collateral: f64) -> Option<(f64, f64)> {
        let mut spent = 0.0_f64;
        let mut size = 0.0_f64;
        for (&price_dec, &level_dec) in self.asks.iter() {
            let price = decimal_to_f64(price_dec);
            let level = decimal_to_f64(level_dec);
            if price <= 0.0 || level <= 0.0 {
                continue;
            }
            let level_cost = price * level;
            let remaining = collateral - spent;
            if level_cost >= remaining {
                size += remaining / price;
                spent = collateral;
                break;
            }
            spent += level_cost;
            size += level;
        }
        if size > 0.0 {
            Some((size, spent))
        } else {
            None
        }
    }

    /// Walk the bid side accumulating proceeds for selling `shares` tokens.
    /// Returns (total_sold, total_proceeds), or None when the book has no bids.
    pub fn walk_bids_for_shares(&self, shares: f64) -> Option<(f64, f64)> {
        let mut sold = 0.0_f64;
        let mut proceeds = 0.0_f64;
        for (&price_dec, &level_dec) in self.bids.iter().rev() {
            let price = decimal_to_f64(price_dec);
            let level = decimal_to_f64(level_dec);
            if price <= 0.0 || level <= 0.0 {
                continue;
            }
            let remaining = shares - sold;
            if level >= remaining {
                sold = shares;
                proceeds += remaining * price;
                break;
            }
            sold += level;
            proceeds += level * price;
        }
        if sold > 0.0 {
            Some((sold, proceeds))
        } else {
            None
        }
    }
}

pub fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_string().parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book_with_asks(levels: &[(Decimal, Decimal)]) -> OrderBook {
        let mut book = OrderBook::new("tok".into());
        for &(p, s) in levels {
            book.asks.insert(p, s);
        }
        book
    }

    #[test]
    fn walk_asks_partial_level() {
        // 3 @ 0.60 = 1.80, remaining 2.20 consumed at 0.62
        let book = book_with_asks(&[
            (dec!(0.60), dec!(3)),
            (dec!(0.62), dec!(5)),
            (dec!(0.65), dec!(10)),
        ]);
        let (size, spent) = book.walk_asks_for_collateral(4.0).unwrap();
        assert!((spent - 4.0).abs() < 1e-9);
        let expected = 3.0 + 2.20 / 0.62;
        assert!((size - expected).abs() < 1e-9);
    }

    #[test]
    fn walk_asks_empty_book() {
        let book = OrderBook::new("tok".into());
        assert!(book.walk_asks_for_collateral(5.0).is_none());
    }

    #[test]
    fn walk_asks_exhausted_book() {
        let book = book_with_asks(&[(dec!(0.50), dec!(2))]);
        let (size, spent) = book.walk_asks_for_collateral(10.0).unwrap();
        assert!((size - 2.0).abs() < 1e-9);
        assert!((spent - 1.0).abs() < 1e-9);
    }

    #[test]
    fn token_type_mapping() {
        let m = Market::new(
            "btc-updown-15m-1700000000".into(),
            "0xabc".into(),
            "up_tok".into(),
            "down_tok".into(),
            1_700_000_000,
            900,
        );
        assert_eq!(m.token_type_of("up_tok"), Some(TokenType::Up));
        assert_eq!(m.token_type_of("down_tok"), Some(TokenType::Down));
        assert_eq!(m.token_type_of("other"), None);
        assert_eq!(m.end_unix(), 1_700_000_900);
    }
}
