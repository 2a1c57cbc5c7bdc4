use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market::TokenType;
use super::order::{OrderSide, OrderStatus};

/// Top-of-book change published by the market stream.
#[derive(Debug, Clone)]
pub struct PriceChanged {
    pub market_slug: String,
    pub asset_id: String,
    pub token_type: TokenType,
    pub new_bid: f64,
    pub new_ask: f64,
    pub ts_ms: i64,
}

/// Order placement/update/cancellation from the user stream or a reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    /// Slug when the feed supplies it; the router falls back to asset-id
    /// membership when empty.
    pub market_slug: String,
    pub asset_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub original_size: Decimal,
    pub filled_size: Decimal,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

/// Fill from the user stream or a trade-history reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub trade_id: String,
    pub order_id: String,
    pub market_slug: String,
    pub asset_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Events fanned out by the user stream.
#[derive(Debug, Clone)]
pub enum UserEvent {
    Order(OrderUpdate),
    Trade(TradeUpdate),
}

impl UserEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UserEvent::Order(_) => EventKind::Order,
            UserEvent::Trade(_) => EventKind::Trade,
        }
    }

    pub fn asset_id(&self) -> &str {
        match self {
            UserEvent::Order(o) => &o.asset_id,
            UserEvent::Trade(t) => &t.asset_id,
        }
    }

    pub fn market_slug(&self) -> &str {
        match self {
            UserEvent::Order(o) => &o.market_slug,
            UserEvent::Trade(t) => &t.market_slug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Order,
    Trade,
    Price,
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Order => "order",
            EventKind::Trade => "trade",
            EventKind::Price => "price",
        }
    }
}

/// Invoked when a subscriber's bounded slot is full and an event is dropped.
/// A drop is a correctness signal: the session answers it with a throttled
/// reconcile against REST.
pub trait DropHandler: Send + Sync {
    fn on_drop(&self, kind: EventKind, meta: &str);
}

/// Net-size change published by the position tracker.
#[derive(Debug, Clone)]
pub struct PositionChanged {
    pub market_slug: String,
    pub token_type: TokenType,
    pub size: Decimal,
    pub average_entry_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Scheduler transitions driving the session orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleTransition {
    /// Next cycle is inside the pre-warm window: resolve metadata, split.
    PreWarm { slug: String, start_unix: u64 },
    /// Cycle has started: swap the active session.
    Activate { slug: String, start_unix: u64 },
    /// Previous cycle handed off: tear down its session.
    Retire { slug: String },
}

impl CycleTransition {
    pub fn slug(&self) -> &str {
        match self {
            CycleTransition::PreWarm { slug, .. } => slug,
            CycleTransition::Activate { slug, .. } => slug,
            CycleTransition::Retire { slug } => slug,
        }
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
