use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use super::gateway::ExchangeGateway;
use crate::models::events::{PositionChanged, TradeUpdate};
use crate::models::market::{Market, TokenType};
use crate::models::order::OrderSide;
use crate::models::position::Position;
use crate::runtime::shutdown::ShutdownSignal;

enum Command {
    Trade(TradeUpdate, TokenType),
    Reconcile,
    Bind(Market),
    GetOpen {
        slug: String,
        reply: oneshot::Sender<Vec<Position>>,
    },
    Get {
        slug: String,
        token_type: TokenType,
        reply: oneshot::Sender<Option<Position>>,
    },
    SnapshotAll {
        reply: oneshot::Sender<Vec<Position>>,
    },
}

/// Cloneable handle to the position tracker.
#[derive(Clone)]
pub struct PositionHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<PositionChanged>,
}

impl PositionHandle {
    pub fn apply_trade(&self, trade: TradeUpdate, token_type: TokenType) {
        let _ = self.tx.send(Command::Trade(trade, token_type));
    }

    /// Replay `/data/trades` to pick up anything the stream missed.
    pub fn reconcile(&self) {
        let _ = self.tx.send(Command::Reconcile);
    }

    pub fn bind_market(&self, market: Market) {
        let _ = self.tx.send(Command::Bind(market));
    }

    pub async fn get_open_positions(&self, slug: &str) -> Vec<Position> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::GetOpen {
                slug: slug.to_string(),
                reply,
            })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get_position(&self, slug: &str, token_type: TokenType) -> Option<Position> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Get {
                slug: slug.to_string(),
                token_type,
                reply,
            })
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn snapshot(&self) -> Vec<Position> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::SnapshotAll { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PositionChanged> {
        self.events.subscribe()
    }
}

/// Single-writer position tracker. Derives net positions per
/// (market slug, token type) from trade events; duplicates by trade id are
/// ignored so WS replays and reconcile overlaps are harmless.
pub struct PositionTracker {
    gateway: Arc<dyn ExchangeGateway>,
    positions: HashMap<(String, TokenType), Position>,
    seen_trades: HashSet<String>,
    bound: Option<Market>,
    events: broadcast::Sender<PositionChanged>,
}

impl PositionTracker {
    pub fn spawn(gateway: Arc<dyn ExchangeGateway>, shutdown: ShutdownSignal) -> PositionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);

        let tracker = PositionTracker {
            gateway,
            positions: HashMap::new(),
            seen_trades: HashSet::new(),
            bound: None,
            events: events.clone(),
        };

        tokio::spawn(tracker.run(rx, shutdown));
        PositionHandle { tx, events }
    }

    // Serves reads through staged shutdown; ends with the last handle.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, _shutdown: ShutdownSignal) {
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        debug!("position tracker stopping");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Trade(trade, token_type) => {
                self.apply(trade, token_type);
            }
            Command::Reconcile => self.reconcile().await,
            Command::Bind(market) => {
                // A new cycle starts with fresh maps; the old cycle's
                // aggregates die with its session.
                if self
                    .bound
                    .as_ref()
                    .map(|m| m.slug != market.slug)
                    .unwrap_or(true)
                {
                    self.positions.retain(|(slug, _), _| *slug == market.slug);
                }
                self.bound = Some(market);
            }
            Command::GetOpen { slug, reply } => {
                let open: Vec<Position> = self
                    .positions
                    .values()
                    .filter(|p| p.market_slug == slug && p.is_open())
                    .cloned()
                    .collect();
                let _ = reply.send(open);
            }
            Command::Get {
                slug,
                token_type,
                reply,
            } => {
                let _ = reply.send(self.positions.get(&(slug, token_type)).cloned());
            }
            Command::SnapshotAll { reply } => {
                let _ = reply.send(self.positions.values().cloned().collect());
            }
        }
    }

    fn apply(&mut self, trade: TradeUpdate, token_type: TokenType) {
        if !self.seen_trades.insert(trade.trade_id.clone()) {
            debug!("duplicate trade {} ignored", trade.trade_id);
            return;
        }

        let key = (trade.market_slug.clone(), token_type);
        let position = self
            .positions
            .entry(key)
            .or_insert_with(|| Position::new(trade.market_slug.clone(), token_type));

        match trade.side {
            OrderSide::Buy => position.apply_buy(trade.price, trade.size),
            OrderSide::Sell => position.apply_sell(trade.size),
        }

        let _ = self.events.send(PositionChanged {
            market_slug: position.market_slug.clone(),
            token_type,
            size: position.size,
            average_entry_price: position.average_entry_price,
            timestamp: Utc::now(),
        });
    }

    async fn reconcile(&mut self) {
        let Some(market) = self.bound.clone() else {
            return;
        };

        let records = match self.gateway.trades(Some(&market.condition_id)).await {
            Ok(records) => records,
            Err(e) => {
                warn!("trade reconcile failed: {e}");
                return;
            }
        };

        for record in records {
            let Some(token_type) = market.token_type_of(&record.asset_id) else {
                continue;
            };
            let Some(side) = OrderSide::from_str(&record.side) else {
                continue;
            };
            let price = record.price.parse().unwrap_or_default();
            let size = record.size.parse().unwrap_or_default();
            let trade = TradeUpdate {
                trade_id: record.id.clone(),
                order_id: record.taker_order_id.clone(),
                market_slug: market.slug.clone(),
                asset_id: record.asset_id.clone(),
                side,
                price,
                size,
                timestamp: record.timestamp(),
            };
            self.apply(trade, token_type);
        }
    }
}
