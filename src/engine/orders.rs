use alloy_primitives::Address;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::gateway::ExchangeGateway;
use super::rounding::{
    order_amounts, price_cents, round_config_for_tick, round_down, round_normal, size_quanta,
    validate_fok_precision, validate_min_order, validate_min_shares,
};
use crate::auth::{OrderArgs, Signer};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::events::{OrderUpdate, TradeUpdate};
use crate::models::market::{decimal_to_f64, Market, TokenType};
use crate::models::order::{Order, OrderIntent, OrderSide, OrderStatus, OrderType};
use crate::runtime::shutdown::ShutdownSignal;

const RECONCILE_THROTTLE: Duration = Duration::from_secs(1);

/// Exchange contract addresses the engine signs against.
#[derive(Debug, Clone)]
pub struct ExchangeAddresses {
    pub standard: Address,
    pub neg_risk: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileReason {
    Periodic,
    Drop,
    Boundary,
    Manual,
}

impl ReconcileReason {
    fn label(&self) -> &'static str {
        match self {
            ReconcileReason::Periodic => "periodic",
            ReconcileReason::Drop => "drop",
            ReconcileReason::Boundary => "boundary",
            ReconcileReason::Manual => "manual",
        }
    }
}

/// Notifications published by the engine.
#[derive(Debug, Clone)]
pub enum OrderEngineEvent {
    Accepted(Order),
    Rejected {
        intent: OrderIntent,
        reason: String,
        fail_safe: bool,
    },
    Terminal(Order),
    ReconcileDone(&'static str),
}

enum Command {
    Place {
        intent: OrderIntent,
        reply: oneshot::Sender<EngineResult<String>>,
    },
    PlaceMarket {
        market_slug: String,
        token_id: String,
        token_type: TokenType,
        side: OrderSide,
        collateral: f64,
        reply: oneshot::Sender<EngineResult<String>>,
    },
    Cancel {
        order_id: String,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    CancelAllForMarket {
        slug: String,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    CancelNotInMarket {
        slug: String,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Reconcile(ReconcileReason),
    OrderEvent(OrderUpdate),
    TradeEvent(TradeUpdate),
    Bind {
        market: Market,
        neg_risk: bool,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Order>>,
    },
}

/// Cloneable handle. All mutation happens inside the single-writer loop;
/// readers get snapshots through request messages.
#[derive(Clone)]
pub struct OrderEngineHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<OrderEngineEvent>,
}

impl OrderEngineHandle {
    pub async fn place(&self, intent: OrderIntent) -> EngineResult<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Place { intent, reply })?;
        rx.await
            .map_err(|_| EngineError::Transient("order engine stopped".into()))?
    }

    /// Synthesize a market order by walking the book, then place as FAK.
    pub async fn place_market(
        &self,
        market_slug: &str,
        token_id: &str,
        token_type: TokenType,
        side: OrderSide,
        collateral: f64,
    ) -> EngineResult<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PlaceMarket {
            market_slug: market_slug.to_string(),
            token_id: token_id.to_string(),
            token_type,
            side,
            collateral,
            reply,
        })?;
        rx.await
            .map_err(|_| EngineError::Transient("order engine stopped".into()))?
    }

    pub async fn cancel(&self, order_id: &str) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel {
            order_id: order_id.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| EngineError::Transient("order engine stopped".into()))?
    }

    pub async fn cancel_all_for_market(&self, slug: &str) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CancelAllForMarket {
            slug: slug.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| EngineError::Transient("order engine stopped".into()))?
    }

    pub async fn cancel_not_in_market(&self, slug: &str) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CancelNotInMarket {
            slug: slug.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| EngineError::Transient("order engine stopped".into()))?
    }

    pub fn reconcile(&self, reason: ReconcileReason) {
        let _ = self.tx.send(Command::Reconcile(reason));
    }

    pub fn apply_order_event(&self, update: OrderUpdate) {
        let _ = self.tx.send(Command::OrderEvent(update));
    }

    pub fn apply_trade_event(&self, update: TradeUpdate) {
        let _ = self.tx.send(Command::TradeEvent(update));
    }

    pub fn bind_market(&self, market: Market, neg_risk: bool) {
        let _ = self.tx.send(Command::Bind { market, neg_risk });
    }

    pub async fn orders_snapshot(&self) -> Vec<Order> {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Snapshot { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderEngineEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> EngineResult<()> {
        self.tx
            .send(command)
            .map_err(|_| EngineError::Transient("order engine stopped".into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Fingerprint {
    market_slug: String,
    asset_id: String,
    side: OrderSide,
    price_cents: i64,
    size_quanta: u64,
    order_type: OrderType,
}

impl Fingerprint {
    fn of(intent: &OrderIntent) -> Self {
        Self {
            market_slug: intent.market_slug.clone(),
            asset_id: intent.token_id.clone(),
            side: intent.side,
            price_cents: price_cents(decimal_to_f64(intent.price)),
            size_quanta: size_quanta(decimal_to_f64(intent.size)),
            order_type: intent.order_type,
        }
    }
}

/// Single-writer order engine. One instance per account; all `Order` map
/// mutations happen inside its loop, and commands execute in submission
/// order against the exchange.
pub struct OrderEngine {
    gateway: Arc<dyn ExchangeGateway>,
    signer: Arc<Signer>,
    addresses: ExchangeAddresses,
    config: EngineConfig,

    orders: HashMap<String, Order>,
    /// fingerprint -> order id ("" while the placement is in flight)
    fingerprints: HashMap<Fingerprint, String>,
    bound: Option<(Market, bool)>,
    last_reconcile: Option<Instant>,

    events: broadcast::Sender<OrderEngineEvent>,
}

impl OrderEngine {
    pub fn spawn(
        gateway: Arc<dyn ExchangeGateway>,
        signer: Arc<Signer>,
        addresses: ExchangeAddresses,
        config: EngineConfig,
        shutdown: ShutdownSignal,
    ) -> OrderEngineHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(512);

        let engine = OrderEngine {
            gateway,
            signer,
            addresses,
            config,
            orders: HashMap::new(),
            fingerprints: HashMap::new(),
            bound: None,
            last_reconcile: None,
            events: events.clone(),
        };

        tokio::spawn(engine.run(rx, shutdown));

        OrderEngineHandle { tx, events }
    }

    // Keeps serving commands through staged shutdown so the drain and
    // persistence hooks still see the map; only the periodic reconcile
    // stops once the signal fires. The task ends with the last handle.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, shutdown: ShutdownSignal) {
        loop {
            let sync_interval = self.sync_interval();
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(command) => self.handle(command).await,
                        None => {
                            debug!("order engine stopping");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(sync_interval), if !shutdown.is_cancelled() => {
                    self.reconcile(ReconcileReason::Periodic).await;
                }
            }
        }
    }

    fn sync_interval(&self) -> Duration {
        let has_orders = self.orders.values().any(|o| !o.status.is_terminal());
        let secs = if has_orders {
            self.config.order_status_sync_interval_with_orders
        } else {
            self.config.order_status_sync_interval_without_orders
        };
        Duration::from_secs(secs.max(1))
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Place { intent, reply } => {
                let result = self.place(intent).await;
                let _ = reply.send(result);
            }
            Command::PlaceMarket {
                market_slug,
                token_id,
                token_type,
                side,
                collateral,
                reply,
            } => {
                let result = self
                    .place_market(&market_slug, &token_id, token_type, side, collateral)
                    .await;
                let _ = reply.send(result);
            }
            Command::Cancel { order_id, reply } => {
                let _ = reply.send(self.cancel(&order_id).await);
            }
            Command::CancelAllForMarket { slug, reply } => {
                let _ = reply.send(self.cancel_all_for_market(&slug).await);
            }
            Command::CancelNotInMarket { slug, reply } => {
                let _ = reply.send(self.cancel_not_in_market(&slug).await);
            }
            Command::Reconcile(reason) => self.reconcile(reason).await,
            Command::OrderEvent(update) => self.apply_order_event(update),
            Command::TradeEvent(update) => self.apply_trade_event(update),
            Command::Bind { market, neg_risk } => {
                debug!("order engine bound to {}", market.slug);
                self.bound = Some((market, neg_risk));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.orders.values().cloned().collect());
            }
        }
    }

    // --- placement ---

    async fn place(&mut self, intent: OrderIntent) -> EngineResult<String> {
        let fingerprint = Fingerprint::of(&intent);
        if self.fingerprint_active(&fingerprint) {
            return Err(EngineError::DuplicateInFlight(format!(
                "{} {} {}@{}",
                intent.market_slug,
                intent.side.as_str(),
                intent.size,
                intent.price
            )));
        }

        let price = decimal_to_f64(intent.price);
        let size = decimal_to_f64(intent.size);
        let config = self.round_config(&intent.market_slug)?;

        validate_min_order(price, size, self.config.min_order_size)?;
        if intent.order_type == OrderType::GTC {
            validate_min_shares(size, self.config.min_share_size)?;
        }
        if intent.order_type.is_market_style() {
            validate_fok_precision(price, size)?;
        }

        let (maker_amount, taker_amount) = order_amounts(intent.side, size, price, config);
        self.submit(intent, maker_amount, taker_amount, fingerprint)
            .await
    }

    async fn place_market(
        &mut self,
        market_slug: &str,
        token_id: &str,
        token_type: TokenType,
        side: OrderSide,
        collateral: f64,
    ) -> EngineResult<String> {
        if collateral <= 0.0 {
            return Err(EngineError::Validation("collateral must be positive".into()));
        }

        // Walk the opposite side of the live book for an average price.
        let book = self.gateway.book(token_id).await?;
        let walk = match side {
            OrderSide::Buy => book.walk_asks_for_collateral(collateral),
            OrderSide::Sell => {
                // For sells the caller quantity is collateral-equivalent at
                // the top bid; walk bids for the implied share count.
                match book.best_bid() {
                    Some((price, _)) if price > Decimal::ZERO => {
                        let shares = collateral / decimal_to_f64(price);
                        book.walk_bids_for_shares(shares)
                    }
                    _ => None,
                }
            }
        };

        let Some((total_size, total_spent)) = walk else {
            return Err(EngineError::Validation(format!(
                "no liquidity on book for {token_id}"
            )));
        };

        let average = total_spent / total_size;
        let price = round_normal(average, 2);
        let size = round_down(total_size, 2);
        if size <= 0.0 || price <= 0.0 {
            return Err(EngineError::Validation("market order rounds to zero".into()));
        }

        info!(
            "market {} {}: walked {:.4} tokens at avg {:.4} for {:.2} collateral",
            side.as_str(),
            token_id,
            total_size,
            average,
            total_spent
        );

        let intent = OrderIntent {
            market_slug: market_slug.to_string(),
            token_id: token_id.to_string(),
            token_type,
            side,
            price: Decimal::from_f64_retain(price).unwrap_or_default(),
            size: Decimal::from_f64_retain(size).unwrap_or_default(),
            order_type: OrderType::FAK,
            fee_rate_bps: None,
            nonce: None,
            expiration: None,
            taker: None,
        };

        let fingerprint = Fingerprint::of(&intent);
        if self.fingerprint_active(&fingerprint) {
            return Err(EngineError::DuplicateInFlight(format!(
                "market order {} {}", side.as_str(), token_id
            )));
        }

        // Amounts are built from integer cents/quanta so the signable
        // values are exact regardless of the walked average.
        let (maker_amount, taker_amount) = match side {
            OrderSide::Buy => {
                let cents = (total_spent * 100.0).floor() as u64;
                let maker = cents * 10_000;
                let raw_taker = cents as f64 / 100.0 / price;
                let quanta = (raw_taker * 10_000.0).floor() as u64;
                (maker, quanta * 100)
            }
            OrderSide::Sell => {
                let token_cents = (size * 100.0).floor() as u64;
                let maker = token_cents * 10_000;
                let raw_taker = token_cents as f64 / 100.0 * price;
                let quanta = (raw_taker * 10_000.0).floor() as u64;
                (maker, quanta * 100)
            }
        };

        self.submit(intent, maker_amount, taker_amount, fingerprint)
            .await
    }

    async fn submit(
        &mut self,
        intent: OrderIntent,
        maker_amount: u64,
        taker_amount: u64,
        fingerprint: Fingerprint,
    ) -> EngineResult<String> {
        if maker_amount == 0 || taker_amount == 0 {
            return Err(EngineError::Validation(
                "order amounts round to zero".into(),
            ));
        }

        // Mark in flight before the REST call so a racing duplicate is
        // rejected without hitting the exchange.
        self.fingerprints.insert(fingerprint.clone(), String::new());

        let salt: u64 = rand::thread_rng().gen::<u64>() & ((1u64 << 53) - 1);
        let args = OrderArgs {
            salt,
            token_id: intent.token_id.clone(),
            maker_amount,
            taker_amount,
            side: intent.side,
            expiration: intent.expiration.unwrap_or(0),
            nonce: intent.nonce.unwrap_or(0),
            fee_rate_bps: intent.fee_rate_bps.unwrap_or(0),
            taker: intent.taker.clone(),
        };

        let exchange = self.exchange_address();
        let signed = match self.signer.sign_order(exchange, &args).await {
            Ok(signed) => signed,
            Err(e) => {
                self.fingerprints.remove(&fingerprint);
                return Err(e);
            }
        };

        // No automatic retry on POST /order: at-most-once placement.
        let outcome = match self.gateway.submit_order(signed, intent.order_type).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fingerprints.remove(&fingerprint);
                return Err(e);
            }
        };

        if !outcome.success {
            self.fingerprints.remove(&fingerprint);
            let reason = outcome.error.unwrap_or_else(|| "rejected".to_string());
            let err = EngineError::from_rejection(&reason);
            warn!("order rejected: {reason}");
            let _ = self.events.send(OrderEngineEvent::Rejected {
                intent,
                reason,
                fail_safe: err.is_fail_safe(),
            });
            return Err(err);
        }

        let order_id = outcome.order_id.unwrap_or_default();
        if order_id.is_empty() {
            self.fingerprints.remove(&fingerprint);
            return Err(EngineError::Transient("accepted without order id".into()));
        }

        let order = Order {
            order_id: order_id.clone(),
            market_slug: intent.market_slug.clone(),
            asset_id: intent.token_id.clone(),
            token_type: intent.token_type,
            side: intent.side,
            order_type: intent.order_type,
            price: intent.price,
            original_size: intent.size,
            filled_size: Decimal::ZERO,
            status: OrderStatus::Live,
            created_at: Utc::now(),
        };

        self.fingerprints.insert(fingerprint, order_id.clone());
        self.orders.insert(order_id.clone(), order.clone());
        info!(
            "placed {} {} {}@{} -> {}",
            intent.order_type.as_str(),
            intent.side.as_str(),
            intent.size,
            intent.price,
            order_id
        );
        let _ = self.events.send(OrderEngineEvent::Accepted(order));
        Ok(order_id)
    }

    fn fingerprint_active(&self, fingerprint: &Fingerprint) -> bool {
        match self.fingerprints.get(fingerprint) {
            // In flight, or still mapped to a live order.
            Some(order_id) if order_id.is_empty() => true,
            Some(order_id) => self
                .orders
                .get(order_id)
                .map(|o| !o.status.is_terminal())
                .unwrap_or(false),
            None => false,
        }
    }

    fn round_config(&self, market_slug: &str) -> EngineResult<super::rounding::RoundConfig> {
        let tick = match &self.bound {
            Some((market, _)) if market.slug == market_slug => market.tick_size,
            _ => Decimal::new(1, 2),
        };
        round_config_for_tick(tick)
            .ok_or_else(|| EngineError::Validation(format!("unknown tick size {tick}")))
    }

    fn exchange_address(&self) -> Address {
        match &self.bound {
            Some((_, true)) => self.addresses.neg_risk,
            _ => self.addresses.standard,
        }
    }

    // --- cancellation ---

    /// Idempotent: missing or already-terminal orders succeed silently.
    async fn cancel(&mut self, order_id: &str) -> EngineResult<()> {
        match self.orders.get(order_id) {
            None => return Ok(()),
            Some(order) if order.status.is_terminal() => return Ok(()),
            Some(_) => {}
        }

        self.gateway.cancel_order(order_id).await?;
        self.finish_order(order_id, OrderStatus::Cancelled);
        Ok(())
    }

    async fn cancel_all_for_market(&mut self, slug: &str) -> EngineResult<()> {
        // Prefer the bulk endpoint when the bound market matches; fall back
        // to per-order cancels otherwise.
        let bulk = match &self.bound {
            Some((market, _)) if market.slug == slug => Some(market.condition_id.clone()),
            _ => None,
        };

        if let Some(condition_id) = bulk {
            self.gateway.cancel_market_orders(&condition_id).await?;
        } else {
            let ids: Vec<String> = self
                .orders
                .values()
                .filter(|o| o.market_slug == slug && !o.status.is_terminal())
                .map(|o| o.order_id.clone())
                .collect();
            for id in ids {
                if let Err(e) = self.gateway.cancel_order(&id).await {
                    warn!("cancel {id} failed: {e}");
                }
            }
        }

        let ids: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.market_slug == slug)
            .map(|o| o.order_id.clone())
            .collect();
        for id in ids {
            self.finish_order(&id, OrderStatus::Cancelled);
        }
        info!("cancelled all orders for {slug}");
        Ok(())
    }

    /// Cancel every order NOT bound to the given market; used at cycle
    /// boundaries so a new cycle starts clean.
    async fn cancel_not_in_market(&mut self, slug: &str) -> EngineResult<()> {
        let stale: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.market_slug != slug && !o.status.is_terminal())
            .map(|o| o.order_id.clone())
            .collect();

        for id in &stale {
            if let Err(e) = self.gateway.cancel_order(id).await {
                warn!("stale cancel {id} failed: {e}");
            }
            self.finish_order(id, OrderStatus::Cancelled);
        }
        if !stale.is_empty() {
            info!("cancelled {} orders outside {slug}", stale.len());
        }
        Ok(())
    }

    /// Transition to a terminal state, release the fingerprint, drop the
    /// record and notify subscribers.
    fn finish_order(&mut self, order_id: &str, status: OrderStatus) {
        if let Some(mut order) = self.orders.remove(order_id) {
            order.transition(status);
            self.fingerprints.retain(|_, id| id != order_id);
            let _ = self.events.send(OrderEngineEvent::Terminal(order));
        }
    }

    // --- stream events ---

    fn apply_order_event(&mut self, update: OrderUpdate) {
        match self.orders.get_mut(&update.order_id) {
            Some(order) => {
                if update.filled_size > order.filled_size {
                    order.filled_size = update.filled_size.min(order.original_size);
                }
                if !update.status.is_terminal() {
                    if order.transition(update.status) {
                        debug!("order {} -> {:?}", update.order_id, update.status);
                    }
                    return;
                }
                self.finish_order(&update.order_id, update.status);
            }
            None => {
                // An order the engine does not know (e.g. placed before a
                // restart). Adopt it when it belongs to the bound market.
                if update.status.is_terminal() {
                    return;
                }
                let Some((market, _)) = &self.bound else { return };
                let Some(token_type) = market.token_type_of(&update.asset_id) else {
                    return;
                };
                let order = Order {
                    order_id: update.order_id.clone(),
                    market_slug: market.slug.clone(),
                    asset_id: update.asset_id,
                    token_type,
                    side: update.side,
                    order_type: OrderType::GTC,
                    price: update.price,
                    original_size: update.original_size,
                    filled_size: update.filled_size,
                    status: update.status,
                    created_at: update.timestamp,
                };
                debug!("adopted unknown order {}", order.order_id);
                self.orders.insert(order.order_id.clone(), order);
            }
        }
    }

    fn apply_trade_event(&mut self, update: TradeUpdate) {
        let fully_filled = match self.orders.get_mut(&update.order_id) {
            Some(order) => {
                order.filled_size = (order.filled_size + update.size).min(order.original_size);
                if order.filled_size >= order.original_size {
                    true
                } else {
                    order.transition(OrderStatus::PartiallyFilled);
                    false
                }
            }
            None => return,
        };
        if fully_filled {
            self.finish_order(&update.order_id, OrderStatus::Filled);
        }
    }

    // --- reconciliation ---

    /// Converge the local map with `/data/orders`, applying minimum edits.
    /// Throttled to at most one pass per second.
    async fn reconcile(&mut self, reason: ReconcileReason) {
        if let Some(last) = self.last_reconcile {
            if last.elapsed() < RECONCILE_THROTTLE {
                debug!("reconcile ({}) throttled", reason.label());
                return;
            }
        }
        self.last_reconcile = Some(Instant::now());

        let Some((market, _)) = self.bound.clone() else {
            return;
        };

        let records = match self.gateway.open_orders(Some(&market.condition_id)).await {
            Ok(records) => records,
            Err(e) => {
                warn!("reconcile ({}) fetch failed: {e}", reason.label());
                return;
            }
        };

        let mut server_ids: HashSet<String> = HashSet::with_capacity(records.len());
        for record in records {
            server_ids.insert(record.id.clone());
            let status = record.runtime_status();
            let known = match self.orders.get_mut(&record.id) {
                Some(order) => {
                    let matched = record.size_matched_decimal();
                    if matched > order.filled_size {
                        order.filled_size = matched.min(order.original_size);
                    }
                    if !status.is_terminal() {
                        order.transition(status);
                    }
                    true
                }
                None => false,
            };
            if known {
                if status.is_terminal() {
                    self.finish_order(&record.id, status);
                }
                continue;
            }

            if status.is_terminal() {
                continue;
            }
            let Some(token_type) = market.token_type_of(&record.asset_id) else {
                continue;
            };
            let order = Order {
                order_id: record.id.clone(),
                market_slug: market.slug.clone(),
                asset_id: record.asset_id.clone(),
                token_type,
                side: record.order_side(),
                order_type: OrderType::GTC,
                price: record.price_decimal(),
                original_size: record.original_size_decimal(),
                filled_size: record.size_matched_decimal(),
                status,
                created_at: Utc::now(),
            };
            debug!("reconcile adopted {}", order.order_id);
            self.orders.insert(record.id, order);
        }

        // Orders we hold that the exchange no longer lists are gone:
        // filled if fully matched, otherwise cancelled.
        let vanished: Vec<(String, bool)> = self
            .orders
            .values()
            .filter(|o| o.market_slug == market.slug && !o.status.is_terminal())
            .filter(|o| !server_ids.contains(&o.order_id))
            .map(|o| (o.order_id.clone(), o.filled_size >= o.original_size))
            .collect();
        for (id, filled) in vanished {
            let status = if filled {
                OrderStatus::Filled
            } else {
                OrderStatus::Cancelled
            };
            debug!("reconcile: {id} vanished server-side -> {:?}", status);
            self.finish_order(&id, status);
        }

        let _ = self
            .events
            .send(OrderEngineEvent::ReconcileDone(reason.label()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_distinguishes_all_fields() {
        let base = OrderIntent::limit(
            "slug",
            "tok",
            TokenType::Up,
            OrderSide::Buy,
            Decimal::new(55, 2),
            Decimal::new(10, 0),
            OrderType::GTC,
        );
        let same = Fingerprint::of(&base);
        assert_eq!(Fingerprint::of(&base), same);

        let mut other = base.clone();
        other.price = Decimal::new(56, 2);
        assert_ne!(Fingerprint::of(&other), same);

        let mut other = base.clone();
        other.order_type = OrderType::FAK;
        assert_ne!(Fingerprint::of(&other), same);

        let mut other = base;
        other.side = OrderSide::Sell;
        assert_ne!(Fingerprint::of(&other), same);
    }
}
