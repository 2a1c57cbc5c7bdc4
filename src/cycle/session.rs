use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::scheduler::{MarketSpec, ScheduledTransition};
use crate::chain::{ChainCoordinator, SplitDecision};
use crate::client::rest::MarketInfo;
use crate::client::RestClient;
use crate::engine::{OrderEngineHandle, PositionHandle, ReconcileReason};
use crate::feeds::{MarketStream, UserStream};
use crate::models::events::{CycleTransition, PositionChanged, PriceChanged, UserEvent};
use crate::models::market::{BestBook, Market, TokenType};
use crate::runtime::shutdown::{ShutdownSignal, ShutdownTrigger};
use crate::strategies::host::StrategyHost;

/// Events routed to strategies, already gated to the session's market.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Price(PriceChanged),
    Order(crate::models::events::OrderUpdate),
    Trade(crate::models::events::TradeUpdate),
    Position(PositionChanged),
}

/// Cycle gate: an event is admitted when its slug (or condition id, which
/// is what the wire carries) matches the bound market; when the field is
/// missing, membership of the asset id decides.
pub fn admits(market: &Market, slug_or_condition: &str, asset_id: &str) -> bool {
    if !slug_or_condition.is_empty() {
        slug_or_condition == market.slug || slug_or_condition == market.condition_id
    } else {
        market.contains_asset(asset_id)
    }
}

/// Route one user event into the engine and tracker, returning true when
/// it was admitted. Late events from a retired cycle fail the gate and
/// never mutate this session's state.
pub fn route_user_event(
    market: &Market,
    engine: &OrderEngineHandle,
    positions: &PositionHandle,
    events_tx: &broadcast::Sender<SessionEvent>,
    event: UserEvent,
) -> bool {
    match event {
        UserEvent::Order(mut order) => {
            if !admits(market, &order.market_slug, &order.asset_id) {
                debug!(
                    "gated order event for {} (bound {})",
                    order.market_slug, market.slug
                );
                return false;
            }
            order.market_slug = market.slug.clone();
            engine.apply_order_event(order.clone());
            let _ = events_tx.send(SessionEvent::Order(order));
            true
        }
        UserEvent::Trade(mut trade) => {
            if !admits(market, &trade.market_slug, &trade.asset_id) {
                debug!(
                    "gated trade event for {} (bound {})",
                    trade.market_slug, market.slug
                );
                return false;
            }
            let Some(token_type) = market.token_type_of(&trade.asset_id) else {
                debug!("trade for unknown asset {}", trade.asset_id);
                return false;
            };
            trade.market_slug = market.slug.clone();
            engine.apply_trade_event(trade.clone());
            positions.apply_trade(trade.clone(), token_type);
            let _ = events_tx.send(SessionEvent::Trade(trade));
            true
        }
    }
}

/// One cycle's trading context: the bound market, its market-data stream,
/// and the router feeding the engine, tracker and strategies. A session is
/// a linear resource; `retire` tears down its tasks and the maps die with
/// it.
pub struct Session {
    market: Market,
    neg_risk: bool,
    market_stream: Arc<MarketStream>,
    events_tx: broadcast::Sender<SessionEvent>,
    scope_trigger: Arc<ShutdownTrigger>,
    scope: ShutdownSignal,
}

impl Session {
    pub async fn open(
        market: Market,
        neg_risk: bool,
        market_ws_url: &str,
        user_stream: &UserStream,
        engine: OrderEngineHandle,
        positions: PositionHandle,
        parent: &ShutdownSignal,
    ) -> Arc<Self> {
        let (scope_trigger, scope) = ShutdownSignal::new();
        let scope_trigger = Arc::new(scope_trigger);

        // Parent cancellation cascades into the session scope so streams
        // and the router stop on global shutdown too.
        {
            let parent = parent.clone();
            let trigger = scope_trigger.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = parent.cancelled() => trigger.trigger(),
                    _ = scope.cancelled() => {}
                }
            });
        }

        let market_stream = Arc::new(MarketStream::new(market_ws_url, market.clone()));
        market_stream.start(scope.clone());

        let user_rx = user_stream
            .subscribe(&format!("session:{}", market.slug))
            .await;
        let price_rx = market_stream.subscribe_prices();
        let position_rx = positions.subscribe();

        let (events_tx, _) = broadcast::channel(1024);

        let session = Arc::new(Self {
            market,
            neg_risk,
            market_stream,
            events_tx: events_tx.clone(),
            scope_trigger,
            scope: scope.clone(),
        });

        session.spawn_router(user_rx, price_rx, position_rx, engine, positions, parent);
        session
    }

    fn spawn_router(
        self: &Arc<Self>,
        mut user_rx: mpsc::Receiver<UserEvent>,
        mut price_rx: broadcast::Receiver<PriceChanged>,
        mut position_rx: broadcast::Receiver<PositionChanged>,
        engine: OrderEngineHandle,
        positions: PositionHandle,
        parent: &ShutdownSignal,
    ) {
        let market = self.market.clone();
        let events_tx = self.events_tx.clone();
        let scope = self.scope.clone();
        let parent = parent.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = user_rx.recv() => {
                        match event {
                            Some(event) => {
                                route_user_event(&market, &engine, &positions, &events_tx, event);
                            }
                            None => break,
                        }
                    }
                    price = price_rx.recv() => {
                        match price {
                            Ok(price) if price.market_slug == market.slug => {
                                let _ = events_tx.send(SessionEvent::Price(price));
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!("session price feed lagged {n}");
                            }
                            Err(_) => break,
                        }
                    }
                    position = position_rx.recv() => {
                        match position {
                            Ok(position) if position.market_slug == market.slug => {
                                let _ = events_tx.send(SessionEvent::Position(position));
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!("session position feed lagged {n}");
                            }
                            Err(_) => break,
                        }
                    }
                    _ = scope.cancelled() => break,
                    _ = parent.cancelled() => break,
                }
            }
            debug!("session router for {} stopped", market.slug);
        });
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn neg_risk(&self) -> bool {
        self.neg_risk
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Latest top of book for one of the session's tokens.
    pub fn best(&self, token_type: TokenType) -> Option<BestBook> {
        self.market_stream.best(self.market.token_id(token_type))
    }

    pub fn last_trade_price(&self, token_type: TokenType) -> Option<Decimal> {
        self.market_stream
            .last_trade_price(self.market.token_id(token_type))
    }

    /// Scope strategies should select on; fires when the session retires.
    pub fn scope(&self) -> ShutdownSignal {
        self.scope.clone()
    }

    pub fn retire(&self) {
        info!("retiring session {}", self.market.slug);
        self.scope_trigger.trigger();
    }
}

/// Turns a user-stream drop into a throttled reconcile: the dropped event
/// is unrecoverable, so the REST state of record is replayed instead.
pub struct ReconcileOnDrop {
    pub engine: OrderEngineHandle,
    pub positions: PositionHandle,
}

impl crate::models::events::DropHandler for ReconcileOnDrop {
    fn on_drop(&self, kind: crate::models::events::EventKind, meta: &str) {
        warn!("user event dropped ({}, {meta}), reconciling", kind.label());
        self.engine.reconcile(ReconcileReason::Drop);
        self.positions.reconcile();
    }
}

/// Dependencies handed to the orchestrator at startup.
pub struct OrchestratorDeps {
    pub spec: MarketSpec,
    pub market_ws_url: String,
    pub cancel_open_orders_on_cycle_start: bool,
    pub split_amount: Decimal,
    pub rest: Arc<RestClient>,
    pub engine: OrderEngineHandle,
    pub positions: PositionHandle,
    pub chain: Option<Arc<ChainCoordinator>>,
    pub user_stream: Arc<UserStream>,
    pub host: Arc<StrategyHost>,
    pub shutdown: ShutdownSignal,
}

/// Per-cycle session lifecycle: consumes scheduler transitions, resolves
/// market metadata, runs the boundary sequence and swaps the active
/// session.
pub struct SessionOrchestrator {
    deps: OrchestratorDeps,
    current: RwLock<Option<Arc<Session>>>,
    prewarmed: Mutex<HashMap<String, MarketInfo>>,
}

impl SessionOrchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self {
            deps,
            current: RwLock::new(None),
            prewarmed: Mutex::new(HashMap::new()),
        }
    }

    pub async fn current_session(&self) -> Option<Arc<Session>> {
        self.current.read().await.clone()
    }

    /// Main loop. Returns when the transition channel closes or shutdown
    /// fires.
    pub async fn run(&self, mut transitions: mpsc::Receiver<ScheduledTransition>) {
        loop {
            let scheduled = tokio::select! {
                scheduled = transitions.recv() => scheduled,
                _ = self.deps.shutdown.cancelled() => break,
            };
            let Some(scheduled) = scheduled else { break };

            let now = Utc::now().timestamp();
            if scheduled.is_late(now) {
                warn!(
                    "suppressing late transition {:?} ({}s old)",
                    scheduled.transition,
                    now - scheduled.emitted_at_unix
                );
                continue;
            }

            match scheduled.transition {
                CycleTransition::PreWarm { slug, .. } => self.pre_warm(&slug).await,
                CycleTransition::Activate { slug, start_unix } => {
                    self.activate(&slug, start_unix).await
                }
                CycleTransition::Retire { slug } => self.retire(&slug).await,
            }
        }

        // Drain on the way out.
        if let Some(session) = self.current.write().await.take() {
            session.retire();
        }
        self.deps.host.stop_all().await;
    }

    /// Resolve metadata ahead of activation and run the cycle-start split.
    async fn pre_warm(&self, slug: &str) {
        let info = match self.resolve(slug).await {
            Some(info) => info,
            None => {
                debug!("pre-warm: {slug} not resolvable yet");
                return;
            }
        };

        if let Some(chain) = &self.deps.chain {
            if self.deps.split_amount > Decimal::ZERO {
                match chain
                    .split_for_cycle(slug, &info.condition_id, self.deps.split_amount)
                    .await
                {
                    Ok(SplitDecision::Done(outcome)) => {
                        info!("pre-warm split done for {slug}: {:?}", outcome.tx_hash)
                    }
                    Ok(SplitDecision::HoldingsOk) => {
                        info!("pre-warm split skipped for {slug}: holdings ok")
                    }
                    Ok(SplitDecision::AlreadyAttempted) => {}
                    Err(e) => warn!("pre-warm split failed for {slug}: {e}"),
                }
            }
        }

        self.prewarmed.lock().await.insert(slug.to_string(), info);
    }

    async fn activate(&self, slug: &str, start_unix: u64) {
        let info = match self.prewarmed.lock().await.remove(slug) {
            Some(info) => Some(info),
            None => self.resolve(slug).await,
        };
        let Some(info) = info else {
            warn!("activate: no metadata for {slug}, skipping cycle");
            return;
        };

        let mut market = Market::new(
            info.slug.clone(),
            info.condition_id.clone(),
            info.up_token_id.clone(),
            info.down_token_id.clone(),
            start_unix,
            self.deps.spec.timeframe_secs,
        );
        market.tick_size = info.tick_size;

        let previous = self.current.read().await.clone();

        // Boundary order: merge the previous cycle's complete sets back to
        // collateral before splitting for the new one.
        if let Some(chain) = &self.deps.chain {
            if let Some(previous) = &previous {
                match chain.merge_all(&previous.market().condition_id).await {
                    Ok(Some(outcome)) => {
                        info!(
                            "merged previous cycle {}: {:?}",
                            previous.market().slug,
                            outcome.tx_hash
                        )
                    }
                    Ok(None) => {}
                    Err(e) => warn!("merge of previous cycle failed: {e}"),
                }
            }

            if self.deps.split_amount > Decimal::ZERO {
                match chain
                    .split_for_cycle(slug, &info.condition_id, self.deps.split_amount)
                    .await
                {
                    Ok(SplitDecision::Done(outcome)) => {
                        info!("cycle split done for {slug}: {:?}", outcome.tx_hash)
                    }
                    Ok(SplitDecision::HoldingsOk) => info!("holdings ok for {slug}"),
                    Ok(SplitDecision::AlreadyAttempted) => {}
                    Err(e) => warn!("cycle split failed for {slug}: {e}"),
                }
            }
        }

        // Bind the engine and tracker to the new market, then clear orders
        // that belong to anything else.
        self.deps
            .engine
            .bind_market(market.clone(), info.neg_risk);
        self.deps.positions.bind_market(market.clone());

        if let Err(e) = self.deps.engine.cancel_not_in_market(slug).await {
            warn!("cancel-not-in-market failed: {e}");
        }
        if self.deps.cancel_open_orders_on_cycle_start {
            if let Err(e) = self.deps.engine.cancel_all_for_market(slug).await {
                warn!("cycle-start cancel-all failed: {e}");
            }
        }

        let session = Session::open(
            market,
            info.neg_risk,
            &self.deps.market_ws_url,
            &self.deps.user_stream,
            self.deps.engine.clone(),
            self.deps.positions.clone(),
            &self.deps.shutdown,
        )
        .await;

        let old = {
            let mut current = self.current.write().await;
            current.replace(session.clone())
        };
        if let Some(old) = old {
            old.retire();
        }

        self.deps.host.switch_session(session).await;
        self.deps.engine.reconcile(ReconcileReason::Boundary);
        self.deps.positions.reconcile();
        info!("session active: {slug}");
    }

    async fn retire(&self, slug: &str) {
        // The swap already retired the old session; this confirms the
        // handoff and drops any stale pre-warm entries.
        self.prewarmed.lock().await.remove(slug);
        debug!("cycle {slug} retired");
    }

    async fn resolve(&self, slug: &str) -> Option<MarketInfo> {
        match self.deps.rest.market_by_slug(slug).await {
            Ok(Some(info)) => Some(info),
            Ok(None) => None,
            Err(e) => {
                warn!("market resolve failed for {slug}: {e}");
                None
            }
        }
    }
}
