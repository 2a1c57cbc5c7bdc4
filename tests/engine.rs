//! Engine integration tests: boundary cancels, market-order synthesis,
//! duplicate suppression, drop-triggered reconciliation and the precision
//! guard, driven through a scripted exchange gateway.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use updn::auth::Signer;
use updn::client::rest::{OpenOrderRecord, PostOrderOutcome, TradeRecord};
use updn::config::EngineConfig;
use updn::engine::orders::ExchangeAddresses;
use updn::engine::{
    ExchangeGateway, OrderEngine, OrderEngineEvent, OrderEngineHandle, PositionHandle,
    PositionTracker, ReconcileReason,
};
use updn::error::{EngineError, EngineResult};
use updn::models::events::{DropHandler, EventKind};
use updn::models::market::{Market, OrderBook, TokenType};
use updn::models::order::{OrderIntent, OrderSide, OrderType, SignedOrder};
use updn::runtime::shutdown::ShutdownSignal;

// ---------------------------------------------------------------------------
// Scripted gateway
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockGateway {
    submitted: Mutex<Vec<(SignedOrder, OrderType)>>,
    cancelled: Mutex<Vec<String>>,
    cancelled_markets: Mutex<Vec<String>>,
    book: Mutex<Option<OrderBook>>,
    open_orders_response: Mutex<Vec<OpenOrderRecord>>,
    trades_response: Mutex<Vec<TradeRecord>>,
    open_orders_calls: AtomicUsize,
    reject_with: Mutex<Option<String>>,
    next_id: AtomicUsize,
}

impl MockGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn set_book(&self, book: OrderBook) {
        *self.book.lock().await = Some(book);
    }

    async fn set_open_orders(&self, records: Vec<OpenOrderRecord>) {
        *self.open_orders_response.lock().await = records;
    }

    async fn set_trades(&self, records: Vec<TradeRecord>) {
        *self.trades_response.lock().await = records;
    }

    async fn reject_next(&self, message: &str) {
        *self.reject_with.lock().await = Some(message.to_string());
    }

    async fn submitted_count(&self) -> usize {
        self.submitted.lock().await.len()
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn submit_order(
        &self,
        signed: SignedOrder,
        order_type: OrderType,
    ) -> EngineResult<PostOrderOutcome> {
        if let Some(message) = self.reject_with.lock().await.take() {
            return Ok(PostOrderOutcome {
                success: false,
                order_id: None,
                error: Some(message),
            });
        }
        let id = format!("order-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.submitted.lock().await.push((signed, order_type));
        Ok(PostOrderOutcome {
            success: true,
            order_id: Some(id),
            error: None,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        self.cancelled.lock().await.push(order_id.to_string());
        Ok(())
    }

    async fn cancel_market_orders(&self, condition_id: &str) -> EngineResult<()> {
        self.cancelled_markets
            .lock()
            .await
            .push(condition_id.to_string());
        Ok(())
    }

    async fn cancel_all(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn open_orders(
        &self,
        _condition_id: Option<&str>,
    ) -> EngineResult<Vec<OpenOrderRecord>> {
        self.open_orders_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.open_orders_response.lock().await.clone())
    }

    async fn trades(&self, _condition_id: Option<&str>) -> EngineResult<Vec<TradeRecord>> {
        Ok(self.trades_response.lock().await.clone())
    }

    async fn book(&self, _token_id: &str) -> EngineResult<OrderBook> {
        self.book
            .lock()
            .await
            .clone()
            .ok_or_else(|| EngineError::Transient("no book scripted".into()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn market_a() -> Market {
    Market::new(
        "btc-updown-15m-1700000000".into(),
        "0xconditionA".into(),
        "up_a".into(),
        "down_a".into(),
        1_700_000_000,
        900,
    )
}

fn market_b() -> Market {
    Market::new(
        "btc-updown-15m-1700000900".into(),
        "0xconditionB".into(),
        "up_b".into(),
        "down_b".into(),
        1_700_000_900,
        900,
    )
}

fn test_engine_config() -> EngineConfig {
    EngineConfig {
        // Long sync intervals keep the periodic reconcile out of tests.
        order_status_sync_interval_with_orders: 600,
        order_status_sync_interval_without_orders: 600,
        min_order_size: 1.0,
        min_share_size: 5.0,
        cancel_open_orders_on_cycle_start: false,
    }
}

fn spawn_engine(gateway: Arc<MockGateway>) -> OrderEngineHandle {
    // Leak the trigger so the signal never fires; the loop ends with the
    // last handle.
    let (trigger, shutdown) = ShutdownSignal::new();
    std::mem::forget(trigger);

    let signer = Arc::new(Signer::random(137));
    let addresses = ExchangeAddresses {
        standard: "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E".parse().unwrap(),
        neg_risk: "0xC5d563A36AE78145C45a50134d48A1215220f80a".parse().unwrap(),
    };
    OrderEngine::spawn(gateway, signer, addresses, test_engine_config(), shutdown)
}

fn spawn_positions(gateway: Arc<MockGateway>) -> PositionHandle {
    let (trigger, shutdown) = ShutdownSignal::new();
    std::mem::forget(trigger);
    PositionTracker::spawn(gateway, shutdown)
}

fn gtc_intent(market: &Market, price: Decimal, size: Decimal) -> OrderIntent {
    OrderIntent::limit(
        &market.slug,
        &market.up_token_id,
        TokenType::Up,
        OrderSide::Buy,
        price,
        size,
        OrderType::GTC,
    )
}

async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

// ---------------------------------------------------------------------------
// S3 — duplicate in-flight
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_fingerprint_is_rejected_without_rest_call() {
    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let market = market_a();
    engine.bind_market(market.clone(), false);

    let intent = gtc_intent(&market, dec!(0.55), dec!(10));
    let first = engine.place(intent.clone()).await;
    assert!(first.is_ok());

    let second = engine.place(intent.clone()).await;
    assert!(matches!(second, Err(EngineError::DuplicateInFlight(_))));

    // Only the first placement reached the exchange.
    assert_eq!(gateway.submitted_count().await, 1);

    // A different price is a different fingerprint and goes through.
    let mut other = intent;
    other.price = dec!(0.56);
    engine.place(other).await.unwrap();
    assert_eq!(gateway.submitted_count().await, 2);
}

#[tokio::test]
async fn fingerprint_frees_after_terminal_state() {
    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let market = market_a();
    engine.bind_market(market.clone(), false);

    let intent = gtc_intent(&market, dec!(0.55), dec!(10));
    let order_id = engine.place(intent.clone()).await.unwrap();

    engine.cancel(&order_id).await.unwrap();

    // The prior order is terminal; the same fingerprint may retry.
    engine.place(intent).await.unwrap();
    assert_eq!(gateway.submitted_count().await, 2);
}

// ---------------------------------------------------------------------------
// S1 — cycle boundary cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn boundary_cancel_clears_previous_market() {
    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let a = market_a();
    engine.bind_market(a.clone(), false);

    let o1 = engine.place(gtc_intent(&a, dec!(0.40), dec!(10))).await.unwrap();
    let o2 = engine.place(gtc_intent(&a, dec!(0.45), dec!(10))).await.unwrap();
    assert_eq!(engine.orders_snapshot().await.len(), 2);

    // Scheduler activates market B.
    let b = market_b();
    engine.bind_market(b.clone(), false);
    engine.cancel_not_in_market(&b.slug).await.unwrap();

    let cancelled = gateway.cancelled.lock().await.clone();
    assert!(cancelled.contains(&o1));
    assert!(cancelled.contains(&o2));

    // No A orders survive in the map.
    let snapshot = engine.orders_snapshot().await;
    assert!(snapshot.iter().all(|o| o.market_slug != a.slug));
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn cancel_all_for_bound_market_uses_bulk_endpoint() {
    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let a = market_a();
    engine.bind_market(a.clone(), false);

    engine.place(gtc_intent(&a, dec!(0.40), dec!(10))).await.unwrap();
    engine.cancel_all_for_market(&a.slug).await.unwrap();

    let markets = gateway.cancelled_markets.lock().await.clone();
    assert_eq!(markets, vec![a.condition_id.clone()]);
    assert!(engine.orders_snapshot().await.is_empty());
}

// ---------------------------------------------------------------------------
// S2 — FAK market buy walks the book
// ---------------------------------------------------------------------------

#[tokio::test]
async fn market_buy_walks_asks_and_places_fak() {
    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let a = market_a();
    engine.bind_market(a.clone(), false);

    let mut book = OrderBook::new(a.up_token_id.clone());
    book.asks.insert(dec!(0.60), dec!(3));
    book.asks.insert(dec!(0.62), dec!(5));
    book.asks.insert(dec!(0.65), dec!(10));
    gateway.set_book(book).await;

    engine
        .place_market(&a.slug, &a.up_token_id, TokenType::Up, OrderSide::Buy, 4.0)
        .await
        .unwrap();

    let submitted = gateway.submitted.lock().await.clone();
    assert_eq!(submitted.len(), 1);
    let (signed, order_type) = &submitted[0];
    assert_eq!(*order_type, OrderType::FAK);
    assert_eq!(signed.side, "BUY");

    // 3 @ 0.60 + 2.20/0.62 -> avg = 4.00 / 6.5484 = 0.6108 -> 0.61
    // maker = 4.00 collateral exactly; taker = 4.00/0.61 floored to 1e-4
    assert_eq!(signed.maker_amount, "4000000");
    assert_eq!(signed.taker_amount, "6557300");
}

#[tokio::test]
async fn market_buy_on_empty_book_is_no_liquidity() {
    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let a = market_a();
    engine.bind_market(a.clone(), false);
    gateway.set_book(OrderBook::new(a.up_token_id.clone())).await;

    let result = engine
        .place_market(&a.slug, &a.up_token_id, TokenType::Up, OrderSide::Buy, 4.0)
        .await;

    match result {
        Err(EngineError::Validation(msg)) => assert!(msg.contains("no liquidity")),
        other => panic!("expected no-liquidity validation error, got {other:?}"),
    }
    assert_eq!(gateway.submitted_count().await, 0);
}

// ---------------------------------------------------------------------------
// S6 — FOK precision guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fok_precision_guard_rejects_before_rest() {
    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let a = market_a();
    engine.bind_market(a.clone(), false);

    let mut intent = gtc_intent(&a, dec!(0.555), dec!(1.2345));
    intent.order_type = OrderType::FOK;

    let result = engine.place(intent).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
    assert_eq!(gateway.submitted_count().await, 0);
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fail_safe_rejection_is_classified() {
    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let a = market_a();
    engine.bind_market(a.clone(), false);

    let mut events = engine.subscribe();
    gateway.reject_next("trading paused for market").await;

    let result = engine.place(gtc_intent(&a, dec!(0.50), dec!(10))).await;
    assert!(matches!(result, Err(EngineError::FailSafe(_))));

    // The strategy sees the rejection with its original intent.
    let mut saw_rejection = false;
    while let Ok(event) = events.try_recv() {
        if let OrderEngineEvent::Rejected { fail_safe, intent, .. } = event {
            assert!(fail_safe);
            assert_eq!(intent.market_slug, a.slug);
            saw_rejection = true;
        }
    }
    assert!(saw_rejection);

    // A rejected fingerprint frees immediately.
    engine.place(gtc_intent(&a, dec!(0.50), dec!(10))).await.unwrap();
}

// ---------------------------------------------------------------------------
// S4 — drop compensation reconcile
// ---------------------------------------------------------------------------

struct TestDropHandler {
    engine: OrderEngineHandle,
    positions: PositionHandle,
}

impl DropHandler for TestDropHandler {
    fn on_drop(&self, _kind: EventKind, _meta: &str) {
        self.engine.reconcile(ReconcileReason::Drop);
        self.positions.reconcile();
    }
}

#[tokio::test]
async fn drop_triggers_reconcile_against_rest() {
    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let positions = spawn_positions(gateway.clone());
    let a = market_a();
    engine.bind_market(a.clone(), false);
    positions.bind_market(a.clone());

    // Server knows an order and a trade the local maps never saw
    // (their WS events were dropped).
    gateway
        .set_open_orders(vec![OpenOrderRecord {
            id: "srv-1".into(),
            status: "LIVE".into(),
            market: a.condition_id.clone(),
            asset_id: a.up_token_id.clone(),
            side: "BUY".into(),
            price: "0.52".into(),
            original_size: "10".into(),
            size_matched: "2".into(),
        }])
        .await;
    gateway
        .set_trades(vec![TradeRecord {
            id: "trade-1".into(),
            taker_order_id: "srv-1".into(),
            market: a.condition_id.clone(),
            asset_id: a.up_token_id.clone(),
            side: "BUY".into(),
            price: "0.52".into(),
            size: "2".into(),
            match_time: "1700000100".into(),
        }])
        .await;

    let handler = TestDropHandler {
        engine: engine.clone(),
        positions: positions.clone(),
    };
    handler.on_drop(EventKind::Trade, "session:test");
    settle().await;

    // The engine converged with the server truth.
    let snapshot = engine.orders_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].order_id, "srv-1");
    assert_eq!(snapshot[0].filled_size, dec!(2));

    // And the position tracker replayed the missed trade.
    let position = positions.get_position(&a.slug, TokenType::Up).await.unwrap();
    assert_eq!(position.size, dec!(2));
    assert_eq!(position.average_entry_price, dec!(0.52));
}

#[tokio::test]
async fn reconcile_is_throttled_to_one_per_second() {
    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let a = market_a();
    engine.bind_market(a.clone(), false);

    engine.reconcile(ReconcileReason::Drop);
    engine.reconcile(ReconcileReason::Drop);
    engine.reconcile(ReconcileReason::Drop);
    settle().await;

    assert_eq!(gateway.open_orders_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconcile_marks_vanished_orders_terminal() {
    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let a = market_a();
    engine.bind_market(a.clone(), false);

    engine.place(gtc_intent(&a, dec!(0.44), dec!(10))).await.unwrap();
    assert_eq!(engine.orders_snapshot().await.len(), 1);

    // Server lists nothing: the order was cancelled out-of-band.
    gateway.set_open_orders(Vec::new()).await;
    engine.reconcile(ReconcileReason::Manual);
    settle().await;

    assert!(engine.orders_snapshot().await.is_empty());
}

// ---------------------------------------------------------------------------
// Stream event application
// ---------------------------------------------------------------------------

fn order_update(
    order_id: &str,
    market: &Market,
    filled: Decimal,
    status: updn::models::order::OrderStatus,
) -> updn::models::events::OrderUpdate {
    updn::models::events::OrderUpdate {
        order_id: order_id.into(),
        market_slug: market.slug.clone(),
        asset_id: market.up_token_id.clone(),
        side: OrderSide::Buy,
        price: dec!(0.40),
        original_size: dec!(10),
        filled_size: filled,
        status,
        timestamp: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn order_events_update_fills_and_respect_terminal_stickiness() {
    use updn::models::order::OrderStatus;

    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let a = market_a();
    engine.bind_market(a.clone(), false);

    let order_id = engine.place(gtc_intent(&a, dec!(0.40), dec!(10))).await.unwrap();

    engine.apply_order_event(order_update(
        &order_id,
        &a,
        dec!(3),
        OrderStatus::PartiallyFilled,
    ));
    settle().await;

    let snapshot = engine.orders_snapshot().await;
    assert_eq!(snapshot[0].filled_size, dec!(3));
    assert_eq!(snapshot[0].status, OrderStatus::PartiallyFilled);

    // Terminal update removes the record from the active map.
    engine.apply_order_event(order_update(&order_id, &a, dec!(3), OrderStatus::Cancelled));
    settle().await;
    assert!(engine.orders_snapshot().await.is_empty());

    // A late echo for the dead order is ignored; the cancel stands.
    engine.apply_order_event(order_update(&order_id, &a, dec!(4), OrderStatus::Cancelled));
    settle().await;
    assert!(engine.orders_snapshot().await.is_empty());
}

#[tokio::test]
async fn trade_events_accumulate_and_complete_orders() {
    use updn::models::order::OrderStatus;

    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let a = market_a();
    engine.bind_market(a.clone(), false);

    let order_id = engine.place(gtc_intent(&a, dec!(0.40), dec!(10))).await.unwrap();

    let trade = updn::models::events::TradeUpdate {
        trade_id: "t1".into(),
        order_id: order_id.clone(),
        market_slug: a.slug.clone(),
        asset_id: a.up_token_id.clone(),
        side: OrderSide::Buy,
        price: dec!(0.40),
        size: dec!(6),
        timestamp: chrono::Utc::now(),
    };
    engine.apply_trade_event(trade.clone());
    settle().await;

    let snapshot = engine.orders_snapshot().await;
    assert_eq!(snapshot[0].filled_size, dec!(6));
    assert_eq!(snapshot[0].status, OrderStatus::PartiallyFilled);

    // Completing fill takes the order to Filled and out of the map.
    let mut rest = trade;
    rest.trade_id = "t2".into();
    rest.size = dec!(4);
    engine.apply_trade_event(rest);
    settle().await;
    assert!(engine.orders_snapshot().await.is_empty());
}

// ---------------------------------------------------------------------------
// Cycle gating (invariant 2)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn router_drops_events_from_retired_cycles() {
    use tokio::sync::broadcast;
    use updn::cycle::session::route_user_event;
    use updn::models::events::UserEvent;

    let gateway = MockGateway::new();
    let engine = spawn_engine(gateway.clone());
    let positions = spawn_positions(gateway.clone());
    let b = market_b();
    engine.bind_market(b.clone(), false);
    positions.bind_market(b.clone());

    let (events_tx, mut events_rx) = broadcast::channel(16);

    // A trade stamped with the retired cycle's condition id must not touch
    // the new cycle's state, even though its shape is otherwise valid.
    let stale = UserEvent::Trade(updn::models::events::TradeUpdate {
        trade_id: "stale-1".into(),
        order_id: "o".into(),
        market_slug: market_a().condition_id.clone(),
        asset_id: market_a().up_token_id.clone(),
        side: OrderSide::Buy,
        price: dec!(0.50),
        size: dec!(5),
        timestamp: chrono::Utc::now(),
    });
    assert!(!route_user_event(&b, &engine, &positions, &events_tx, stale));

    settle().await;
    assert!(positions.snapshot().await.is_empty());
    assert!(events_rx.try_recv().is_err());

    // The same trade re-stamped for the bound market is admitted and lands
    // in the tracker with the slug rewritten.
    let fresh = UserEvent::Trade(updn::models::events::TradeUpdate {
        trade_id: "fresh-1".into(),
        order_id: "o".into(),
        market_slug: b.condition_id.clone(),
        asset_id: b.up_token_id.clone(),
        side: OrderSide::Buy,
        price: dec!(0.50),
        size: dec!(5),
        timestamp: chrono::Utc::now(),
    });
    assert!(route_user_event(&b, &engine, &positions, &events_tx, fresh));

    settle().await;
    let position = positions.get_position(&b.slug, TokenType::Up).await.unwrap();
    assert_eq!(position.size, dec!(5));

    match events_rx.try_recv().unwrap() {
        updn::cycle::session::SessionEvent::Trade(trade) => {
            assert_eq!(trade.market_slug, b.slug);
        }
        other => panic!("expected trade event, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Position idempotency (invariant 4)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_trade_ids_apply_once() {
    let gateway = MockGateway::new();
    let positions = spawn_positions(gateway.clone());
    let a = market_a();
    positions.bind_market(a.clone());

    let trade = updn::models::events::TradeUpdate {
        trade_id: "t-1".into(),
        order_id: "o-1".into(),
        market_slug: a.slug.clone(),
        asset_id: a.up_token_id.clone(),
        side: OrderSide::Buy,
        price: dec!(0.50),
        size: dec!(4),
        timestamp: chrono::Utc::now(),
    };

    positions.apply_trade(trade.clone(), TokenType::Up);
    positions.apply_trade(trade.clone(), TokenType::Up);
    settle().await;

    let position = positions.get_position(&a.slug, TokenType::Up).await.unwrap();
    assert_eq!(position.size, dec!(4));

    // A distinct trade id does apply.
    let mut second = trade;
    second.trade_id = "t-2".into();
    positions.apply_trade(second, TokenType::Up);
    settle().await;

    let position = positions.get_position(&a.slug, TokenType::Up).await.unwrap();
    assert_eq!(position.size, dec!(8));
}

#[tokio::test]
async fn sell_trades_close_positions() {
    let gateway = MockGateway::new();
    let positions = spawn_positions(gateway.clone());
    let a = market_a();
    positions.bind_market(a.clone());

    let mut buy = updn::models::events::TradeUpdate {
        trade_id: "t-buy".into(),
        order_id: "o".into(),
        market_slug: a.slug.clone(),
        asset_id: a.up_token_id.clone(),
        side: OrderSide::Buy,
        price: dec!(0.50),
        size: dec!(5),
        timestamp: chrono::Utc::now(),
    };
    positions.apply_trade(buy.clone(), TokenType::Up);

    buy.trade_id = "t-sell".into();
    buy.side = OrderSide::Sell;
    positions.apply_trade(buy, TokenType::Up);
    settle().await;

    let open = positions.get_open_positions(&a.slug).await;
    assert!(open.is_empty());
}
