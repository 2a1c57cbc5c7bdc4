//! Strategy host lifecycle: mount filtering, session starts, the
//! cancel-and-restart on session swap, and validation failures.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use updn::auth::{ApiCreds, Signer};
use updn::client::rest::{OpenOrderRecord, PostOrderOutcome, TradeRecord};
use updn::config::{EngineConfig, StrategyMount};
use updn::cycle::session::Session;
use updn::engine::orders::ExchangeAddresses;
use updn::engine::{ExchangeGateway, OrderEngine, PositionTracker};
use updn::error::{EngineError, EngineResult};
use updn::feeds::UserStream;
use updn::models::events::{DropHandler, EventKind};
use updn::models::market::{Market, OrderBook};
use updn::models::order::{OrderType, SignedOrder};
use updn::runtime::persistence::PersistenceService;
use updn::runtime::shutdown::ShutdownSignal;
use updn::strategies::host::StrategyHost;
use updn::strategies::{Services, Strategy, StrategyContext, StrategyRegistry};

struct NullGateway;

#[async_trait]
impl ExchangeGateway for NullGateway {
    async fn submit_order(
        &self,
        _signed: SignedOrder,
        _order_type: OrderType,
    ) -> EngineResult<PostOrderOutcome> {
        Ok(PostOrderOutcome {
            success: true,
            order_id: Some("null".into()),
            error: None,
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn cancel_market_orders(&self, _condition_id: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn cancel_all(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn open_orders(
        &self,
        _condition_id: Option<&str>,
    ) -> EngineResult<Vec<OpenOrderRecord>> {
        Ok(Vec::new())
    }

    async fn trades(&self, _condition_id: Option<&str>) -> EngineResult<Vec<TradeRecord>> {
        Ok(Vec::new())
    }

    async fn book(&self, token_id: &str) -> EngineResult<OrderBook> {
        Ok(OrderBook::new(token_id.to_string()))
    }
}

struct NoopDropHandler;

impl DropHandler for NoopDropHandler {
    fn on_drop(&self, _kind: EventKind, _meta: &str) {}
}

/// Counts run starts and graceful stops.
struct Probe {
    started: Arc<AtomicUsize>,
    stopped: Arc<AtomicUsize>,
}

#[async_trait]
impl Strategy for Probe {
    fn id(&self) -> &'static str {
        "probe"
    }

    fn validate(&self, config: &serde_json::Value) -> EngineResult<()> {
        if config.get("poison").is_some() {
            return Err(EngineError::Validation("poisoned config".into()));
        }
        Ok(())
    }

    async fn run(&mut self, ctx: StrategyContext) -> EngineResult<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        ctx.scope.cancelled().await;
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    services: Services,
    user_stream: Arc<UserStream>,
    shutdown: ShutdownSignal,
}

fn harness() -> Harness {
    let (trigger, shutdown) = ShutdownSignal::new();
    std::mem::forget(trigger);

    let gateway: Arc<dyn ExchangeGateway> = Arc::new(NullGateway);
    let signer = Arc::new(Signer::random(137));
    let addresses = ExchangeAddresses {
        standard: "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E".parse().unwrap(),
        neg_risk: "0xC5d563A36AE78145C45a50134d48A1215220f80a".parse().unwrap(),
    };
    let engine_config = EngineConfig {
        order_status_sync_interval_with_orders: 600,
        order_status_sync_interval_without_orders: 600,
        min_order_size: 1.0,
        min_share_size: 5.0,
        cancel_open_orders_on_cycle_start: false,
    };
    let engine = OrderEngine::spawn(
        gateway.clone(),
        signer,
        addresses,
        engine_config,
        shutdown.clone(),
    );
    let positions = PositionTracker::spawn(gateway, shutdown.clone());

    let creds = ApiCreds {
        key: String::new(),
        secret: String::new(),
        passphrase: String::new(),
    };
    let user_stream = Arc::new(UserStream::new(
        "ws://127.0.0.1:1",
        creds,
        Arc::new(NoopDropHandler),
    ));

    let services = Services {
        orders: engine,
        positions,
        chain: None,
        persistence: Arc::new(PersistenceService::new("/tmp/updn-host-test")),
    };

    Harness {
        services,
        user_stream,
        shutdown,
    }
}

fn market(start: u64) -> Market {
    Market::new(
        format!("btc-updown-15m-{start}"),
        format!("0xcond{start}"),
        format!("up_{start}"),
        format!("down_{start}"),
        start,
        900,
    )
}

async fn open_session(h: &Harness, start: u64) -> Arc<Session> {
    // The market stream dials an unroutable endpoint; the session itself
    // is fully functional for routing and lifecycle purposes.
    Session::open(
        market(start),
        false,
        "ws://127.0.0.1:1",
        &h.user_stream,
        h.services.orders.clone(),
        h.services.positions.clone(),
        &h.shutdown,
    )
    .await
}

fn probe_registry(
    started: Arc<AtomicUsize>,
    stopped: Arc<AtomicUsize>,
) -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry.register("probe", move || {
        Box::new(Probe {
            started: started.clone(),
            stopped: stopped.clone(),
        })
    });
    registry
}

async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

#[tokio::test]
async fn mounts_filter_by_session_name() {
    let h = harness();
    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));

    let mounts = vec![
        StrategyMount {
            strategy_id: "probe".into(),
            on: vec!["btc-updown-15m".into()],
            config: serde_json::json!({}),
        },
        StrategyMount {
            strategy_id: "probe".into(),
            on: vec!["eth-updown-15m".into()],
            config: serde_json::json!({}),
        },
    ];

    let host = StrategyHost::new(
        probe_registry(started.clone(), stopped.clone()),
        mounts,
        h.services.clone(),
        "btc-updown-15m",
    );

    let session = open_session(&h, 1_700_000_000).await;
    host.start_for_session(session).await;
    settle().await;

    // Only the btc mount matched.
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(host.running_ids().await, vec!["probe".to_string()]);

    host.stop_all().await;
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn switch_session_cancels_and_restarts() {
    let h = harness();
    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));

    let mounts = vec![StrategyMount {
        strategy_id: "probe".into(),
        on: Vec::new(), // empty = every session
        config: serde_json::json!({}),
    }];

    let host = StrategyHost::new(
        probe_registry(started.clone(), stopped.clone()),
        mounts,
        h.services.clone(),
        "btc-updown-15m",
    );

    let first = open_session(&h, 1_700_000_000).await;
    host.start_for_session(first).await;
    settle().await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    let second = open_session(&h, 1_700_000_900).await;
    host.switch_session(second).await;
    settle().await;

    // The first run observed cancellation, then a new run started.
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert_eq!(started.load(Ordering::SeqCst), 2);

    host.stop_all().await;
    assert_eq!(stopped.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalid_config_never_starts() {
    let h = harness();
    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));

    let mounts = vec![StrategyMount {
        strategy_id: "probe".into(),
        on: Vec::new(),
        config: serde_json::json!({"poison": true}),
    }];

    let host = StrategyHost::new(
        probe_registry(started.clone(), stopped.clone()),
        mounts,
        h.services.clone(),
        "btc-updown-15m",
    );

    let session = open_session(&h, 1_700_000_000).await;
    host.start_for_session(session).await;
    settle().await;

    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert!(host.running_ids().await.is_empty());
}

#[tokio::test]
async fn unknown_strategy_id_is_skipped() {
    let h = harness();

    let mounts = vec![StrategyMount {
        strategy_id: "no_such_strategy".into(),
        on: Vec::new(),
        config: serde_json::json!({}),
    }];

    let host = StrategyHost::new(
        StrategyRegistry::with_builtins(),
        mounts,
        h.services.clone(),
        "btc-updown-15m",
    );

    let session = open_session(&h, 1_700_000_000).await;
    host.start_for_session(session).await;
    settle().await;

    assert!(host.running_ids().await.is_empty());
}
