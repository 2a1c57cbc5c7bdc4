#![allow(dead_code)]

mod auth;
mod chain;
mod client;
mod config;
mod cycle;
mod engine;
mod error;
mod feeds;
mod models;
mod runtime;
mod strategies;

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::auth::Signer;
use crate::chain::ChainCoordinator;
use crate::client::RestClient;
use crate::config::Config;
use crate::cycle::scheduler::{CycleScheduler, MarketSpec};
use crate::cycle::session::{OrchestratorDeps, ReconcileOnDrop, SessionOrchestrator};
use crate::engine::orders::ExchangeAddresses;
use crate::engine::{ExchangeGateway, OrderEngine, PositionTracker};
use crate::feeds::UserStream;
use crate::runtime::executor::SerialExecutor;
use crate::runtime::persistence::{PersistenceService, StateSnapshot};
use crate::runtime::shutdown::{ShutdownManager, ShutdownStage};
use crate::strategies::host::StrategyHost;
use crate::strategies::{Services, StrategyRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::load_or_default();
    if let Err(e) = config.validate() {
        error!("config validation failed: {e}");
        anyhow::bail!(e);
    }

    let dry_run = config.is_dry_run();
    if dry_run {
        warn!("DRY RUN — random signing key, orders will be rejected upstream");
    }

    info!(
        "updn starting: {} {} {} ({}s cycles)",
        config.market.symbol,
        config.market.kind,
        config.market.timeframe_label,
        config.market.timeframe_secs
    );

    // --- core services ---

    let shutdown_mgr = Arc::new(ShutdownManager::new());
    let shutdown = shutdown_mgr.signal();

    let signer = if dry_run {
        Arc::new(Signer::random(config.exchange.chain_id))
    } else {
        Arc::new(Signer::new(
            &config.wallet.private_key,
            config.exchange.chain_id,
            config.wallet.funder_address.as_deref(),
            config.wallet.signature_type,
        )?)
    };
    info!("wallet: {:?} (maker {:?})", signer.address(), signer.funder());

    let proxy_url = config.proxy.resolve_url();
    if let Some(url) = &proxy_url {
        info!("http proxy: {url}");
    }
    let rest = Arc::new(RestClient::new(
        &config.exchange.clob_host,
        proxy_url.as_deref(),
        signer.clone(),
        shutdown.clone(),
    )?);

    match rest.init_auth().await {
        Ok(_) => info!("L2 api-key auth ready"),
        Err(e) => warn!("api-key derivation failed ({e}); L1 auth only"),
    }

    let addresses = ExchangeAddresses {
        standard: config.exchange.exchange_address.parse()?,
        neg_risk: config.exchange.neg_risk_exchange_address.parse()?,
    };

    let gateway: Arc<dyn ExchangeGateway> = rest.clone();
    let engine = OrderEngine::spawn(
        gateway.clone(),
        signer.clone(),
        addresses,
        config.engine.clone(),
        shutdown.clone(),
    );
    let positions = PositionTracker::spawn(gateway, shutdown.clone());

    let chain = if dry_run {
        None
    } else {
        match ChainCoordinator::new(
            &config.chain,
            config.exchange.chain_id,
            signer.clone(),
            shutdown.clone(),
        ) {
            Ok(coordinator) => {
                info!("chain lifecycle mode: {:?}", coordinator.mode());
                Some(Arc::new(coordinator))
            }
            Err(e) => {
                warn!("chain coordinator unavailable: {e}");
                None
            }
        }
    };

    // --- user stream ---

    let creds = rest.creds().await.unwrap_or(crate::auth::ApiCreds {
        key: String::new(),
        secret: String::new(),
        passphrase: String::new(),
    });
    let drop_handler = Arc::new(ReconcileOnDrop {
        engine: engine.clone(),
        positions: positions.clone(),
    });
    let user_stream = Arc::new(UserStream::new(
        &config.exchange.user_ws_url,
        creds,
        drop_handler,
    ));
    user_stream.start(shutdown.clone());

    // --- persistence ---

    let persistence = Arc::new(PersistenceService::new(&config.persistence.dir));
    let account = format!("{:?}", signer.address());
    if let Some(snapshot) = persistence.load(&account) {
        info!(
            "recovered snapshot from {} ({} orders, {} positions)",
            snapshot.market_slug,
            snapshot.active_orders.len(),
            snapshot.positions.len()
        );
    }

    // Snapshot writes run on a serial executor so they stay ordered even
    // when a flush overlaps the shutdown flush.
    let persist_exec = Arc::new(SerialExecutor::start("persist", shutdown.clone()));
    {
        let persistence = persistence.clone();
        let engine = engine.clone();
        let positions = positions.clone();
        let account = account.clone();
        let shutdown = shutdown.clone();
        let persist_exec = persist_exec.clone();
        let interval_secs = config.persistence.flush_interval_secs.max(5);

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = StateSnapshot {
                            account: account.clone(),
                            market_slug: String::new(),
                            taken_at_unix: chrono::Utc::now().timestamp(),
                            active_orders: engine.orders_snapshot().await,
                            positions: positions.snapshot().await,
                        };
                        let persistence = persistence.clone();
                        persist_exec
                            .submit(async move {
                                if let Err(e) = persistence.save(&snapshot) {
                                    warn!("snapshot flush failed: {e}");
                                }
                            })
                            .await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    // --- telemetry ---

    {
        let metrics = rest.metrics().clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => metrics.log_summary(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    // --- strategies ---

    let spec = MarketSpec::from_config(&config.market);
    let services = Services {
        orders: engine.clone(),
        positions: positions.clone(),
        chain: chain.clone(),
        persistence: persistence.clone(),
    };
    let host = Arc::new(StrategyHost::new(
        StrategyRegistry::with_builtins(),
        config.strategies.clone(),
        services,
        &spec.session_name(),
    ));

    // --- cycle machinery ---

    let scheduler = CycleScheduler::new(spec.clone());
    let transitions = scheduler.start(shutdown.clone());

    let orchestrator = Arc::new(SessionOrchestrator::new(OrchestratorDeps {
        spec,
        market_ws_url: config.exchange.market_ws_url.clone(),
        cancel_open_orders_on_cycle_start: config.engine.cancel_open_orders_on_cycle_start,
        split_amount: rust_decimal::Decimal::from_f64_retain(config.chain.split_amount)
            .unwrap_or_default(),
        rest: rest.clone(),
        engine: engine.clone(),
        positions: positions.clone(),
        chain,
        user_stream,
        host: host.clone(),
        shutdown: shutdown.clone(),
    }));

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.run(transitions).await;
        });
    }

    // --- staged shutdown ---

    {
        let host = host.clone();
        shutdown_mgr
            .register("strategies", ShutdownStage::Strategies, move || async move {
                host.stop_all().await;
            })
            .await;
    }
    {
        let engine = engine.clone();
        let rest = rest.clone();
        shutdown_mgr
            .register("order-drain", ShutdownStage::OrderEngine, move || async move {
                // Pull the book before the account goes dark.
                if let Err(e) = rest.cancel_all().await {
                    warn!("shutdown cancel-all failed: {e}");
                }
                let open = engine.orders_snapshot().await;
                if !open.is_empty() {
                    info!("{} orders still tracked at shutdown", open.len());
                }
            })
            .await;
    }
    {
        let persistence = persistence.clone();
        let engine = engine.clone();
        let positions = positions.clone();
        let account = account.clone();
        shutdown_mgr
            .register("persist-flush", ShutdownStage::Persistence, move || async move {
                let snapshot = StateSnapshot {
                    account: account.clone(),
                    market_slug: String::new(),
                    taken_at_unix: chrono::Utc::now().timestamp(),
                    active_orders: engine.orders_snapshot().await,
                    positions: positions.snapshot().await,
                };
                if let Err(e) = persistence.save(&snapshot) {
                    warn!("final snapshot failed: {e}");
                }
            })
            .await;
    }

    info!("updn running — ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    shutdown_mgr.run().await;
    info!("updn stopped");
    Ok(())
}
