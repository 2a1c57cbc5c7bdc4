use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::{Strategy, StrategyContext};
use crate::cycle::session::SessionEvent;
use crate::error::EngineResult;
use crate::models::market::TokenType;

/// Minimal built-in strategy: watches top-of-book spreads and logs when
/// they cross a threshold. Issues no orders; serves as the wiring template
/// for real strategies and as the host's lifecycle test subject.
pub struct SpreadWatch {
    min_spread_cents: i64,
}

impl SpreadWatch {
    pub fn new() -> Self {
        Self {
            min_spread_cents: 3,
        }
    }
}

impl Default for SpreadWatch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for SpreadWatch {
    fn id(&self) -> &'static str {
        "spread_watch"
    }

    fn defaults(&self) -> serde_json::Value {
        json!({ "min_spread_cents": 3 })
    }

    fn validate(&self, config: &serde_json::Value) -> EngineResult<()> {
        if let Some(cents) = config.get("min_spread_cents") {
            let value = cents.as_i64().unwrap_or(-1);
            if !(0..=100).contains(&value) {
                return Err(crate::error::EngineError::Validation(format!(
                    "min_spread_cents must be in [0, 100], got {cents}"
                )));
            }
        }
        Ok(())
    }

    async fn initialize(
        &mut self,
        _services: &super::Services,
        config: &serde_json::Value,
    ) -> EngineResult<()> {
        if let Some(cents) = config.get("min_spread_cents").and_then(|v| v.as_i64()) {
            self.min_spread_cents = cents;
        }
        Ok(())
    }

    async fn run(&mut self, ctx: StrategyContext) -> EngineResult<()> {
        let market = ctx.session.market().clone();
        let mut events = ctx.session.subscribe();
        info!(
            "spread_watch running on {} (threshold {}c)",
            market.slug, self.min_spread_cents
        );

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(SessionEvent::Price(price)) => {
                            let spread_cents =
                                ((price.new_ask - price.new_bid) * 100.0).round() as i64;
                            if price.new_bid > 0.0
                                && price.new_ask > 0.0
                                && spread_cents >= self.min_spread_cents
                            {
                                let label = match price.token_type {
                                    TokenType::Up => "UP",
                                    TokenType::Down => "DOWN",
                                };
                                debug!(
                                    "{} {label} spread {spread_cents}c ({:.2}/{:.2})",
                                    market.slug, price.new_bid, price.new_ask
                                );
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!("spread_watch lagged {n} events");
                        }
                        Err(_) => break,
                    }
                }
                _ = ctx.scope.cancelled() => break,
            }
        }

        info!("spread_watch stopped for {}", market.slug);
        Ok(())
    }
}
