use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Services, Strategy, StrategyContext};
use crate::cycle::session::SessionEvent;
use crate::error::{EngineError, EngineResult};
use crate::models::market::TokenType;
use crate::models::order::{OrderIntent, OrderSide, OrderType};

/// Buys a complete UP/DOWN pair when the combined ask drops below $1 by a
/// configurable edge. Each matched pair pays out $1 at resolution, so a
/// fill at combined < 1 locks the difference.
///
/// One attempt per cycle; stops quoting inside the lockout window before
/// resolution.
pub struct CycleStraddle {
    max_combined: f64,
    stake: f64,
    lockout_secs: f64,
    attempted: bool,
}

impl CycleStraddle {
    pub fn new() -> Self {
        Self {
            max_combined: 0.97,
            stake: 5.0,
            lockout_secs: 30.0,
            attempted: false,
        }
    }
}

impl Default for CycleStraddle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for CycleStraddle {
    fn id(&self) -> &'static str {
        "cycle_straddle"
    }

    fn defaults(&self) -> serde_json::Value {
        json!({
            "max_combined": 0.97,
            "stake": 5.0,
            "lockout_secs": 30.0,
        })
    }

    fn validate(&self, config: &serde_json::Value) -> EngineResult<()> {
        let max_combined = config
            .get("max_combined")
            .and_then(|v| v.as_f64())
            .unwrap_or(self.max_combined);
        if !(0.0..1.0).contains(&max_combined) {
            return Err(EngineError::Validation(format!(
                "max_combined must be in (0, 1), got {max_combined}"
            )));
        }
        let stake = config
            .get("stake")
            .and_then(|v| v.as_f64())
            .unwrap_or(self.stake);
        if stake <= 0.0 {
            return Err(EngineError::Validation(format!(
                "stake must be positive, got {stake}"
            )));
        }
        Ok(())
    }

    async fn initialize(
        &mut self,
        _services: &Services,
        config: &serde_json::Value,
    ) -> EngineResult<()> {
        if let Some(v) = config.get("max_combined").and_then(|v| v.as_f64()) {
            self.max_combined = v;
        }
        if let Some(v) = config.get("stake").and_then(|v| v.as_f64()) {
            self.stake = v;
        }
        if let Some(v) = config.get("lockout_secs").and_then(|v| v.as_f64()) {
            self.lockout_secs = v;
        }
        Ok(())
    }

    async fn run(&mut self, ctx: StrategyContext) -> EngineResult<()> {
        // Fresh cycle, fresh attempt.
        self.attempted = false;

        let market = ctx.session.market().clone();
        let mut events = ctx.session.subscribe();
        info!(
            "cycle_straddle on {} (edge below {:.2}, stake {:.2})",
            market.slug, self.max_combined, self.stake
        );

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(SessionEvent::Price(_)) => {
                            if self.attempted {
                                continue;
                            }
                            if market.time_remaining_secs() < self.lockout_secs {
                                debug!("lockout window, no more entries");
                                continue;
                            }

                            let (Some(up), Some(down)) = (
                                ctx.session.best(TokenType::Up),
                                ctx.session.best(TokenType::Down),
                            ) else {
                                continue;
                            };
                            if up.ask <= 0.0 || down.ask <= 0.0 {
                                continue;
                            }

                            let combined = up.ask + down.ask;
                            if combined > self.max_combined {
                                continue;
                            }

                            // Whole shares keep FAK amounts exactly
                            // representable.
                            let shares = (self.stake / combined).floor();
                            if shares < 1.0 {
                                continue;
                            }
                            let available = up.ask_size.floor().min(down.ask_size.floor());
                            let shares = shares.min(available);
                            if shares < 1.0 {
                                debug!("combined {combined:.2} but no depth");
                                continue;
                            }

                            self.attempted = true;
                            info!(
                                "straddle entry on {}: UP@{:.2} + DOWN@{:.2} = {combined:.2}, {shares} shares",
                                market.slug, up.ask, down.ask
                            );

                            for (token_type, price) in
                                [(TokenType::Up, up.ask), (TokenType::Down, down.ask)]
                            {
                                let intent = OrderIntent::limit(
                                    &market.slug,
                                    market.token_id(token_type),
                                    token_type,
                                    OrderSide::Buy,
                                    Decimal::from_f64_retain(price).unwrap_or_default(),
                                    Decimal::from_f64_retain(shares).unwrap_or_default(),
                                    OrderType::FAK,
                                );
                                match ctx.services.orders.place(intent).await {
                                    Ok(order_id) => {
                                        debug!("straddle leg {} -> {order_id}", token_type.label())
                                    }
                                    Err(EngineError::DuplicateInFlight(_)) => {}
                                    Err(e) => {
                                        warn!("straddle leg {} failed: {e}", token_type.label())
                                    }
                                }
                            }
                        }
                        Ok(SessionEvent::Trade(trade)) => {
                            debug!(
                                "straddle fill: {} {} {}@{}",
                                trade.side.as_str(),
                                trade.asset_id,
                                trade.size,
                                trade.price
                            );
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!("cycle_straddle lagged {n} events");
                        }
                        Err(_) => break,
                    }
                }
                _ = ctx.scope.cancelled() => break,
            }
        }

        info!("cycle_straddle stopped for {}", market.slug);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_bounds() {
        let strategy = CycleStraddle::new();
        strategy.validate(&json!({})).unwrap();
        strategy
            .validate(&json!({"max_combined": 0.95, "stake": 2.0}))
            .unwrap();
        assert!(strategy.validate(&json!({"max_combined": 1.2})).is_err());
        assert!(strategy.validate(&json!({"stake": 0.0})).is_err());
    }
}
