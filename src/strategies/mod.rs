pub mod cycle_straddle;
pub mod host;
pub mod spread_watch;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::chain::ChainCoordinator;
use crate::cycle::session::Session;
use crate::engine::{OrderEngineHandle, PositionHandle};
use crate::error::{EngineError, EngineResult};
use crate::runtime::persistence::PersistenceService;
use crate::runtime::shutdown::ShutdownSignal;

/// Shared service handles injected into every strategy.
#[derive(Clone)]
pub struct Services {
    pub orders: OrderEngineHandle,
    pub positions: PositionHandle,
    pub chain: Option<Arc<ChainCoordinator>>,
    pub persistence: Arc<PersistenceService>,
}

/// Everything a running strategy needs for one cycle. `run` must observe
/// `scope` and stop issuing commands once it fires.
pub struct StrategyContext {
    pub session: Arc<Session>,
    pub services: Services,
    pub config: serde_json::Value,
    pub scope: ShutdownSignal,
}

/// A trading strategy plugin. Lifecycle per mount:
/// defaults -> validate -> initialize -> subscribe -> run; on a session
/// swap the running task is cancelled and the strategy re-runs against the
/// new session.
#[async_trait]
pub trait Strategy: Send {
    fn id(&self) -> &'static str;

    /// Default config merged under the mount's config blob.
    fn defaults(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn validate(&self, _config: &serde_json::Value) -> EngineResult<()> {
        Ok(())
    }

    async fn initialize(
        &mut self,
        _services: &Services,
        _config: &serde_json::Value,
    ) -> EngineResult<()> {
        Ok(())
    }

    async fn subscribe(&mut self, _session: &Arc<Session>) -> EngineResult<()> {
        Ok(())
    }

    async fn run(&mut self, ctx: StrategyContext) -> EngineResult<()>;
}

pub type StrategyFactory = Box<dyn Fn() -> Box<dyn Strategy> + Send + Sync>;

/// Maps strategy ids to constructors.
#[derive(Default)]
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in strategy registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("spread_watch", || Box::new(spread_watch::SpreadWatch::new()));
        registry.register("cycle_straddle", || {
            Box::new(cycle_straddle::CycleStraddle::new())
        });
        registry
    }

    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn() -> Box<dyn Strategy> + Send + Sync + 'static,
    {
        self.factories.insert(id.to_string(), Box::new(factory));
    }

    pub fn create(&self, id: &str) -> EngineResult<Box<dyn Strategy>> {
        self.factories
            .get(id)
            .map(|factory| factory())
            .ok_or_else(|| EngineError::Validation(format!("unknown strategy id: {id}")))
    }

    pub fn known_ids(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

/// Shallow-merge a mount config over the strategy defaults.
pub fn merge_config(
    defaults: serde_json::Value,
    overrides: &serde_json::Value,
) -> serde_json::Value {
    match (defaults, overrides) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(over)) => {
            for (key, value) in over {
                base.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(base)
        }
        (base, serde_json::Value::Null) => base,
        (_, over) => over.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_creates_builtins() {
        let registry = StrategyRegistry::with_builtins();
        assert!(registry.create("spread_watch").is_ok());
        assert!(registry.create("cycle_straddle").is_ok());
        assert!(registry.create("nope").is_err());
    }

    #[test]
    fn config_merge_overrides_defaults() {
        let merged = merge_config(
            json!({"a": 1, "b": 2}),
            &json!({"b": 3, "c": 4}),
        );
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));

        let merged = merge_config(json!({"a": 1}), &serde_json::Value::Null);
        assert_eq!(merged, json!({"a": 1}));
    }
}
