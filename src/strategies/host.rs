use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{merge_config, Services, StrategyContext, StrategyRegistry};
use crate::config::StrategyMount;
use crate::cycle::session::Session;
use crate::error::EngineResult;
use crate::runtime::shutdown::{ShutdownSignal, ShutdownTrigger};

struct RunningStrategy {
    strategy_id: String,
    cancel: ShutdownTrigger,
    join: JoinHandle<()>,
}

/// Loads strategy mounts, instantiates them through the registry, injects
/// services, and drives each strategy's run loop. On a session swap the
/// current runs are cancelled and every mount restarts bound to the new
/// session.
pub struct StrategyHost {
    registry: StrategyRegistry,
    mounts: Vec<StrategyMount>,
    services: Services,
    /// Session-family name the mounts' `on` lists are matched against.
    session_name: String,
    running: Mutex<Vec<RunningStrategy>>,
}

impl StrategyHost {
    pub fn new(
        registry: StrategyRegistry,
        mounts: Vec<StrategyMount>,
        services: Services,
        session_name: &str,
    ) -> Self {
        Self {
            registry,
            mounts,
            services,
            session_name: session_name.to_string(),
            running: Mutex::new(Vec::new()),
        }
    }

    fn mounts_for_session(&self) -> Vec<&StrategyMount> {
        self.mounts
            .iter()
            .filter(|mount| {
                mount.on.is_empty() || mount.on.iter().any(|name| name == &self.session_name)
            })
            .collect()
    }

    /// Start every matching mount against a session.
    pub async fn start_for_session(&self, session: Arc<Session>) {
        let mounts = self.mounts_for_session();
        if mounts.is_empty() {
            return;
        }
        info!(
            "starting {} strategies for {}",
            mounts.len(),
            session.market().slug
        );

        let mut running = self.running.lock().await;
        for mount in mounts {
            match self.launch(mount, session.clone()).await {
                Ok(run) => running.push(run),
                Err(e) => error!("strategy {} failed to start: {e}", mount.strategy_id),
            }
        }
    }

    async fn launch(
        &self,
        mount: &StrategyMount,
        session: Arc<Session>,
    ) -> EngineResult<RunningStrategy> {
        let mut strategy = self.registry.create(&mount.strategy_id)?;

        let config = merge_config(strategy.defaults(), &mount.config);
        strategy.validate(&config)?;
        strategy.initialize(&self.services, &config).await?;
        strategy.subscribe(&session).await?;

        let (cancel, scope) = ShutdownSignal::new();
        let strategy_id = mount.strategy_id.clone();
        let ctx = StrategyContext {
            session,
            services: self.services.clone(),
            config,
            scope,
        };

        let id_for_task = strategy_id.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = strategy.run(ctx).await {
                error!("strategy {id_for_task} exited with error: {e}");
            }
        });

        Ok(RunningStrategy {
            strategy_id,
            cancel,
            join,
        })
    }

    /// Cancel the current runs and restart everything against the new
    /// session. Strategies observe cancellation and must stop issuing
    /// commands before returning.
    pub async fn switch_session(&self, session: Arc<Session>) {
        self.stop_all().await;
        self.start_for_session(session).await;
    }

    pub async fn stop_all(&self) {
        let mut running = {
            let mut guard = self.running.lock().await;
            std::mem::take(&mut *guard)
        };

        for run in &running {
            run.cancel.trigger();
        }
        for run in running.drain(..) {
            match tokio::time::timeout(std::time::Duration::from_secs(5), run.join).await {
                Ok(_) => {}
                Err(_) => warn!("strategy {} did not stop in time", run.strategy_id),
            }
        }
    }

    pub async fn running_ids(&self) -> Vec<String> {
        self.running
            .lock()
            .await
            .iter()
            .map(|r| r.strategy_id.clone())
            .collect()
    }
}
