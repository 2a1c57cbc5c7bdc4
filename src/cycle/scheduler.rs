use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::MarketSpecConfig;
use crate::models::events::CycleTransition;
use crate::runtime::shutdown::ShutdownSignal;

/// Transitions older than this relative to the local clock are late and
/// must be suppressed by the consumer.
pub const LATE_TRANSITION_SECS: i64 = 30;

/// Describes the recurring market family and its slug arithmetic.
#[derive(Debug, Clone)]
pub struct MarketSpec {
    pub symbol: String,
    pub timeframe_secs: u64,
    pub kind: String,
    pub slug_template: String,
    pub timeframe_label: String,
    pub pre_warm_secs: u64,
}

impl MarketSpec {
    pub fn from_config(config: &MarketSpecConfig) -> Self {
        Self {
            symbol: config.symbol.clone(),
            timeframe_secs: config.timeframe_secs,
            kind: config.kind.clone(),
            slug_template: config.slug_template.clone(),
            timeframe_label: config.timeframe_label.clone(),
            pre_warm_secs: config.pre_warm_secs,
        }
    }

    /// Start of the period containing `now`, aligned to the timeframe.
    pub fn current_period_start(&self, now_unix: u64) -> u64 {
        (now_unix / self.timeframe_secs) * self.timeframe_secs
    }

    pub fn next_period_start(&self, now_unix: u64) -> u64 {
        self.current_period_start(now_unix) + self.timeframe_secs
    }

    /// Render the slug for a period start from the template.
    pub fn slug_for(&self, period_start_unix: u64) -> String {
        self.slug_template
            .replace("{symbol}", &self.symbol)
            .replace("{kind}", &self.kind)
            .replace("{tf}", &self.timeframe_label)
            .replace("{start}", &period_start_unix.to_string())
    }

    pub fn current_slug(&self, now_unix: u64) -> String {
        self.slug_for(self.current_period_start(now_unix))
    }

    /// Name shared by every cycle of this family, used to match strategy
    /// mounts.
    pub fn session_name(&self) -> String {
        format!("{}-{}-{}", self.symbol, self.kind, self.timeframe_label)
    }
}

/// A transition stamped with its emission time so consumers can drop stale
/// entries that sat in a queue across a stall.
#[derive(Debug, Clone)]
pub struct ScheduledTransition {
    pub transition: CycleTransition,
    pub emitted_at_unix: i64,
}

impl ScheduledTransition {
    fn now(transition: CycleTransition) -> Self {
        Self {
            transition,
            emitted_at_unix: Utc::now().timestamp(),
        }
    }

    pub fn is_late(&self, now_unix: i64) -> bool {
        now_unix - self.emitted_at_unix > LATE_TRANSITION_SECS
    }
}

/// Drives the cycle state machine: PreWarm at `start - preWarm`, Activate
/// at `start`, Retire for the previous cycle after handoff.
pub struct CycleScheduler {
    spec: MarketSpec,
}

impl CycleScheduler {
    pub fn new(spec: MarketSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &MarketSpec {
        &self.spec
    }

    /// Spawn the tick loop; transitions arrive on the returned channel.
    pub fn start(&self, shutdown: ShutdownSignal) -> mpsc::Receiver<ScheduledTransition> {
        let (tx, rx) = mpsc::channel(32);
        let spec = self.spec.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut activated: Option<String> = None;
            let mut prewarmed: Option<String> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => {
                        debug!("cycle scheduler stopping");
                        return;
                    }
                }

                let now = Utc::now().timestamp() as u64;
                let current_start = spec.current_period_start(now);
                let current_slug = spec.slug_for(current_start);
                let next_start = spec.next_period_start(now);
                let next_slug = spec.slug_for(next_start);

                // Pre-warm the next cycle inside its window.
                if prewarmed.as_deref() != Some(&next_slug)
                    && now + spec.pre_warm_secs >= next_start
                {
                    info!("pre-warm {next_slug} ({}s to start)", next_start - now);
                    prewarmed = Some(next_slug.clone());
                    if tx
                        .send(ScheduledTransition::now(CycleTransition::PreWarm {
                            slug: next_slug.clone(),
                            start_unix: next_start,
                        }))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }

                // Activate the current cycle once, retiring its predecessor.
                if activated.as_deref() != Some(&current_slug) {
                    let previous = activated.replace(current_slug.clone());
                    info!("activate {current_slug}");
                    if tx
                        .send(ScheduledTransition::now(CycleTransition::Activate {
                            slug: current_slug.clone(),
                            start_unix: current_start,
                        }))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    if let Some(previous) = previous {
                        if tx
                            .send(ScheduledTransition::now(CycleTransition::Retire {
                                slug: previous,
                            }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> MarketSpec {
        MarketSpec {
            symbol: "btc".into(),
            timeframe_secs: 900,
            kind: "updown".into(),
            slug_template: "{symbol}-{kind}-{tf}-{start}".into(),
            timeframe_label: "15m".into(),
            pre_warm_secs: 60,
        }
    }

    #[test]
    fn period_arithmetic() {
        let s = spec();
        // 1700000000 = 1699999200 + 800
        assert_eq!(s.current_period_start(1_700_000_000), 1_699_999_200);
        assert_eq!(s.next_period_start(1_700_000_000), 1_700_000_100);
        // Exactly on a boundary the new period starts.
        assert_eq!(s.current_period_start(1_700_000_100), 1_700_000_100);
    }

    #[test]
    fn slug_rendering() {
        let s = spec();
        assert_eq!(
            s.slug_for(1_699_999_200),
            "btc-updown-15m-1699999200"
        );
        assert_eq!(s.session_name(), "btc-updown-15m");
    }

    #[test]
    fn late_transitions_flagged() {
        let t = ScheduledTransition {
            transition: CycleTransition::Activate {
                slug: "s".into(),
                start_unix: 0,
            },
            emitted_at_unix: 1_000,
        };
        assert!(!t.is_late(1_000 + LATE_TRANSITION_SECS));
        assert!(t.is_late(1_000 + LATE_TRANSITION_SECS + 1));
    }

    #[test]
    fn slugs_advance_monotonically() {
        let s = spec();
        let mut prev = 0;
        for now in (1_700_000_000..1_700_010_000).step_by(97) {
            let start = s.current_period_start(now);
            assert!(start >= prev);
            assert!(start <= now);
            assert!(now < start + s.timeframe_secs);
            prev = start;
        }
    }
}
