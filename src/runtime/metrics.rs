use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::info;

const DEFAULT_MAX_SAMPLES: usize = 1000;

/// Rolling latency histograms per named operation.
pub struct LatencyTracker {
    histograms: DashMap<String, VecDeque<Duration>>,
    max_samples: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct LatencySummary {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub samples: usize,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SAMPLES)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            histograms: DashMap::new(),
            max_samples,
        }
    }

    pub fn record(&self, operation: &str, duration: Duration) {
        let max = self.max_samples;
        self.histograms
            .entry(operation.to_string())
            .and_modify(|hist| {
                if hist.len() >= max {
                    hist.pop_front();
                }
                hist.push_back(duration);
            })
            .or_insert_with(|| {
                let mut hist = VecDeque::with_capacity(max.min(64));
                hist.push_back(duration);
                hist
            });
    }

    /// Timer guard that records on drop.
    pub fn start_timer(&self, operation: &str) -> Timer<'_> {
        Timer {
            operation: operation.to_string(),
            start: Instant::now(),
            tracker: self,
        }
    }

    pub fn summary(&self, operation: &str) -> Option<LatencySummary> {
        let hist = self.histograms.get(operation)?;
        if hist.is_empty() {
            return None;
        }

        let mut sorted: Vec<Duration> = hist.iter().copied().collect();
        sorted.sort();
        let len = sorted.len();

        Some(LatencySummary {
            p50: sorted[len / 2],
            p95: sorted[((len as f64 * 0.95) as usize).min(len - 1)],
            p99: sorted[((len as f64 * 0.99) as usize).min(len - 1)],
            samples: len,
        })
    }

    pub fn log_summary(&self) {
        for entry in self.histograms.iter() {
            if let Some(summary) = self.summary(entry.key()) {
                info!(
                    "latency [{}]: p50={:.1}ms p95={:.1}ms p99={:.1}ms n={}",
                    entry.key(),
                    summary.p50.as_secs_f64() * 1000.0,
                    summary.p95.as_secs_f64() * 1000.0,
                    summary.p99.as_secs_f64() * 1000.0,
                    summary.samples,
                );
            }
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Timer<'a> {
    operation: String,
    start: Instant,
    tracker: &'a LatencyTracker,
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.tracker.record(&self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_from_samples() {
        let tracker = LatencyTracker::with_capacity(100);
        for ms in 1..=100u64 {
            tracker.record("op", Duration::from_millis(ms));
        }
        let summary = tracker.summary("op").unwrap();
        assert_eq!(summary.samples, 100);
        assert!(summary.p50 >= Duration::from_millis(50));
        assert!(summary.p95 >= summary.p50);
        assert!(summary.p99 >= summary.p95);
    }

    #[test]
    fn ring_evicts_old_samples() {
        let tracker = LatencyTracker::with_capacity(10);
        for ms in 1..=50u64 {
            tracker.record("op", Duration::from_millis(ms));
        }
        assert_eq!(tracker.summary("op").unwrap().samples, 10);
    }

    #[test]
    fn timer_records_on_drop() {
        let tracker = LatencyTracker::new();
        {
            let _timer = tracker.start_timer("scoped");
        }
        assert_eq!(tracker.summary("scoped").unwrap().samples, 1);
    }
}
