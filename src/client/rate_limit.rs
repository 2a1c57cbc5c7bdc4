use dashmap::DashMap;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::runtime::shutdown::ShutdownSignal;

/// Endpoint-class keys. Every REST call waits on its class bucket plus the
/// global bucket before hitting the wire.
pub mod classes {
    pub const ORDER_POST: &str = "clob:order:post";
    pub const ORDER_DELETE: &str = "clob:order:delete";
    pub const DATA: &str = "clob:data";
    pub const BOOK: &str = "clob:book";
    pub const META: &str = "clob:meta";
    pub const AUTH: &str = "clob:auth";
    pub const BALANCE: &str = "clob:balance";
}

/// Conservative limits: 150 requests per 10 s globally, 15/s per class.
const GLOBAL_LIMIT: f64 = 150.0;
const GLOBAL_WINDOW_SECS: f64 = 10.0;
const CLASS_LIMIT: f64 = 15.0;
const CLASS_WINDOW_SECS: f64 = 1.0;

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: f64, window_secs: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate: max_tokens / window_secs,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }
}

/// Token-bucket limiter keyed by endpoint-class string, with a shared
/// global bucket. `wait` suspends until a token is available in both and
/// aborts with a distinct error when the shutdown signal fires.
pub struct RateLimiter {
    global: tokio::sync::Mutex<TokenBucket>,
    buckets: DashMap<String, std::sync::Arc<tokio::sync::Mutex<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            global: tokio::sync::Mutex::new(TokenBucket::new(GLOBAL_LIMIT, GLOBAL_WINDOW_SECS)),
            buckets: DashMap::new(),
        }
    }

    pub async fn wait(&self, class: &str, cancel: &ShutdownSignal) -> EngineResult<()> {
        self.wait_bucket_global(class, cancel).await?;
        self.wait_bucket_class(class, cancel).await
    }

    async fn wait_bucket_global(&self, class: &str, cancel: &ShutdownSignal) -> EngineResult<()> {
        loop {
            let delay = {
                let mut bucket = self.global.lock().await;
                if bucket.try_acquire() {
                    return Ok(());
                }
                bucket.time_until_available()
            };
            debug!("rate limiter: global bucket empty, {class} waits {delay:?}");
            self.sleep_or_abort(class, delay, cancel).await?;
        }
    }

    async fn wait_bucket_class(&self, class: &str, cancel: &ShutdownSignal) -> EngineResult<()> {
        // Clone the Arc out so no map shard lock is held across an await.
        let bucket = self
            .buckets
            .entry(class.to_string())
            .or_insert_with(|| {
                std::sync::Arc::new(tokio::sync::Mutex::new(TokenBucket::new(
                    CLASS_LIMIT,
                    CLASS_WINDOW_SECS,
                )))
            })
            .value()
            .clone();

        loop {
            let delay = {
                let mut bucket = bucket.lock().await;
                if bucket.try_acquire() {
                    return Ok(());
                }
                bucket.time_until_available()
            };
            debug!("rate limiter: waiting {delay:?} for {class}");
            self.sleep_or_abort(class, delay, cancel).await?;
        }
    }

    async fn sleep_or_abort(
        &self,
        class: &str,
        delay: Duration,
        cancel: &ShutdownSignal,
    ) -> EngineResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => {
                Err(EngineError::ThrottleAborted(class.to_string()))
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_buckets_pass_immediately() {
        let limiter = RateLimiter::new();
        let (_trigger, signal) = ShutdownSignal::new();
        limiter.wait(classes::ORDER_POST, &signal).await.unwrap();
        limiter.wait(classes::DATA, &signal).await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_class_bucket_delays() {
        let limiter = RateLimiter::new();
        let (_trigger, signal) = ShutdownSignal::new();

        for _ in 0..(CLASS_LIMIT as usize) {
            limiter.wait(classes::BOOK, &signal).await.unwrap();
        }

        let started = Instant::now();
        limiter.wait(classes::BOOK, &signal).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_wait() {
        let limiter = RateLimiter::new();
        let (trigger, signal) = ShutdownSignal::new();

        for _ in 0..(CLASS_LIMIT as usize) {
            limiter.wait(classes::ORDER_POST, &signal).await.unwrap();
        }
        trigger.trigger();

        let err = limiter.wait(classes::ORDER_POST, &signal).await.unwrap_err();
        assert!(matches!(err, EngineError::ThrottleAborted(_)));
    }
}
