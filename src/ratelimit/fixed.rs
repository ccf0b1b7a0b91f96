//! Fixed-window rate limiter.
//!
//! Each window bucket gets its own counter named `key:bucket`. The counter is
//! created with a time-to-live equal to the rest of the window, so it vanishes
//! exactly when the next bucket begins. Across a boundary this admits up to
//! `2 × limit` requests in one window's worth of time; the sliding limiter
//! trades a second read for a smoother edge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::limiter::{non_negative, read_count, validate, Decision, OverLimitPolicy, RateLimiter};
use super::window::WindowBucket;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::metrics::{record_best_effort, MetricsSink, NoopMetrics, Outcome};
use crate::storage::Storage;

/// Fixed-window counting over a shared [`Storage`].
pub struct FixedWindowLimiter<S: Storage + ?Sized> {
    /// Counter store; the only place state lives
    store: Arc<S>,
    /// Receives one event per `allow`
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    policy: OverLimitPolicy,
}

impl<S: Storage + ?Sized> FixedWindowLimiter<S> {
    /// Create a limiter over `store` with no metrics and the system clock.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
            policy: OverLimitPolicy::default(),
        }
    }

    /// Report decisions to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Choose what happens to the counter on rejection.
    pub fn with_policy(mut self, policy: OverLimitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Get the over-limit policy.
    pub fn policy(&self) -> OverLimitPolicy {
        self.policy
    }

    /// Get the backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[async_trait]
impl<S: Storage + ?Sized> RateLimiter for FixedWindowLimiter<S> {
    async fn allow(&self, key: &str, limit: u64, window: Duration) -> Result<Decision> {
        validate(key, limit, window)?;

        let now = self.clock.now();
        let bucket = WindowBucket::containing(now, window)?;
        let counter_key = bucket.storage_key(key);

        trace!(
            key = %key,
            bucket = bucket.id,
            limit = limit,
            "Checking rate limit"
        );

        let value = self
            .store
            .increment(&counter_key, 1, bucket.remaining())
            .await?;
        let decision = Decision::from_count(non_negative(value), limit, bucket.end(), now);

        if !decision.allowed {
            debug!(
                key = %key,
                count = value,
                limit = limit,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );

            if self.policy == OverLimitPolicy::CapAtLimit {
                self.store
                    .increment(&counter_key, -1, bucket.remaining())
                    .await?;
            }
        }

        record_best_effort(
            self.metrics.as_ref(),
            key,
            Outcome::from_allowed(decision.allowed),
        );

        Ok(decision)
    }

    async fn status(&self, key: &str, limit: u64, window: Duration) -> Result<Decision> {
        validate(key, limit, window)?;

        let now = self.clock.now();
        let bucket = WindowBucket::containing(now, window)?;
        let count = read_count(self.store.as_ref(), &bucket.storage_key(key)).await?;

        trace!(key = %key, bucket = bucket.id, count = count, "Reading rate limit status");

        Ok(Decision::from_count(count, limit, bucket.end(), now))
    }

    async fn reset(&self, key: &str, window: Duration) -> Result<()> {
        validate(key, 1, window)?;

        let bucket = WindowBucket::containing(self.clock.now(), window)?;
        debug!(key = %key, bucket = bucket.id, "Resetting rate limit");
        self.store.delete(&bucket.storage_key(key)).await
    }
}
