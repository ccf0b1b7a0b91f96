//! Sliding-window rate limiter.
//!
//! Approximates a true sliding window with two fixed buckets: the current
//! bucket's count plus the previous bucket's count scaled by how much of the
//! previous window still overlaps the sliding one. Bucket counters live for
//! two windows so the previous bucket is still readable.

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

/// Sliding-window counting over a shared [`Storage`].
pub struct SlidingWindowLimiter<S: Storage + ?Sized> {
    store: Arc<S>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    policy: OverLimitPolicy,
}

impl<S: Storage + ?Sized> SlidingWindowLimiter<S> {
    /// Create a limiter over `store` with no metrics and the system clock.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
            policy: OverLimitPolicy::default(),
        }
    }

    /// Report every decision to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Choose what happens to the counter when a request is rejected.
    pub fn with_policy(mut self, policy: OverLimitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Counters of this limiter are namespaced apart from fixed-window ones,
    /// since their time-to-live differs.
    fn prefix(key: &str) -> String {
        format!("{}:sliding", key)
    }

    async fn previous_count(&self, bucket: &WindowBucket, prefix: &str) -> Result<u64> {
        read_count(self.store.as_ref(), &bucket.previous_storage_key(prefix)).await
    }
}

/// Build a decision from the weighted `estimate`, given `stored` requests left
/// in the current bucket and `previous` in the one before it.
///
/// `reset_at` is when everything counted so far has fully decayed, while
/// `retry_after` is the earliest moment one more request fits.
fn sliding_decision(
    bucket: &WindowBucket,
    estimate: u64,
    stored: u64,
    previous: u64,
    limit: u64,
) -> Decision {
    let reset_at = if stored > 0 {
        bucket.following_end()
    } else {
        bucket.end()
    };

    if estimate <= limit {
        return Decision {
            allowed: true,
            remaining: limit - estimate,
            reset_at,
            retry_after: Duration::ZERO,
        };
    }

    Decision {
        allowed: false,
        remaining: 0,
        reset_at,
        retry_after: earliest_admission(bucket, stored, previous, limit),
    }
}

/// Time until `stored + 1` requests plus the decaying weight of older buckets
/// fit under `limit`. `limit` must be at least one.
fn earliest_admission(bucket: &WindowBucket, stored: u64, previous: u64, limit: u64) -> Duration {
    let window = bucket.window().as_nanos();
    let left = bucket.remaining().as_nanos();

    let wait = if stored < limit {
        // Fits before this bucket ends, once the previous bucket has decayed enough.
        let fits_at = max_remaining_for(previous, limit - 1 - stored, window);
        left.saturating_sub(fits_at)
    } else {
        // This bucket becomes the previous one and has to decay in turn.
        left + window - max_remaining_for(stored, limit - 1, window)
    };

    Duration::from_nanos(u64::try_from(wait).unwrap_or(u64::MAX))
}

/// Largest time left in a bucket, in nanoseconds, at which `count` requests
/// weighted by that share of the window round down to at most `allowance`.
fn max_remaining_for(count: u64, allowance: u64, window_nanos: u128) -> u128 {
    if count <= allowance {
        return window_nanos;
    }
    let bound = (allowance as u128 + 1) * window_nanos;
    bound.div_ceil(count as u128) - 1
}

#[async_trait]
impl<S: Storage + ?Sized> RateLimiter for SlidingWindowLimiter<S> {
    async fn allow(&self, key: &str, limit: u64, window: Duration) -> Result<Decision> {
        validate(key, limit, window)?;

        let now = self.clock.now();
        let bucket = WindowBucket::containing(now, window)?;
        let prefix = Self::prefix(key);
        let counter_key = bucket.storage_key(&prefix);
        let ttl = bucket.remaining().saturating_add(bucket.window());

        let current = non_negative(self.store.increment(&counter_key, 1, ttl).await?);
        let previous = self.previous_count(&bucket, &prefix).await?;
        let carried = bucket.weight_remaining(previous);
        let estimate = current.saturating_add(carried);

        trace!(
            key = %key,
            bucket = bucket.id,
            current = current,
            carried = carried,
            limit = limit,
            "Checking sliding rate limit"
        );

        let mut stored = current;
        if estimate > limit {
            debug!(
                key = %key,
                estimate = estimate,
                limit = limit,
                "Sliding rate limit exceeded"
            );

            if self.policy == OverLimitPolicy::CapAtLimit {
                stored = non_negative(self.store.increment(&counter_key, -1, ttl).await?);
            }
        }

        let decision = sliding_decision(&bucket, estimate, stored, previous, limit);

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
        let prefix = Self::prefix(key);

        let current = read_count(self.store.as_ref(), &bucket.storage_key(&prefix)).await?;
        let previous = self.previous_count(&bucket, &prefix).await?;
        let estimate = current.saturating_add(bucket.weight_remaining(previous));

        trace!(
            key = %key,
            bucket = bucket.id,
            estimate = estimate,
            "Reading sliding rate limit status"
        );

        Ok(sliding_decision(&bucket, estimate, current, previous, limit))
    }

    async fn reset(&self, key: &str, window: Duration) -> Result<()> {
        validate(key, 1, window)?;

        let bucket = WindowBucket::containing(self.clock.now(), window)?;
        let prefix = Self::prefix(key);
        debug!(key = %key, bucket = bucket.id, "Resetting sliding rate limit");

        self.store.delete(&bucket.storage_key(&prefix)).await?;
        self.store.delete(&bucket.previous_storage_key(&prefix)).await
    }
}
