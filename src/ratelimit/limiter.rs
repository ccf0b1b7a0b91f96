//! Rate limiter trait and the decision type shared by all algorithms.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SentinelError};
use crate::storage::Storage;

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window after this check
    pub remaining: u64,
    /// When the current window's counter expires
    pub reset_at: DateTime<Utc>,
    /// How long to wait before retrying; zero when allowed
    pub retry_after: Duration,
}

impl Decision {
    /// Build a decision from the number of requests counted in the window.
    ///
    /// `count <= limit` is allowed, so the limit is inclusive of the Nth request.
    pub(crate) fn from_count(
        count: u64,
        limit: u64,
        reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        if count <= limit {
            return Self {
                allowed: true,
                remaining: limit - count,
                reset_at,
                retry_after: Duration::ZERO,
            };
        }

        Self {
            allowed: false,
            remaining: 0,
            reset_at,
            retry_after: (reset_at - now).to_std().unwrap_or_default(),
        }
    }
}

/// What to do with the counter when a request is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverLimitPolicy {
    /// Keep every rejected request in the count, so bursts stay visible.
    #[default]
    CountAll,
    /// Undo the increment of a rejected request; the count settles at the limit.
    CapAtLimit,
}

/// Available counting algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    FixedWindow,
    SlidingWindow,
}

/// Trait for rate limiting algorithms.
///
/// Implementations hold no mutable state of their own and can be shared
/// across any number of concurrent callers; all serialization happens in
/// the backing [`Storage`].
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request against `key` and decide whether it may proceed.
    ///
    /// An error means the request is undecided; whether to fail open or
    /// closed is up to the caller.
    async fn allow(&self, key: &str, limit: u64, window: Duration) -> Result<Decision>;

    /// Report the current quota state for `key` without counting anything.
    async fn status(&self, key: &str, limit: u64, window: Duration) -> Result<Decision>;

    /// Drop the counters of the current window for `key`.
    async fn reset(&self, key: &str, window: Duration) -> Result<()>;

    /// [`allow`](RateLimiter::allow), giving up with `Cancelled` once `cancel` fires.
    async fn allow_cancellable(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Decision> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SentinelError::Cancelled),
            decision = self.allow(key, limit, window) => decision,
        }
    }

    /// [`status`](RateLimiter::status), giving up with `Cancelled` once `cancel` fires.
    async fn status_cancellable(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Decision> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SentinelError::Cancelled),
            decision = self.status(key, limit, window) => decision,
        }
    }
}

/// Reject malformed rules before any storage access.
pub(crate) fn validate(key: &str, limit: u64, window: Duration) -> Result<()> {
    if key.is_empty() {
        return Err(SentinelError::InvalidArgument("key is required".to_string()));
    }
    if limit == 0 {
        return Err(SentinelError::InvalidArgument(
            "limit must be at least 1".to_string(),
        ));
    }
    if window.is_zero() {
        return Err(SentinelError::InvalidArgument(
            "window must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// Read a counter, treating a missing key as zero.
pub(crate) async fn read_count<S: Storage + ?Sized>(store: &S, key: &str) -> Result<u64> {
    match store.get(key).await {
        Ok(value) => Ok(non_negative(value)),
        Err(err) if err.is_not_found() => Ok(0),
        Err(err) => Err(err),
    }
}

/// Counters can be driven below zero through `Storage::set`; count those as empty.
pub(crate) fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_millis(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    #[test]
    fn test_decision_within_limit() {
        let decision = Decision::from_count(2, 5, at_millis(1_000), at_millis(400));

        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
        assert_eq!(decision.retry_after, Duration::ZERO);
    }

    #[test]
    fn test_decision_exactly_at_limit_is_allowed() {
        let decision = Decision::from_count(5, 5, at_millis(1_000), at_millis(400));

        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_decision_over_limit() {
        let decision = Decision::from_count(6, 5, at_millis(1_000), at_millis(400));

        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at, at_millis(1_000));
        assert_eq!(decision.retry_after, Duration::from_millis(600));
    }

    #[test]
    fn test_validate() {
        assert!(validate("k", 1, Duration::from_secs(1)).is_ok());
        assert!(matches!(
            validate("", 1, Duration::from_secs(1)),
            Err(SentinelError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate("k", 0, Duration::from_secs(1)),
            Err(SentinelError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate("k", 1, Duration::ZERO),
            Err(SentinelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_non_negative() {
        assert_eq!(non_negative(7), 7);
        assert_eq!(non_negative(-3), 0);
    }

    #[test]
    fn test_policy_and_algorithm_names() {
        let policy: OverLimitPolicy = serde_yaml::from_str("cap_at_limit").unwrap();
        assert_eq!(policy, OverLimitPolicy::CapAtLimit);

        let algorithm: Algorithm = serde_yaml::from_str("sliding_window").unwrap();
        assert_eq!(algorithm, Algorithm::SlidingWindow);

        assert_eq!(OverLimitPolicy::default(), OverLimitPolicy::CountAll);
        assert_eq!(Algorithm::default(), Algorithm::FixedWindow);
    }
}
