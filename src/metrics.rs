//! Decision metrics.
//!
//! The engine reports one [`Outcome`] per `allow` call to an injected
//! [`MetricsSink`]. Sinks are synchronous and must not block; any error they
//! return is logged and dropped so observability can never change an
//! admission decision.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use prometheus::{IntCounterVec, Opts, Registry};
use thiserror::Error;
use tracing::warn;

/// Metric name for admitted requests.
pub const ALLOWED_REQUESTS: &str = "allowed_requests";
/// Metric name for rejected requests.
pub const BLOCKED_REQUESTS: &str = "blocked_requests";

/// Result of a single admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Allowed,
    Blocked,
}

impl Outcome {
    /// Map an `allowed` flag to an outcome.
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Outcome::Allowed
        } else {
            Outcome::Blocked
        }
    }

    /// Counter name this outcome increments.
    pub fn metric_name(&self) -> &'static str {
        match self {
            Outcome::Allowed => ALLOWED_REQUESTS,
            Outcome::Blocked => BLOCKED_REQUESTS,
        }
    }
}

/// Errors a metrics sink may report. Never surfaced to rate limit callers.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("metrics sink unavailable: {0}")]
    Unavailable(String),
}

/// Receiver for allow/block events keyed by client key.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Record one decision for `key`.
    fn record(&self, key: &str, outcome: Outcome) -> Result<(), MetricsError>;
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _key: &str, _outcome: Outcome) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Sink that increments `allowed_requests{key}` and `blocked_requests{key}`.
///
/// Bring your own `prometheus::Registry`; exporting it is up to the caller.
#[derive(Debug, Clone)]
pub struct PrometheusMetrics {
    allowed: IntCounterVec,
    blocked: IntCounterVec,
}

impl PrometheusMetrics {
    /// Create the counters and register them into `registry`.
    ///
    /// # Errors
    /// Returns an error if a counter cannot be registered (e.g. name conflict).
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let allowed = IntCounterVec::new(
            Opts::new(ALLOWED_REQUESTS, "Requests admitted by the rate limiter"),
            &["key"],
        )?;
        let blocked = IntCounterVec::new(
            Opts::new(BLOCKED_REQUESTS, "Requests rejected by the rate limiter"),
            &["key"],
        )?;

        registry.register(Box::new(allowed.clone()))?;
        registry.register(Box::new(blocked.clone()))?;

        Ok(Self { allowed, blocked })
    }

    /// Current value of the counter for `key` and `outcome`.
    pub fn count(&self, key: &str, outcome: Outcome) -> u64 {
        self.counter_vec(outcome)
            .get_metric_with_label_values(&[key])
            .map(|counter| counter.get())
            .unwrap_or(0)
    }

    fn counter_vec(&self, outcome: Outcome) -> &IntCounterVec {
        match outcome {
            Outcome::Allowed => &self.allowed,
            Outcome::Blocked => &self.blocked,
        }
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record(&self, key: &str, outcome: Outcome) -> Result<(), MetricsError> {
        self.counter_vec(outcome)
            .get_metric_with_label_values(&[key])?
            .inc();
        Ok(())
    }
}

/// Record an outcome, logging and dropping any sink failure.
///
/// A panicking sink is contained here as well, so it cannot unwind through
/// the limiter and lose a decision whose counter was already updated.
pub(crate) fn record_best_effort(sink: &dyn MetricsSink, key: &str, outcome: Outcome) {
    match panic::catch_unwind(AssertUnwindSafe(|| sink.record(key, outcome))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(
                key = %key,
                metric = outcome.metric_name(),
                error = %err,
                "Dropping metrics event"
            );
        }
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("unknown");
            warn!(
                key = %key,
                metric = outcome.metric_name(),
                reason = reason,
                "Metrics sink panicked, dropping event"
            );
        }
    }
}
