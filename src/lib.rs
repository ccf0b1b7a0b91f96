//! Sentinel - Request Rate Limiting
//!
//! This crate decides, per client key, whether a request may proceed under a
//! "N requests per window" quota, and reports how much quota remains and when
//! it resets. Decisions are made by stateless limiters on top of a pluggable
//! atomic counter [`storage::Storage`], with every outcome reported to an
//! optional [`metrics::MetricsSink`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sentinel::ratelimit::{FixedWindowLimiter, RateLimiter};
//! use sentinel::storage::MemoryStorage;
//!
//! # async fn run() -> sentinel::error::Result<()> {
//! let limiter = FixedWindowLimiter::new(Arc::new(MemoryStorage::new()));
//! let decision = limiter.allow("user:42", 100, Duration::from_secs(60)).await?;
//! if !decision.allowed {
//!     println!("retry in {:?}", decision.retry_after);
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod storage;
