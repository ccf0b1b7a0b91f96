//! Rate limiting algorithms.

mod fixed;
mod limiter;
mod sliding;
mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use fixed::FixedWindowLimiter;
pub use limiter::{Algorithm, Decision, OverLimitPolicy, RateLimiter};
pub use sliding::SlidingWindowLimiter;
pub use window::{TimeWindow, WindowBucket};
