//! Window bucket arithmetic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SentinelError};

/// Named time windows used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// The window instance a wall-clock moment falls into.
///
/// Buckets are `floor(now / window)` on nanoseconds since the Unix epoch, so
/// every caller sharing a store agrees on boundaries without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBucket {
    /// Integer bucket index
    pub id: i64,
    /// Window length in nanoseconds
    window_nanos: i64,
    /// Offset of `now` into the bucket in nanoseconds
    elapsed_nanos: i64,
    /// Bucket start in nanoseconds since the epoch
    start_nanos: i64,
}

impl WindowBucket {
    /// Locate the bucket containing `now` for a window of length `window`.
    pub fn containing(now: DateTime<Utc>, window: Duration) -> Result<Self> {
        let window_nanos = window_nanos(window)?;
        let now_nanos = now.timestamp_nanos_opt().ok_or_else(|| {
            SentinelError::InvalidArgument(format!("timestamp {now} is out of range"))
        })?;

        let id = now_nanos.div_euclid(window_nanos);
        let elapsed_nanos = now_nanos.rem_euclid(window_nanos);

        Ok(Self {
            id,
            window_nanos,
            elapsed_nanos,
            start_nanos: now_nanos - elapsed_nanos,
        })
    }

    /// Storage key for this bucket under `prefix`.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self.id)
    }

    /// Storage key for the bucket immediately before this one.
    pub fn previous_storage_key(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self.id - 1)
    }

    /// When this bucket began.
    pub fn start(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.start_nanos)
    }

    /// When this bucket ends and the next one begins.
    pub fn end(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.start_nanos.saturating_add(self.window_nanos))
    }

    /// When the bucket after this one ends.
    pub fn following_end(&self) -> DateTime<Utc> {
        let two_windows = self.window_nanos.saturating_mul(2);
        DateTime::from_timestamp_nanos(self.start_nanos.saturating_add(two_windows))
    }

    /// Time already spent in this bucket.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos as u64)
    }

    /// Time left until the bucket ends. Always greater than zero.
    pub fn remaining(&self) -> Duration {
        Duration::from_nanos((self.window_nanos - self.elapsed_nanos) as u64)
    }

    /// Length of the window.
    pub fn window(&self) -> Duration {
        Duration::from_nanos(self.window_nanos as u64)
    }

    /// Scale `count` by the share of the window not yet elapsed, rounding down.
    pub fn weight_remaining(&self, count: u64) -> u64 {
        let left = (self.window_nanos - self.elapsed_nanos) as u128;
        ((count as u128 * left) / self.window_nanos as u128) as u64
    }
}

fn window_nanos(window: Duration) -> Result<i64> {
    if window.is_zero() {
        return Err(SentinelError::InvalidArgument(
            "window must be greater than zero".to_string(),
        ));
    }
    i64::try_from(window.as_nanos()).map_err(|_| {
        SentinelError::InvalidArgument(format!("window {window:?} is too large"))
    })
}
