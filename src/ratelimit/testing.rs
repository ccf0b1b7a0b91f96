//! Test doubles shared by the limiter tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::ManualClock;
use crate::error::{Result, SentinelError};
use crate::metrics::{MetricsError, MetricsSink, Outcome};
use crate::storage::{MemoryStorage, Storage};

/// 2023-11-14T22:13:20Z, a whole second so bucket offsets read naturally.
pub const START_MILLIS: i64 = 1_700_000_000_000;

/// A manual clock plus a memory store reading from it.
pub fn clock_and_store() -> (Arc<ManualClock>, Arc<MemoryStorage>) {
    let clock = Arc::new(ManualClock::at_millis(START_MILLIS));
    let store = Arc::new(MemoryStorage::with_clock(clock.clone()));
    (clock, store)
}

/// Storage whose backend is always down. Counts how often it was touched.
#[derive(Debug, Default)]
pub struct UnavailableStorage {
    pub calls: AtomicUsize,
}

impl UnavailableStorage {
    fn fail<T>(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SentinelError::StorageUnavailable("connection refused".to_string()))
    }
}

#[async_trait]
impl Storage for UnavailableStorage {
    async fn increment(&self, _key: &str, _delta: i64, _expiry: Duration) -> Result<i64> {
        self.fail()
    }

    async fn get(&self, _key: &str) -> Result<i64> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: i64, _expiry: Duration) -> Result<()> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        self.fail()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Storage that never answers.
#[derive(Debug, Default)]
pub struct StalledStorage;

#[async_trait]
impl Storage for StalledStorage {
    async fn increment(&self, _key: &str, _delta: i64, _expiry: Duration) -> Result<i64> {
        futures::future::pending().await
    }

    async fn get(&self, _key: &str) -> Result<i64> {
        futures::future::pending().await
    }

    async fn set(&self, _key: &str, _value: i64, _expiry: Duration) -> Result<()> {
        futures::future::pending().await
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        futures::future::pending().await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Sink that fails every call but remembers how many it saw.
#[derive(Debug, Default)]
pub struct BrokenMetrics {
    pub calls: AtomicUsize,
}

impl MetricsSink for BrokenMetrics {
    fn record(&self, _key: &str, _outcome: Outcome) -> std::result::Result<(), MetricsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(MetricsError::Unavailable("exporter down".to_string()))
    }
}

/// Sink that panics on every call.
#[derive(Debug, Default)]
pub struct PanickingMetrics;

impl MetricsSink for PanickingMetrics {
    fn record(&self, _key: &str, _outcome: Outcome) -> std::result::Result<(), MetricsError> {
        panic!("metrics exporter bug");
    }
}
