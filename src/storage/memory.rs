//! In-process counter store backed by a sharded concurrent map.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::Storage;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SentinelError};

/// A single counter record and its optional deadline.
#[derive(Debug, Clone, Copy)]
struct Counter {
    value: i64,
    expires_at: Option<DateTime<Utc>>,
}

impl Counter {
    fn new(value: i64, expiry: Duration, now: DateTime<Utc>) -> Self {
        Self {
            value,
            expires_at: deadline(now, expiry),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

fn deadline(now: DateTime<Utc>, expiry: Duration) -> Option<DateTime<Utc>> {
    if expiry.is_zero() {
        return None;
    }
    chrono::Duration::from_std(expiry)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

/// Reference [`Storage`] implementation kept entirely in memory.
///
/// Each key lives in one `DashMap` shard; increments go through the entry API
/// while holding that shard's write lock, which is what makes them atomic.
/// Expired counters are treated as absent on every access and can also be
/// purged in the background with [`MemoryStorage::start_sweeper`].
pub struct MemoryStorage {
    counters: DashMap<String, Counter>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("counters", &self.counters.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl MemoryStorage {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that reads expiry time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of counters currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Whether [`Storage::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop every expired counter and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Spawn a background task that purges expired counters every `interval`.
    ///
    /// The task exits when the store is closed or dropped.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> Result<JoinHandle<()>> {
        if interval.is_zero() {
            return Err(SentinelError::InvalidArgument(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        let store = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        debug!(interval_ms = interval.as_millis() as u64, "Starting counter sweeper");

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else { break };
                        let purged = store.purge_expired();
                        if purged > 0 {
                            trace!(purged = purged, "Purged expired counters");
                        }
                    }
                }
            }

            debug!("Counter sweeper stopped");
        }))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SentinelError::StorageUnavailable(
                "memory storage is closed".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn increment(&self, key: &str, delta: i64, expiry: Duration) -> Result<i64> {
        self.ensure_open()?;
        let now = self.clock.now();

        let value = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let counter = occupied.get_mut();
                if counter.is_expired(now) {
                    *counter = Counter::new(delta, expiry, now);
                } else {
                    counter.value = counter.value.saturating_add(delta);
                }
                counter.value
            }
            Entry::Vacant(vacant) => {
                trace!(key = %key, ttl_ms = expiry.as_millis() as u64, "Creating counter");
                vacant.insert(Counter::new(delta, expiry, now)).value
            }
        };

        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        self.ensure_open()?;
        let now = self.clock.now();

        let expired = match self.counters.get(key) {
            Some(counter) if !counter.is_expired(now) => return Ok(counter.value),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.counters.remove_if(key, |_, counter| counter.is_expired(now));
        }

        Err(SentinelError::KeyNotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: i64, expiry: Duration) -> Result<()> {
        self.ensure_open()?;
        let now = self.clock.now();
        self.counters.insert(key.to_string(), Counter::new(value, expiry, now));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.counters.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();
        let dropped = self.counters.len();
        self.counters.clear();

        info!(counters = dropped, "Memory storage closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_test::{assert_err, assert_ok};

    fn store_with_clock() -> (Arc<ManualClock>, MemoryStorage) {
        let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));
        let store = MemoryStorage::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_increment_initializes_to_delta() {
        let (_, store) = store_with_clock();

        let value = store.increment("k", 3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, 3);

        let value = store.increment("k", 2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, 5);
        assert_eq!(store.get("k").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_increment_keeps_original_expiry() {
        let (clock, store) = store_with_clock();

        store.increment("k", 1, Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_millis(600));
        store.increment("k", 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 2);

        // 1.1s after creation: the first TTL has elapsed even though the
        // second increment asked for another full second.
        clock.advance(Duration::from_millis(500));
        assert!(store.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_increment_after_expiry_starts_fresh() {
        let (clock, store) = store_with_clock();

        store.increment("k", 7, Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(1));

        let value = store.increment("k", 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_zero_expiry_never_expires() {
        let (clock, store) = store_with_clock();

        store.increment("k", 1, Duration::ZERO).await.unwrap();
        clock.advance(Duration::from_secs(86_400 * 365));
        assert_eq!(store.get("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let (_, store) = store_with_clock();

        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, SentinelError::KeyNotFound(ref k) if k == "missing"));
    }

    #[tokio::test]
    async fn test_get_removes_expired_counter() {
        let (clock, store) = store_with_clock();

        store.increment("k", 1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_millis(10));
        assert_err!(store.get("k").await);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_overwrites_value_and_expiry() {
        let (clock, store) = store_with_clock();

        store.increment("k", 9, Duration::from_millis(100)).await.unwrap();
        assert_ok!(store.set("k", 2, Duration::from_secs(10)).await);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_, store) = store_with_clock();

        store.increment("k", 1, Duration::from_secs(1)).await.unwrap();
        assert_ok!(store.delete("k").await);
        assert_ok!(store.delete("k").await);
        assert!(store.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_operations() {
        let (_, store) = store_with_clock();

        store.increment("k", 1, Duration::from_secs(1)).await.unwrap();
        assert_ok!(store.close().await);
        assert_ok!(store.close().await);
        assert!(store.is_closed());
        assert!(store.is_empty());

        let err = store.increment("k", 1, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SentinelError::StorageUnavailable(_)));
        assert!(matches!(
            store.get("k").await.unwrap_err(),
            SentinelError::StorageUnavailable(_)
        ));
        assert!(store.set("k", 1, Duration::ZERO).await.is_err());
        assert!(store.delete("k").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStorage::new());

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        store
                            .increment("shared", 1, Duration::from_secs(60))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        assert_eq!(store.get("shared").await.unwrap(), 3_200);
    }

    #[tokio::test]
    async fn test_purge_expired_only_removes_expired() {
        let (clock, store) = store_with_clock();

        store.increment("short", 1, Duration::from_millis(50)).await.unwrap();
        store.increment("long", 1, Duration::from_secs(60)).await.unwrap();

        clock.advance(Duration::from_millis(100));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_purges_in_background() {
        let clock = Arc::new(ManualClock::at_millis(0));
        let store = Arc::new(MemoryStorage::with_clock(clock.clone()));

        store.increment("a", 1, Duration::from_millis(10)).await.unwrap();
        store.increment("b", 1, Duration::from_millis(10)).await.unwrap();
        clock.advance(Duration::from_secs(1));

        let handle = store.start_sweeper(Duration::from_millis(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());

        store.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop after close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_rejects_zero_interval() {
        let store = Arc::new(MemoryStorage::new());
        let err = store.start_sweeper(Duration::ZERO).unwrap_err();
        assert!(matches!(err, SentinelError::InvalidArgument(_)));
    }
}
