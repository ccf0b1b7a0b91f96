//! Atomic counter storage.
//!
//! The decision engine never touches counter representation directly; it only
//! talks to a [`Storage`] implementation by derived key string. Any backend,
//! in-process or remote, can be plugged in as long as it honors the contract
//! below.

mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryStorage;

/// Contract for a keyed counter store.
///
/// # Atomicity
///
/// Under N concurrent [`increment`](Storage::increment) calls on the same key,
/// every increment must be observed exactly once in the final value. A backend
/// that cannot provide atomic increment-with-expiry is not a valid
/// implementation.
///
/// # Expiry
///
/// An expiry of `Duration::ZERO` means the counter never expires. Expiry is
/// applied only when a counter is created; later increments leave it alone, so
/// a window bucket lives for exactly one window.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Atomically add `delta` to `key` and return the new value.
    ///
    /// An absent or expired counter is initialized to `delta` with `expiry` as
    /// its time-to-live.
    async fn increment(&self, key: &str, delta: i64, expiry: Duration) -> Result<i64>;

    /// Read the current value, failing with `KeyNotFound` if absent or expired.
    async fn get(&self, key: &str) -> Result<i64>;

    /// Overwrite `key` unconditionally with a fresh time-to-live.
    async fn set(&self, key: &str, value: i64, expiry: Duration) -> Result<()>;

    /// Remove `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Release backend resources. Calling it twice is not an error.
    ///
    /// Must not be called while other operations are in flight.
    async fn close(&self) -> Result<()>;
}
