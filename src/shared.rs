//! # Shared Resource Guard
//!
//! A small wrapper around an async mutex for state shared between tasks, such
//! as a peripheral driven from both the network task's handlers and an
//! application task. Access is scoped to the returned RAII guard, so a lock
//! can never outlive its use site, and a bounded-wait variant is provided for
//! callers that must not stall indefinitely.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard, TryLockError};
use embassy_time::{with_timeout, Duration};

/// A mutex-protected value with scoped, optionally bounded access.
pub struct Shared<T> {
    inner: Mutex<CriticalSectionRawMutex, T>,
}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Locks the value, waiting as long as it takes. The lock is released
    /// when the guard drops.
    pub async fn lock(&self) -> MutexGuard<'_, CriticalSectionRawMutex, T> {
        self.inner.lock().await
    }

    /// Locks the value only if it is free right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, CriticalSectionRawMutex, T>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError) => None,
        }
    }

    /// Locks the value, giving up after `timeout`.
    pub async fn lock_timeout(
        &self,
        timeout: Duration,
    ) -> Option<MutexGuard<'_, CriticalSectionRawMutex, T>> {
        with_timeout(timeout, self.inner.lock()).await.ok()
    }

    /// Consumes the wrapper, returning the inner value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn lock_gives_mutable_access() {
        let shared = Shared::new(1u32);
        block_on(async {
            *shared.lock().await += 1;
        });
        assert_eq!(shared.into_inner(), 2);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let shared = Shared::new(());
        let guard = shared.try_lock().unwrap();
        assert!(shared.try_lock().is_none());
        drop(guard);
        assert!(shared.try_lock().is_some());
    }

    #[test]
    fn lock_timeout_expires_while_held() {
        let shared = Shared::new(());
        let guard = block_on(shared.lock());
        block_on(async {
            assert!(shared.lock_timeout(Duration::from_millis(10)).await.is_none());
        });
        drop(guard);
        block_on(async {
            assert!(shared.lock_timeout(Duration::from_millis(10)).await.is_some());
        });
    }
}
