//! In-Memory Lock Service
//!
//! Reference [`LockService`] with one tokio mutex per lock name. Acquisition
//! is bounded by a timeout and never parks a runtime thread.

use crate::domain::ports::{LockHandle, LockService};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held in-memory lock; dropping it releases the lock
pub struct MemoryLockHandle {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl LockHandle for MemoryLockHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn release(self: Box<Self>) -> Result<()> {
        tracing::trace!(lock = %self.name, "lock released");
        Ok(())
    }
}

/// Named cluster locks shared by every node of a [`super::MemoryCluster`]
#[derive(Default)]
pub struct MemoryLockService {
    locks: DashMap<String, Arc<Mutex<()>>>,
    acquired: AtomicU64,
    timed_out: AtomicU64,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `lock_name` is currently held
    pub fn is_locked(&self, lock_name: &str) -> bool {
        self.locks
            .get(lock_name)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Total successful acquisitions
    pub fn acquired_count(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Total acquisitions that timed out
    pub fn timeout_count(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    fn mutex(&self, lock_name: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .locks
                .entry(lock_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, lock_name: &str, timeout: Duration) -> Result<Box<dyn LockHandle>> {
        let mutex = self.mutex(lock_name);

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                Ok(Box::new(MemoryLockHandle {
                    name: lock_name.to_string(),
                    _guard: guard,
                }))
            }
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(Error::LockTimeout {
                    lock_name: lock_name.to_string(),
                    timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = MemoryLockService::new();

        let handle = locks.acquire("cleanup", Duration::from_millis(50)).await.unwrap();
        assert_eq!(handle.name(), "cleanup");
        assert!(locks.is_locked("cleanup"));

        handle.release().await.unwrap();
        assert!(!locks.is_locked("cleanup"));
        assert_eq!(locks.acquired_count(), 1);
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let locks = MemoryLockService::new();
        let _held = locks.acquire("cleanup", Duration::from_millis(50)).await.unwrap();

        let result = locks.acquire("cleanup", Duration::from_millis(20)).await;
        assert_matches!(result.err(), Some(Error::LockTimeout { ref lock_name, .. }) if lock_name == "cleanup");
        assert_eq!(locks.timeout_count(), 1);

        // Other names are independent
        let other = locks.acquire("other", Duration::from_millis(20)).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_handle_frees_lock() {
        let locks = MemoryLockService::new();
        {
            let _handle = locks.acquire("cleanup", Duration::from_millis(50)).await.unwrap();
        }
        assert!(!locks.is_locked("cleanup"));
        assert!(locks.acquire("cleanup", Duration::from_millis(50)).await.is_ok());
    }
}
