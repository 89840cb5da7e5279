//! Interleaving Shared Map
//!
//! Test backend wrapping a [`MemorySharedMap`] so that every operation
//! suspends before touching the data, the way a round trip to a remote store
//! does. Concurrent callers driven by `join!`/`join_all` then interleave
//! between their reads and writes instead of running one after another.

use super::MemorySharedMap;
use crate::domain::ports::SharedMap;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct InterleavingMap {
    inner: Arc<MemorySharedMap>,
    yields: usize,
    /// Take the backend down right after the next successful `clear`
    outage_after_clear: AtomicBool,
}

impl InterleavingMap {
    pub fn new(inner: Arc<MemorySharedMap>) -> Self {
        Self::with_yields(inner, 2)
    }

    pub fn with_yields(inner: Arc<MemorySharedMap>, yields: usize) -> Self {
        Self {
            inner,
            yields,
            outage_after_clear: AtomicBool::new(false),
        }
    }

    /// Make the inner map unavailable once the next `clear` has succeeded
    pub fn fail_after_next_clear(&self) {
        self.outage_after_clear.store(true, Ordering::SeqCst);
    }

    async fn suspend(&self) {
        for _ in 0..self.yields {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl SharedMap for InterleavingMap {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.suspend().await;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.suspend().await;
        self.inner.put(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<Option<String>> {
        self.suspend().await;
        self.inner.remove(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.suspend().await;
        self.inner.clear().await?;
        if self.outage_after_clear.swap(false, Ordering::SeqCst) {
            self.inner.set_available(false);
        }
        Ok(())
    }

    async fn entries(&self) -> Result<BTreeMap<String, String>> {
        self.suspend().await;
        self.inner.entries().await
    }

    async fn put_if_absent(&self, key: &str, value: String) -> Result<Option<String>> {
        self.suspend().await;
        self.inner.put_if_absent(key, value).await
    }

    async fn replace_if_equal(&self, key: &str, expected: &str, value: String) -> Result<bool> {
        self.suspend().await;
        self.inner.replace_if_equal(key, expected, value).await
    }

    async fn remove_if_equal(&self, key: &str, expected: &str) -> Result<bool> {
        self.suspend().await;
        self.inner.remove_if_equal(key, expected).await
    }
}
