//! In-Memory Shared Map
//!
//! Reference [`SharedMap`] backed by DashMap. Every node in the process that
//! opens the same name through [`super::MemoryCluster`] sees the same map.

use crate::domain::ports::SharedMap;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// =============================================================================
// Memory Shared Map
// =============================================================================

/// Named in-memory map with atomic per-key conditional operations
pub struct MemorySharedMap {
    /// Map name
    name: String,
    /// The actual storage map
    entries: DashMap<String, String>,
    /// When false every operation fails with `BackendUnavailable`
    available: AtomicBool,
    /// Successful mutations, conditional or not
    writes: AtomicU64,
}

impl MemorySharedMap {
    /// Create an empty map
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Simulate the backend becoming unreachable (or recovering)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful mutations so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_available(&self, operation: &str) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            tracing::trace!(map = %self.name, operation, "shared map unavailable");
            Err(Error::BackendUnavailable {
                backend: format!("memory-map:{}", self.name),
            })
        }
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl SharedMap for MemorySharedMap {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available("get")?;
        Ok(self.entries.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.check_available("put")?;
        self.entries.insert(key.to_string(), value);
        self.record_write();
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<Option<String>> {
        self.check_available("remove")?;
        let removed = self.entries.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            self.record_write();
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        self.check_available("clear")?;
        self.entries.clear();
        self.record_write();
        Ok(())
    }

    async fn entries(&self) -> Result<BTreeMap<String, String>> {
        self.check_available("entries")?;
        Ok(self
            .entries
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect())
    }

    async fn put_if_absent(&self, key: &str, value: String) -> Result<Option<String>> {
        self.check_available("put_if_absent")?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(value);
                self.record_write();
                Ok(None)
            }
        }
    }

    async fn replace_if_equal(&self, key: &str, expected: &str, value: String) -> Result<bool> {
        self.check_available("replace_if_equal")?;
        let replaced = match self.entries.get_mut(key) {
            Some(mut current) if current.value() == expected => {
                *current = value;
                true
            }
            _ => false,
        };
        if replaced {
            self.record_write();
        }
        Ok(replaced)
    }

    async fn remove_if_equal(&self, key: &str, expected: &str) -> Result<bool> {
        self.check_available("remove_if_equal")?;
        let removed = self.entries.remove_if(key, |_, v| v == expected).is_some();
        if removed {
            self.record_write();
        }
        Ok(removed)
    }
}

// =============================================================================
// Tests
// =============================================================================
