//! Replicated Multimap
//!
//! [`Registry`] stores `key → set of values` in a [`SharedMap`]. Each key's
//! set is kept as the JSON encoding of a sorted set, so equal sets encode to
//! identical strings and compare-and-swap works on the raw value. Empty sets
//! are never stored; removing the last value removes the key.

use crate::domain::ports::{LockHandle, SharedMap};
use crate::error::{Error, Result};
use crate::registry::strategy::{StrategyKind, WriteStrategy};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Values storable in a [`Registry`]
pub trait RegistryValue: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> RegistryValue for T where T: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetOp {
    Add,
    Remove,
}

// =============================================================================
// Registry
// =============================================================================

/// Replicated multimap over a shared map with a pluggable write strategy
pub struct Registry<T> {
    map: Arc<dyn SharedMap>,
    strategy: Arc<dyn WriteStrategy>,
    _values: PhantomData<fn() -> T>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            map: Arc::clone(&self.map),
            strategy: Arc::clone(&self.strategy),
            _values: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("map", &self.map.name())
            .field("strategy", &self.strategy.kind())
            .finish()
    }
}

impl<T: RegistryValue> Registry<T> {
    /// Create a registry over `map`
    pub fn new(map: Arc<dyn SharedMap>, strategy: Arc<dyn WriteStrategy>) -> Self {
        Self {
            map,
            strategy,
            _values: PhantomData,
        }
    }

    /// Name of the underlying shared map
    pub fn name(&self) -> &str {
        self.map.name()
    }

    /// Write strategy in use
    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Add `value` to the set at `key`
    pub async fn register(&self, key: &str, value: T) -> Result<()> {
        self.modify(key, SetOp::Add, BTreeSet::from([value])).await
    }

    /// Add every value to the set at `key`
    pub async fn register_all(&self, key: &str, values: impl IntoIterator<Item = T>) -> Result<()> {
        self.modify(key, SetOp::Add, values.into_iter().collect()).await
    }

    /// Remove `value` from the set at `key`; absent values are ignored
    pub async fn unregister(&self, key: &str, value: &T) -> Result<()> {
        self.modify(key, SetOp::Remove, BTreeSet::from([value.clone()]))
            .await
    }

    /// Remove every value from the set at `key`
    pub async fn unregister_all(
        &self,
        key: &str,
        values: impl IntoIterator<Item = T>,
    ) -> Result<()> {
        self.modify(key, SetOp::Remove, values.into_iter().collect())
            .await
    }

    /// Delete the whole set at `key`
    pub async fn remove_key(&self, key: &str) -> Result<()> {
        self.strategy
            .update(self.map.as_ref(), key, &|_| Ok(None))
            .await
    }

    /// Current set at `key`, empty if absent
    pub async fn get(&self, key: &str) -> Result<BTreeSet<T>> {
        match self.map.get(key).await? {
            Some(raw) => self.decode(key, &raw),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Keys holding at least one value
    pub async fn get_keys(&self) -> Result<BTreeSet<String>> {
        Ok(self.map.entries().await?.into_keys().collect())
    }

    /// Every key and its set, read in one pass
    pub async fn entries(&self) -> Result<BTreeMap<String, BTreeSet<T>>> {
        let raw = self.map.entries().await?;
        let mut decoded = BTreeMap::new();
        for (key, value) in raw {
            let set = self.decode(&key, &value)?;
            if !set.is_empty() {
                decoded.insert(key, set);
            }
        }
        Ok(decoded)
    }

    /// Take the map-wide write lock
    ///
    /// Fails with [`Error::UnsupportedOperation`] unless the registry uses
    /// the write-lock strategy.
    pub async fn exclusive(&self) -> Result<ExclusiveWrite<'_, T>> {
        let handle = self.strategy.acquire_exclusive(self.map.as_ref()).await?;
        debug!(map = self.name(), "exclusive write lock acquired");
        Ok(ExclusiveWrite {
            registry: self,
            handle,
        })
    }

    /// Atomically replace the whole content of the registry
    pub async fn replace_all(&self, entries: BTreeMap<String, BTreeSet<T>>) -> Result<()> {
        self.exclusive().await?.replace_all(entries).await
    }

    async fn modify(&self, key: &str, op: SetOp, values: BTreeSet<T>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        let mutation = |current: Option<&str>| -> Result<Option<String>> {
            let mut set = match current {
                Some(raw) => self.decode(key, raw)?,
                None => BTreeSet::new(),
            };
            match op {
                SetOp::Add => set.extend(values.iter().cloned()),
                SetOp::Remove => set.retain(|v| !values.contains(v)),
            }
            self.encode(key, &set)
        };

        self.strategy
            .update(self.map.as_ref(), key, &mutation)
            .await
    }

    fn decode(&self, key: &str, raw: &str) -> Result<BTreeSet<T>> {
        serde_json::from_str(raw).map_err(|e| Error::MalformedRecord {
            map: self.name().to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn encode(&self, key: &str, set: &BTreeSet<T>) -> Result<Option<String>> {
        if set.is_empty() {
            return Ok(None);
        }
        serde_json::to_string(set)
            .map(Some)
            .map_err(|e| Error::MalformedRecord {
                map: self.name().to_string(),
                key: key.to_string(),
                reason: e.to_string(),
            })
    }
}

// =============================================================================
// Exclusive Write
// =============================================================================

/// Map-wide write lock held on a [`Registry`]
///
/// Readers not going through the lock may observe the map empty while
/// [`ExclusiveWrite::replace_all`] runs.
pub struct ExclusiveWrite<'a, T> {
    registry: &'a Registry<T>,
    handle: Box<dyn LockHandle>,
}

impl<T: RegistryValue> ExclusiveWrite<'_, T> {
    /// Read every entry while holding the lock
    pub async fn entries(&self) -> Result<BTreeMap<String, BTreeSet<T>>> {
        self.registry.entries().await
    }

    /// [`ExclusiveWrite::repopulate`], then release the lock on every path
    pub async fn replace_all(self, entries: BTreeMap<String, BTreeSet<T>>) -> Result<()> {
        let result = self.repopulate(entries).await;
        let released = self.release().await;
        result.and(released)
    }

    /// Release the lock without writing
    pub async fn release(self) -> Result<()> {
        let name = self.handle.name().to_string();
        self.handle.release().await.map_err(|e| {
            warn!(lock = %name, error = %e, "failed to release write lock");
            e
        })
    }

    /// Clear the map and repopulate it with `entries`, keeping the lock
    ///
    /// All values are encoded before anything is cleared, so an encoding
    /// failure leaves the map untouched. A write failure after the clear
    /// leaves the map partially rebuilt.
    pub async fn repopulate(&self, entries: BTreeMap<String, BTreeSet<T>>) -> Result<()> {
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, set) in &entries {
            if let Some(value) = self.registry.encode(key, set)? {
                encoded.push((key.clone(), value));
            }
        }

        let map = self.registry.map.as_ref();
        map.clear().await?;
        let total = encoded.len();
        for (written, (key, value)) in encoded.into_iter().enumerate() {
            if let Err(e) = map.put(&key, value).await {
                error!(
                    map = map.name(),
                    written,
                    total,
                    key = %key,
                    error = %e,
                    "registry left partially rebuilt"
                );
                return Err(e);
            }
        }

        debug!(map = map.name(), keys = total, "registry repopulated");
        Ok(())
    }
}
