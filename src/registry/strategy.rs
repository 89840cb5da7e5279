//! Write Strategies
//!
//! A registry never writes its shared map directly. Every change is expressed
//! as a read-modify-write mutation of one key and handed to a
//! [`WriteStrategy`], which decides how concurrent writers are reconciled:
//!
//! - [`WriteSafe`]: compare-and-swap retry loop, no lock. For keys written by
//!   many independent callers with small deltas.
//! - [`WriteLock`]: map-wide distributed lock. The only strategy that can
//!   clear and repopulate the whole map atomically.
//! - [`NonLocking`]: plain read then write. Lost updates are possible under
//!   real contention.

use crate::domain::ports::{LockHandle, LockService, SharedMap};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default bound on compare-and-swap attempts per mutation
pub const DEFAULT_CAS_MAX_ATTEMPTS: u32 = 64;

// =============================================================================
// Strategy Kind
// =============================================================================

/// Concurrency strategy identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    WriteSafe,
    WriteLock,
    NonLocking,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::WriteSafe => write!(f, "write_safe"),
            StrategyKind::WriteLock => write!(f, "write_lock"),
            StrategyKind::NonLocking => write!(f, "non_locking"),
        }
    }
}

// =============================================================================
// WriteStrategy Trait
// =============================================================================

/// Read-modify-write applied to the encoded value of one key
///
/// Receives the current encoded value (`None` when absent) and returns the
/// new one (`None` to delete the key). May be invoked several times by
/// retrying strategies, so it must be a pure function of its input.
pub type Mutation<'a> = &'a (dyn Fn(Option<&str>) -> Result<Option<String>> + Send + Sync);

/// How a registry applies mutations to its shared map
#[async_trait]
pub trait WriteStrategy: Send + Sync {
    /// Strategy identifier
    fn kind(&self) -> StrategyKind;

    /// Apply `mutation` to `key`
    async fn update(
        &self,
        map: &dyn SharedMap,
        key: &str,
        mutation: Mutation<'_>,
    ) -> Result<()>;

    /// Take exclusive ownership of the whole map
    ///
    /// Only lock-based strategies can offer this.
    async fn acquire_exclusive(&self, map: &dyn SharedMap) -> Result<Box<dyn LockHandle>> {
        Err(Error::UnsupportedOperation {
            operation: format!("exclusive write on {}", map.name()),
            strategy: self.kind().to_string(),
        })
    }
}

/// Store `next` unless it equals `current`
async fn write_back(
    map: &dyn SharedMap,
    key: &str,
    current: Option<&str>,
    next: Option<String>,
) -> Result<()> {
    if next.as_deref() == current {
        return Ok(());
    }
    match next {
        Some(value) => map.put(key, value).await,
        None => map.remove(key).await.map(|_| ()),
    }
}

// =============================================================================
// Write-Safe (CAS)
// =============================================================================

/// Compare-and-swap retry loop against a single key
#[derive(Debug, Clone)]
pub struct WriteSafe {
    max_attempts: u32,
}

impl WriteSafe {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for WriteSafe {
    fn default() -> Self {
        Self::new(DEFAULT_CAS_MAX_ATTEMPTS)
    }
}

#[async_trait]
impl WriteStrategy for WriteSafe {
    fn kind(&self) -> StrategyKind {
        StrategyKind::WriteSafe
    }

    async fn update(
        &self,
        map: &dyn SharedMap,
        key: &str,
        mutation: Mutation<'_>,
    ) -> Result<()> {
        for attempt in 1..=self.max_attempts {
            let current = map.get(key).await?;
            let next = mutation(current.as_deref())?;
            if next == current {
                return Ok(());
            }

            let swapped = match (current, next) {
                (None, Some(value)) => map.put_if_absent(key, value).await?.is_none(),
                (Some(expected), Some(value)) => map.replace_if_equal(key, &expected, value).await?,
                (Some(expected), None) => map.remove_if_equal(key, &expected).await?,
                (None, None) => true,
            };

            if swapped {
                if attempt > 1 {
                    trace!(map = map.name(), key, attempt, "CAS succeeded after retry");
                }
                return Ok(());
            }

            debug!(map = map.name(), key, attempt, "CAS conflict, retrying");
            tokio::task::yield_now().await;
        }

        warn!(
            map = map.name(),
            key,
            attempts = self.max_attempts,
            "CAS retries exhausted"
        );
        Err(Error::ContentionExhausted {
            map: map.name().to_string(),
            key: key.to_string(),
            attempts: self.max_attempts,
        })
    }
}

// =============================================================================
// Write-Lock
// =============================================================================

/// Map-wide distributed lock around every write
#[derive(Clone)]
pub struct WriteLock {
    locks: Arc<dyn LockService>,
    timeout: Duration,
}

impl WriteLock {
    pub fn new(locks: Arc<dyn LockService>, timeout: Duration) -> Self {
        Self { locks, timeout }
    }

    /// Name of the lock guarding `map`
    pub fn lock_name(map: &dyn SharedMap) -> String {
        format!("{}.write-lock", map.name())
    }

    /// Lock acquisition timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for WriteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLock")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl WriteStrategy for WriteLock {
    fn kind(&self) -> StrategyKind {
        StrategyKind::WriteLock
    }

    async fn update(
        &self,
        map: &dyn SharedMap,
        key: &str,
        mutation: Mutation<'_>,
    ) -> Result<()> {
        let handle = self.acquire_exclusive(map).await?;

        let result = async {
            let current = map.get(key).await?;
            let next = mutation(current.as_deref())?;
            write_back(map, key, current.as_deref(), next).await
        }
        .await;

        // Release regardless of the outcome
        let released = handle.release().await;
        result.and(released)
    }

    async fn acquire_exclusive(&self, map: &dyn SharedMap) -> Result<Box<dyn LockHandle>> {
        self.locks.acquire(&Self::lock_name(map), self.timeout).await
    }
}

// =============================================================================
// Non-Locking
// =============================================================================

/// Plain read then write, no conflict detection
#[derive(Debug, Clone, Default)]
pub struct NonLocking;

#[async_trait]
impl WriteStrategy for NonLocking {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NonLocking
    }

    async fn update(
        &self,
        map: &dyn SharedMap,
        key: &str,
        mutation: Mutation<'_>,
    ) -> Result<()> {
        let current = map.get(key).await?;
        let next = mutation(current.as_deref())?;
        write_back(map, key, current.as_deref(), next).await
    }
}
