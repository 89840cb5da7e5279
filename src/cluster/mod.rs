//! Reference Cluster Backends
//!
//! In-process implementations of the shared map, lock and membership ports.
//! A single [`MemoryCluster`] can be shared by several logical nodes to run
//! the registry and the cleanup coordinator without external services.

#[cfg(test)]
pub(crate) mod interleaving;
mod membership;
mod memory_lock;
mod memory_map;

pub use membership::{MembershipEvent, StaticMembership};
pub use memory_lock::{MemoryLockHandle, MemoryLockService};
pub use memory_map::MemorySharedMap;

use dashmap::DashMap;
use std::sync::Arc;

/// Storage and locks shared by every node of an in-process cluster
#[derive(Default)]
pub struct MemoryCluster {
    maps: DashMap<String, Arc<MemorySharedMap>>,
    locks: Arc<MemoryLockService>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open (or create) the map called `name`
    pub fn shared_map(&self, name: &str) -> Arc<MemorySharedMap> {
        Arc::clone(
            &self
                .maps
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemorySharedMap::new(name))),
        )
    }

    /// The cluster-wide lock service
    pub fn lock_service(&self) -> Arc<MemoryLockService> {
        Arc::clone(&self.locks)
    }
}
