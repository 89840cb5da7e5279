//! Dual-Index Entity Registry
//!
//! Tracks which node serves which resource for each entity type using two
//! [`Registry`] instances over shared maps:
//!
//! ```text
//!   forward   (write-lock)   entity type key ──► { qualified name, ... }
//!   reverse   (write-safe)   node id         ──► { RegistrationRecord, ... }
//! ```
//!
//! The forward index is what consumers query. The reverse index is what makes
//! [`EntityRegistry::unregister_node`] possible: the forward index alone
//! cannot tell which of its values came from a given node, because a type may
//! be served by several nodes and a node may serve several types. Removal
//! therefore rebuilds the forward index from every *other* node's bucket.

use crate::cluster::MemoryCluster;
use crate::config::RegistryConfig;
use crate::domain::ports::{
    EntityDirectory, LockService, NodeAware, NodeId, RegistrationRecord, SharedMap,
};
use crate::error::{Error, Result};
use crate::registry::events::RegistryEvent;
use crate::registry::multimap::{ExclusiveWrite, Registry};
use crate::registry::strategy::{WriteLock, WriteSafe};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// =============================================================================
// Statistics
// =============================================================================

/// Registry activity counters
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub registrations: AtomicU64,
    pub unregistrations: AtomicU64,
    pub dual_write_failures: AtomicU64,
    pub nodes_removed: AtomicU64,
    pub records_removed: AtomicU64,
}

impl RegistryStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            registrations: self.registrations.load(Ordering::Relaxed),
            unregistrations: self.unregistrations.load(Ordering::Relaxed),
            dual_write_failures: self.dual_write_failures.load(Ordering::Relaxed),
            nodes_removed: self.nodes_removed.load(Ordering::Relaxed),
            records_removed: self.records_removed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    pub registrations: u64,
    pub unregistrations: u64,
    pub dual_write_failures: u64,
    pub nodes_removed: u64,
    pub records_removed: u64,
}

// =============================================================================
// Entity Registry
// =============================================================================

/// Clustered entity registry with forward and reverse indices
pub struct EntityRegistry {
    /// entity type key → qualified names
    forward: Registry<String>,
    /// node id → records that node contributed
    reverse: Registry<RegistrationRecord>,
    /// Statistics
    stats: RegistryStats,
    /// Event broadcaster
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl EntityRegistry {
    /// Create a registry over already-built indices
    pub fn new(
        forward: Registry<String>,
        reverse: Registry<RegistrationRecord>,
        event_channel_capacity: usize,
    ) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(event_channel_capacity.max(1));

        Arc::new(Self {
            forward,
            reverse,
            stats: RegistryStats::default(),
            event_sender,
        })
    }

    /// Create a registry over the given backend maps and lock service
    ///
    /// The forward index uses the write-lock strategy so node removal can
    /// rebuild it atomically; the reverse index uses the write-safe strategy
    /// since each node only edits its own bucket.
    pub fn with_backends(
        forward_map: Arc<dyn SharedMap>,
        clustering_map: Arc<dyn SharedMap>,
        locks: Arc<dyn LockService>,
        config: &RegistryConfig,
    ) -> Arc<Self> {
        let forward = Registry::new(
            forward_map,
            Arc::new(WriteLock::new(locks, config.write_lock_timeout())),
        );
        let reverse = Registry::new(
            clustering_map,
            Arc::new(WriteSafe::new(config.cas_max_attempts)),
        );
        Self::new(forward, reverse, config.event_channel_capacity)
    }

    /// Open the registry on an in-process cluster
    pub fn open(cluster: &MemoryCluster, config: &RegistryConfig) -> Arc<Self> {
        Self::with_backends(
            cluster.shared_map(&config.forward_map),
            cluster.shared_map(&config.clustering_map),
            cluster.lock_service(),
            config,
        )
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Get statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        self.stats.snapshot()
    }

    /// The forward index
    pub fn forward_index(&self) -> &Registry<String> {
        &self.forward
    }

    /// The reverse (clustering) index
    pub fn clustering_index(&self) -> &Registry<RegistrationRecord> {
        &self.reverse
    }

    /// Entity types served by at least one node
    pub async fn entity_type_keys(&self) -> Result<BTreeSet<String>> {
        self.forward.get_keys().await
    }

    /// Rebuild the forward index from a reverse index snapshot minus `departing`
    fn flatten_without(
        snapshot: &BTreeMap<String, BTreeSet<RegistrationRecord>>,
        departing: &NodeId,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut rebuilt: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for record in snapshot
            .iter()
            .filter(|(node, _)| node.as_str() != departing.as_str())
            .flat_map(|(_, records)| records)
        {
            rebuilt
                .entry(record.entity_type_key.clone())
                .or_default()
                .insert(record.qualified_name.clone());
        }
        rebuilt
    }

    /// Rebuild the forward index without `departing`, then drop its bucket
    ///
    /// The reverse index is read again here, with the lock held, so
    /// registrations that landed after the caller's first snapshot are kept.
    /// The bucket must be gone before the lock is released: any rebuild that
    /// still reads it puts the departed node's records back.
    async fn rebuild_without(
        &self,
        exclusive: &ExclusiveWrite<'_, String>,
        departing: &NodeId,
    ) -> Result<Option<(usize, usize)>> {
        let snapshot = self.reverse.entries().await?;
        let Some(removed) = snapshot.get(departing.as_str()).map(BTreeSet::len) else {
            // Removed by a concurrent caller while we waited for the lock
            return Ok(None);
        };
        let rebuilt = Self::flatten_without(&snapshot, departing);
        let entity_types = rebuilt.len();

        exclusive.repopulate(rebuilt).await?;
        self.reverse.remove_key(departing.as_str()).await?;
        Ok(Some((removed, entity_types)))
    }

    fn dual_write_result(
        &self,
        operation: &str,
        qualified_name: &str,
        forward: Result<()>,
        reverse: Result<()>,
    ) -> Result<()> {
        let (forward, reverse) = match (forward, reverse) {
            (Ok(()), Ok(())) => return Ok(()),
            // Fatal errors are not worth retrying; surface them as they are
            (Err(e), _) | (_, Err(e)) if !e.is_retryable() => return Err(e),
            (forward, reverse) => (forward, reverse),
        };

        self.stats.dual_write_failures.fetch_add(1, Ordering::Relaxed);
        let describe = |r: &Result<()>| match r {
            Ok(()) => "ok".to_string(),
            Err(e) => e.to_string(),
        };
        let err = Error::DualWrite {
            operation: operation.to_string(),
            qualified_name: qualified_name.to_string(),
            forward: describe(&forward),
            reverse: describe(&reverse),
        };
        warn!(error = %err, "dual-index write failed");
        Err(err)
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("forward", &self.forward)
            .field("reverse", &self.reverse)
            .finish()
    }
}

#[async_trait]
impl EntityDirectory for EntityRegistry {
    async fn register(
        &self,
        node_id: &NodeId,
        entity_type_key: &str,
        qualified_name: &str,
    ) -> Result<()> {
        let record = RegistrationRecord::new(qualified_name, entity_type_key);
        let (forward, reverse) = futures::join!(
            self.forward.register(entity_type_key, qualified_name.to_string()),
            self.reverse.register(node_id.as_str(), record),
        );
        self.dual_write_result("register", qualified_name, forward, reverse)?;

        self.stats.registrations.fetch_add(1, Ordering::Relaxed);
        debug!(node = %node_id, entity_type_key, qualified_name, "entry registered");
        let _ = self.event_sender.send(RegistryEvent::EntryRegistered {
            node_id: node_id.clone(),
            entity_type_key: entity_type_key.to_string(),
            qualified_name: qualified_name.to_string(),
        });
        Ok(())
    }

    async fn unregister(
        &self,
        node_id: &NodeId,
        entity_type_key: &str,
        qualified_name: &str,
    ) -> Result<()> {
        let record = RegistrationRecord::new(qualified_name, entity_type_key);
        let name = qualified_name.to_string();
        let (forward, reverse) = futures::join!(
            self.forward.unregister(entity_type_key, &name),
            self.reverse.unregister(node_id.as_str(), &record),
        );
        self.dual_write_result("unregister", qualified_name, forward, reverse)?;

        self.stats.unregistrations.fetch_add(1, Ordering::Relaxed);
        debug!(node = %node_id, entity_type_key, qualified_name, "entry unregistered");
        let _ = self.event_sender.send(RegistryEvent::EntryUnregistered {
            node_id: node_id.clone(),
            entity_type_key: entity_type_key.to_string(),
            qualified_name: qualified_name.to_string(),
        });
        Ok(())
    }

    async fn get(&self, entity_type_key: &str) -> Result<BTreeSet<String>> {
        self.forward.get(entity_type_key).await
    }

    async fn get_clustering_information(
        &self,
        node_id: &NodeId,
    ) -> Result<BTreeSet<RegistrationRecord>> {
        self.reverse.get(node_id.as_str()).await
    }
}

#[async_trait]
impl NodeAware for EntityRegistry {
    async fn unregister_node(&self, node_id: &NodeId) -> Result<usize> {
        // 1. One-pass snapshot of the reverse index
        let snapshot = self.reverse.entries().await?;
        if !snapshot.contains_key(node_id.as_str()) {
            debug!(node = %node_id, "node has no registrations, nothing to remove");
            return Ok(0);
        }

        // 2-5. Rebuild the forward index and drop the node's bucket under
        // the forward write lock
        let exclusive = self.forward.exclusive().await?;
        let rebuilt = self.rebuild_without(&exclusive, node_id).await;
        let released = exclusive.release().await;
        let Some((removed, entity_types)) = rebuilt? else {
            released?;
            debug!(node = %node_id, "node already removed");
            return Ok(0);
        };
        released?;

        self.stats.nodes_removed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_removed
            .fetch_add(removed as u64, Ordering::Relaxed);
        info!(
            node = %node_id,
            records_removed = removed,
            entity_types,
            "node registrations removed"
        );
        let _ = self.event_sender.send(RegistryEvent::NodeUnregistered {
            node_id: node_id.clone(),
            records_removed: removed,
            removed_at: Utc::now(),
        });

        Ok(removed)
    }

    async fn registered_node_ids(&self) -> Result<BTreeSet<NodeId>> {
        Ok(self
            .reverse
            .get_keys()
            .await?
            .into_iter()
            .map(NodeId::from)
            .collect())
    }
}
