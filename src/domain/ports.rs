//! Domain Ports - Core trait definitions for the entity registry
//!
//! These traits define the boundaries between the registry logic and the
//! cluster primitives it runs on. Any backend (gossip-based, consensus-based
//! or the in-process reference backends in [`crate::cluster`]) plugs in by
//! implementing them.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

// =============================================================================
// Node ID
// =============================================================================

/// Unique identifier for a cluster node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&String> for NodeId {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

// =============================================================================
// Registration Record
// =============================================================================

/// One resource of a given entity type contributed by a node
///
/// Identity is the pair itself; there is no surrogate id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    /// Resource identifier (e.g. a deployed service's qualified name)
    pub qualified_name: String,
    /// Entity type / category the resource serves
    pub entity_type_key: String,
}

impl RegistrationRecord {
    pub fn new(qualified_name: impl Into<String>, entity_type_key: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            entity_type_key: entity_type_key.into(),
        }
    }
}

impl std::fmt::Display for RegistrationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.qualified_name, self.entity_type_key)
    }
}

// =============================================================================
// Shared Map Port
// =============================================================================

/// A named, cluster-replicated key-value store
///
/// Values are opaque encoded strings. The conditional operations are the
/// building blocks of the write-safe (compare-and-swap) strategy and must be
/// atomic per key.
#[async_trait]
pub trait SharedMap: Send + Sync {
    /// Name of the map, shared by every node that opens it
    fn name(&self) -> &str;

    /// Get the value at `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditionally store `value` at `key`
    async fn put(&self, key: &str, value: String) -> Result<()>;

    /// Remove `key`, returning the previous value
    async fn remove(&self, key: &str) -> Result<Option<String>>;

    /// Remove every entry
    async fn clear(&self) -> Result<()>;

    /// Snapshot of all entries
    async fn entries(&self) -> Result<BTreeMap<String, String>>;

    /// Store `value` only if `key` is absent; returns the existing value otherwise
    async fn put_if_absent(&self, key: &str, value: String) -> Result<Option<String>>;

    /// Replace the value at `key` only if it currently equals `expected`
    async fn replace_if_equal(&self, key: &str, expected: &str, value: String) -> Result<bool>;

    /// Remove `key` only if its value currently equals `expected`
    async fn remove_if_equal(&self, key: &str, expected: &str) -> Result<bool>;
}

// =============================================================================
// Distributed Lock Port
// =============================================================================

/// A held cluster-wide lock
///
/// Dropping a handle without calling [`LockHandle::release`] also frees the
/// lock, the way a backend frees the locks of a node that died.
#[async_trait]
pub trait LockHandle: Send + Sync {
    /// Name of the held lock
    fn name(&self) -> &str;

    /// Release the lock
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Cluster-wide named lock service
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to acquire `lock_name`, giving up after `timeout`
    ///
    /// Fails with [`crate::Error::LockTimeout`] when the lock is held
    /// elsewhere for longer than `timeout`.
    async fn acquire(&self, lock_name: &str, timeout: Duration) -> Result<Box<dyn LockHandle>>;
}

// =============================================================================
// Membership Port
// =============================================================================

/// View of the nodes currently considered alive
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Id of the local node
    fn local_node_id(&self) -> NodeId;

    /// Ids of every node currently alive, read fresh on each call
    async fn live_node_ids(&self) -> Result<BTreeSet<NodeId>>;
}

// =============================================================================
// Registry Capabilities
// =============================================================================

/// Publish/discover operations shared by every entity registry flavour
#[async_trait]
pub trait EntityDirectory: Send + Sync {
    /// Record that `node_id` serves `qualified_name` for `entity_type_key`
    async fn register(
        &self,
        node_id: &NodeId,
        entity_type_key: &str,
        qualified_name: &str,
    ) -> Result<()>;

    /// Remove a registration made by `node_id`
    async fn unregister(
        &self,
        node_id: &NodeId,
        entity_type_key: &str,
        qualified_name: &str,
    ) -> Result<()>;

    /// Qualified names serving `entity_type_key`, merged across nodes
    async fn get(&self, entity_type_key: &str) -> Result<BTreeSet<String>>;

    /// Records contributed by `node_id`
    async fn get_clustering_information(
        &self,
        node_id: &NodeId,
    ) -> Result<BTreeSet<RegistrationRecord>>;
}

/// Capability of registries that track per-node contributions
///
/// Only registries that keep a reverse index can drop everything a departed
/// node contributed. Callers that need node removal take `dyn NodeAware`
/// instead of inspecting the concrete registry type.
#[async_trait]
pub trait NodeAware: Send + Sync {
    /// Remove every registration contributed by `node_id`
    ///
    /// Returns the number of records removed. Idempotent: a node with no
    /// registrations is a no-op success returning zero.
    async fn unregister_node(&self, node_id: &NodeId) -> Result<usize>;

    /// Node ids that currently own at least one registration
    async fn registered_node_ids(&self) -> Result<BTreeSet<NodeId>>;
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Explicit start/stop hooks invoked by the host process
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Called once during process startup
    async fn on_start(&self) -> Result<()>;

    /// Called once during process shutdown
    async fn on_stop(&self) -> Result<()>;
}
