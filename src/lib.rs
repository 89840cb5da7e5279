//! Entity Registry - Cluster Membership Reconciliation
//!
//! Tracks which cluster node serves which resource for each entity type, and
//! cleans up after nodes that leave the cluster without unregistering.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        Reconciliation (per node)                            │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │    Cleanup Coordinator      │  │     Node Departure Listener         │   │
//! │  │  (adaptive interval + lock) │  │   (eager, retried with backoff)     │   │
//! │  └──────────────┬──────────────┘  └──────────────────┬──────────────────┘   │
//! │                 └──────────────┬─────────────────────┘                      │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                    ┌───────────┴───────────┐                                │
//! │                    │    Entity Registry    │                                │
//! │                    └───────────┬───────────┘                                │
//! │          ┌─────────────────────┴─────────────────────┐                      │
//! │  ┌───────┴─────────────────┐           ┌─────────────┴───────────────┐      │
//! │  │  Forward index          │           │  Reverse index              │      │
//! │  │  type → names           │           │  node → records             │      │
//! │  │  (write-lock strategy)  │           │  (write-safe strategy)      │      │
//! │  └───────┬─────────────────┘           └─────────────┬───────────────┘      │
//! ├──────────┴───────────────────────────────────────────┴──────────────────────┤
//! │                 Cluster Ports (shared maps, locks, membership)              │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`registry`]: Replicated multimaps, write strategies, and the entity registry
//! - [`reconcile`]: Cleanup coordinator and lifecycle glue
//! - [`cluster`]: In-process reference backends for the cluster ports
//! - [`domain`]: Core domain types and port traits
//! - [`config`]: Registry and coordinator configuration
//! - [`error`]: Error types and handling

pub mod cluster;
pub mod config;
pub mod domain;
pub mod error;
pub mod reconcile;
pub mod registry;

// Re-export commonly used types
pub use cluster::{
    MemoryCluster, MemoryLockService, MemorySharedMap,
    MembershipEvent, StaticMembership,
};

pub use config::{ClusterConfig, CoordinatorConfig, RegistryConfig};

pub use domain::ports::{
    NodeId, RegistrationRecord,
    SharedMap, LockService, LockHandle, MembershipProvider,
    EntityDirectory, NodeAware, Lifecycle,
};

pub use error::{Error, Result, ErrorAction};

pub use reconcile::{
    CleanupCoordinator, CoordinatorStatsSnapshot, CycleOutcome,
    NodeDepartureListener, ReconciliationHook,
};

pub use registry::{
    EntityRegistry, LocalEntityRegistry, RegistryEvent, RegistryStatsSnapshot,
    Registry, WriteStrategy, WriteLock, WriteSafe, NonLocking,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
