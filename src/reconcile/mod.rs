//! Reconciliation Module
//!
//! Background cleanup of registrations left behind by departed nodes: the
//! adaptive [`CleanupCoordinator`] loop, the eager [`NodeDepartureListener`],
//! and the [`ReconciliationHook`] tying both to process lifecycle.

pub mod coordinator;
pub mod lifecycle;

pub use coordinator::{CleanupCoordinator, CoordinatorStats, CoordinatorStatsSnapshot, CycleOutcome};
pub use lifecycle::{NodeDepartureListener, ReconciliationHook, DEFAULT_RETRY_BUDGET};
