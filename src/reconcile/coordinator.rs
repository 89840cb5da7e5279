//! Cleanup Coordinator
//!
//! Per-node adaptive loop that removes the registrations of departed nodes.
//! Each cycle:
//!
//! ```text
//!   Idle ─► Scheduled(interval + jitter) ─► LockAttempt
//!                                             │
//!                 ┌───────────────────────────┴──────────────┐
//!                 ▼                                          ▼
//!        Reconciling ─► Cleaning ─► release lock        LockFailed
//!                 │                                          │
//!                 └────── halve interval ◄─┐   double ───────┘
//!                                          └─ interval on failure
//! ```
//!
//! Stale nodes are recomputed from scratch every cycle by diffing the reverse
//! index against live membership, so no node-left notification has to be
//! delivered reliably. At most one coordinator in the cluster is inside a
//! cycle at a time, guarded by the cleanup lock.

use crate::config::CoordinatorConfig;
use crate::domain::ports::{LockService, MembershipProvider, NodeAware, NodeId};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Cycle Outcome
// =============================================================================

/// Result of one coordinator cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another node holds the cleanup lock
    Contended,
    /// No stale nodes
    Converged,
    /// Stale nodes removed (`remaining` are left for later cycles)
    Cleaned { removed: usize, remaining: usize },
    /// Reconciliation failed
    Failed { reason: String },
}

impl CycleOutcome {
    /// Whether the adaptive interval should shrink after this cycle
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Converged | CycleOutcome::Cleaned { .. })
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Coordinator counters
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    pub cycles: AtomicU64,
    pub contended: AtomicU64,
    pub converged: AtomicU64,
    pub cleaned: AtomicU64,
    pub failed: AtomicU64,
    pub nodes_removed: AtomicU64,
    last_cycle_at: Mutex<Option<DateTime<Utc>>>,
}

impl CoordinatorStats {
    fn record(&self, outcome: &CycleOutcome) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        match outcome {
            CycleOutcome::Contended => self.contended.fetch_add(1, Ordering::Relaxed),
            CycleOutcome::Converged => self.converged.fetch_add(1, Ordering::Relaxed),
            CycleOutcome::Cleaned { removed, .. } => {
                self.nodes_removed
                    .fetch_add(*removed as u64, Ordering::Relaxed);
                self.cleaned.fetch_add(1, Ordering::Relaxed)
            }
            CycleOutcome::Failed { .. } => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        *self.last_cycle_at.lock() = Some(Utc::now());
    }

    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            converged: self.converged.load(Ordering::Relaxed),
            cleaned: self.cleaned.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            nodes_removed: self.nodes_removed.load(Ordering::Relaxed),
            last_cycle_at: *self.last_cycle_at.lock(),
        }
    }
}

/// Snapshot of coordinator statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatsSnapshot {
    pub cycles: u64,
    pub contended: u64,
    pub converged: u64,
    pub cleaned: u64,
    pub failed: u64,
    pub nodes_removed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Coordinator State
// =============================================================================

/// Process-local state, created on start and dropped on stop
struct CoordinatorState {
    current_interval_ms: u64,
    timer: Option<TimerHandle>,
}

struct TimerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

// =============================================================================
// Cleanup Coordinator
// =============================================================================

/// Self-healing cleanup loop for one node
pub struct CleanupCoordinator {
    config: CoordinatorConfig,
    registry: Arc<dyn NodeAware>,
    membership: Arc<dyn MembershipProvider>,
    locks: Arc<dyn LockService>,
    state: Mutex<CoordinatorState>,
    stats: CoordinatorStats,
}

impl CleanupCoordinator {
    /// Create a stopped coordinator
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<dyn NodeAware>,
        membership: Arc<dyn MembershipProvider>,
        locks: Arc<dyn LockService>,
    ) -> Arc<Self> {
        let state = CoordinatorState {
            current_interval_ms: config.initial_interval_ms,
            timer: None,
        };

        Arc::new(Self {
            config,
            registry,
            membership,
            locks,
            state: Mutex::new(state),
            stats: CoordinatorStats::default(),
        })
    }

    /// Get configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Current adaptive interval (without jitter)
    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.state.lock().current_interval_ms)
    }

    /// Get statistics
    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the timer loop is running
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .timer
            .as_ref()
            .map(|t| !t.task.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the timer loop on the current tokio runtime
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if state.timer.as_ref().is_some_and(|t| !t.task.is_finished()) {
            return Err(Error::CoordinatorRunning {
                node_id: self.membership.local_node_id().to_string(),
            });
        }

        state.current_interval_ms = self.config.initial_interval_ms;
        let cancel = CancellationToken::new();
        let coordinator = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            coordinator.run_loop(token).await;
        });
        state.timer = Some(TimerHandle { cancel, task });

        info!(
            node = %self.membership.local_node_id(),
            initial_interval_ms = self.config.initial_interval_ms,
            "cleanup coordinator started"
        );
        Ok(())
    }

    /// Cancel the pending timer and wait for an in-flight cycle to finish
    pub async fn stop(&self) {
        let timer = self.state.lock().timer.take();
        let Some(timer) = timer else {
            return;
        };

        timer.cancel.cancel();
        if let Err(e) = timer.task.await {
            error!(error = %e, "cleanup coordinator task ended abnormally");
        }
        info!(node = %self.membership.local_node_id(), "cleanup coordinator stopped");
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let delay = self.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "next cleanup cycle scheduled");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            // Past this point the cycle runs to completion even if stopped
            self.run_cycle().await;
        }
    }

    /// Adaptive interval plus a uniformly drawn jitter
    fn next_delay(&self) -> Duration {
        let jitter = if self.config.jitter_max_ms > self.config.jitter_min_ms {
            rand::thread_rng().gen_range(self.config.jitter_min_ms..=self.config.jitter_max_ms)
        } else {
            self.config.jitter_min_ms
        };
        Duration::from_millis(self.state.lock().current_interval_ms + jitter)
    }

    /// Run a single cycle: lock, reconcile, release, adapt the interval
    pub async fn run_cycle(&self) -> CycleOutcome {
        let outcome = match self
            .locks
            .acquire(&self.config.lock_name, self.config.lock_timeout())
            .await
        {
            Ok(lock) => {
                let outcome = match self.reconcile().await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(error = %e, "reconciliation failed");
                        CycleOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
                if let Err(e) = lock.release().await {
                    warn!(lock = %self.config.lock_name, error = %e, "failed to release cleanup lock");
                }
                outcome
            }
            Err(e) if e.is_contention() => {
                debug!(lock = %self.config.lock_name, "cleanup lock held elsewhere, backing off");
                CycleOutcome::Contended
            }
            Err(e) => {
                warn!(lock = %self.config.lock_name, error = %e, "cleanup lock acquisition failed");
                CycleOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        self.adjust_interval(outcome.is_success());
        self.stats.record(&outcome);
        outcome
    }

    /// Diff the reverse index against membership and remove one batch
    async fn reconcile(&self) -> Result<CycleOutcome> {
        let registered = self.registry.registered_node_ids().await?;
        let live = self.membership.live_node_ids().await?;
        let stale: BTreeSet<NodeId> = registered.difference(&live).cloned().collect();

        if stale.is_empty() {
            debug!(registered = registered.len(), "no stale nodes");
            return Ok(CycleOutcome::Converged);
        }

        let batch: Vec<NodeId> = stale.iter().take(self.config.max_batch).cloned().collect();
        let remaining = stale.len() - batch.len();
        info!(
            stale = stale.len(),
            batch = batch.len(),
            "removing registrations of departed nodes"
        );

        let results =
            futures::future::join_all(batch.iter().map(|node| self.registry.unregister_node(node)))
                .await;

        let failures: Vec<(&NodeId, Error)> = batch
            .iter()
            .zip(results)
            .filter_map(|(node, result)| result.err().map(|e| (node, e)))
            .collect();

        if let Some((node, first)) = failures.first() {
            for (node, e) in &failures {
                warn!(node = %node, error = %e, "node removal failed");
            }
            return Err(Error::NodeRemovalFailed {
                attempted: batch.len(),
                failed: failures.len(),
                reason: format!("{}: {}", node, first),
            });
        }

        Ok(CycleOutcome::Cleaned {
            removed: batch.len(),
            remaining,
        })
    }

    /// Halve on success (floored at min), double on failure (capped at max)
    fn adjust_interval(&self, success: bool) {
        let mut state = self.state.lock();
        let previous = state.current_interval_ms;
        state.current_interval_ms = if success {
            (previous / 2).max(self.config.min_interval_ms)
        } else {
            previous
                .saturating_mul(2)
                .min(self.config.max_interval_ms)
        };
        if state.current_interval_ms != previous {
            debug!(
                previous_ms = previous,
                current_ms = state.current_interval_ms,
                "cleanup interval adjusted"
            );
        }
    }
}

impl std::fmt::Debug for CleanupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupCoordinator")
            .field("node", &self.membership.local_node_id())
            .field("current_interval", &self.current_interval())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::interleaving::InterleavingMap;
    use crate::cluster::{MemoryCluster, StaticMembership};
    use crate::config::RegistryConfig;
    use crate::domain::ports::{EntityDirectory, RegistrationRecord};
    use crate::registry::EntityRegistry;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    struct Fixture {
        cluster: Arc<MemoryCluster>,
        registry: Arc<EntityRegistry>,
        membership: StaticMembership,
        coordinator: Arc<CleanupCoordinator>,
    }

    async fn assert_forward_matches_reverse(registry: &EntityRegistry) {
        let mut expected: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for record in registry
            .clustering_index()
            .entries()
            .await
            .unwrap()
            .values()
            .flatten()
        {
            expected
                .entry(record.entity_type_key.clone())
                .or_default()
                .insert(record.qualified_name.clone());
        }
        assert_eq!(registry.forward_index().entries().await.unwrap(), expected);
    }

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            lock_timeout_ms: 50,
            min_interval_ms: 10,
            max_interval_ms: 80,
            initial_interval_ms: 20,
            jitter_min_ms: 0,
            jitter_max_ms: 5,
            ..Default::default()
        }
    }

    fn fixture(config: CoordinatorConfig) -> Fixture {
        let cluster = MemoryCluster::new();
        let registry_config = RegistryConfig::default();
        let registry = EntityRegistry::with_backends(
            Arc::new(InterleavingMap::new(
                cluster.shared_map(&registry_config.forward_map),
            )),
            Arc::new(InterleavingMap::new(
                cluster.shared_map(&registry_config.clustering_map),
            )),
            cluster.lock_service(),
            &registry_config,
        );
        let membership = StaticMembership::new("B");
        let coordinator = CleanupCoordinator::new(
            config,
            registry.clone(),
            Arc::new(membership.clone()),
            cluster.lock_service(),
        );
        Fixture {
            cluster,
            registry,
            membership,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_reconciliation_end_to_end() {
        let f = fixture(test_config());
        let (a, b) = (NodeId::from("A"), NodeId::from("B"));
        f.registry.register(&a, "Customer", "x").await.unwrap();
        f.registry.register(&b, "Customer", "y").await.unwrap();
        let before_b = f.registry.get_clustering_information(&b).await.unwrap();

        // Membership only knows B
        let outcome = f.coordinator.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::Cleaned { removed: 1, remaining: 0 });

        assert!(f.registry.get_clustering_information(&a).await.unwrap().is_empty());
        assert_eq!(f.registry.get_clustering_information(&b).await.unwrap(), before_b);
        assert_eq!(
            before_b,
            BTreeSet::from([RegistrationRecord::new("y", "Customer")])
        );
        assert_eq!(f.coordinator.stats().nodes_removed, 1);
    }

    #[tokio::test]
    async fn test_converged_cycle_shrinks_interval() {
        let f = fixture(test_config());
        f.registry.register(&"B".into(), "Customer", "y").await.unwrap();

        let before = f.coordinator.current_interval();
        assert_eq!(f.coordinator.run_cycle().await, CycleOutcome::Converged);
        let after = f.coordinator.current_interval();
        assert!(after < before);

        // Floored at the minimum
        for _ in 0..10 {
            f.coordinator.run_cycle().await;
        }
        assert_eq!(f.coordinator.current_interval(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_contended_cycle_grows_interval() {
        let f = fixture(test_config());
        let held = f
            .cluster
            .lock_service()
            .acquire("entity-registry.cleanup", Duration::from_millis(10))
            .await
            .unwrap();

        let before = f.coordinator.current_interval();
        assert_eq!(f.coordinator.run_cycle().await, CycleOutcome::Contended);
        assert!(f.coordinator.current_interval() > before);

        // Capped at the maximum
        for _ in 0..10 {
            f.coordinator.run_cycle().await;
        }
        assert_eq!(f.coordinator.current_interval(), Duration::from_millis(80));
        assert_eq!(f.coordinator.stats().contended, 11);

        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_cycle_backs_off_and_releases_lock() {
        let f = fixture(test_config());
        f.registry.register(&"A".into(), "Customer", "x").await.unwrap();
        f.cluster
            .shared_map("entity-registry.clustering")
            .set_available(false);

        let before = f.coordinator.current_interval();
        assert_matches!(f.coordinator.run_cycle().await, CycleOutcome::Failed { .. });
        assert!(f.coordinator.current_interval() > before);
        assert!(!f.cluster.lock_service().is_locked("entity-registry.cleanup"));

        // Recovers on the next cycle
        f.cluster
            .shared_map("entity-registry.clustering")
            .set_available(true);
        assert_matches!(f.coordinator.run_cycle().await, CycleOutcome::Cleaned { .. });
    }

    #[tokio::test]
    async fn test_batch_cap() {
        let f = fixture(CoordinatorConfig {
            max_batch: 100,
            ..test_config()
        });
        for i in 0..150 {
            let node = NodeId::new(format!("stale-{:03}", i));
            f.registry.register(&node, "Customer", &format!("q{}", i)).await.unwrap();
        }

        assert_eq!(
            f.coordinator.run_cycle().await,
            CycleOutcome::Cleaned { removed: 100, remaining: 50 }
        );
        assert_eq!(f.registry.registered_node_ids().await.unwrap().len(), 50);
        assert_eq!(f.registry.get("Customer").await.unwrap().len(), 50);
        assert_forward_matches_reverse(&f.registry).await;

        assert_eq!(
            f.coordinator.run_cycle().await,
            CycleOutcome::Cleaned { removed: 50, remaining: 0 }
        );
        assert!(f.registry.registered_node_ids().await.unwrap().is_empty());
        assert!(f.registry.forward_index().entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejoined_node_is_kept() {
        let f = fixture(test_config());
        f.registry.register(&"A".into(), "Customer", "x").await.unwrap();
        f.membership.join("A");

        assert_eq!(f.coordinator.run_cycle().await, CycleOutcome::Converged);
        assert_eq!(f.registry.get("Customer").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timer_loop_cleans_and_stops() {
        let f = fixture(test_config());
        f.registry.register(&"A".into(), "Customer", "x").await.unwrap();

        f.coordinator.start().unwrap();
        assert!(f.coordinator.is_running());
        assert_matches!(f.coordinator.start(), Err(Error::CoordinatorRunning { .. }));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !f.registry.registered_node_ids().await.unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "coordinator never cleaned");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        f.coordinator.stop().await;
        assert!(!f.coordinator.is_running());
        let cycles = f.coordinator.stats().cycles;
        assert!(cycles >= 1);

        // No more cycles once stopped
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.coordinator.stats().cycles, cycles);

        // Stop is idempotent and the coordinator can be restarted
        f.coordinator.stop().await;
        f.coordinator.start().unwrap();
        f.coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_only_one_coordinator_cleans_at_a_time() {
        let f = fixture(test_config());
        for i in 0..5 {
            let node = NodeId::new(format!("gone-{}", i));
            f.registry.register(&node, "Customer", &format!("q{}", i)).await.unwrap();
        }
        let other = CleanupCoordinator::new(
            test_config(),
            f.registry.clone(),
            Arc::new(f.membership.view_for("C")),
            f.cluster.lock_service(),
        );

        let (first, second) = tokio::join!(f.coordinator.run_cycle(), other.run_cycle());
        let removed: usize = [first, second]
            .iter()
            .map(|o| match o {
                CycleOutcome::Cleaned { removed, .. } => *removed,
                _ => 0,
            })
            .sum();

        // Whoever lost the lock race either backed off or found nothing left
        assert_eq!(removed, 5);
        assert!(f.registry.registered_node_ids().await.unwrap().is_empty());
    }
}
