//! Lifecycle Glue
//!
//! Wires the cleanup coordinator and the node-departure listener into the
//! host's startup and shutdown sequence through [`Lifecycle`].

use crate::cluster::MembershipEvent;
use crate::domain::ports::{Lifecycle, NodeAware, NodeId};
use crate::error::{Error, Result};
use crate::reconcile::coordinator::CleanupCoordinator;
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default time budget for retrying one departed node's removal
pub const DEFAULT_RETRY_BUDGET: Duration = Duration::from_secs(10);

// =============================================================================
// Node Departure Listener
// =============================================================================

/// Eagerly removes a node's registrations when membership reports it left
///
/// Best effort: anything missed here (lagged events, an exhausted retry
/// budget, a departure while this node was down) is picked up by the
/// periodic reconciliation of [`CleanupCoordinator`].
pub struct NodeDepartureListener {
    registry: Arc<dyn NodeAware>,
    retry_budget: Duration,
    handled: AtomicU64,
    failed: AtomicU64,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl NodeDepartureListener {
    pub fn new(registry: Arc<dyn NodeAware>) -> Arc<Self> {
        Self::with_retry_budget(registry, DEFAULT_RETRY_BUDGET)
    }

    /// Create with a custom retry budget per departed node
    pub fn with_retry_budget(registry: Arc<dyn NodeAware>, retry_budget: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            retry_budget,
            handled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            worker: Mutex::new(None),
        })
    }

    /// Departures successfully cleaned up
    pub fn handled_count(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Departures given up on
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Handle one membership event, returning the number of records removed
    pub async fn handle(&self, event: &MembershipEvent) -> Result<usize> {
        match event {
            MembershipEvent::NodeLeft { node_id } => {
                let result = self.remove_with_retry(node_id).await;
                match &result {
                    Ok(removed) => {
                        self.handled.fetch_add(1, Ordering::Relaxed);
                        info!(node = %node_id, records_removed = removed, "departed node cleaned up");
                    }
                    Err(e) => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(node = %node_id, error = %e, "departed node cleanup failed, leaving it to reconciliation");
                    }
                }
                result
            }
            MembershipEvent::NodeJoined { .. } => Ok(0),
        }
    }

    async fn remove_with_retry(&self, node_id: &NodeId) -> Result<usize> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(self.retry_budget))
            .build();

        let registry = &self.registry;
        backoff::future::retry(policy, || async move {
            registry.unregister_node(node_id).await.map_err(|e| {
                if e.is_transient() {
                    debug!(node = %node_id, error = %e, "retrying departed node cleanup");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    /// Spawn a task consuming `events` until stopped or the channel closes
    pub fn start(self: &Arc<Self>, mut events: broadcast::Receiver<MembershipEvent>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|(_, task)| !task.is_finished()) {
            return Err(Error::Internal("departure listener already running".into()));
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let listener = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        let _ = listener.handle(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "membership events dropped, reconciliation will catch up");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *worker = Some((cancel, task));
        Ok(())
    }

    /// Stop the listener task, letting an in-flight removal finish
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some((cancel, task)) = worker {
            cancel.cancel();
            if let Err(e) = task.await {
                error!(error = %e, "departure listener task ended abnormally");
            }
        }
    }
}

// =============================================================================
// Reconciliation Hook
// =============================================================================

/// Starts and stops reconciliation together with the host process
pub struct ReconciliationHook {
    coordinator: Arc<CleanupCoordinator>,
    departures: Option<(Arc<NodeDepartureListener>, broadcast::Receiver<MembershipEvent>)>,
}

impl ReconciliationHook {
    /// Periodic reconciliation only
    pub fn new(coordinator: Arc<CleanupCoordinator>) -> Self {
        Self {
            coordinator,
            departures: None,
        }
    }

    /// Also react to node-left events as they arrive
    pub fn with_departures(
        mut self,
        listener: Arc<NodeDepartureListener>,
        events: broadcast::Receiver<MembershipEvent>,
    ) -> Self {
        self.departures = Some((listener, events));
        self
    }

    pub fn coordinator(&self) -> &Arc<CleanupCoordinator> {
        &self.coordinator
    }
}

#[async_trait]
impl Lifecycle for ReconciliationHook {
    async fn on_start(&self) -> Result<()> {
        self.coordinator.start()?;
        if let Some((listener, events)) = &self.departures {
            if let Err(e) = listener.start(events.resubscribe()) {
                self.coordinator.stop().await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        if let Some((listener, _)) = &self.departures {
            listener.stop().await;
        }
        self.coordinator.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryCluster, StaticMembership};
    use crate::config::{CoordinatorConfig, RegistryConfig};
    use crate::domain::ports::{EntityDirectory, SharedMap};
    use crate::registry::EntityRegistry;
    use assert_matches::assert_matches;
    use std::collections::BTreeSet;

    fn setup() -> (Arc<MemoryCluster>, Arc<EntityRegistry>, StaticMembership) {
        let cluster = MemoryCluster::new();
        let registry = EntityRegistry::open(&cluster, &RegistryConfig::default());
        let membership = StaticMembership::new("B");
        membership.join("A");
        (cluster, registry, membership)
    }

    async fn wait_until_removed(registry: &EntityRegistry, node: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry
            .registered_node_ids()
            .await
            .unwrap()
            .contains(&NodeId::from(node))
        {
            assert!(tokio::time::Instant::now() < deadline, "{} never removed", node);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_listener_removes_departed_node() {
        let (_cluster, registry, membership) = setup();
        registry.register(&"A".into(), "Customer", "x").await.unwrap();
        registry.register(&"B".into(), "Customer", "y").await.unwrap();

        let listener = NodeDepartureListener::new(registry.clone());
        listener.start(membership.subscribe()).unwrap();
        assert!(membership.leave("A"));

        wait_until_removed(&registry, "A").await;
        assert_eq!(
            registry.get("Customer").await.unwrap(),
            BTreeSet::from(["y".to_string()])
        );

        listener.stop().await;
        assert_eq!(listener.handled_count(), 1);
    }

    #[tokio::test]
    async fn test_join_event_is_ignored() {
        let (_cluster, registry, _membership) = setup();
        registry.register(&"C".into(), "Customer", "z").await.unwrap();
        let listener = NodeDepartureListener::new(registry.clone());

        let event = MembershipEvent::NodeJoined { node_id: "C".into() };
        tokio_test::assert_ok!(listener.handle(&event).await);
        assert_eq!(registry.get("Customer").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (cluster, registry, _membership) = setup();
        registry.register(&"A".into(), "Customer", "x").await.unwrap();
        let clustering = cluster.shared_map("entity-registry.clustering");
        clustering.set_available(false);

        let recover = {
            let clustering = clustering.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                clustering.set_available(true);
            })
        };

        let listener = NodeDepartureListener::new(registry.clone());
        let event = MembershipEvent::NodeLeft { node_id: "A".into() };
        let removed = tokio_test::assert_ok!(listener.handle(&event).await);
        assert_eq!(removed, 1);
        recover.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let (cluster, registry, _membership) = setup();
        registry.register(&"A".into(), "Customer", "x").await.unwrap();
        cluster
            .shared_map("entity-registry.clustering")
            .set_available(false);

        let listener =
            NodeDepartureListener::with_retry_budget(registry.clone(), Duration::from_millis(200));
        let event = MembershipEvent::NodeLeft { node_id: "A".into() };
        assert_matches!(
            listener.handle(&event).await,
            Err(Error::BackendUnavailable { .. })
        );
        assert_eq!(listener.failed_count(), 1);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let (cluster, registry, _membership) = setup();
        cluster
            .shared_map("entity-registry.clustering")
            .put("A", "not json".to_string())
            .await
            .unwrap();

        let listener = NodeDepartureListener::new(registry.clone());
        let event = MembershipEvent::NodeLeft { node_id: "A".into() };
        let started = tokio::time::Instant::now();
        assert_matches!(
            listener.handle(&event).await,
            Err(Error::MalformedRecord { .. })
        );
        assert!(started.elapsed() < DEFAULT_RETRY_BUDGET);
    }

    #[tokio::test]
    async fn test_hook_starts_and_stops_reconciliation() {
        let (cluster, registry, membership) = setup();
        registry.register(&"A".into(), "Customer", "x").await.unwrap();
        registry.register(&"gone".into(), "Order", "o").await.unwrap();

        let config = CoordinatorConfig {
            min_interval_ms: 10,
            max_interval_ms: 50,
            initial_interval_ms: 20,
            jitter_max_ms: 5,
            lock_timeout_ms: 20,
            ..Default::default()
        };
        let coordinator = CleanupCoordinator::new(
            config,
            registry.clone(),
            Arc::new(membership.clone()),
            cluster.lock_service(),
        );
        let hook = ReconciliationHook::new(coordinator).with_departures(
            NodeDepartureListener::new(registry.clone()),
            membership.subscribe(),
        );

        hook.on_start().await.unwrap();
        assert!(hook.coordinator().is_running());
        assert_matches!(hook.on_start().await, Err(Error::CoordinatorRunning { .. }));

        // Never a member: only periodic reconciliation can find it
        wait_until_removed(&registry, "gone").await;
        // Announced departure
        membership.leave("A");
        wait_until_removed(&registry, "A").await;

        hook.on_stop().await.unwrap();
        assert!(!hook.coordinator().is_running());
        assert!(registry.get("Customer").await.unwrap().is_empty());
    }
}
