//! Entity Registry Simulator
//!
//! Runs an in-process cluster of nodes sharing one entity registry, lets some
//! of them depart without unregistering, and shows the surviving nodes'
//! reconciliation removing what the departed nodes left behind.
//!
//! ```text
//!   node-0 ──┐                               ┌── CleanupCoordinator
//!   node-1 ──┼── EntityRegistry (shared) ◄───┤
//!   node-2 ──┘                               └── NodeDepartureListener
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use entity_registry::{
    CleanupCoordinator, ClusterConfig, EntityDirectory, EntityRegistry, Lifecycle,
    MemoryCluster, NodeDepartureListener, NodeId, ReconciliationHook, StaticMembership,
};

const ENTITY_TYPES: [&str; 3] = ["Customer", "Order", "Invoice"];

// =============================================================================
// CLI Arguments
// =============================================================================

/// Entity Registry - cluster membership reconciliation simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of simulated nodes
    #[arg(long, env = "NODES", default_value = "3")]
    nodes: usize,

    /// Entities registered by each node
    #[arg(long, env = "ENTITIES_PER_NODE", default_value = "5")]
    entities_per_node: usize,

    /// Nodes that leave the cluster without unregistering
    #[arg(long, env = "DEPART", default_value = "1")]
    depart: usize,

    /// How long to let reconciliation run, in seconds
    #[arg(long, env = "RUN_SECS", default_value = "10")]
    run_secs: u64,

    /// YAML configuration file
    #[arg(long, env = "ENTITY_REGISTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// One simulated cluster member
struct SimulatedNode {
    id: NodeId,
    registry: Arc<EntityRegistry>,
    hook: ReconciliationHook,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = match &args.config {
        Some(path) => ClusterConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ClusterConfig::default(),
    };
    if args.depart >= args.nodes {
        anyhow::bail!(
            "--depart ({}) must leave at least one of --nodes ({}) running",
            args.depart,
            args.nodes
        );
    }

    info!("Starting Entity Registry simulator");
    info!("  Version: {}", entity_registry::VERSION);
    info!("  Nodes: {}", args.nodes);
    info!("  Entities per node: {}", args.entities_per_node);
    info!("  Departing: {}", args.depart);
    info!(
        "  Cleanup interval: {}..{} ms",
        config.coordinator.min_interval_ms, config.coordinator.max_interval_ms
    );

    let cluster = MemoryCluster::new();
    let membership = StaticMembership::new("node-0");

    // Bring up every node
    let mut nodes = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let id = NodeId::new(format!("node-{}", i));
        membership.join(id.clone());
        let view = membership.view_for(id.clone());

        let registry = EntityRegistry::open(&cluster, &config.registry);
        let coordinator = CleanupCoordinator::new(
            config.coordinator.clone(),
            registry.clone(),
            Arc::new(view.clone()),
            cluster.lock_service(),
        );
        let hook = ReconciliationHook::new(coordinator)
            .with_departures(NodeDepartureListener::new(registry.clone()), view.subscribe());
        hook.on_start().await?;

        for j in 0..args.entities_per_node {
            let entity_type = ENTITY_TYPES[j % ENTITY_TYPES.len()];
            let qualified_name = format!("{}/{}-{}", id, entity_type.to_lowercase(), j);
            registry
                .register(&id, entity_type, &qualified_name)
                .await
                .with_context(|| format!("{} failed to register {}", id, qualified_name))?;
        }
        info!(node = %id, "node joined and registered its entities");

        nodes.push(SimulatedNode { id, registry, hook });
    }

    // The last nodes leave without cleaning up after themselves
    let departed = nodes.split_off(args.nodes - args.depart);
    for node in &departed {
        node.hook.on_stop().await?;
        membership.leave(node.id.clone());
        warn!(node = %node.id, "node departed without unregistering");
    }

    info!("Running reconciliation for {}s (Ctrl+C to stop early)", args.run_secs);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.run_secs)) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    // Report what the survivors see
    let observer = &nodes[0];
    for entity_type in observer.registry.entity_type_keys().await? {
        let names = observer.registry.get(&entity_type).await?;
        info!(entity_type = %entity_type, count = names.len(), "forward index");
    }
    for node in &departed {
        let leftover = observer.registry.get_clustering_information(&node.id).await?;
        info!(node = %node.id, leftover = leftover.len(), "departed node registrations");
    }

    for node in &nodes {
        let stats = node.hook.coordinator().stats();
        info!(
            node = %node.id,
            cycles = stats.cycles,
            contended = stats.contended,
            nodes_removed = stats.nodes_removed,
            interval_ms = node.hook.coordinator().current_interval().as_millis() as u64,
            "coordinator stats"
        );
        node.hook.on_stop().await?;
    }

    info!("Simulator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
