//! Benchmark for the dual-index entity registry
//!
//! Measures registration throughput and the cost of removing a departed node
//! from a populated registry.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use entity_registry::{
    EntityDirectory, EntityRegistry, MemoryCluster, NodeAware, NodeId, RegistryConfig,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

const ENTITY_TYPES: [&str; 4] = ["Customer", "Order", "Invoice", "Shipment"];

async fn populated_registry(nodes: usize, per_node: usize) -> Arc<EntityRegistry> {
    let cluster = MemoryCluster::new();
    let registry = EntityRegistry::open(&cluster, &RegistryConfig::default());
    for n in 0..nodes {
        let node = NodeId::new(format!("node-{:03}", n));
        for e in 0..per_node {
            let entity_type = ENTITY_TYPES[e % ENTITY_TYPES.len()];
            registry
                .register(&node, entity_type, &format!("{}/{}", node, e))
                .await
                .expect("populate");
        }
    }
    registry
}

fn bench_register(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("entity_registry");
    group.throughput(Throughput::Elements(1));

    let registry = rt.block_on(populated_registry(0, 0));
    let node = NodeId::from("node-000");

    group.bench_function("register", |b| {
        let mut counter = 0u64;
        b.to_async(&rt).iter(|| {
            counter += 1;
            let name = format!("entity-{}", counter);
            let registry = registry.clone();
            let node = node.clone();
            async move {
                let _ = registry
                    .register(black_box(&node), "Customer", black_box(&name))
                    .await;
            }
        });
    });

    group.finish();
}

fn bench_unregister_node(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("entity_registry");
    group.throughput(Throughput::Elements(1));
    group.sample_size(20);

    // 50 nodes with 20 registrations each, one of which departs
    group.bench_function("unregister_node", |b| {
        b.iter_batched(
            || rt.block_on(populated_registry(50, 20)),
            |registry| {
                rt.block_on(async move {
                    let _ = registry
                        .unregister_node(black_box(&NodeId::from("node-007")))
                        .await;
                })
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_register, bench_unregister_node);
criterion_main!(benches);
