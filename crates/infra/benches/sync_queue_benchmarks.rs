use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::atomic::{AtomicI64, Ordering};

use asyncjob_core::NodeId;
use asyncjob_infra::job_store::InMemoryJobDataStore;
use asyncjob_infra::jobs::{ResourceKey, SyncQueueManager, JOB_CONTENT_TYPE};

static NEXT_CONTENT: AtomicI64 = AtomicI64::new(1);

fn next_content() -> i64 {
    NEXT_CONTENT.fetch_add(1, Ordering::Relaxed)
}

fn manager() -> SyncQueueManager<InMemoryJobDataStore> {
    SyncQueueManager::new(InMemoryJobDataStore::arc())
}

/// Enqueue onto one hot resource vs. spread across many.
fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_queue_enqueue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_resource", |b| {
        let queues = manager();
        let key = ResourceKey::new("VirtualMachine", 1);
        b.iter(|| {
            queues
                .queue(black_box(&key), JOB_CONTENT_TYPE, next_content(), 1)
                .unwrap()
        });
    });

    group.bench_function("many_resources", |b| {
        let queues = manager();
        let mut resource = 0i64;
        b.iter(|| {
            resource = (resource + 1) % 256;
            let key = ResourceKey::new("VirtualMachine", resource);
            queues
                .queue(&key, JOB_CONTENT_TYPE, next_content(), 1)
                .unwrap()
        });
    });

    group.finish();
}

/// Full slot lifecycle: enqueue, claim, purge.
fn bench_claim_and_purge(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_queue_claim_purge");
    let node = NodeId::new(1);

    for size_limit in [1u32, 4, 16].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(size_limit),
            size_limit,
            |b, &size_limit| {
                let queues = manager();
                let key = ResourceKey::new("Volume", 7);
                b.iter(|| {
                    let (queue, _) = queues
                        .queue(&key, JOB_CONTENT_TYPE, next_content(), size_limit)
                        .unwrap();
                    let item = queues.dequeue_from_one(queue.id, node).unwrap().unwrap();
                    black_box(queues.purge_item(item.id).unwrap())
                });
            },
        );
    }

    group.finish();
}

/// Heartbeat-style scan over a backlog of ready queues.
fn bench_dequeue_from_any(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_queue_dequeue_from_any");
    let node = NodeId::new(1);

    for backlog in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, &backlog| {
            b.iter_batched(
                || {
                    let queues = manager();
                    for i in 0..backlog {
                        let key = ResourceKey::new("Host", i as i64);
                        queues
                            .queue(&key, JOB_CONTENT_TYPE, next_content(), 1)
                            .unwrap();
                    }
                    queues
                },
                |queues| black_box(queues.dequeue_from_any(node, backlog).unwrap()),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue,
    bench_claim_and_purge,
    bench_dequeue_from_any
);
criterion_main!(benches);
