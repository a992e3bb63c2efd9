//! Flow submission benchmark
//!
//! Benchmarks the Flow Builder's tree construction and an in-memory `BackingStore`'s
//! round trip from submission through every leaf completing.

use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use flowmesh_core::flow_builder::{self, StepGroup};
use flowmesh_core::store::{BackingStore, InMemoryBackingStore, JobState, RawJob};

fn step_groups(step_count: usize) -> Vec<StepGroup> {
    (0..step_count).map(|i| StepGroup::Sequential(vec![format!("step-{i}")])).collect()
}

/// Benchmark tree construction alone, no store involved.
fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_submission/build");

    for step_count in [1, 5, 20] {
        group.throughput(Throughput::Elements(step_count as u64));
        group.bench_with_input(BenchmarkId::new("steps", step_count), &step_count, |b, &step_count| {
            let groups = step_groups(step_count);
            b.iter(|| {
                flow_builder::build(
                    "bench-workflow",
                    "flow-id",
                    "bench",
                    &groups,
                    serde_json::json!({}),
                    None,
                    None,
                    None,
                )
            });
        });
    }

    group.finish();
}

/// Benchmark submitting a built tree to the in-memory store and draining it to
/// completion through a worker that immediately resolves every job.
fn bench_submit_and_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("flow_submission/submit_and_drain");

    for step_count in [1, 5, 20] {
        group.throughput(Throughput::Elements(step_count as u64));
        group.bench_with_input(BenchmarkId::new("steps", step_count), &step_count, |b, &step_count| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let groups = step_groups(step_count);
                let mut total = std::time::Duration::ZERO;

                for i in 0..iters {
                    let store = Arc::new(InMemoryBackingStore::new());
                    let prefix = format!("bench-{i}");

                    let plan = flow_builder::build(
                        "workflow",
                        &format!("flow-{i}"),
                        &prefix,
                        &groups,
                        serde_json::json!({}),
                        None,
                        None,
                        None,
                    );

                    let handler: flowmesh_core::store::WorkerHandler =
                        Arc::new(|job: RawJob| Box::pin(async move { Ok(job.data) }));
                    store
                        .register_worker(&plan.step_queue, 8, std::time::Duration::from_secs(5), handler.clone())
                        .await
                        .unwrap();
                    store
                        .register_worker(&plan.workflow_queue, 1, std::time::Duration::from_secs(5), handler)
                        .await
                        .unwrap();

                    let start = Instant::now();
                    let root_id = store.submit_tree(plan.tree).await.unwrap();
                    loop {
                        match store.find_job_by_id(&plan.workflow_queue, &root_id).await.unwrap() {
                            Some(JobState::Completed) | Some(JobState::Failed) => break,
                            _ => tokio::task::yield_now().await,
                        }
                    }
                    total += start.elapsed();

                    store.stop_worker(&plan.step_queue).await.unwrap();
                    store.stop_worker(&plan.workflow_queue).await.unwrap();
                }

                total
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_build, bench_submit_and_drain);
criterion_main!(benches);
