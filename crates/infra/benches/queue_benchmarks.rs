use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use courier_infra::jobs::{
    DeliveryError, Dispatcher, DispatcherConfig, InMemoryJobStore, Job, JobStore, JobType,
    Notifier, Payload, RetryPolicy,
};
use tokio::runtime::Runtime;

/// Accepts everything; isolates dispatcher overhead from delivery cost.
struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, _: &JobType, _: &Payload) -> Result<(), DeliveryError> {
        Ok(())
    }
}

fn booking_job(n: usize) -> Job {
    let mut payload = Payload::new();
    payload.insert("bookingId".into(), serde_json::json!(format!("bk_{n}")));
    payload.insert("phone".into(), serde_json::json!("+910000000000"));
    Job::new(JobType::booking_confirmation(), payload)
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn bench_push_pop(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("ready_queue_push_pop");
    group.throughput(Throughput::Elements(1));

    group.bench_function("in_memory", |b| {
        let store = InMemoryJobStore::new();
        let job = booking_job(0);
        b.iter(|| {
            rt.block_on(async {
                store.push_ready(black_box(&job)).await.unwrap();
                black_box(store.pop_ready().await.unwrap());
            })
        });
    });

    group.finish();
}

fn bench_promote_due(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("promote_due");

    for batch in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let store = InMemoryJobStore::new();
            let past = Utc::now() - chrono::Duration::seconds(1);
            let jobs: Vec<Job> = (0..batch).map(booking_job).collect();
            b.iter(|| {
                rt.block_on(async {
                    for job in &jobs {
                        store.schedule_delayed(job, past).await.unwrap();
                    }
                    let moved = store.promote_due(Utc::now(), batch).await.unwrap();
                    assert_eq!(moved, batch);
                    while store.pop_ready().await.unwrap().is_some() {}
                })
            });
        });
    }

    group.finish();
}

fn bench_dispatch_once(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("dispatch_once");
    group.throughput(Throughput::Elements(1));

    group.bench_function("deliver_success", |b| {
        let store = InMemoryJobStore::arc();
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(NullNotifier),
            RetryPolicy::default(),
            DispatcherConfig::default().with_delivery_timeout(Duration::from_secs(1)),
        );
        let job = booking_job(0);
        b.iter(|| {
            rt.block_on(async {
                store.push_ready(&job).await.unwrap();
                black_box(dispatcher.dispatch_once().await.unwrap());
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_push_pop, bench_promote_due, bench_dispatch_once);
criterion_main!(benches);
