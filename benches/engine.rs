use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ticketflow::{Amount, Config, Engine, NewResource, PurchaseRequest};
use tokio::runtime::Runtime;

/// Generates purchase requests spread over `resources` resources.
///
/// Requesters are unique, so every request has its own fingerprint. Every
/// `duplicate_every`-th request repeats the previous one (0 = no duplicates).
pub struct PurchaseGenerator {
    resources: u32,
    remaining: u32,
    next_requester: u32,
    duplicate_every: u32,
    last: Option<PurchaseRequest>,
}

impl PurchaseGenerator {
    pub fn new(resources: u32, count: u32, duplicate_every: u32) -> Self {
        Self {
            resources: resources.max(1),
            remaining: count,
            next_requester: 0,
            duplicate_every,
            last: None,
        }
    }
}

impl Iterator for PurchaseGenerator {
    type Item = PurchaseRequest;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if self.duplicate_every > 0 && self.next_requester % self.duplicate_every == 0 {
            if let Some(last) = self.last.take() {
                return Some(last);
            }
        }

        let n = self.next_requester;
        self.next_requester += 1;
        let request = PurchaseRequest::new(
            format!("event-{}", n % self.resources),
            format!("user-{n}"),
        );
        self.last = Some(request.clone());
        Some(request)
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.lock.poll_interval = Duration::from_millis(1);
    config.lock.max_wait = Duration::from_secs(60);
    config.gateway.min_latency = Duration::ZERO;
    config.gateway.max_latency = Duration::ZERO;
    config.gateway.failure_rate = 0.0;
    config
}

async fn engine(resources: u32, units: u32) -> Engine {
    let engine = Engine::new(config());
    for i in 0..resources {
        engine
            .create_resource(NewResource::new(
                format!("event-{i}"),
                units,
                Amount::from_scaled(450_000),
            ))
            .await
            .expect("create resource");
    }
    engine
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn bench_single_resource(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("single_resource");

    for count in [100u32, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                let engine = engine(1, count).await;
                let outcomes = engine
                    .run(tokio_stream::iter(PurchaseGenerator::new(1, count, 0)))
                    .await;
                black_box(outcomes)
            });
        });
    }

    group.finish();
}

fn bench_spread_resources(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("spread");

    for resources in [10u32, 100] {
        group.bench_with_input(
            BenchmarkId::from_parameter(resources),
            &resources,
            |b, &resources| {
                b.to_async(&rt).iter(|| async move {
                    let engine = engine(resources, 100).await;
                    let outcomes = engine
                        .run(tokio_stream::iter(PurchaseGenerator::new(resources, 1_000, 0)))
                        .await;
                    black_box(outcomes)
                });
            },
        );
    }

    group.finish();
}

fn bench_with_duplicates(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("with_duplicates");

    // every 10th request is a retry of the one before
    group.bench_function("1k_dup_10pct", |b| {
        b.to_async(&rt).iter(|| async {
            let engine = engine(10, 1_000).await;
            let outcomes = engine
                .run(tokio_stream::iter(PurchaseGenerator::new(10, 1_000, 10)))
                .await;
            black_box(outcomes)
        });
    });

    group.finish();
}

fn bench_settlement(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("settlement");
    group.sample_size(10);

    group.bench_function("1k_purchase_and_settle", |b| {
        b.to_async(&rt).iter(|| async {
            let engine = engine(10, 100).await;
            engine.start();
            let outcomes = engine
                .run(tokio_stream::iter(PurchaseGenerator::new(10, 1_000, 0)))
                .await;
            engine.wait_settled().await;
            engine.shutdown().await;
            black_box(outcomes)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_resource,
    bench_spread_resources,
    bench_with_duplicates,
    bench_settlement,
);

criterion_main!(benches);
