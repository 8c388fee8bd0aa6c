use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conductor_core::{JobId, JobRequest, OwnerId, Priority};
use conductor_events::{InMemoryEventBus, JobLifecycleEvent};
use conductor_infra::QueueConfig;
use conductor_infra::jobs::{
    DedupePolicy, DirectExecution, InMemoryJobStore, JobContext, JobDefinition,
    JobDefinitionRegistry, JobError, JobRunner, LaneConfig, LaneScheduler, QueueManager,
    RetryPolicy,
};
use serde_json::{Value as JsonValue, json};

struct Noop;

#[async_trait]
impl JobRunner for Noop {
    async fn run(&self, _ctx: JobContext) -> Result<JsonValue, JobError> {
        Ok(JsonValue::Null)
    }
}

fn owners(count: usize) -> Vec<OwnerId> {
    (0..count)
        .map(|i| OwnerId::parse(format!("owner-{i}")).unwrap())
        .collect()
}

/// Fill `owners` lanes with `per_owner` jobs each, alternating priority classes.
fn filled_scheduler(owners: &[OwnerId], per_owner: usize) -> LaneScheduler {
    let mut lanes = LaneScheduler::new(LaneConfig {
        max_interactive_burst: 3,
        background_aging: Duration::ZERO,
    });
    let now = Utc::now();
    for i in 0..per_owner {
        for owner in owners {
            let priority = if i % 2 == 0 {
                Priority::Interactive
            } else {
                Priority::Background
            };
            lanes.push(owner.clone(), JobId::new(), priority, now, None);
        }
    }
    lanes
}

fn bench_lane_pick(c: &mut Criterion) {
    let mut group = c.benchmark_group("lane_pick");

    for owner_count in [1, 10, 100, 1000].iter() {
        let owners = owners(*owner_count);
        group.throughput(Throughput::Elements(*owner_count as u64 * 4));
        group.bench_with_input(
            BenchmarkId::new("drain_all_lanes", owner_count),
            &owners,
            |b, owners| {
                b.iter(|| {
                    let mut lanes = filled_scheduler(owners, 4);
                    let now = Utc::now();
                    while let Some(pick) = lanes.pick_next(now) {
                        lanes.finish(&pick.owner_id, pick.job_id);
                        black_box(pick);
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_retry_delay(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_delay");

    let policies = [
        (
            "exponential",
            RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(60)),
        ),
        (
            "immediate_then_linear",
            RetryPolicy::immediate_then_linear(10, Duration::from_secs(5), Duration::from_secs(60)),
        ),
        (
            "exponential_jitter",
            RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(60))
                .with_jitter(0.2),
        ),
    ];

    for (name, policy) in policies.iter() {
        group.bench_with_input(BenchmarkId::new("attempts_1_to_10", name), policy, |b, policy| {
            b.iter(|| {
                for attempt in 1..=10 {
                    black_box(policy.delay_for_attempt(black_box(attempt)));
                }
            });
        });
    }

    group.finish();
}

fn queue(registry: JobDefinitionRegistry) -> QueueManager {
    let bus: Arc<InMemoryEventBus<JobLifecycleEvent>> = Arc::new(InMemoryEventBus::new());
    QueueManager::new(
        InMemoryJobStore::arc(),
        Arc::new(registry),
        bus,
        Arc::new(DirectExecution),
        QueueConfig::default(),
    )
}

fn bench_enqueue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_throughput");
    group.throughput(Throughput::Elements(1));

    let registry = || {
        JobDefinitionRegistry::new()
            .with(JobDefinition::new("plain", Arc::new(Noop)))
            .unwrap()
            .with(
                JobDefinition::new("deduped", Arc::new(Noop))
                    .with_dedupe(DedupePolicy::single_flight(DedupePolicy::field_key("threadId"))),
            )
            .unwrap()
    };
    let owner = OwnerId::parse("bench").unwrap();

    group.bench_function("fresh_jobs", |b| {
        let queue = queue(registry());
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let request = JobRequest::new("plain", owner.clone(), json!({ "n": n }));
            black_box(queue.enqueue(request).unwrap());
        });
    });

    // Every submission after the first collapses onto the in-flight job.
    group.bench_function("single_flight_hits", |b| {
        let queue = queue(registry());
        let request = JobRequest::new("deduped", owner.clone(), json!({ "threadId": "t" }));
        queue.enqueue(request.clone()).unwrap();
        b.iter(|| black_box(queue.enqueue(request.clone()).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lane_pick,
    bench_retry_delay,
    bench_enqueue_throughput
);
criterion_main!(benches);
