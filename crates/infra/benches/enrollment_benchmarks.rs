use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use chrono::Utc;
use campus_catalog::{Course, CourseCommand, CourseId, CreateCourse};
use campus_core::{AggregateId, UserId};
use campus_events::{EventEnvelope, InMemoryEventBus};
use campus_infra::command_dispatcher::CommandDispatcher;
use campus_infra::enrollment::EnrollmentService;
use campus_infra::event_store::InMemoryEventStore;

type Store = Arc<InMemoryEventStore>;
type Bus = Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>>;

fn setup(cost: u64) -> (EnrollmentService<Store, Bus>, CourseId) {
    let store: Store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());

    let dispatcher = CommandDispatcher::new(store.clone(), bus.clone());
    let course_id = CourseId::new(AggregateId::new());
    dispatcher
        .dispatch::<Course>(
            course_id.0,
            "catalog.course",
            CourseCommand::CreateCourse(CreateCourse {
                course_id,
                creator: UserId::new(),
                name: "Benchmark Course".to_string(),
                cost,
                occurred_at: Utc::now(),
            }),
            |id| Course::empty(CourseId::new(id)),
        )
        .expect("course creation failed");

    (EnrollmentService::new(store, bus), course_id)
}

fn bench_purchase_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("purchase_latency");

    group.bench_function("single_purchase", |b| {
        b.iter_batched(
            || setup(0),
            |(service, course_id)| {
                service
                    .purchase(black_box(UserId::new()), black_box(course_id))
                    .unwrap()
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_roster_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("roster_growth");

    // Rehydration cost grows with the roster stream; measure how purchase
    // latency degrades as the course fills up.
    for prefill in [0usize, 50, 100] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(prefill),
            &prefill,
            |b, &prefill| {
                b.iter_batched(
                    || {
                        let (service, course_id) = setup(0);
                        for _ in 0..prefill {
                            service.purchase(UserId::new(), course_id).unwrap();
                        }
                        (service, course_id)
                    },
                    |(service, course_id)| {
                        service
                            .purchase(black_box(UserId::new()), black_box(course_id))
                            .unwrap()
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_purchase_latency, bench_roster_growth);
criterion_main!(benches);
