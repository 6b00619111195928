use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use serde_json::json;
use timeline_core::{accumulate, ReplicaState, ScalarSeries, TimelineController};

fn history(len: usize) -> ScalarSeries {
    let mut series = ScalarSeries::new();
    for step in 0..len {
        let state = ReplicaState::from_json(json!({"running": true, "x": step, "y": step * 2}))
            .expect("state parses");
        series = accumulate(&series, &state.model).series;
    }
    series
}

fn bench_accumulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate");
    let next = ReplicaState::from_json(json!({"running": true, "x": 1, "y": 2}))
        .expect("state parses");

    for len in [100usize, 1_000, 10_000] {
        let series = history(len);
        group.bench_with_input(BenchmarkId::new("history", len), &series, |b, series| {
            b.iter(|| accumulate(series, &next.model))
        });
    }

    group.finish();
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");

    for steps in [100u64, 1_000] {
        group.bench_with_input(BenchmarkId::new("steps", steps), &steps, |b, &steps| {
            b.iter_batched(
                || {
                    let mut timeline = TimelineController::new();
                    timeline.init(2).expect("init");
                    timeline
                },
                |mut timeline| {
                    for step in 0..steps {
                        let payload = |x: u64| {
                            ReplicaState::from_json(json!({"running": true, "x": x, "agents": []}))
                                .expect("state parses")
                        };
                        timeline
                            .on_step_received(step, vec![payload(step), payload(step + 1)])
                            .expect("step applies");
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(series_benches, bench_accumulate, bench_ingest);
criterion_main!(series_benches);
