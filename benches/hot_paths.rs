use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use atomflow::clock::FakeClock;
use atomflow::config::{ConfigKey, TelemetryConfig};
use atomflow::event::field::Value;
use atomflow::event::parse::{parse_event, serialize_event};
use atomflow::event::EventBuilder;
use atomflow::manager::MetricsManager;
use atomflow::puller::PullerManager;
use atomflow::stats::{EngineStats, ShardOffsetProvider};

const CONFIG: &str = r#"
id: 1
atom_matchers:
  - id: 100
    simple:
      atom_id: 10
  - id: 101
    simple:
      atom_id: 20
  - id: 102
    simple:
      atom_id: 21
conditions:
  - id: 500
    simple:
      start: 101
      stop: 102
count_metrics:
  - id: 1000
    what: 100
    condition: 500
    bucket: 1s
    dimensions_in_what:
      atom_id: 10
      fields:
        - field: 1
kll_metrics:
  - id: 5000
    what: 100
    bucket: 1s
    value_fields:
      atom_id: 10
      fields:
        - field: 2
"#;

fn build_manager() -> Arc<MetricsManager> {
    let config: TelemetryConfig = serde_yaml::from_str(CONFIG).expect("config parses");
    let clock = Arc::new(FakeClock::new(0));
    let stats = Arc::new(EngineStats::new());
    let puller = Arc::new(PullerManager::new(clock.clone(), stats.clone()));
    MetricsManager::new(
        &config,
        ConfigKey::new(0, 1),
        0,
        clock,
        stats,
        Arc::new(ShardOffsetProvider::default()),
        puller,
    )
    .expect("config installs")
}

fn bench_parse_event(c: &mut Criterion) {
    let event = EventBuilder::new(10, 123_456_789)
        .uid(1000)
        .field(Value::Int(7))
        .field(Value::Long(42_000))
        .field(Value::Str("wlan0".into()))
        .build();
    let bytes = serialize_event(&event);

    c.bench_function("parse_event", |b| {
        b.iter(|| parse_event(black_box(&bytes)).expect("parses"))
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let manager = build_manager();
    let mut ts = 0i64;

    c.bench_function("dispatch_count_and_kll", |b| {
        b.iter(|| {
            ts += 1_000;
            let event = EventBuilder::new(10, ts)
                .field(Value::Int((ts % 16) as i32))
                .field(Value::Long(ts % 4_096))
                .build();
            manager.on_event(black_box(&event));
        })
    });
}

fn bench_dispatch_unmatched_tag(c: &mut Criterion) {
    let manager = build_manager();
    let event = EventBuilder::new(9_999, 1).build();

    c.bench_function("dispatch_unmatched_tag", |b| {
        b.iter(|| manager.on_event(black_box(&event)))
    });
}

criterion_group!(
    benches,
    bench_parse_event,
    bench_dispatch,
    bench_dispatch_unmatched_tag
);
criterion_main!(benches);
