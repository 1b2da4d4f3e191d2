//! Black-box pipeline tests: config in, events in, report bytes out.

use std::collections::HashMap;
use std::sync::Arc;

use atomflow::clock::{FakeClock, NS_PER_SEC};
use atomflow::config::{ConfigKey, TelemetryConfig};
use atomflow::event::field::Value;
use atomflow::event::parse::{parse_event, serialize_event};
use atomflow::event::{Event, EventBuilder};
use atomflow::manager::MetricsManager;
use atomflow::puller::{AtomPuller, PullReceiver, PullResult, PullerManager};
use atomflow::report::{fields, ProtoReader};
use atomflow::stats::{EngineStats, ShardOffsetProvider};

struct Harness {
    clock: Arc<FakeClock>,
    stats: Arc<EngineStats>,
    puller: Arc<PullerManager>,
    manager: Arc<MetricsManager>,
}

fn harness(yaml: &str) -> Harness {
    // RUST_LOG=debug makes failing scenarios narrate themselves.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let config: TelemetryConfig = serde_yaml::from_str(yaml).expect("config yaml parses");
    let clock = Arc::new(FakeClock::new(0));
    let stats = Arc::new(EngineStats::new());
    let puller = Arc::new(PullerManager::new(clock.clone(), stats.clone()));
    let manager = MetricsManager::new(
        &config,
        ConfigKey::new(1000, 1),
        0,
        clock.clone(),
        stats.clone(),
        Arc::new(ShardOffsetProvider::default()),
        puller.clone(),
    )
    .expect("config installs");
    Harness {
        clock,
        stats,
        puller,
        manager,
    }
}

fn seconds(s: f64) -> i64 {
    (s * NS_PER_SEC as f64) as i64
}

fn uid_event(atom_id: i32, ts: i64, uid: i32) -> Event {
    EventBuilder::new(atom_id, ts)
        .uid(uid)
        .field(Value::Int(uid))
        .build()
}

/// First report record in a length-delimited dump.
fn first_record(dump: &[u8]) -> Vec<u8> {
    let records = ProtoReader::records(dump);
    assert!(!records.is_empty(), "dump has at least one record");
    records[0].to_vec()
}

fn nested(buf: &[u8], field: u32) -> Option<Vec<u8>> {
    ProtoReader::first(buf, field).and_then(|v| v.as_bytes().map(|b| b.to_vec()))
}

fn all_nested(buf: &[u8], field: u32) -> Vec<Vec<u8>> {
    ProtoReader::all(buf, field)
        .into_iter()
        .filter_map(|v| v.as_bytes().map(|b| b.to_vec()))
        .collect()
}

// --- Scenario: count metric, one dimension ---

const COUNT_CONFIG: &str = r#"
id: 1
atom_matchers:
  - id: 100
    simple:
      atom_id: 10
count_metrics:
  - id: 1000
    what: 100
    bucket: 1s
    dimensions_in_what:
      atom_id: 10
      fields:
        - field: 1
"#;

#[test]
fn test_count_metric_one_dimension() {
    let h = harness(COUNT_CONFIG);
    for t in [0.1, 0.3, 0.5, 1.2, 1.8] {
        h.manager.on_event(&uid_event(10, seconds(t), 1));
    }

    let dump = h.manager.on_dump_report(seconds(2.1), false, false);
    let record = first_record(&dump);
    assert_eq!(
        ProtoReader::first(&record, fields::REPORT_ID).and_then(|v| v.as_i64()),
        Some(1000)
    );

    let wrapper = nested(&record, fields::REPORT_COUNT_METRICS).expect("count wrapper");
    assert!(all_nested(&wrapper, fields::WRAPPER_SKIPPED).is_empty());

    let data = all_nested(&wrapper, fields::WRAPPER_DATA);
    assert_eq!(data.len(), 1, "one dimension");

    let buckets = all_nested(&data[0], fields::DATA_BUCKET_INFO);
    assert_eq!(buckets.len(), 2, "two full buckets");
    let counts: Vec<i64> = buckets
        .iter()
        .filter_map(|b| ProtoReader::first(b, fields::BUCKET_SCALAR).and_then(|v| v.as_i64()))
        .collect();
    assert_eq!(counts, vec![3, 2]);
    // Full buckets are identified by bucket number, not explicit bounds.
    for b in &buckets {
        assert!(ProtoReader::first(b, fields::BUCKET_NUM).is_some());
        assert!(ProtoReader::first(b, fields::BUCKET_START_MILLIS).is_none());
    }
}

// --- Scenario: pulled gauge, one random sample per bucket ---

struct ThreeAtomPuller;

impl AtomPuller for ThreeAtomPuller {
    fn pull(&self, tag_id: i32) -> anyhow::Result<Vec<Event>> {
        Ok((1..=3)
            .map(|uid| {
                EventBuilder::new(tag_id, 0)
                    .uid(uid)
                    .field(Value::Int(uid))
                    .field(Value::Long(i64::from(uid) * 11))
                    .build()
            })
            .collect())
    }
}

const GAUGE_CONFIG: &str = r#"
id: 1
atom_matchers:
  - id: 100
    simple:
      atom_id: 42
gauge_metrics:
  - id: 2000
    what: 100
    pull_tag_id: 42
    bucket: 10s
    sampling_type: random_one_sample
    dimensions_in_what:
      atom_id: 42
      fields:
        - field: 1
"#;

#[test]
fn test_pulled_gauge_random_one_sample() {
    let h = harness(GAUGE_CONFIG);
    h.puller.register_puller(42, Arc::new(ThreeAtomPuller));

    // The initial sample was requested at creation before the puller
    // existed; request it again at the start of the first bucket.
    h.manager
        .on_pulled_data(2000, ThreeAtomPuller.pull(42).expect("pull"), PullResult::Success, 0);

    for t in [10.0, 20.0] {
        h.clock.set_ns(seconds(t));
        h.puller.fire_alarms(seconds(t));
    }

    let dump = h.manager.on_dump_report(seconds(25.5), false, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_GAUGE_METRICS).expect("gauge wrapper");

    let data = all_nested(&wrapper, fields::WRAPPER_DATA);
    assert_eq!(data.len(), 3, "three pulled dimensions");

    for dim in &data {
        let buckets = all_nested(dim, fields::DATA_BUCKET_INFO);
        assert_eq!(buckets.len(), 2, "two full buckets; the partial one is dropped");
        for bucket in &buckets {
            let atoms = all_nested(bucket, fields::BUCKET_PAYLOAD);
            assert_eq!(atoms.len(), 1, "exactly one sample per dimension per bucket");
        }
    }
}

// --- Scenario: dimension guardrail ---

const GUARDRAIL_CONFIG: &str = r#"
id: 1
atom_matchers:
  - id: 100
    simple:
      atom_id: 10
count_metrics:
  - id: 1000
    what: 100
    bucket: 60s
    dimensions_in_what:
      atom_id: 10
      fields:
        - field: 1
    guardrail:
      soft_limit: 3
      hard_limit: 5
"#;

#[test]
fn test_dimension_guardrail() {
    let h = harness(GUARDRAIL_CONFIG);
    for uid in 1..=8 {
        h.manager.on_event(&uid_event(10, seconds(0.1) * i64::from(uid), uid));
    }

    let dump = h.manager.on_dump_report(seconds(10.0), true, false);
    let record = first_record(&dump);
    assert_eq!(
        ProtoReader::first(&record, fields::REPORT_DIMENSION_GUARDRAIL_HIT)
            .and_then(|v| v.as_u64()),
        Some(1)
    );

    let wrapper = nested(&record, fields::REPORT_COUNT_METRICS).expect("count wrapper");
    let data = all_nested(&wrapper, fields::WRAPPER_DATA);
    assert_eq!(data.len(), 5, "dimensions beyond the hard limit are dropped");

    let snap = h.stats.snapshot();
    let dim_stats = snap.dimension_stats.get(&1000).expect("dimension stats");
    assert_eq!(dim_stats.soft_limit_notes, 6);
    assert_eq!(dim_stats.hard_limit_hits, 1);
}

// --- Scenario: bucket too small to keep ---

const SMALL_BUCKET_CONFIG: &str = r#"
id: 1
atom_matchers:
  - id: 100
    simple:
      atom_id: 10
count_metrics:
  - id: 1000
    what: 100
    bucket: 60s
    min_bucket_size: 30s
    split_bucket_for_app_upgrade: true
"#;

#[test]
fn test_bucket_too_small_is_skipped() {
    let h = harness(SMALL_BUCKET_CONFIG);
    h.manager.notify_app_upgrade(seconds(10.0));

    let dump = h.manager.on_dump_report(seconds(11.0), false, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_COUNT_METRICS).expect("count wrapper");

    assert!(all_nested(&wrapper, fields::WRAPPER_DATA).is_empty());
    let skipped = all_nested(&wrapper, fields::WRAPPER_SKIPPED);
    assert_eq!(skipped.len(), 1);
    assert_eq!(
        ProtoReader::first(&skipped[0], fields::SKIPPED_START_MILLIS).and_then(|v| v.as_i64()),
        Some(0)
    );
    assert_eq!(
        ProtoReader::first(&skipped[0], fields::SKIPPED_END_MILLIS).and_then(|v| v.as_i64()),
        Some(10_000)
    );
    let drops = all_nested(&skipped[0], fields::SKIPPED_DROP_EVENT);
    assert_eq!(drops.len(), 1);
    assert_eq!(
        ProtoReader::first(&drops[0], fields::DROP_REASON).and_then(|v| v.as_i64()),
        Some(1), // BUCKET_TOO_SMALL
    );
}

// --- Scenario: pulled value with a late pull ---

const VALUE_CONFIG: &str = r#"
id: 1
atom_matchers:
  - id: 100
    simple:
      atom_id: 42
value_metrics:
  - id: 3000
    what: 100
    pull_tag_id: 42
    bucket: 10s
    max_pull_delay: 2s
    value_fields:
      atom_id: 42
      fields:
        - field: 2
    aggregation_types: [sum]
"#;

#[test]
fn test_pulled_value_late_pull_discarded() {
    let h = harness(VALUE_CONFIG);

    // The pull was requested at t=10s but arrives at t=13s.
    h.clock.set_ns(seconds(13.0));
    let atoms = vec![EventBuilder::new(42, 0)
        .field(Value::Int(1))
        .field(Value::Long(77))
        .build()];
    h.manager
        .on_pulled_data(3000, atoms, PullResult::Success, seconds(10.0));

    let snap = h.stats.snapshot();
    let tag = snap.pull_stats.get(&42).expect("pull stats for tag");
    assert_eq!(tag.exceed_max_delay, 1);

    let dump = h.manager.on_dump_report(seconds(14.0), true, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_VALUE_METRICS).expect("value wrapper");

    assert!(all_nested(&wrapper, fields::WRAPPER_DATA).is_empty());
    let skipped = all_nested(&wrapper, fields::WRAPPER_SKIPPED);
    assert_eq!(skipped.len(), 1);
    let drops = all_nested(&skipped[0], fields::SKIPPED_DROP_EVENT);
    let reasons: Vec<i64> = drops
        .iter()
        .filter_map(|d| ProtoReader::first(d, fields::DROP_REASON).and_then(|v| v.as_i64()))
        .collect();
    assert!(reasons.contains(&5), "PULL_DELAYED recorded: {reasons:?}");
}

// --- Scenario: config update with an unchanged metric ---

fn renamed_matcher_config() -> &'static str {
    r#"
id: 1
atom_matchers:
  - id: 999
    simple:
      atom_id: 10
count_metrics:
  - id: 1000
    what: 999
    bucket: 1s
    dimensions_in_what:
      atom_id: 10
      fields:
        - field: 1
"#
}

#[test]
fn test_config_update_same_content_hash_preserves_counts() {
    let h = harness(COUNT_CONFIG);
    for t in [0.1, 0.2, 0.3] {
        h.manager.on_event(&uid_event(10, seconds(t), 1));
    }

    let updated: TelemetryConfig =
        serde_yaml::from_str(renamed_matcher_config()).expect("updated config parses");
    h.manager
        .on_config_updated(&updated, seconds(0.5))
        .expect("update installs");
    h.manager.register_pullers();

    // The renamed matcher keeps matching; counts continue accruing.
    h.manager.on_event(&uid_event(10, seconds(0.7), 1));

    let dump = h.manager.on_dump_report(seconds(2.0), true, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_COUNT_METRICS).expect("count wrapper");
    let data = all_nested(&wrapper, fields::WRAPPER_DATA);
    assert_eq!(data.len(), 1);

    let total: i64 = all_nested(&data[0], fields::DATA_BUCKET_INFO)
        .iter()
        .filter_map(|b| ProtoReader::first(b, fields::BUCKET_SCALAR).and_then(|v| v.as_i64()))
        .sum();
    assert_eq!(total, 4, "counts survive the update");
}

// --- Empty-report law ---

#[test]
fn test_empty_producer_emits_only_id_and_active() {
    let h = harness(COUNT_CONFIG);
    let dump = h.manager.on_dump_report(seconds(0.2), true, false);
    let record = first_record(&dump);

    let present: Vec<u32> = ProtoReader::new(&record).map(|(f, _)| f).collect();
    assert_eq!(present, vec![fields::REPORT_ID, fields::REPORT_IS_ACTIVE]);

    // Idempotent under erase=false.
    let again = h.manager.on_dump_report(seconds(0.2), true, false);
    assert_eq!(dump, again);
}

// --- Condition gating ---

const CONDITION_CONFIG: &str = r#"
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
      initial_value: "false"
count_metrics:
  - id: 1000
    what: 100
    condition: 500
    bucket: 10s
"#;

#[test]
fn test_condition_gates_counting() {
    let h = harness(CONDITION_CONFIG);

    // Before the condition starts nothing counts.
    h.manager.on_event(&uid_event(10, seconds(0.1), 1));
    // Condition turns true.
    h.manager.on_event(&EventBuilder::new(20, seconds(0.2)).build());
    h.manager.on_event(&uid_event(10, seconds(0.3), 1));
    h.manager.on_event(&uid_event(10, seconds(0.4), 1));
    // Condition turns false.
    h.manager.on_event(&EventBuilder::new(21, seconds(0.5)).build());
    h.manager.on_event(&uid_event(10, seconds(0.6), 1));

    let dump = h.manager.on_dump_report(seconds(11.0), false, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_COUNT_METRICS).expect("count wrapper");
    let data = all_nested(&wrapper, fields::WRAPPER_DATA);
    assert_eq!(data.len(), 1);
    let counts: Vec<i64> = all_nested(&data[0], fields::DATA_BUCKET_INFO)
        .iter()
        .filter_map(|b| ProtoReader::first(b, fields::BUCKET_SCALAR).and_then(|v| v.as_i64()))
        .collect();
    assert_eq!(counts, vec![2]);
}

// --- Activation gating ---

const ACTIVATION_CONFIG: &str = r#"
id: 1
atom_matchers:
  - id: 100
    simple:
      atom_id: 10
  - id: 103
    simple:
      atom_id: 30
count_metrics:
  - id: 1000
    what: 100
    bucket: 10s
activations:
  - metric_id: 1000
    activations:
      - activation_matcher: 103
        ttl: 2s
"#;

#[test]
fn test_activation_ttl() {
    let h = harness(ACTIVATION_CONFIG);
    assert_eq!(h.manager.is_metric_active(1000), Some(false));

    // Ignored: not yet active.
    h.manager.on_event(&uid_event(10, seconds(0.5), 1));

    // Activate, then count within the TTL.
    h.manager.on_event(&EventBuilder::new(30, seconds(1.0)).build());
    assert_eq!(h.manager.is_metric_active(1000), Some(true));
    h.manager.on_event(&uid_event(10, seconds(1.5), 1));
    h.manager.on_event(&uid_event(10, seconds(2.5), 1));

    // TTL expired; this event deactivates and is not counted.
    h.manager.on_event(&uid_event(10, seconds(4.0), 1));
    assert_eq!(h.manager.is_metric_active(1000), Some(false));

    let dump = h.manager.on_dump_report(seconds(11.0), false, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_COUNT_METRICS).expect("count wrapper");
    let data = all_nested(&wrapper, fields::WRAPPER_DATA);
    assert_eq!(data.len(), 1);
    let total: i64 = all_nested(&data[0], fields::DATA_BUCKET_INFO)
        .iter()
        .filter_map(|b| ProtoReader::first(b, fields::BUCKET_SCALAR).and_then(|v| v.as_i64()))
        .sum();
    assert_eq!(total, 2);
}

// --- Duration metric ---

const DURATION_CONFIG: &str = r#"
id: 1
atom_matchers:
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
duration_metrics:
  - id: 4000
    what: 500
    aggregation: sum
    bucket: 10s
"#;

#[test]
fn test_duration_metric_sum() {
    let h = harness(DURATION_CONFIG);
    h.manager.on_event(&EventBuilder::new(20, seconds(1.0)).build());
    h.manager.on_event(&EventBuilder::new(21, seconds(3.0)).build());

    let dump = h.manager.on_dump_report(seconds(10.5), false, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_DURATION_METRICS).expect("duration wrapper");
    let data = all_nested(&wrapper, fields::WRAPPER_DATA);
    assert_eq!(data.len(), 1);
    let buckets = all_nested(&data[0], fields::DATA_BUCKET_INFO);
    assert_eq!(buckets.len(), 1);
    assert_eq!(
        ProtoReader::first(&buckets[0], fields::BUCKET_SCALAR).and_then(|v| v.as_i64()),
        Some(2 * NS_PER_SEC)
    );
}

// --- KLL metric ---

const KLL_CONFIG: &str = r#"
id: 1
atom_matchers:
  - id: 100
    simple:
      atom_id: 10
kll_metrics:
  - id: 5000
    what: 100
    bucket: 10s
    value_fields:
      atom_id: 10
      fields:
        - field: 1
"#;

#[test]
fn test_kll_metric_serializes_sketch() {
    let h = harness(KLL_CONFIG);
    for i in 1..=100 {
        h.manager.on_event(
            &EventBuilder::new(10, seconds(0.01) * i64::from(i))
                .field(Value::Int(i))
                .build(),
        );
    }

    let dump = h.manager.on_dump_report(seconds(11.0), false, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_KLL_METRICS).expect("kll wrapper");
    let data = all_nested(&wrapper, fields::WRAPPER_DATA);
    assert_eq!(data.len(), 1);
    let buckets = all_nested(&data[0], fields::DATA_BUCKET_INFO);
    assert_eq!(buckets.len(), 1);
    let sketches = all_nested(&buckets[0], fields::BUCKET_PAYLOAD);
    assert_eq!(sketches.len(), 1);
    let bytes = nested(&sketches[0], fields::KLL_SERIALIZED_SKETCH).expect("sketch bytes");
    // Serialized sketch carries n = 100.
    assert_eq!(&bytes[2..10], &100u64.to_le_bytes());
}

// --- Sampled sharding keeps a stable subset ---

const SAMPLED_CONFIG: &str = r#"
id: 1
atom_matchers:
  - id: 100
    simple:
      atom_id: 10
count_metrics:
  - id: 1000
    what: 100
    bucket: 10s
    dimensions_in_what:
      atom_id: 10
      fields:
        - field: 1
    sampling:
      sampled_what_field:
        atom_id: 10
        fields:
          - field: 1
      shard_count: 2
"#;

#[test]
fn test_sampled_sharding_deterministic() {
    let run = || {
        let h = harness(SAMPLED_CONFIG);
        for uid in 1..=20 {
            h.manager.on_event(&uid_event(10, seconds(0.01) * i64::from(uid), uid));
        }
        let dump = h.manager.on_dump_report(seconds(11.0), false, false);
        let record = first_record(&dump);
        let wrapper = nested(&record, fields::REPORT_COUNT_METRICS).expect("count wrapper");
        all_nested(&wrapper, fields::WRAPPER_DATA).len()
    };

    let first = run();
    let second = run();
    assert_eq!(first, second, "sharding is deterministic across runs");
    assert!(first > 0 && first < 20, "sharding keeps a strict subset: {first}");
}

// --- Wire parser feeding the pipeline ---

#[test]
fn test_wire_events_roundtrip_into_pipeline() {
    let h = harness(COUNT_CONFIG);
    for t in [0.1, 0.2] {
        let event = uid_event(10, seconds(t), 7);
        let bytes = serialize_event(&event);
        let parsed = parse_event(&bytes).expect("wire event parses");
        assert_eq!(parsed, event);
        h.manager.on_event(&parsed);
    }

    let dump = h.manager.on_dump_report(seconds(2.0), false, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_COUNT_METRICS).expect("count wrapper");
    assert_eq!(all_nested(&wrapper, fields::WRAPPER_DATA).len(), 1);
}

// --- Memory pressure drops past buckets and surfaces the reason ---

#[test]
fn test_memory_pressure_drop() {
    let h = harness(COUNT_CONFIG);
    for t in [0.1, 0.3] {
        h.manager.on_event(&uid_event(10, seconds(t), 1));
    }
    // Close the bucket so there is past data to drop.
    h.manager.on_event(&uid_event(10, seconds(1.5), 1));

    assert!(h.manager.enforce_memory_limit(0, seconds(2.0)));
    let snap = h.stats.snapshot();
    assert_eq!(snap.bucket_drops.get(&1000), Some(&1));

    let dump = h.manager.on_dump_report(seconds(3.0), true, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_COUNT_METRICS).expect("count wrapper");
    let skipped = all_nested(&wrapper, fields::WRAPPER_SKIPPED);
    let reasons: Vec<i64> = skipped
        .iter()
        .flat_map(|s| all_nested(s, fields::SKIPPED_DROP_EVENT))
        .filter_map(|d| ProtoReader::first(&d, fields::DROP_REASON).and_then(|v| v.as_i64()))
        .collect();
    assert!(reasons.contains(&12), "NO_DUMP_BECAUSE_MEMORY surfaced: {reasons:?}");
}

// --- Metadata hooks are idempotent ---

#[test]
fn test_metadata_roundtrip() {
    let h = harness(COUNT_CONFIG);
    let metadata = h.manager.write_metadata();
    assert!(metadata.contains_key(&1000));
    h.manager.load_metadata(metadata.clone());
    h.manager.load_metadata(metadata);

    // Absent input is tolerated.
    h.manager.load_metadata(HashMap::new());
}

// --- Pull failure path ---

struct BrokenPuller;

impl AtomPuller for BrokenPuller {
    fn pull(&self, _tag_id: i32) -> anyhow::Result<Vec<Event>> {
        anyhow::bail!("hardware went away")
    }
}

#[test]
fn test_pull_failure_invalidates_value_bucket() {
    let h = harness(VALUE_CONFIG);
    h.puller.register_puller(42, Arc::new(BrokenPuller));

    h.clock.set_ns(seconds(10.0));
    h.puller.fire_alarms(seconds(10.0));

    let dump = h.manager.on_dump_report(seconds(12.0), true, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_VALUE_METRICS).expect("value wrapper");
    let skipped = all_nested(&wrapper, fields::WRAPPER_SKIPPED);
    let reasons: Vec<i64> = skipped
        .iter()
        .flat_map(|s| all_nested(s, fields::SKIPPED_DROP_EVENT))
        .filter_map(|d| ProtoReader::first(&d, fields::DROP_REASON).and_then(|v| v.as_i64()))
        .collect();
    assert!(reasons.contains(&4), "PULL_FAILED surfaced: {reasons:?}");

    let snap = h.stats.snapshot();
    assert_eq!(snap.pull_stats.get(&42).map(|p| p.pull_failures), Some(1));
}

#[test]
fn test_drop_data_preserves_in_flight_bucket() {
    let h = harness(COUNT_CONFIG);
    h.manager.on_event(&uid_event(10, seconds(0.1), 1));
    h.manager.on_event(&uid_event(10, seconds(1.2), 1)); // closes bucket 0

    h.manager.drop_data(seconds(1.5));

    // The in-flight bucket keeps aggregating after the drop.
    h.manager.on_event(&uid_event(10, seconds(1.7), 1));
    let dump = h.manager.on_dump_report(seconds(2.5), false, false);
    let record = first_record(&dump);
    let wrapper = nested(&record, fields::REPORT_COUNT_METRICS).expect("count wrapper");
    let data = all_nested(&wrapper, fields::WRAPPER_DATA);
    assert_eq!(data.len(), 1);
    let counts: Vec<i64> = all_nested(&data[0], fields::DATA_BUCKET_INFO)
        .iter()
        .filter_map(|b| ProtoReader::first(b, fields::BUCKET_SCALAR).and_then(|v| v.as_i64()))
        .collect();
    assert_eq!(counts, vec![2], "bucket 1 survives the drop; bucket 0 is gone");
}
