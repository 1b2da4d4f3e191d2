//! Gauge metric: atom snapshot capture, pushed or pulled.

use std::collections::HashMap;

use tracing::warn;

use crate::condition::ConditionState;
use crate::config::GaugeSamplingType;
use crate::event::field::{FieldValue, Matcher, MetricDimensionKey};
use crate::event::{truncate_timestamp_if_necessary, Event};
use crate::puller::PullResult;
use crate::report::{fields, write_atom, ProtoWriter};

use super::{
    flush_if_needed, hit_dimension_guardrail, keep_random_sample, match_pulled_events,
    write_bucket_bounds, write_data_dimension, write_skipped_buckets, CommonState,
    DispatchContext, KindState, ProducerMeta, ProducerState,
};

#[derive(Debug)]
pub struct GaugeMeta {
    pub atom_id: i32,
    pub pull_tag_id: Option<i32>,
    pub trigger_matcher_index: Option<usize>,
    pub trigger_atom_id: Option<i32>,
    pub sampling_type: GaugeSamplingType,
    pub atoms_per_dimension_limit: usize,
    /// Gauge field filter; `None` captures every field.
    pub field_filter: Option<Vec<Matcher>>,
    pub max_pull_delay_ns: i64,
    pub sampling_percentage: u32,
}

impl GaugeMeta {
    pub fn is_pulled(&self) -> bool {
        self.pull_tag_id.is_some()
    }

    fn is_random_n_samples(&self) -> bool {
        matches!(
            self.sampling_type,
            GaugeSamplingType::RandomOneSample | GaugeSamplingType::FirstNSamples
        )
    }

    /// Whether this producer wants bucket-aligned periodic pulls.
    pub fn registers_for_periodic_pulls(&self) -> bool {
        self.is_pulled() && self.is_random_n_samples()
    }
}

#[derive(Debug, Default)]
pub struct GaugeState {
    pub current: HashMap<MetricDimensionKey, Vec<GaugeAtom>>,
    pub past: HashMap<MetricDimensionKey, Vec<GaugeBucket>>,
}

#[derive(Debug, Clone)]
pub struct GaugeAtom {
    pub fields: Vec<FieldValue>,
    pub elapsed_ns: i64,
}

#[derive(Debug)]
pub struct GaugeBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    /// Unique atom value trees with the timestamps they occurred at.
    pub aggregated: Vec<(Vec<FieldValue>, Vec<i64>)>,
}

impl GaugeState {
    pub fn byte_size(&self) -> usize {
        let past: usize = self
            .past
            .values()
            .flat_map(|buckets| buckets.iter())
            .map(|b| {
                b.aggregated
                    .iter()
                    .map(|(values, ts)| values.len() * 24 + ts.len() * 8)
                    .sum::<usize>()
            })
            .sum();
        let current: usize = self
            .current
            .values()
            .flat_map(|atoms| atoms.iter())
            .map(|a| a.fields.len() * 24 + 8)
            .sum();
        past + current
    }
}

/// The fields a captured atom keeps: the declared filter (or all), minus
/// the dimension fields, which the report carries separately.
fn gauge_fields(meta: &ProducerMeta, m: &GaugeMeta, event: &Event) -> Vec<FieldValue> {
    let mut fields: Vec<FieldValue> = match &m.field_filter {
        Some(filter) => event
            .values()
            .iter()
            .filter(|v| filter.iter().any(|f| f.matches(v.path)))
            .cloned()
            .collect(),
        None => event.values().to_vec(),
    };
    fields.retain(|v| !meta.dimensions.iter().any(|d| d.matches(v.path)));
    fields
}

/// Pull, filter through the what matcher, and feed the hits back in.
/// Only call with the condition true and the metric active.
fn pull_and_match(
    meta: &ProducerMeta,
    m: &GaugeMeta,
    state: &mut ProducerState,
    timestamp_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    let trigger = match m.sampling_type {
        // One random sample per bucket: skip when this bucket already
        // captured anything. The emptiness check is per producer, not
        // per dimension.
        GaugeSamplingType::RandomOneSample => match &state.kind {
            KindState::Gauge(k) => k.current.is_empty(),
            _ => false,
        },
        GaugeSamplingType::ConditionChangeToTrue | GaugeSamplingType::FirstNSamples => true,
        GaugeSamplingType::AllConditionChanges => true,
    };
    if !trigger {
        return;
    }
    let Some(puller) = ctx.puller else {
        return;
    };
    let Some(tag_id) = m.pull_tag_id else {
        return;
    };
    let events = match puller.pull(tag_id) {
        Ok(events) => events,
        Err(e) => {
            warn!(tag_id, metric_id = meta.metric_id, error = %e, "gauge pull failed");
            return;
        }
    };
    let pull_delay_ns = ctx.clock.elapsed_ns() - timestamp_ns;
    ctx.stats.note_pull_delay(tag_id, pull_delay_ns);
    if pull_delay_ns > m.max_pull_delay_ns {
        warn!(tag_id, metric_id = meta.metric_id, pull_delay_ns, "gauge pull too late");
        ctx.stats.note_pull_exceed_max_delay(tag_id);
        return;
    }

    let mut hits = Vec::new();
    match_pulled_events(meta, ctx, &events, timestamp_ns, |event| {
        hits.push(event.clone());
    });
    for event in &hits {
        consume_matched(meta, m, state, event, ctx);
    }
}

/// The shared capture path for pushed, pulled, and trigger-pulled atoms.
fn consume_matched(
    meta: &ProducerMeta,
    m: &GaugeMeta,
    state: &mut ProducerState,
    event: &Event,
    ctx: &DispatchContext<'_>,
) {
    let what_key = crate::event::field::filter_values(&meta.dimensions, event.values());
    let event_key = MetricDimensionKey::for_what(what_key);
    capture(meta, m, state, event_key, event, ctx);
}

pub(crate) fn on_matched(
    meta: &ProducerMeta,
    m: &GaugeMeta,
    state: &mut ProducerState,
    event_key: MetricDimensionKey,
    condition: ConditionState,
    event: &Event,
    ctx: &DispatchContext<'_>,
) {
    if !condition.is_true() {
        return;
    }
    if !m.is_pulled() && !keep_random_sample(&mut state.common, m.sampling_percentage) {
        return;
    }
    let ts = event.elapsed_ns();
    if ts < state.common.current_bucket_start_ns {
        // Late arrival; the bucket it belongs to is gone.
        return;
    }
    flush_if_needed(meta, state, ts, ctx.stats);

    if m.trigger_atom_id == Some(event.atom_id()) {
        // Active and condition-true are already established here.
        pull_and_match(meta, m, state, ts, ctx);
        return;
    }

    capture(meta, m, state, event_key, event, ctx);
}

fn capture(
    meta: &ProducerMeta,
    m: &GaugeMeta,
    state: &mut ProducerState,
    event_key: MetricDimensionKey,
    event: &Event,
    ctx: &DispatchContext<'_>,
) {
    let (len, present) = {
        let KindState::Gauge(k) = &state.kind else {
            return;
        };
        (k.current.len(), k.current.contains_key(&event_key))
    };
    if present && m.sampling_type == GaugeSamplingType::RandomOneSample {
        // Random sampling keeps the first atom of the bucket.
        return;
    }
    if hit_dimension_guardrail(meta, &mut state.common, len, present, ctx.stats) {
        return;
    }

    let fields = gauge_fields(meta, m, event);
    let atom = GaugeAtom {
        fields,
        elapsed_ns: truncate_timestamp_if_necessary(event),
    };

    let KindState::Gauge(k) = &mut state.kind else {
        return;
    };
    let atoms = k.current.entry(event_key.clone()).or_default();
    if atoms.len() >= m.atoms_per_dimension_limit {
        return;
    }
    atoms.push(atom);

    // Anomaly detection only works with a single numeric gauge field.
    let gauge_value = atoms
        .last()
        .filter(|a| a.fields.len() == 1)
        .and_then(|a| a.fields[0].value.as_long());
    if let Some(value) = gauge_value {
        let ts = event.elapsed_ns();
        let bucket_num = state.common.current_bucket_num;
        for tracker in &mut state.common.anomaly_trackers {
            tracker.detect_and_declare(ts, bucket_num, meta.metric_id, &event_key, value);
        }
    }
}

pub(crate) fn prepare_first_bucket(
    meta: &ProducerMeta,
    m: &GaugeMeta,
    state: &mut ProducerState,
    ctx: &DispatchContext<'_>,
) {
    if state.common.condition.is_true()
        && state.common.is_active
        && m.is_pulled()
        && m.is_random_n_samples()
    {
        let ts = state.common.current_bucket_start_ns;
        pull_and_match(meta, m, state, ts, ctx);
    }
}

pub(crate) fn on_became_active(
    meta: &ProducerMeta,
    m: &GaugeMeta,
    state: &mut ProducerState,
    event_time_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    if state.common.condition.is_true() && m.is_pulled() && m.is_random_n_samples() {
        pull_and_match(meta, m, state, event_time_ns, ctx);
    }
}

pub(crate) fn on_condition_changed(
    meta: &ProducerMeta,
    m: &GaugeMeta,
    state: &mut ProducerState,
    event_time_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    flush_if_needed(meta, state, event_time_ns, ctx.stats);
    let met = state.common.condition.is_true();
    let pull = m.is_pulled()
        && match m.sampling_type {
            // Both edges sample; everything else samples the rising edge.
            GaugeSamplingType::AllConditionChanges => true,
            _ => met,
        };
    if pull {
        pull_and_match(meta, m, state, event_time_ns, ctx);
    }
}

pub(crate) fn on_sliced_condition_may_change(
    meta: &ProducerMeta,
    m: &GaugeMeta,
    state: &mut ProducerState,
    overall: bool,
    event_time_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    flush_if_needed(meta, state, event_time_ns, ctx.stats);
    // Any true slice pulls for every dimension; the trigger-atom path
    // owns pulling when a trigger is configured.
    if overall && m.is_pulled() && m.trigger_atom_id.is_none() {
        pull_and_match(meta, m, state, event_time_ns, ctx);
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn on_data_pulled(
    meta: &ProducerMeta,
    m: &GaugeMeta,
    state: &mut ProducerState,
    events: &[Event],
    result: PullResult,
    original_pull_time_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    if result != PullResult::Success || events.is_empty() {
        return;
    }
    let Some(tag_id) = m.pull_tag_id else {
        return;
    };
    let pull_delay_ns = ctx.clock.elapsed_ns() - original_pull_time_ns;
    ctx.stats.note_pull_delay(tag_id, pull_delay_ns);
    if pull_delay_ns > m.max_pull_delay_ns {
        warn!(tag_id, metric_id = meta.metric_id, pull_delay_ns, "gauge pull too late");
        ctx.stats.note_pull_exceed_max_delay(tag_id);
        return;
    }
    if !state.common.is_active || !state.common.condition.is_true() {
        return;
    }

    let mut hits = Vec::new();
    match_pulled_events(meta, ctx, events, original_pull_time_ns, |event| {
        hits.push(event.clone());
    });
    for event in &hits {
        let ts = event.elapsed_ns();
        flush_if_needed(meta, state, ts, ctx.stats);
        consume_matched(meta, m, state, event, ctx);
    }
}

pub(crate) fn close_bucket(
    kind: &mut GaugeState,
    bucket_start: i64,
    bucket_end: i64,
    persist: bool,
) -> HashMap<MetricDimensionKey, i64> {
    let current = std::mem::take(&mut kind.current);
    let mut anomaly = HashMap::new();
    for (key, atoms) in current {
        if let Some(value) = atoms
            .first()
            .filter(|a| a.fields.len() == 1)
            .and_then(|a| a.fields[0].value.as_long())
        {
            anomaly.insert(key.clone(), value);
        }
        if !persist || atoms.is_empty() {
            continue;
        }
        let mut aggregated: Vec<(Vec<FieldValue>, Vec<i64>)> = Vec::new();
        for atom in atoms {
            match aggregated.iter_mut().find(|(v, _)| *v == atom.fields) {
                Some((_, timestamps)) => timestamps.push(atom.elapsed_ns),
                None => aggregated.push((atom.fields, vec![atom.elapsed_ns])),
            }
        }
        kind.past.entry(key).or_default().push(GaugeBucket {
            start_ns: bucket_start,
            end_ns: bucket_end,
            aggregated,
        });
    }
    anomaly
}

pub(crate) fn write_report(
    meta: &ProducerMeta,
    m: &GaugeMeta,
    common: &CommonState,
    kind: &GaugeState,
    out: &mut ProtoWriter,
) {
    out.message(fields::REPORT_GAUGE_METRICS, |wrapper| {
        write_skipped_buckets(common, wrapper);
        for (key, buckets) in &kind.past {
            wrapper.message(fields::WRAPPER_DATA, |data| {
                write_data_dimension(meta, key, data);
                for bucket in buckets {
                    data.message(fields::DATA_BUCKET_INFO, |info| {
                        write_bucket_bounds(meta, bucket.start_ns, bucket.end_ns, info);
                        for (values, timestamps) in &bucket.aggregated {
                            info.message(fields::BUCKET_PAYLOAD, |agg| {
                                write_atom(agg, fields::AGGREGATED_ATOM_VALUE, m.atom_id, values);
                                for ts in timestamps {
                                    agg.int64(fields::AGGREGATED_ATOM_TIMESTAMPS, *ts);
                                }
                            });
                        }
                    });
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::field::{FieldPath, Value};

    fn atom(v: i64, ts: i64) -> GaugeAtom {
        let path = FieldPath::for_atom(10).with_index_at(0, 1);
        GaugeAtom {
            fields: vec![FieldValue::new(path, Value::Long(v))],
            elapsed_ns: ts,
        }
    }

    #[test]
    fn test_close_bucket_aggregates_identical_atoms() {
        let mut kind = GaugeState::default();
        let key = MetricDimensionKey::default();
        kind.current
            .insert(key.clone(), vec![atom(7, 100), atom(7, 200), atom(9, 300)]);

        let anomaly = close_bucket(&mut kind, 0, 1_000, true);
        assert_eq!(anomaly.get(&key), Some(&7));

        let buckets = kind.past.get(&key).expect("bucket for key");
        assert_eq!(buckets.len(), 1);
        let agg = &buckets[0].aggregated;
        assert_eq!(agg.len(), 2);
        assert_eq!(agg[0].1, vec![100, 200]);
        assert_eq!(agg[1].1, vec![300]);
    }

    #[test]
    fn test_close_bucket_discards_without_persist() {
        let mut kind = GaugeState::default();
        kind.current
            .insert(MetricDimensionKey::default(), vec![atom(7, 100)]);
        close_bucket(&mut kind, 0, 1_000, false);
        assert!(kind.past.is_empty());
        assert!(kind.current.is_empty());
    }
}
