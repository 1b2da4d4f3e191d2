//! Numeric value metric: per-field aggregation with pulled-counter
//! support.

use std::collections::HashMap;

use tracing::warn;

use crate::condition::ConditionState;
use crate::config::ValueAggregation;
use crate::event::field::{Matcher, MetricDimensionKey, Value};
use crate::event::Event;
use crate::puller::PullResult;
use crate::report::{fields, ProtoWriter};

use super::{
    flush_if_needed, hit_dimension_guardrail, invalidate_bucket, match_pulled_events,
    write_bucket_bounds, write_data_dimension, write_skipped_buckets, BucketDropReason,
    CommonState, DispatchContext, KindState, ProducerMeta, ProducerState,
};

#[derive(Debug)]
pub struct ValueMeta {
    pub pull_tag_id: Option<i32>,
    pub value_fields: Vec<Matcher>,
    /// One aggregation per value field.
    pub aggregations: Vec<ValueAggregation>,
    pub use_absolute_value_on_reset: bool,
    pub max_pull_delay_ns: i64,
}

impl ValueMeta {
    pub fn is_pulled(&self) -> bool {
        self.pull_tag_id.is_some()
    }
}

/// Exact integer or floating accumulator value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericValue {
    Long(i64),
    Double(f64),
}

impl NumericValue {
    fn from_value(v: &Value) -> Option<NumericValue> {
        match v {
            Value::Int(x) => Some(NumericValue::Long(i64::from(*x))),
            Value::Long(x) => Some(NumericValue::Long(*x)),
            Value::Float(x) => Some(NumericValue::Double(f64::from(*x))),
            Value::Double(x) => Some(NumericValue::Double(*x)),
            _ => None,
        }
    }

    fn add(self, other: NumericValue) -> NumericValue {
        match (self, other) {
            (NumericValue::Long(a), NumericValue::Long(b)) => {
                NumericValue::Long(a.saturating_add(b))
            }
            (a, b) => NumericValue::Double(a.as_double() + b.as_double()),
        }
    }

    fn sub(self, other: NumericValue) -> NumericValue {
        match (self, other) {
            (NumericValue::Long(a), NumericValue::Long(b)) => {
                NumericValue::Long(a.saturating_sub(b))
            }
            (a, b) => NumericValue::Double(a.as_double() - b.as_double()),
        }
    }

    fn min(self, other: NumericValue) -> NumericValue {
        if other.as_double() < self.as_double() {
            other
        } else {
            self
        }
    }

    fn max(self, other: NumericValue) -> NumericValue {
        if other.as_double() > self.as_double() {
            other
        } else {
            self
        }
    }

    fn is_negative(self) -> bool {
        match self {
            NumericValue::Long(v) => v < 0,
            NumericValue::Double(v) => v < 0.0,
        }
    }

    fn zero_like(self) -> NumericValue {
        match self {
            NumericValue::Long(_) => NumericValue::Long(0),
            NumericValue::Double(_) => NumericValue::Double(0.0),
        }
    }

    pub fn as_double(self) -> f64 {
        match self {
            NumericValue::Long(v) => v as f64,
            NumericValue::Double(v) => v,
        }
    }

    pub fn as_long(self) -> i64 {
        match self {
            NumericValue::Long(v) => v,
            NumericValue::Double(v) => v as i64,
        }
    }
}

/// Running aggregate for one value field of one dimension.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldAccumulator {
    value: Option<NumericValue>,
    sample_count: u32,
}

impl FieldAccumulator {
    fn absorb(&mut self, aggregation: ValueAggregation, sample: NumericValue) {
        self.sample_count = self.sample_count.saturating_add(1);
        self.value = Some(match (self.value, aggregation) {
            (None, _) => sample,
            (Some(v), ValueAggregation::Sum | ValueAggregation::Avg | ValueAggregation::Diff) => {
                v.add(sample)
            }
            (Some(v), ValueAggregation::Min) => v.min(sample),
            (Some(v), ValueAggregation::Max) => v.max(sample),
        });
    }

    fn finish(&self, aggregation: ValueAggregation) -> Option<NumericValue> {
        let value = self.value?;
        match aggregation {
            ValueAggregation::Avg if self.sample_count > 0 => Some(NumericValue::Double(
                value.as_double() / f64::from(self.sample_count),
            )),
            _ => Some(value),
        }
    }
}

#[derive(Debug, Default)]
pub struct ValueState {
    pub current: HashMap<MetricDimensionKey, Vec<FieldAccumulator>>,
    /// Previous samples for DIFF fields; survives bucket boundaries.
    pub bases: HashMap<MetricDimensionKey, Vec<Option<NumericValue>>>,
    pub past: HashMap<MetricDimensionKey, Vec<ValueBucket>>,
}

#[derive(Debug, Clone)]
pub struct ValueBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    /// `(value field index, aggregate)` pairs.
    pub values: Vec<(usize, NumericValue)>,
}

impl ValueState {
    pub fn byte_size(&self) -> usize {
        self.past
            .values()
            .map(|b| b.len() * std::mem::size_of::<ValueBucket>() + 32)
            .sum::<usize>()
            + self.current.len() * 64
            + self.bases.len() * 32
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn on_matched(
    meta: &ProducerMeta,
    m: &ValueMeta,
    state: &mut ProducerState,
    event_key: MetricDimensionKey,
    condition: ConditionState,
    event: &Event,
    ctx: &DispatchContext<'_>,
) {
    let ts = event.elapsed_ns();
    flush_if_needed(meta, state, ts, ctx.stats);

    if condition == ConditionState::Unknown {
        invalidate_bucket(&mut state.common, BucketDropReason::ConditionUnknown, ts);
        return;
    }

    // Extract the samples once; DIFF bases update even while the
    // condition is false so the next interval diffs correctly.
    let samples: Vec<Option<NumericValue>> = m
        .value_fields
        .iter()
        .map(|matcher| {
            event
                .values()
                .iter()
                .find(|v| matcher.matches(v.path))
                .and_then(|v| NumericValue::from_value(&v.value))
        })
        .collect();

    let accumulate = condition.is_true();
    if accumulate {
        let (len, present) = {
            let KindState::Value(k) = &state.kind else {
                return;
            };
            (k.current.len(), k.current.contains_key(&event_key))
        };
        if hit_dimension_guardrail(meta, &mut state.common, len, present, ctx.stats) {
            return;
        }
    }

    let KindState::Value(k) = &mut state.kind else {
        return;
    };
    let field_count = m.value_fields.len();
    let bases = k
        .bases
        .entry(event_key.clone())
        .or_insert_with(|| vec![None; field_count]);

    let mut contributions: Vec<(usize, NumericValue)> = Vec::new();
    for (i, sample) in samples.iter().enumerate() {
        let Some(sample) = *sample else { continue };
        let aggregation = m.aggregations[i];
        if aggregation == ValueAggregation::Diff {
            let base = bases[i].replace(sample);
            let Some(base) = base else { continue };
            let mut delta = sample.sub(base);
            if delta.is_negative() {
                // The counter reset; the reported interval saturates at
                // zero unless the absolute value is requested.
                delta = if m.use_absolute_value_on_reset {
                    sample
                } else {
                    sample.zero_like()
                };
            }
            contributions.push((i, delta));
        } else {
            contributions.push((i, sample));
        }
    }

    if !accumulate {
        return;
    }
    let accumulators = k
        .current
        .entry(event_key.clone())
        .or_insert_with(|| vec![FieldAccumulator::default(); field_count]);
    for (i, value) in contributions {
        accumulators[i].absorb(m.aggregations[i], value);
    }

    // Anomaly detection runs on the first value field's running total.
    let anomaly_value = accumulators
        .first()
        .and_then(|a| a.value)
        .map(NumericValue::as_long);
    if let Some(value) = anomaly_value {
        let bucket_num = state.common.current_bucket_num;
        for tracker in &mut state.common.anomaly_trackers {
            tracker.detect_and_declare(ts, bucket_num, meta.metric_id, &event_key, value);
        }
    }
}

pub(crate) fn on_condition_changed(
    meta: &ProducerMeta,
    m: &ValueMeta,
    state: &mut ProducerState,
    previous: ConditionState,
    event_time_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    flush_if_needed(meta, state, event_time_ns, ctx.stats);
    // Pulled value metrics sample on both condition edges: the rising
    // edge establishes DIFF bases, the falling edge captures the final
    // interval.
    if m.is_pulled() && previous != state.common.condition {
        pull_now(meta, m, state, event_time_ns, ctx);
    }
}

pub(crate) fn on_sliced_condition_may_change(
    meta: &ProducerMeta,
    m: &ValueMeta,
    state: &mut ProducerState,
    _overall: bool,
    event_time_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    flush_if_needed(meta, state, event_time_ns, ctx.stats);
    if m.is_pulled() {
        pull_now(meta, m, state, event_time_ns, ctx);
    }
}

/// Pulled value metrics sample on activation to establish DIFF bases.
pub(crate) fn on_became_active(
    meta: &ProducerMeta,
    m: &ValueMeta,
    state: &mut ProducerState,
    event_time_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    if m.is_pulled() {
        pull_now(meta, m, state, event_time_ns, ctx);
    }
}

fn pull_now(
    meta: &ProducerMeta,
    m: &ValueMeta,
    state: &mut ProducerState,
    timestamp_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    let Some(puller) = ctx.puller else {
        return;
    };
    let Some(tag_id) = m.pull_tag_id else {
        return;
    };
    match puller.pull(tag_id) {
        Ok(events) => {
            absorb_pulled(meta, m, state, &events, timestamp_ns, ctx);
        }
        Err(e) => {
            warn!(tag_id, metric_id = meta.metric_id, error = %e, "value pull failed");
            invalidate_bucket(&mut state.common, BucketDropReason::PullFailed, timestamp_ns);
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn on_data_pulled(
    meta: &ProducerMeta,
    m: &ValueMeta,
    state: &mut ProducerState,
    events: &[Event],
    result: PullResult,
    original_pull_time_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    let Some(tag_id) = m.pull_tag_id else {
        return;
    };
    if result != PullResult::Success {
        invalidate_bucket(
            &mut state.common,
            BucketDropReason::PullFailed,
            original_pull_time_ns,
        );
        return;
    }
    if events.is_empty() {
        invalidate_bucket(
            &mut state.common,
            BucketDropReason::NoData,
            original_pull_time_ns,
        );
        return;
    }
    let pull_delay_ns = ctx.clock.elapsed_ns() - original_pull_time_ns;
    ctx.stats.note_pull_delay(tag_id, pull_delay_ns);
    if pull_delay_ns > m.max_pull_delay_ns {
        warn!(tag_id, metric_id = meta.metric_id, pull_delay_ns, "value pull too late");
        ctx.stats.note_pull_exceed_max_delay(tag_id);
        invalidate_bucket(
            &mut state.common,
            BucketDropReason::PullDelayed,
            original_pull_time_ns,
        );
        return;
    }
    // Bucket-boundary samples are stamped just inside the ending bucket
    // so they close it rather than open the next.
    let stamp = original_pull_time_ns.saturating_sub(1);
    absorb_pulled(meta, m, state, events, stamp, ctx);
}

fn absorb_pulled(
    meta: &ProducerMeta,
    m: &ValueMeta,
    state: &mut ProducerState,
    events: &[Event],
    stamp_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    let mut hits = Vec::new();
    match_pulled_events(meta, ctx, events, stamp_ns, |event| {
        hits.push(event.clone());
    });
    let condition = state.common.condition;
    for event in &hits {
        let what_key =
            crate::event::field::filter_values(&meta.dimensions, event.values());
        let event_key = MetricDimensionKey::for_what(what_key);
        on_matched(meta, m, state, event_key, condition, event, ctx);
    }
}

pub(crate) fn close_bucket(
    m: &ValueMeta,
    kind: &mut ValueState,
    bucket_start: i64,
    bucket_end: i64,
    persist: bool,
) -> HashMap<MetricDimensionKey, i64> {
    let current = std::mem::take(&mut kind.current);
    let mut anomaly = HashMap::new();
    for (key, accumulators) in current {
        let values: Vec<(usize, NumericValue)> = accumulators
            .iter()
            .enumerate()
            .filter_map(|(i, acc)| acc.finish(m.aggregations[i]).map(|v| (i, v)))
            .collect();
        if values.is_empty() {
            continue;
        }
        anomaly.insert(key.clone(), values[0].1.as_long());
        if persist {
            kind.past.entry(key).or_default().push(ValueBucket {
                start_ns: bucket_start,
                end_ns: bucket_end,
                values,
            });
        }
    }
    anomaly
}

pub(crate) fn write_report(
    meta: &ProducerMeta,
    _m: &ValueMeta,
    common: &CommonState,
    kind: &ValueState,
    out: &mut ProtoWriter,
) {
    out.message(fields::REPORT_VALUE_METRICS, |wrapper| {
        write_skipped_buckets(common, wrapper);
        for (key, buckets) in &kind.past {
            wrapper.message(fields::WRAPPER_DATA, |data| {
                write_data_dimension(meta, key, data);
                for bucket in buckets {
                    data.message(fields::DATA_BUCKET_INFO, |info| {
                        write_bucket_bounds(meta, bucket.start_ns, bucket.end_ns, info);
                        for (index, value) in &bucket.values {
                            info.message(fields::BUCKET_PAYLOAD, |entry| {
                                entry.varint(fields::VALUE_FIELD_INDEX, *index as u64);
                                match value {
                                    NumericValue::Long(v) => {
                                        entry.int64(fields::VALUE_LONG, *v)
                                    }
                                    NumericValue::Double(v) => {
                                        entry.double(fields::VALUE_DOUBLE, *v)
                                    }
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

    #[test]
    fn test_accumulator_sum_min_max() {
        let mut sum = FieldAccumulator::default();
        sum.absorb(ValueAggregation::Sum, NumericValue::Long(5));
        sum.absorb(ValueAggregation::Sum, NumericValue::Long(7));
        assert_eq!(sum.finish(ValueAggregation::Sum), Some(NumericValue::Long(12)));

        let mut min = FieldAccumulator::default();
        min.absorb(ValueAggregation::Min, NumericValue::Long(5));
        min.absorb(ValueAggregation::Min, NumericValue::Long(3));
        assert_eq!(min.finish(ValueAggregation::Min), Some(NumericValue::Long(3)));

        let mut max = FieldAccumulator::default();
        max.absorb(ValueAggregation::Max, NumericValue::Long(5));
        max.absorb(ValueAggregation::Max, NumericValue::Long(9));
        assert_eq!(max.finish(ValueAggregation::Max), Some(NumericValue::Long(9)));
    }

    #[test]
    fn test_accumulator_avg() {
        let mut avg = FieldAccumulator::default();
        avg.absorb(ValueAggregation::Avg, NumericValue::Long(4));
        avg.absorb(ValueAggregation::Avg, NumericValue::Long(8));
        match avg.finish(ValueAggregation::Avg) {
            Some(NumericValue::Double(v)) => assert!((v - 6.0).abs() < f64::EPSILON),
            other => panic!("unexpected avg {other:?}"),
        }
    }

    #[test]
    fn test_close_bucket_collects_values() {
        let m = ValueMeta {
            pull_tag_id: None,
            value_fields: Vec::new(),
            aggregations: vec![ValueAggregation::Sum],
            use_absolute_value_on_reset: false,
            max_pull_delay_ns: 0,
        };
        let mut kind = ValueState::default();
        let key = MetricDimensionKey::default();
        let mut acc = FieldAccumulator::default();
        acc.absorb(ValueAggregation::Sum, NumericValue::Long(11));
        kind.current.insert(key.clone(), vec![acc]);

        let anomaly = close_bucket(&m, &mut kind, 0, 1_000, true);
        assert_eq!(anomaly.get(&key), Some(&11));
        assert_eq!(kind.past[&key][0].values, vec![(0, NumericValue::Long(11))]);
    }
}
