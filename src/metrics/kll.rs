//! KLL metric: streaming quantile sketches per value field.

use std::collections::HashMap;

use crate::condition::ConditionState;
use crate::event::field::{Matcher, MetricDimensionKey};
use crate::event::Event;
use crate::report::{fields, ProtoWriter};
use crate::sketch::KllSketch;

use super::{
    flush_if_needed, hit_dimension_guardrail, invalidate_bucket, write_bucket_bounds,
    write_data_dimension, write_skipped_buckets, BucketDropReason, CommonState, DispatchContext,
    KindState, ProducerMeta, ProducerState,
};

#[derive(Debug)]
pub struct KllMeta {
    pub value_fields: Vec<Matcher>,
}

#[derive(Debug, Default)]
pub struct KllState {
    pub current: HashMap<MetricDimensionKey, Vec<KllSketch>>,
    pub past: HashMap<MetricDimensionKey, Vec<KllBucket>>,
}

#[derive(Debug)]
pub struct KllBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    /// `(value field index, samples, serialized sketch)` triples.
    pub sketches: Vec<(usize, u64, Vec<u8>)>,
}

impl KllState {
    pub fn byte_size(&self) -> usize {
        let past: usize = self
            .past
            .values()
            .flat_map(|b| b.iter())
            .map(|b| b.sketches.iter().map(|(_, _, bytes)| bytes.len()).sum::<usize>())
            .sum();
        let current: usize = self
            .current
            .values()
            .flat_map(|s| s.iter())
            .map(KllSketch::byte_size)
            .sum();
        past + current
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn on_matched(
    meta: &ProducerMeta,
    m: &KllMeta,
    state: &mut ProducerState,
    event_key: MetricDimensionKey,
    condition: ConditionState,
    event: &Event,
    ctx: &DispatchContext<'_>,
) {
    let ts = event.elapsed_ns();
    flush_if_needed(meta, state, ts, ctx.stats);

    match condition {
        ConditionState::True => {}
        ConditionState::Unknown => {
            invalidate_bucket(&mut state.common, BucketDropReason::ConditionUnknown, ts);
            return;
        }
        ConditionState::False => return,
    }

    let (len, present) = {
        let KindState::Kll(k) = &state.kind else {
            return;
        };
        (k.current.len(), k.current.contains_key(&event_key))
    };
    if hit_dimension_guardrail(meta, &mut state.common, len, present, ctx.stats) {
        return;
    }

    let KindState::Kll(k) = &mut state.kind else {
        return;
    };
    let sketches = k
        .current
        .entry(event_key)
        .or_insert_with(|| (0..m.value_fields.len()).map(|_| KllSketch::new()).collect());
    for (i, matcher) in m.value_fields.iter().enumerate() {
        let sample = event
            .values()
            .iter()
            .find(|v| matcher.matches(v.path))
            .and_then(|v| v.value.as_long());
        if let Some(sample) = sample {
            sketches[i].insert(sample);
        }
    }
}

pub(crate) fn close_bucket(
    kind: &mut KllState,
    bucket_start: i64,
    bucket_end: i64,
    persist: bool,
) -> HashMap<MetricDimensionKey, i64> {
    let current = std::mem::take(&mut kind.current);
    if persist {
        for (key, sketches) in current {
            let serialized: Vec<(usize, u64, Vec<u8>)> = sketches
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.is_empty())
                .map(|(i, s)| (i, s.n(), s.serialize()))
                .collect();
            if serialized.is_empty() {
                continue;
            }
            kind.past.entry(key).or_default().push(KllBucket {
                start_ns: bucket_start,
                end_ns: bucket_end,
                sketches: serialized,
            });
        }
    }
    HashMap::new()
}

pub(crate) fn write_report(
    meta: &ProducerMeta,
    _m: &KllMeta,
    common: &CommonState,
    kind: &KllState,
    out: &mut ProtoWriter,
) {
    out.message(fields::REPORT_KLL_METRICS, |wrapper| {
        write_skipped_buckets(common, wrapper);
        for (key, buckets) in &kind.past {
            wrapper.message(fields::WRAPPER_DATA, |data| {
                write_data_dimension(meta, key, data);
                for bucket in buckets {
                    data.message(fields::DATA_BUCKET_INFO, |info| {
                        write_bucket_bounds(meta, bucket.start_ns, bucket.end_ns, info);
                        for (index, _n, bytes) in &bucket.sketches {
                            info.message(fields::BUCKET_PAYLOAD, |entry| {
                                entry.varint(fields::KLL_FIELD_INDEX, *index as u64);
                                entry.bytes_field(fields::KLL_SERIALIZED_SKETCH, bytes);
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
    fn test_close_bucket_serializes_nonempty_sketches() {
        let mut kind = KllState::default();
        let key = MetricDimensionKey::default();
        let mut sketch = KllSketch::new();
        sketch.insert(10);
        sketch.insert(20);
        kind.current.insert(key.clone(), vec![sketch, KllSketch::new()]);

        close_bucket(&mut kind, 0, 1_000, true);
        let buckets = kind.past.get(&key).expect("bucket");
        assert_eq!(buckets.len(), 1);
        // The empty second sketch is dropped.
        assert_eq!(buckets[0].sketches.len(), 1);
        assert_eq!(buckets[0].sketches[0].0, 0);
        assert_eq!(buckets[0].sketches[0].1, 2);
    }

    #[test]
    fn test_close_bucket_all_empty_adds_nothing() {
        let mut kind = KllState::default();
        kind.current
            .insert(MetricDimensionKey::default(), vec![KllSketch::new()]);
        close_bucket(&mut kind, 0, 1_000, true);
        assert!(kind.past.is_empty());
    }
}
