//! Count metric: per-dimension event counter.

use std::collections::HashMap;

use crate::condition::ConditionState;
use crate::config::UploadThresholdConfig;
use crate::event::field::MetricDimensionKey;
use crate::event::Event;
use crate::report::{fields, ProtoWriter};

use super::{
    flush_if_needed, hit_dimension_guardrail, mark_invalid, write_bucket_bounds,
    write_data_dimension, write_skipped_buckets, CommonState, DispatchContext, KindState,
    ProducerMeta, ProducerState,
};

#[derive(Debug)]
pub struct CountMeta {
    pub threshold: Option<UploadThresholdConfig>,
}

#[derive(Debug, Default)]
pub struct CountState {
    pub current: HashMap<MetricDimensionKey, i64>,
    pub past: HashMap<MetricDimensionKey, Vec<CountBucket>>,
}

#[derive(Debug, Clone, Copy)]
pub struct CountBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub count: i64,
}

impl CountState {
    pub fn byte_size(&self) -> usize {
        self.past
            .values()
            .map(|buckets| buckets.len() * std::mem::size_of::<CountBucket>() + 32)
            .sum::<usize>()
            + self.current.len() * 48
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn on_matched(
    meta: &ProducerMeta,
    _m: &CountMeta,
    state: &mut ProducerState,
    event_key: MetricDimensionKey,
    condition: ConditionState,
    event: &Event,
    ctx: &DispatchContext<'_>,
) {
    if !condition.is_true() {
        return;
    }
    let ts = event.elapsed_ns();
    flush_if_needed(meta, state, ts, ctx.stats);

    let (len, present) = {
        let KindState::Count(k) = &state.kind else {
            return;
        };
        (k.current.len(), k.current.contains_key(&event_key))
    };
    if hit_dimension_guardrail(meta, &mut state.common, len, present, ctx.stats) {
        return;
    }

    let KindState::Count(k) = &mut state.kind else {
        return;
    };
    let entry = k.current.entry(event_key.clone()).or_insert(0);
    let Some(next) = entry.checked_add(1) else {
        mark_invalid(meta, &mut state.common, "count accumulator overflow");
        return;
    };
    *entry = next;

    let count = next;
    let bucket_num = state.common.current_bucket_num;
    for tracker in &mut state.common.anomaly_trackers {
        tracker.detect_and_declare(ts, bucket_num, meta.metric_id, &event_key, count);
    }
}

pub(crate) fn close_bucket(
    kind: &mut CountState,
    bucket_start: i64,
    bucket_end: i64,
    persist: bool,
) -> HashMap<MetricDimensionKey, i64> {
    let current = std::mem::take(&mut kind.current);
    if persist {
        for (key, count) in &current {
            kind.past.entry(key.clone()).or_default().push(CountBucket {
                start_ns: bucket_start,
                end_ns: bucket_end,
                count: *count,
            });
        }
    }
    current
}

pub(crate) fn write_report(
    meta: &ProducerMeta,
    m: &CountMeta,
    common: &CommonState,
    kind: &CountState,
    out: &mut ProtoWriter,
) {
    out.message(fields::REPORT_COUNT_METRICS, |wrapper| {
        write_skipped_buckets(common, wrapper);
        for (key, buckets) in &kind.past {
            let visible: Vec<&CountBucket> = buckets
                .iter()
                .filter(|b| m.threshold.map_or(true, |t| t.contains(b.count)))
                .collect();
            if visible.is_empty() {
                continue;
            }
            wrapper.message(fields::WRAPPER_DATA, |data| {
                write_data_dimension(meta, key, data);
                for bucket in visible {
                    data.message(fields::DATA_BUCKET_INFO, |info| {
                        write_bucket_bounds(meta, bucket.start_ns, bucket.end_ns, info);
                        info.int64(fields::BUCKET_SCALAR, bucket.count);
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
    fn test_close_bucket_moves_counts() {
        let mut kind = CountState::default();
        let key = MetricDimensionKey::default();
        kind.current.insert(key.clone(), 3);

        let anomaly = close_bucket(&mut kind, 0, 1_000, true);
        assert!(kind.current.is_empty());
        assert_eq!(kind.past.get(&key).map(|b| b.len()), Some(1));
        assert_eq!(kind.past[&key][0].count, 3);
        assert_eq!(anomaly.get(&key), Some(&3));
    }

    #[test]
    fn test_close_bucket_discard() {
        let mut kind = CountState::default();
        kind.current.insert(MetricDimensionKey::default(), 3);
        close_bucket(&mut kind, 0, 1_000, false);
        assert!(kind.current.is_empty());
        assert!(kind.past.is_empty());
    }
}
