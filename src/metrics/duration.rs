//! Duration metric: per-dimension time-in-state accumulation.
//!
//! The state machine is driven by the start/stop/stop-all matchers of
//! the simple condition the metric's `what` references. While the gating
//! condition is false an open interval is paused: elapsed time stops
//! accruing but the outstanding start count survives.

use std::collections::HashMap;

use crate::condition::ConditionState;
use crate::config::DurationAggregation;
use crate::event::field::{DimensionKey, MetricDimensionKey};
use crate::event::Event;
use crate::report::{fields, ProtoWriter};

use super::{
    flush_if_needed, hit_dimension_guardrail, write_bucket_bounds, write_data_dimension,
    write_skipped_buckets, CommonState, DispatchContext, KindState, ProducerMeta, ProducerState,
};

#[derive(Debug)]
pub struct DurationMeta {
    pub start_matcher_index: usize,
    pub stop_matcher_index: Option<usize>,
    pub stop_all_matcher_index: Option<usize>,
    /// Stacked starts (true) vs coalesced (false).
    pub nested: bool,
    pub aggregation: DurationAggregation,
}

#[derive(Debug, Default)]
pub struct DurationState {
    pub current: HashMap<MetricDimensionKey, DurationTracker>,
    pub past: HashMap<MetricDimensionKey, Vec<DurationBucket>>,
}

#[derive(Debug, Clone, Copy)]
pub struct DurationBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub duration_ns: i64,
}

/// Per-dimension interval tracker.
#[derive(Debug, Default)]
pub struct DurationTracker {
    nest_count: u32,
    /// Accrual start within the current bucket; `None` when stopped or
    /// paused by the condition.
    running_since_ns: Option<i64>,
    /// Start of the contiguous interval, possibly in an earlier bucket.
    interval_start_ns: Option<i64>,
    sum_ns: i64,
    max_interval_ns: i64,
    /// Condition key captured at start, for sliced-condition re-query.
    condition_key: DimensionKey,
}

impl DurationTracker {
    fn is_running(&self) -> bool {
        self.running_since_ns.is_some()
    }

    fn start(&mut self, ts: i64, nested: bool, condition_met: bool, condition_key: DimensionKey) {
        if self.nest_count == 0 {
            self.condition_key = condition_key;
        }
        if nested {
            self.nest_count = self.nest_count.saturating_add(1);
        } else {
            self.nest_count = 1;
        }
        if condition_met && self.running_since_ns.is_none() {
            self.running_since_ns = Some(ts);
            self.interval_start_ns.get_or_insert(ts);
        }
    }

    fn stop(&mut self, ts: i64) {
        self.nest_count = self.nest_count.saturating_sub(1);
        if self.nest_count == 0 {
            self.accrue_until(ts);
            self.running_since_ns = None;
            self.interval_start_ns = None;
        }
    }

    fn stop_all(&mut self, ts: i64) {
        if self.nest_count > 0 {
            self.accrue_until(ts);
        }
        self.nest_count = 0;
        self.running_since_ns = None;
        self.interval_start_ns = None;
    }

    fn pause(&mut self, ts: i64) {
        if self.is_running() {
            self.accrue_until(ts);
            self.running_since_ns = None;
            self.interval_start_ns = None;
        }
    }

    fn resume(&mut self, ts: i64) {
        if self.nest_count > 0 && !self.is_running() {
            self.running_since_ns = Some(ts);
            self.interval_start_ns = Some(ts);
        }
    }

    fn accrue_until(&mut self, ts: i64) {
        if let Some(since) = self.running_since_ns {
            let elapsed = (ts - since).max(0);
            self.sum_ns += elapsed;
        }
        if let Some(interval_start) = self.interval_start_ns {
            let len = (ts - interval_start).max(0);
            self.max_interval_ns = self.max_interval_ns.max(len);
        }
    }

    /// Close this tracker's contribution at a bucket boundary and return
    /// the bucket's aggregate. The ongoing interval carries over.
    fn roll(&mut self, bucket_end: i64, aggregation: DurationAggregation) -> i64 {
        self.accrue_until(bucket_end);
        let value = match aggregation {
            DurationAggregation::Sum => self.sum_ns,
            DurationAggregation::MaxSparse => self.max_interval_ns,
        };
        self.sum_ns = 0;
        self.max_interval_ns = 0;
        if self.is_running() {
            self.running_since_ns = Some(bucket_end);
        }
        value
    }

    fn is_finished(&self) -> bool {
        self.nest_count == 0 && !self.is_running()
    }
}

impl DurationState {
    pub fn byte_size(&self) -> usize {
        self.past
            .values()
            .map(|b| b.len() * std::mem::size_of::<DurationBucket>() + 32)
            .sum::<usize>()
            + self.current.len() * std::mem::size_of::<DurationTracker>()
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn on_matched(
    meta: &ProducerMeta,
    m: &DurationMeta,
    state: &mut ProducerState,
    matcher_index: usize,
    event_key: MetricDimensionKey,
    condition_key: DimensionKey,
    condition: ConditionState,
    event: &Event,
    ctx: &DispatchContext<'_>,
) {
    let ts = event.elapsed_ns();
    flush_if_needed(meta, state, ts, ctx.stats);

    if Some(matcher_index) == m.stop_all_matcher_index {
        let KindState::Duration(k) = &mut state.kind else {
            return;
        };
        for tracker in k.current.values_mut() {
            tracker.stop_all(ts);
        }
        return;
    }

    if matcher_index == m.start_matcher_index {
        let (len, present) = {
            let KindState::Duration(k) = &state.kind else {
                return;
            };
            (k.current.len(), k.current.contains_key(&event_key))
        };
        if hit_dimension_guardrail(meta, &mut state.common, len, present, ctx.stats) {
            return;
        }
        let KindState::Duration(k) = &mut state.kind else {
            return;
        };
        k.current
            .entry(event_key)
            .or_default()
            .start(ts, m.nested, condition.is_true(), condition_key);
        return;
    }

    if Some(matcher_index) == m.stop_matcher_index {
        let KindState::Duration(k) = &mut state.kind else {
            return;
        };
        if let Some(tracker) = k.current.get_mut(&event_key) {
            tracker.stop(ts);
        }
    }
}

pub(crate) fn on_condition_changed(
    _meta: &ProducerMeta,
    _m: &DurationMeta,
    state: &mut ProducerState,
    event_time_ns: i64,
    _ctx: &DispatchContext<'_>,
) {
    let condition = state.common.condition;
    let KindState::Duration(k) = &mut state.kind else {
        return;
    };
    for tracker in k.current.values_mut() {
        if condition.is_true() {
            tracker.resume(event_time_ns);
        } else {
            tracker.pause(event_time_ns);
        }
    }
}

/// Sliced gating condition: each tracker re-queries its own slice.
pub(crate) fn on_sliced_condition_may_change(
    meta: &ProducerMeta,
    _m: &DurationMeta,
    state: &mut ProducerState,
    event_time_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    let Some(condition_index) = meta.condition_index else {
        return;
    };
    let KindState::Duration(k) = &mut state.kind else {
        return;
    };
    for tracker in k.current.values_mut() {
        let slice = ctx.conditions.query(condition_index, &tracker.condition_key);
        if slice.is_true() {
            tracker.resume(event_time_ns);
        } else {
            tracker.pause(event_time_ns);
        }
    }
}

pub(crate) fn close_bucket(
    m: &DurationMeta,
    kind: &mut DurationState,
    bucket_start: i64,
    bucket_end: i64,
    persist: bool,
) -> HashMap<MetricDimensionKey, i64> {
    let mut anomaly = HashMap::new();
    let mut finished = Vec::new();
    for (key, tracker) in kind.current.iter_mut() {
        let value = tracker.roll(bucket_end, m.aggregation);
        if value > 0 {
            anomaly.insert(key.clone(), value);
            if persist {
                kind.past.entry(key.clone()).or_default().push(DurationBucket {
                    start_ns: bucket_start,
                    end_ns: bucket_end,
                    duration_ns: value,
                });
            }
        }
        if tracker.is_finished() {
            finished.push(key.clone());
        }
    }
    for key in finished {
        kind.current.remove(&key);
    }
    anomaly
}

pub(crate) fn write_report(
    meta: &ProducerMeta,
    _m: &DurationMeta,
    common: &CommonState,
    kind: &DurationState,
    out: &mut ProtoWriter,
) {
    out.message(fields::REPORT_DURATION_METRICS, |wrapper| {
        write_skipped_buckets(common, wrapper);
        for (key, buckets) in &kind.past {
            wrapper.message(fields::WRAPPER_DATA, |data| {
                write_data_dimension(meta, key, data);
                for bucket in buckets {
                    data.message(fields::DATA_BUCKET_INFO, |info| {
                        write_bucket_bounds(meta, bucket.start_ns, bucket.end_ns, info);
                        info.int64(fields::BUCKET_SCALAR, bucket.duration_ns);
                    });
                }
            });
        }
    });
}
