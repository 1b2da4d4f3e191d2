//! Event metric: verbatim capture of matched events.
//!
//! No aggregate state; buckets only segment the output stream. Identical
//! atom value trees are merged at flush, each keeping its timestamp list.

use std::collections::HashMap;

use crate::condition::ConditionState;
use crate::event::field::{FieldValue, MetricDimensionKey};
use crate::event::{truncate_timestamp_if_necessary, Event};
use crate::report::{fields, write_atom, ProtoWriter};

use super::{
    flush_if_needed, keep_random_sample, write_bucket_bounds, write_skipped_buckets, CommonState,
    DispatchContext, KindState, ProducerMeta, ProducerState,
};

#[derive(Debug)]
pub struct EventMeta {
    pub sampling_percentage: u32,
}

/// A captured event: atom id, values, report timestamp.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub atom_id: i32,
    pub values: Vec<FieldValue>,
    pub elapsed_ns: i64,
}

#[derive(Debug, Default)]
pub struct EventState {
    pub current: Vec<CapturedEvent>,
    pub past: Vec<EventBucket>,
}

#[derive(Debug)]
pub struct EventBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub aggregated: Vec<(i32, Vec<FieldValue>, Vec<i64>)>,
}

impl EventState {
    pub fn byte_size(&self) -> usize {
        let past: usize = self
            .past
            .iter()
            .map(|b| {
                b.aggregated
                    .iter()
                    .map(|(_, values, ts)| values.len() * 24 + ts.len() * 8)
                    .sum::<usize>()
            })
            .sum();
        past + self.current.iter().map(|e| e.values.len() * 24 + 16).sum::<usize>()
    }
}

pub(crate) fn on_matched(
    meta: &ProducerMeta,
    m: &EventMeta,
    state: &mut ProducerState,
    condition: ConditionState,
    event: &Event,
    ctx: &DispatchContext<'_>,
) {
    if !condition.is_true() {
        return;
    }
    if !keep_random_sample(&mut state.common, m.sampling_percentage) {
        return;
    }
    flush_if_needed(meta, state, event.elapsed_ns(), ctx.stats);

    let KindState::Event(k) = &mut state.kind else {
        return;
    };
    k.current.push(CapturedEvent {
        atom_id: event.atom_id(),
        values: event.values().to_vec(),
        elapsed_ns: truncate_timestamp_if_necessary(event),
    });
}

pub(crate) fn close_bucket(
    kind: &mut EventState,
    bucket_start: i64,
    bucket_end: i64,
    persist: bool,
) -> HashMap<MetricDimensionKey, i64> {
    let current = std::mem::take(&mut kind.current);
    if persist && !current.is_empty() {
        let mut aggregated: Vec<(i32, Vec<FieldValue>, Vec<i64>)> = Vec::new();
        for captured in current {
            match aggregated
                .iter_mut()
                .find(|(atom, v, _)| *atom == captured.atom_id && *v == captured.values)
            {
                Some((_, _, timestamps)) => timestamps.push(captured.elapsed_ns),
                None => aggregated.push((captured.atom_id, captured.values, vec![captured.elapsed_ns])),
            }
        }
        kind.past.push(EventBucket {
            start_ns: bucket_start,
            end_ns: bucket_end,
            aggregated,
        });
    }
    HashMap::new()
}

pub(crate) fn write_report(
    meta: &ProducerMeta,
    _m: &EventMeta,
    common: &CommonState,
    kind: &EventState,
    out: &mut ProtoWriter,
) {
    out.message(fields::REPORT_EVENT_METRICS, |wrapper| {
        write_skipped_buckets(common, wrapper);
        for bucket in &kind.past {
            wrapper.message(fields::WRAPPER_DATA, |data| {
                data.message(fields::DATA_BUCKET_INFO, |info| {
                    write_bucket_bounds(meta, bucket.start_ns, bucket.end_ns, info);
                    for (atom_id, values, timestamps) in &bucket.aggregated {
                        info.message(fields::BUCKET_PAYLOAD, |agg| {
                            write_atom(agg, fields::AGGREGATED_ATOM_VALUE, *atom_id, values);
                            for ts in timestamps {
                                agg.int64(fields::AGGREGATED_ATOM_TIMESTAMPS, *ts);
                            }
                        });
                    }
                });
            });
        }
    });
}
