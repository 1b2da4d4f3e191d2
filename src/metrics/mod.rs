//! Metric producers: the roots of the evaluation graph.
//!
//! Six producer kinds share one chassis: activation gating, the
//! time-bucket state machine, the dimension guardrail, skipped-bucket
//! accounting, and report framing. Kind-specific accumulation lives in
//! the sibling modules and is dispatched through [`KindMeta`] /
//! [`KindState`]. Every producer is guarded by its own mutex; the
//! manager never reaches into producer state directly.

pub mod count;
pub mod duration;
pub mod event;
pub mod gauge;
pub mod kll;
pub mod value;

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::anomaly::AnomalyTracker;
use crate::clock::{nano_to_millis, ElapsedClock};
use crate::condition::wizard::ConditionWizard;
use crate::condition::ConditionState;
use crate::config::{ActivationType, ConfigKey};
use crate::event::field::{
    filter_values, DimensionKey, DimensionSpec, Matcher, MetricDimensionKey,
};
use crate::event::Event;
use crate::matcher::wizard::{MatchCache, MatcherWizard};
use crate::matcher::MatchResult;
use crate::puller::{PullResult, PullerManager};
use crate::report::{fields, write_dimension_path, ProtoWriter};
use crate::stats::{hash64, EngineStats};

/// Producer kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Event,
    Count,
    Duration,
    Gauge,
    Value,
    Kll,
}

/// Activation lifecycle of one named activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    NotActive,
    Active,
    /// Armed; becomes active at the next init-complete.
    ActiveOnBoot,
}

/// Runtime slot for one configured activation.
#[derive(Debug, Clone)]
pub struct ActivationSlot {
    pub activation_matcher_index: usize,
    pub deactivation_matcher_index: Option<usize>,
    pub activation_type: ActivationType,
    pub ttl_ns: i64,
    pub start_ns: i64,
    pub state: ActivationState,
}

/// Why a bucket (or part of one) was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketDropReason {
    BucketTooSmall,
    NoData,
    ConditionUnknown,
    PullFailed,
    PullDelayed,
    DimensionGuardrailReached,
    MultipleBucketsSkipped,
    BucketError,
    ConditionChanged,
    ActiveStateChanged,
    UploadTimeout,
    NoDumpBecauseMemory,
}

impl BucketDropReason {
    pub fn code(self) -> i32 {
        match self {
            BucketDropReason::BucketTooSmall => 1,
            BucketDropReason::NoData => 2,
            BucketDropReason::ConditionUnknown => 3,
            BucketDropReason::PullFailed => 4,
            BucketDropReason::PullDelayed => 5,
            BucketDropReason::DimensionGuardrailReached => 6,
            BucketDropReason::MultipleBucketsSkipped => 7,
            BucketDropReason::BucketError => 8,
            BucketDropReason::ConditionChanged => 9,
            BucketDropReason::ActiveStateChanged => 10,
            BucketDropReason::UploadTimeout => 11,
            BucketDropReason::NoDumpBecauseMemory => 12,
        }
    }
}

/// One drop occurrence inside a bucket.
#[derive(Debug, Clone, Copy)]
pub struct DropEvent {
    pub reason: BucketDropReason,
    pub drop_time_ns: i64,
}

/// A bucket whose data was dropped; only metadata survives.
#[derive(Debug, Clone)]
pub struct SkippedBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub drop_events: Vec<DropEvent>,
}

/// Drop events per bucket are capped; the overflow is silently
/// suppressed.
pub const MAX_DROP_EVENTS: usize = 10;

/// A metric-to-condition link with translated field matchers.
#[derive(Debug, Clone)]
pub struct CompiledLink {
    pub condition_index: usize,
    pub fields_in_what: Vec<Matcher>,
    pub fields_in_condition: Vec<Matcher>,
}

/// Everything the dispatch path hands a producer: borrowed wizards over
/// the arenas plus the process-scoped collaborators.
pub struct DispatchContext<'a> {
    pub matchers: MatcherWizard<'a>,
    pub conditions: ConditionWizard<'a>,
    pub stats: &'a EngineStats,
    pub clock: &'a dyn ElapsedClock,
    pub shard_offset: u32,
    pub puller: Option<&'a PullerManager>,
}

/// Immutable (between config updates) configuration of one producer.
#[derive(Debug)]
pub struct ProducerMeta {
    pub metric_id: i64,
    pub config_key: ConfigKey,
    pub proto_hash: u64,
    pub what_matcher_index: usize,
    pub condition_index: Option<usize>,
    /// True when links slice the condition query per event.
    pub condition_sliced: bool,
    pub links: Vec<CompiledLink>,
    pub dimensions: Vec<Matcher>,
    pub dimensions_spec: Option<DimensionSpec>,
    /// Position ALL in the dimension spec forces nested dimension output.
    pub nested_dimensions: bool,
    pub time_base_ns: i64,
    pub bucket_size_ns: i64,
    pub min_bucket_size_ns: i64,
    pub dimension_soft_limit: usize,
    pub dimension_hard_limit: usize,
    pub split_bucket_for_app_upgrade: bool,
    pub sampled_fields: Vec<Matcher>,
    pub shard_count: u32,
    pub kind: KindMeta,
}

/// Kind-specific immutable configuration.
#[derive(Debug)]
pub enum KindMeta {
    Event(event::EventMeta),
    Count(count::CountMeta),
    Duration(duration::DurationMeta),
    Gauge(gauge::GaugeMeta),
    Value(value::ValueMeta),
    Kll(kll::KllMeta),
}

/// Kind-specific mutable accumulation state.
#[derive(Debug)]
pub enum KindState {
    Event(event::EventState),
    Count(count::CountState),
    Duration(duration::DurationState),
    Gauge(gauge::GaugeState),
    Value(value::ValueState),
    Kll(kll::KllState),
}

impl KindMeta {
    fn new_state(&self) -> KindState {
        match self {
            KindMeta::Event(_) => KindState::Event(event::EventState::default()),
            KindMeta::Count(_) => KindState::Count(count::CountState::default()),
            KindMeta::Duration(_) => KindState::Duration(duration::DurationState::default()),
            KindMeta::Gauge(_) => KindState::Gauge(gauge::GaugeState::default()),
            KindMeta::Value(_) => KindState::Value(value::ValueState::default()),
            KindMeta::Kll(_) => KindState::Kll(kll::KllState::default()),
        }
    }

    fn metric_type(&self) -> MetricType {
        match self {
            KindMeta::Event(_) => MetricType::Event,
            KindMeta::Count(_) => MetricType::Count,
            KindMeta::Duration(_) => MetricType::Duration,
            KindMeta::Gauge(_) => MetricType::Gauge,
            KindMeta::Value(_) => MetricType::Value,
            KindMeta::Kll(_) => MetricType::Kll,
        }
    }
}

/// Shared mutable state.
pub(crate) struct CommonState {
    pub valid: bool,
    pub current_bucket_start_ns: i64,
    pub current_bucket_num: i64,
    pub condition: ConditionState,
    pub is_active: bool,
    pub activations: Vec<ActivationSlot>,
    pub current_drop_events: Vec<DropEvent>,
    pub current_bucket_invalid: bool,
    pub skipped_buckets: Vec<SkippedBucket>,
    /// Log-once per bucket for the hard guardrail.
    pub has_hit_guardrail: bool,
    /// Sticky until report erase.
    pub dimension_guardrail_hit: bool,
    pub anomaly_trackers: Vec<AnomalyTracker>,
    rng: u64,
}

pub(crate) struct ProducerState {
    pub common: CommonState,
    pub kind: KindState,
}

/// One metric producer: shared chassis plus kind-specific accumulation,
/// all behind the producer's own mutex.
pub struct MetricProducer {
    meta: ProducerMeta,
    state: Mutex<ProducerState>,
}

impl MetricProducer {
    pub fn new(
        meta: ProducerMeta,
        initial_condition: ConditionState,
        activations: Vec<ActivationSlot>,
    ) -> Self {
        let kind = meta.kind.new_state();
        // With no activation requirement the producer is born active.
        let is_active = activations.is_empty();
        let condition = if meta.condition_index.is_some() {
            initial_condition
        } else {
            ConditionState::True
        };
        let state = ProducerState {
            common: CommonState {
                valid: true,
                current_bucket_start_ns: meta.time_base_ns,
                current_bucket_num: 0,
                condition,
                is_active,
                activations,
                current_drop_events: Vec::new(),
                current_bucket_invalid: false,
                skipped_buckets: Vec::new(),
                has_hit_guardrail: false,
                dimension_guardrail_hit: false,
                anomaly_trackers: Vec::new(),
                rng: meta.metric_id as u64 ^ 0x5851_f42d_4c95_7f2d,
            },
            kind,
        };
        Self {
            meta,
            state: Mutex::new(state),
        }
    }

    pub fn metric_id(&self) -> i64 {
        self.meta.metric_id
    }

    pub fn proto_hash(&self) -> u64 {
        self.meta.proto_hash
    }

    pub fn metric_type(&self) -> MetricType {
        self.meta.kind.metric_type()
    }

    pub fn config_key(&self) -> ConfigKey {
        self.meta.config_key
    }

    pub fn condition_sliced(&self) -> bool {
        self.meta.condition_sliced
    }

    pub fn condition_index(&self) -> Option<usize> {
        self.meta.condition_index
    }

    /// Matcher indices whose matches this producer consumes.
    pub fn subscribed_matchers(&self) -> Vec<usize> {
        match &self.meta.kind {
            KindMeta::Duration(m) => {
                let mut v = vec![m.start_matcher_index];
                v.extend(m.stop_matcher_index);
                v.extend(m.stop_all_matcher_index);
                v
            }
            KindMeta::Gauge(m) => {
                let mut v = vec![self.meta.what_matcher_index];
                v.extend(m.trigger_matcher_index);
                v
            }
            _ => vec![self.meta.what_matcher_index],
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().common.is_active
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().common.valid
    }

    pub fn current_bucket_num(&self) -> i64 {
        self.state.lock().common.current_bucket_num
    }

    pub fn add_anomaly_tracker(&self, tracker: AnomalyTracker) {
        self.state.lock().common.anomaly_trackers.push(tracker);
    }

    /// Periodic pull registration this producer wants, if any:
    /// `(tag_id, first_pull_ns, period_ns)`.
    pub fn pull_registration(&self) -> Option<(i32, i64, i64)> {
        let state = self.state.lock();
        let first = current_bucket_end_ns(&self.meta, &state.common);
        match &self.meta.kind {
            KindMeta::Gauge(g) if g.registers_for_periodic_pulls() => {
                Some((g.pull_tag_id?, first, self.meta.bucket_size_ns))
            }
            KindMeta::Value(v) => Some((v.pull_tag_id?, first, self.meta.bucket_size_ns)),
            _ => None,
        }
    }

    /// Initial pull for pulled gauges whose condition starts true.
    pub fn prepare_first_bucket(&self, ctx: &DispatchContext<'_>) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        if let KindMeta::Gauge(g) = &self.meta.kind {
            gauge::prepare_first_bucket(&self.meta, g, &mut state, ctx);
        }
    }

    /// Consume an event already matched to this metric's subscriptions.
    pub fn on_matched_event(&self, matcher_index: usize, event: &Event, ctx: &DispatchContext<'_>) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        let now = event.elapsed_ns();
        evaluate_active_state(&self.meta, &mut state, now, ctx);
        if !state.common.is_active {
            return;
        }

        // Resolve the gating condition, sliced through links if declared.
        let condition_key = extract_condition_key(&self.meta, event);
        let condition = match self.meta.condition_index {
            None => ConditionState::True,
            Some(ci) => {
                if self.meta.condition_sliced {
                    ctx.conditions.query(ci, &condition_key)
                } else {
                    state.common.condition
                }
            }
        };

        if !self.meta.sampled_fields.is_empty()
            && !passes_sample_check(&self.meta, ctx.shard_offset, event)
        {
            return;
        }

        let what_key = filter_values(&self.meta.dimensions, event.values());
        let event_key = MetricDimensionKey::for_what(what_key);

        let state = &mut *state;
        match &self.meta.kind {
            KindMeta::Event(m) => event::on_matched(&self.meta, m, state, condition, event, ctx),
            KindMeta::Count(m) => {
                count::on_matched(&self.meta, m, state, event_key, condition, event, ctx)
            }
            KindMeta::Duration(m) => duration::on_matched(
                &self.meta,
                m,
                state,
                matcher_index,
                event_key,
                condition_key,
                condition,
                event,
                ctx,
            ),
            KindMeta::Gauge(m) => {
                gauge::on_matched(&self.meta, m, state, event_key, condition, event, ctx)
            }
            KindMeta::Value(m) => {
                value::on_matched(&self.meta, m, state, event_key, condition, event, ctx)
            }
            KindMeta::Kll(m) => {
                kll::on_matched(&self.meta, m, state, event_key, condition, event, ctx)
            }
        }
    }

    /// A non-sliced dependent condition transitioned.
    pub fn on_condition_changed(
        &self,
        new_condition: ConditionState,
        event_time_ns: i64,
        ctx: &DispatchContext<'_>,
    ) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        let previous = state.common.condition;
        state.common.condition = new_condition;
        if !state.common.is_active {
            return;
        }
        let state = &mut *state;
        match &self.meta.kind {
            KindMeta::Gauge(m) => {
                gauge::on_condition_changed(&self.meta, m, state, event_time_ns, ctx)
            }
            KindMeta::Value(m) => {
                value::on_condition_changed(&self.meta, m, state, previous, event_time_ns, ctx)
            }
            KindMeta::Duration(m) => {
                duration::on_condition_changed(&self.meta, m, state, event_time_ns, ctx)
            }
            _ => {}
        }
    }

    /// A sliced dependent condition may have changed some slice.
    pub fn on_sliced_condition_may_change(
        &self,
        overall: bool,
        event_time_ns: i64,
        ctx: &DispatchContext<'_>,
    ) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        state.common.condition = ConditionState::from(overall);
        if !state.common.is_active {
            return;
        }
        let state = &mut *state;
        match &self.meta.kind {
            KindMeta::Gauge(m) => gauge::on_sliced_condition_may_change(
                &self.meta, m, state, overall, event_time_ns, ctx,
            ),
            KindMeta::Value(m) => value::on_sliced_condition_may_change(
                &self.meta, m, state, overall, event_time_ns, ctx,
            ),
            KindMeta::Duration(m) => {
                duration::on_sliced_condition_may_change(&self.meta, m, state, event_time_ns, ctx)
            }
            _ => {}
        }
    }

    /// An activation matcher fired.
    pub fn activate(&self, matcher_index: usize, event_time_ns: i64, ctx: &DispatchContext<'_>) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        for slot in &mut state.common.activations {
            if slot.activation_matcher_index != matcher_index {
                continue;
            }
            slot.start_ns = event_time_ns;
            slot.state = match slot.activation_type {
                ActivationType::Immediate => ActivationState::Active,
                ActivationType::OnBoot => {
                    if slot.state == ActivationState::Active {
                        // Refreshing an already-live OnBoot activation.
                        ActivationState::Active
                    } else {
                        ActivationState::ActiveOnBoot
                    }
                }
            };
        }
        evaluate_active_state(&self.meta, &mut state, event_time_ns, ctx);
    }

    /// A deactivation matcher fired.
    pub fn cancel_event_activation(
        &self,
        matcher_index: usize,
        event_time_ns: i64,
        ctx: &DispatchContext<'_>,
    ) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        for slot in &mut state.common.activations {
            if slot.deactivation_matcher_index == Some(matcher_index) {
                slot.state = ActivationState::NotActive;
            }
        }
        evaluate_active_state(&self.meta, &mut state, event_time_ns, ctx);
    }

    /// Asynchronous delivery from the puller manager.
    pub fn on_data_pulled(
        &self,
        events: &[Event],
        result: PullResult,
        original_pull_time_ns: i64,
        ctx: &DispatchContext<'_>,
    ) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        let state = &mut *state;
        match &self.meta.kind {
            KindMeta::Gauge(m) => gauge::on_data_pulled(
                &self.meta,
                m,
                state,
                events,
                result,
                original_pull_time_ns,
                ctx,
            ),
            KindMeta::Value(m) => value::on_data_pulled(
                &self.meta,
                m,
                state,
                events,
                result,
                original_pull_time_ns,
                ctx,
            ),
            _ => {}
        }
    }

    /// Force a partial-bucket split if the metric opted into it.
    pub fn notify_app_upgrade(&self, event_time_ns: i64, stats: &EngineStats) {
        if !self.meta.split_bucket_for_app_upgrade {
            return;
        }
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        flush_full(&self.meta, &mut state, event_time_ns, stats);
    }

    /// Init-complete: promote armed on-boot activations, then split the
    /// bucket if the metric opted into splits.
    pub fn on_init_completed(&self, event_time_ns: i64, stats: &EngineStats) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        let mut promoted = false;
        for slot in &mut state.common.activations {
            if slot.state == ActivationState::ActiveOnBoot {
                slot.state = ActivationState::Active;
                slot.start_ns = event_time_ns;
                promoted = true;
            }
        }
        if promoted {
            let has_live = state.common.activations.iter().any(|s| {
                s.state == ActivationState::Active
                    && event_time_ns < s.start_ns.saturating_add(s.ttl_ns)
            });
            state.common.is_active = state.common.activations.is_empty() || has_live;
        }
        if self.meta.split_bucket_for_app_upgrade {
            flush_full(&self.meta, &mut state, event_time_ns, stats);
        }
    }

    /// Flush, then drop past buckets. In-flight bucket state survives so
    /// aggregation continues correctly.
    pub fn drop_data(&self, drop_time_ns: i64, stats: &EngineStats) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        flush_if_needed(&self.meta, &mut state, drop_time_ns, stats);
        stats.note_bucket_dropped(self.meta.metric_id);
        clear_past(&mut state.kind);
    }

    /// Unconditional partial-bucket split (config update boundary).
    pub(crate) fn split_bucket(&self, event_time_ns: i64, stats: &EngineStats) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        flush_full(&self.meta, &mut state, event_time_ns, stats);
    }

    /// Record that report data was withheld for memory pressure. The
    /// current bucket is invalidated so the reason reaches the report.
    pub fn note_memory_drop(&self, drop_time_ns: i64) {
        let mut state = self.state.lock();
        invalidate_bucket(
            &mut state.common,
            BucketDropReason::NoDumpBecauseMemory,
            drop_time_ns,
        );
    }

    pub fn clear_past_buckets(&self, dump_time_ns: i64, stats: &EngineStats) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        flush_if_needed(&self.meta, &mut state, dump_time_ns, stats);
        clear_past(&mut state.kind);
        state.common.skipped_buckets.clear();
    }

    /// Serialize this producer's report record.
    pub fn on_dump_report(
        &self,
        dump_time_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
        stats: &EngineStats,
        out: &mut ProtoWriter,
    ) {
        let mut state = self.state.lock();
        if !state.common.valid {
            return;
        }
        expire_activations(&mut state.common, dump_time_ns);
        if include_current_partial_bucket {
            flush_full(&self.meta, &mut state, dump_time_ns, stats);
        } else {
            flush_if_needed(&self.meta, &mut state, dump_time_ns, stats);
        }

        out.int64(fields::REPORT_ID, self.meta.metric_id);
        out.bool(fields::REPORT_IS_ACTIVE, state.common.is_active);

        if !has_report_data(&state.kind) && state.common.skipped_buckets.is_empty() {
            return;
        }

        if state.common.dimension_guardrail_hit {
            out.bool(fields::REPORT_DIMENSION_GUARDRAIL_HIT, true);
        }
        if self.metric_type() != MetricType::Event {
            out.int64(fields::REPORT_TIME_BASE, self.meta.time_base_ns);
            out.int64(fields::REPORT_BUCKET_SIZE, self.meta.bucket_size_ns);
        }
        if !self.meta.nested_dimensions {
            if let Some(spec) = &self.meta.dimensions_spec {
                write_dimension_path(out, fields::REPORT_DIMENSION_PATH_IN_WHAT, spec);
            }
        }

        let state = &mut *state;
        match (&self.meta.kind, &state.kind) {
            (KindMeta::Event(m), KindState::Event(k)) => {
                event::write_report(&self.meta, m, &state.common, k, out)
            }
            (KindMeta::Count(m), KindState::Count(k)) => {
                count::write_report(&self.meta, m, &state.common, k, out)
            }
            (KindMeta::Duration(m), KindState::Duration(k)) => {
                duration::write_report(&self.meta, m, &state.common, k, out)
            }
            (KindMeta::Gauge(m), KindState::Gauge(k)) => {
                gauge::write_report(&self.meta, m, &state.common, k, out)
            }
            (KindMeta::Value(m), KindState::Value(k)) => {
                value::write_report(&self.meta, m, &state.common, k, out)
            }
            (KindMeta::Kll(m), KindState::Kll(k)) => {
                kll::write_report(&self.meta, m, &state.common, k, out)
            }
            _ => {}
        }

        if erase_data {
            clear_past(&mut state.kind);
            state.common.skipped_buckets.clear();
            state.common.dimension_guardrail_hit = false;
        }
    }

    /// Approximate in-memory footprint, for pressure-driven eviction.
    pub fn byte_size(&self) -> usize {
        let state = self.state.lock();
        kind_byte_size(&state.kind) + state.common.skipped_buckets.len() * 64
    }

    /// Carry accumulated state over from the pre-update producer with an
    /// unchanged proto hash. Keeps the original time base so bucket
    /// numbering stays continuous.
    pub(crate) fn adopt(&mut self, old: MetricProducer) {
        let old_state = old.state.into_inner();
        let new_state = self.state.get_mut();
        if std::mem::discriminant(&old_state.kind) != std::mem::discriminant(&new_state.kind) {
            warn!(
                metric_id = self.meta.metric_id,
                "kind changed under an unchanged hash; state not carried"
            );
            return;
        }
        self.meta.time_base_ns = old.meta.time_base_ns;

        // Activation runtime state carries by position; indices are the
        // new graph's.
        let mut activations = std::mem::take(&mut new_state.common.activations);
        for (slot, old_slot) in activations.iter_mut().zip(&old_state.common.activations) {
            slot.start_ns = old_slot.start_ns;
            slot.state = old_slot.state;
        }

        let anomaly_trackers = std::mem::take(&mut new_state.common.anomaly_trackers);
        *new_state = old_state;
        new_state.common.activations = activations;
        new_state.common.anomaly_trackers = anomaly_trackers;
    }

    /// Metadata for the persistence collaborator: anomaly refractory
    /// timestamps.
    pub fn write_metadata(&self) -> Vec<(i64, HashMap<MetricDimensionKey, i64>)> {
        let state = self.state.lock();
        state
            .common
            .anomaly_trackers
            .iter()
            .map(|t| (t.alert_id(), t.alarm_timestamps().clone()))
            .collect()
    }

    /// Restore metadata written by [`write_metadata`](Self::write_metadata).
    /// Idempotent; unknown alert ids are ignored.
    pub fn load_metadata(&self, metadata: Vec<(i64, HashMap<MetricDimensionKey, i64>)>) {
        let mut state = self.state.lock();
        for (alert_id, timestamps) in metadata {
            if let Some(tracker) = state
                .common
                .anomaly_trackers
                .iter_mut()
                .find(|t| t.alert_id() == alert_id)
            {
                tracker.load_alarm_timestamps(timestamps);
            }
        }
    }
}

// --- Shared chassis ---

pub(crate) fn current_bucket_end_ns(meta: &ProducerMeta, common: &CommonState) -> i64 {
    meta.time_base_ns + (common.current_bucket_num + 1) * meta.bucket_size_ns
}

pub(crate) fn bucket_num_from_end_ns(meta: &ProducerMeta, end_ns: i64) -> i64 {
    (end_ns - meta.time_base_ns) / meta.bucket_size_ns - 1
}

fn mark_invalid(meta: &ProducerMeta, common: &mut CommonState, why: &str) {
    error!(metric_id = meta.metric_id, why, "metric producer terminated");
    common.valid = false;
}

pub(crate) fn append_drop_event(common: &mut CommonState, reason: BucketDropReason, ts: i64) {
    if common.current_drop_events.len() >= MAX_DROP_EVENTS {
        return;
    }
    common.current_drop_events.push(DropEvent {
        reason,
        drop_time_ns: ts,
    });
}

pub(crate) fn invalidate_bucket(common: &mut CommonState, reason: BucketDropReason, ts: i64) {
    common.current_bucket_invalid = true;
    append_drop_event(common, reason, ts);
}

/// Roll the current bucket forward when `event_time_ns` has passed its
/// end; elides empty intermediate buckets by skipping the bucket number
/// ahead.
pub(crate) fn flush_if_needed(
    meta: &ProducerMeta,
    state: &mut ProducerState,
    event_time_ns: i64,
    stats: &EngineStats,
) {
    let end = current_bucket_end_ns(meta, &state.common);
    if event_time_ns < end {
        return;
    }
    let forward = 1 + (event_time_ns - end) / meta.bucket_size_ns;
    if forward > 1 {
        // Attached to the closing bucket; surfaced only if it skips.
        append_drop_event(
            &mut state.common,
            BucketDropReason::MultipleBucketsSkipped,
            event_time_ns,
        );
    }
    let next_start = end + (forward - 1) * meta.bucket_size_ns;
    flush_current_bucket(meta, state, event_time_ns, next_start, stats);
    state.common.current_bucket_num += forward;
}

/// Flush everything including the current partial bucket, leaving the
/// new bucket anchored at `event_time_ns`. The bucket number is not
/// advanced for a partial split.
pub(crate) fn flush_full(
    meta: &ProducerMeta,
    state: &mut ProducerState,
    event_time_ns: i64,
    stats: &EngineStats,
) {
    flush_if_needed(meta, state, event_time_ns, stats);
    flush_current_bucket(meta, state, event_time_ns, event_time_ns, stats);
}

fn flush_current_bucket(
    meta: &ProducerMeta,
    state: &mut ProducerState,
    event_time_ns: i64,
    next_bucket_start_ns: i64,
    stats: &EngineStats,
) {
    let full_end = current_bucket_end_ns(meta, &state.common);
    let bucket_end = event_time_ns.min(full_end);
    let bucket_start = state.common.current_bucket_start_ns;

    let large_enough = bucket_end - bucket_start >= meta.min_bucket_size_ns;
    let persist = large_enough && !state.common.current_bucket_invalid;

    let anomaly_values = close_kind_bucket(meta, state, bucket_start, bucket_end, persist);

    if !persist && state.common.is_active {
        let mut drop_events = std::mem::take(&mut state.common.current_drop_events);
        if !large_enough && drop_events.len() < MAX_DROP_EVENTS {
            drop_events.push(DropEvent {
                reason: BucketDropReason::BucketTooSmall,
                drop_time_ns: event_time_ns,
            });
        }
        state.common.skipped_buckets.push(SkippedBucket {
            start_ns: bucket_start,
            end_ns: bucket_end,
            drop_events,
        });
    }

    // Anomaly windows advance only on full-bucket crossings; partial
    // splits do not feed them.
    if event_time_ns >= full_end && !state.common.anomaly_trackers.is_empty() {
        let bucket_num = state.common.current_bucket_num;
        for tracker in &mut state.common.anomaly_trackers {
            tracker.add_past_bucket(&anomaly_values, bucket_num);
        }
    }

    stats.note_bucket_count(meta.metric_id);
    state.common.current_bucket_start_ns = next_bucket_start_ns;
    state.common.current_drop_events.clear();
    state.common.current_bucket_invalid = false;
    state.common.has_hit_guardrail = false;
}

fn close_kind_bucket(
    meta: &ProducerMeta,
    state: &mut ProducerState,
    bucket_start: i64,
    bucket_end: i64,
    persist: bool,
) -> HashMap<MetricDimensionKey, i64> {
    match (&meta.kind, &mut state.kind) {
        (KindMeta::Event(_), KindState::Event(k)) => {
            event::close_bucket(k, bucket_start, bucket_end, persist)
        }
        (KindMeta::Count(_), KindState::Count(k)) => {
            count::close_bucket(k, bucket_start, bucket_end, persist)
        }
        (KindMeta::Duration(m), KindState::Duration(k)) => {
            duration::close_bucket(m, k, bucket_start, bucket_end, persist)
        }
        (KindMeta::Gauge(_), KindState::Gauge(k)) => {
            gauge::close_bucket(k, bucket_start, bucket_end, persist)
        }
        (KindMeta::Value(m), KindState::Value(k)) => {
            value::close_bucket(m, k, bucket_start, bucket_end, persist)
        }
        (KindMeta::Kll(_), KindState::Kll(k)) => {
            kll::close_bucket(k, bucket_start, bucket_end, persist)
        }
        _ => HashMap::new(),
    }
}

fn clear_past(kind: &mut KindState) {
    match kind {
        KindState::Event(k) => k.past.clear(),
        KindState::Count(k) => k.past.clear(),
        KindState::Duration(k) => k.past.clear(),
        KindState::Gauge(k) => k.past.clear(),
        KindState::Value(k) => k.past.clear(),
        KindState::Kll(k) => k.past.clear(),
    }
}

fn has_report_data(kind: &KindState) -> bool {
    match kind {
        KindState::Event(k) => !k.past.is_empty(),
        KindState::Count(k) => !k.past.is_empty(),
        KindState::Duration(k) => !k.past.is_empty(),
        KindState::Gauge(k) => !k.past.is_empty(),
        KindState::Value(k) => !k.past.is_empty(),
        KindState::Kll(k) => !k.past.is_empty(),
    }
}

fn kind_byte_size(kind: &KindState) -> usize {
    match kind {
        KindState::Event(k) => k.byte_size(),
        KindState::Count(k) => k.byte_size(),
        KindState::Duration(k) => k.byte_size(),
        KindState::Gauge(k) => k.byte_size(),
        KindState::Value(k) => k.byte_size(),
        KindState::Kll(k) => k.byte_size(),
    }
}

/// Expire TTL-lapsed activations without any transition side effects;
/// used on the dump path where the producer lock is already held.
fn expire_activations(common: &mut CommonState, now_ns: i64) {
    if common.activations.is_empty() {
        return;
    }
    for slot in &mut common.activations {
        if slot.state == ActivationState::Active
            && now_ns >= slot.start_ns.saturating_add(slot.ttl_ns)
        {
            slot.state = ActivationState::NotActive;
        }
    }
    common.is_active = common
        .activations
        .iter()
        .any(|s| s.state == ActivationState::Active);
}

/// Recompute the activation-derived active bit, running the transition
/// side effects (bucket flush on deactivation, pull on activation).
pub(crate) fn evaluate_active_state(
    meta: &ProducerMeta,
    state: &mut ProducerState,
    now_ns: i64,
    ctx: &DispatchContext<'_>,
) {
    if state.common.activations.is_empty() {
        return;
    }
    let was_active = state.common.is_active;

    let mut latest_expiry = i64::MIN;
    for slot in &mut state.common.activations {
        if slot.state == ActivationState::Active {
            let expiry = slot.start_ns.saturating_add(slot.ttl_ns);
            if now_ns >= expiry {
                slot.state = ActivationState::NotActive;
                latest_expiry = latest_expiry.max(expiry);
            }
        }
    }
    let is_active = state
        .common
        .activations
        .iter()
        .any(|s| s.state == ActivationState::Active);
    if is_active == was_active {
        return;
    }
    state.common.is_active = is_active;

    if !is_active {
        // Deactivation flushes what the metric accumulated while active.
        let flush_at = if latest_expiry > i64::MIN {
            latest_expiry.min(now_ns)
        } else {
            now_ns
        };
        flush_full(meta, state, flush_at, ctx.stats);
        return;
    }

    // Activation side effects are kind-specific: pulled metrics sample.
    match &meta.kind {
        KindMeta::Gauge(m) => gauge::on_became_active(meta, m, state, now_ns, ctx),
        KindMeta::Value(m) => value::on_became_active(meta, m, state, now_ns, ctx),
        _ => {}
    }
}

/// Extract the condition key from the event through the metric's links.
fn extract_condition_key(meta: &ProducerMeta, event: &Event) -> DimensionKey {
    if meta.links.is_empty() {
        return DimensionKey::default();
    }
    let mut out = Vec::new();
    for link in &meta.links {
        let what = filter_values(&link.fields_in_what, event.values());
        let translated = crate::event::field::translate_dimension(
            &what,
            &link.fields_in_what,
            &link.fields_in_condition,
        );
        out.extend(translated.values().iter().cloned());
    }
    DimensionKey::new(out)
}

/// Deterministic sampled-dimension shard check.
pub(crate) fn passes_sample_check(meta: &ProducerMeta, shard_offset: u32, event: &Event) -> bool {
    if meta.shard_count == 0 {
        return true;
    }
    let sampled = filter_values(&meta.sampled_fields, event.values());
    if sampled.is_empty() {
        return true;
    }
    let hash = hash64(&sampled.hash_bytes());
    (hash.wrapping_add(u64::from(shard_offset))) % u64::from(meta.shard_count) == 0
}

/// The dimension guardrail. Returns true when the new key must be
/// dropped.
pub(crate) fn hit_dimension_guardrail(
    meta: &ProducerMeta,
    common: &mut CommonState,
    current_len: usize,
    already_present: bool,
    stats: &EngineStats,
) -> bool {
    if already_present {
        return false;
    }
    let new_count = current_len + 1;
    if new_count >= meta.dimension_soft_limit {
        stats.note_metric_dimension_size(meta.metric_id, new_count);
        if new_count > meta.dimension_hard_limit {
            if !common.has_hit_guardrail {
                warn!(
                    metric_id = meta.metric_id,
                    new_count, "dimension hard limit reached; dropping new dimensions"
                );
                common.has_hit_guardrail = true;
                stats.note_hard_dimension_limit_reached(meta.metric_id);
            }
            common.dimension_guardrail_hit = true;
            return true;
        }
    }
    false
}

/// Push-mode random sampling; deterministic per producer.
pub(crate) fn keep_random_sample(common: &mut CommonState, percentage: u32) -> bool {
    if percentage >= 100 {
        return true;
    }
    // xorshift64
    common.rng ^= common.rng << 13;
    common.rng ^= common.rng >> 7;
    common.rng ^= common.rng << 17;
    (common.rng % 100) < u64::from(percentage)
}

/// Re-match pulled atoms through the metric's what matcher, re-stamp
/// them, and hand each hit to `consume`.
pub(crate) fn match_pulled_events(
    meta: &ProducerMeta,
    ctx: &DispatchContext<'_>,
    events: &[Event],
    stamp_ns: i64,
    mut consume: impl FnMut(&Event),
) {
    let mut cache = MatchCache::new(ctx.matchers.matcher_count());
    for event in events {
        if ctx.matchers.match_event(&mut cache, event, meta.what_matcher_index)
            == MatchResult::Matched
        {
            let base = ctx
                .matchers
                .transformed(&cache, meta.what_matcher_index)
                .unwrap_or(event);
            let mut local = base.clone();
            local.set_elapsed_ns(stamp_ns);
            consume(&local);
        }
        // The cache is per-event.
        cache = MatchCache::new(ctx.matchers.matcher_count());
    }
}

/// Shared skipped-bucket serialization.
pub(crate) fn write_skipped_buckets(common: &CommonState, w: &mut ProtoWriter) {
    for skipped in &common.skipped_buckets {
        w.message(fields::WRAPPER_SKIPPED, |sb| {
            sb.int64(fields::SKIPPED_START_MILLIS, nano_to_millis(skipped.start_ns));
            sb.int64(fields::SKIPPED_END_MILLIS, nano_to_millis(skipped.end_ns));
            for drop in &skipped.drop_events {
                sb.message(fields::SKIPPED_DROP_EVENT, |de| {
                    de.int32(fields::DROP_REASON, drop.reason.code());
                    de.int64(fields::DROP_TIME, nano_to_millis(drop.drop_time_ns));
                });
            }
        });
    }
}

/// Shared bucket header: bucket number for exactly-full buckets, explicit
/// start/end milliseconds otherwise.
pub(crate) fn write_bucket_bounds(
    meta: &ProducerMeta,
    start_ns: i64,
    end_ns: i64,
    w: &mut ProtoWriter,
) {
    if end_ns - start_ns == meta.bucket_size_ns {
        w.int64(fields::BUCKET_NUM, bucket_num_from_end_ns(meta, end_ns));
    } else {
        w.int64(fields::BUCKET_START_MILLIS, nano_to_millis(start_ns));
        w.int64(fields::BUCKET_END_MILLIS, nano_to_millis(end_ns));
    }
}

/// Shared dimension serialization for one data entry.
pub(crate) fn write_data_dimension(
    meta: &ProducerMeta,
    key: &MetricDimensionKey,
    w: &mut ProtoWriter,
) {
    if meta.nested_dimensions {
        crate::report::write_dimension_key(w, fields::DATA_DIMENSION_IN_WHAT, key.what());
    } else {
        crate::report::write_dimension_leaves(w, fields::DATA_DIMENSION_LEAF_IN_WHAT, key.what());
    }
}
