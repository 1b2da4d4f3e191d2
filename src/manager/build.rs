//! Config-to-graph construction.
//!
//! Builds the matcher, condition, and producer arenas plus every reverse
//! index from one [`TelemetryConfig`]. Any invalid reference, cycle, or
//! malformed entity rejects the whole install; nothing partial is ever
//! produced.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::anomaly::AnomalyTracker;
use crate::condition::{build_conditions, ConditionState, ConditionTracker};
use crate::config::{
    self, ConfigKey, DimensionGuardrailConfig, DimensionalSamplingConfig, InvalidConfigReason,
    MetricConditionLink, TelemetryConfig, ValueAggregation,
};
use crate::event::field::{
    translate_field_matcher, DimensionSpec, FieldMatcherNode, Matcher, Position,
};
use crate::matcher::{build_matchers, AtomMatcherTracker};
use crate::metrics::{
    count, duration, event, gauge, kll, value, ActivationSlot, ActivationState, CompiledLink,
    KindMeta, MetricProducer, ProducerMeta,
};
use crate::stats::{
    DEFAULT_DIMENSION_HARD_LIMIT, DEFAULT_DIMENSION_SOFT_LIMIT, DEFAULT_MAX_PULL_DELAY_NS,
};

use super::EvalGraph;

struct BuildCtx<'a> {
    config: &'a TelemetryConfig,
    config_key: ConfigKey,
    time_base_ns: i64,
    matchers: &'a [AtomMatcherTracker],
    matcher_map: &'a HashMap<i64, usize>,
    conditions: &'a [ConditionTracker],
    condition_map: &'a HashMap<i64, usize>,
}

pub(crate) fn build_graph(
    config: &TelemetryConfig,
    config_key: ConfigKey,
    time_base_ns: i64,
) -> Result<EvalGraph, InvalidConfigReason> {
    let (matchers, matcher_map) = build_matchers(&config.atom_matchers)?;
    let (conditions, condition_map) = build_conditions(&config.conditions, &matcher_map)?;

    let mut seen_metric_ids = HashSet::new();
    for id in config.metric_ids() {
        if !seen_metric_ids.insert(id) {
            return Err(InvalidConfigReason::DuplicateId(id));
        }
    }
    for activation in &config.activations {
        if !seen_metric_ids.contains(&activation.metric_id) {
            return Err(InvalidConfigReason::ActivationMetricNotFound(
                activation.metric_id,
            ));
        }
    }

    let ctx = BuildCtx {
        config,
        config_key,
        time_base_ns,
        matchers: &matchers,
        matcher_map: &matcher_map,
        conditions: &conditions,
        condition_map: &condition_map,
    };

    let mut producers = Vec::new();
    for m in &config.event_metrics {
        producers.push(build_event_metric(&ctx, m)?);
    }
    for m in &config.count_metrics {
        producers.push(build_count_metric(&ctx, m)?);
    }
    for m in &config.duration_metrics {
        producers.push(build_duration_metric(&ctx, m)?);
    }
    for m in &config.gauge_metrics {
        producers.push(build_gauge_metric(&ctx, m)?);
    }
    for m in &config.value_metrics {
        producers.push(build_value_metric(&ctx, m)?);
    }
    for m in &config.kll_metrics {
        producers.push(build_kll_metric(&ctx, m)?);
    }

    let metric_index_by_id: HashMap<i64, usize> = producers
        .iter()
        .enumerate()
        .map(|(i, p)| (p.metric_id(), i))
        .collect();

    for alert in &config.alerts {
        let Some(&idx) = metric_index_by_id.get(&alert.metric_id) else {
            return Err(InvalidConfigReason::AlertMetricNotFound(
                alert.id,
                alert.metric_id,
            ));
        };
        producers[idx].add_anomaly_tracker(AnomalyTracker::new(alert.clone(), config_key));
    }

    Ok(assemble_graph(
        config,
        matchers,
        conditions,
        producers,
        matcher_map,
        condition_map,
        metric_index_by_id,
    ))
}

fn assemble_graph(
    config: &TelemetryConfig,
    matchers: Vec<AtomMatcherTracker>,
    conditions: Vec<ConditionTracker>,
    producers: Vec<MetricProducer>,
    matcher_map: HashMap<i64, usize>,
    condition_map: HashMap<i64, usize>,
    metric_index_by_id: HashMap<i64, usize>,
) -> EvalGraph {
    let mut tag_to_matchers: HashMap<i32, Vec<usize>> = HashMap::new();
    for (i, matcher) in matchers.iter().enumerate() {
        for tag in matcher.covered_tag_ids() {
            tag_to_matchers.entry(*tag).or_default().push(i);
        }
    }

    let mut matcher_to_conditions: HashMap<usize, Vec<usize>> = HashMap::new();
    for (ci, condition) in conditions.iter().enumerate() {
        for mi in condition.input_matchers() {
            matcher_to_conditions.entry(mi).or_default().push(ci);
        }
    }

    let mut matcher_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut condition_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut activation_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut deactivation_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();

    for (pi, producer) in producers.iter().enumerate() {
        for mi in producer.subscribed_matchers() {
            let subs = matcher_to_metrics.entry(mi).or_default();
            if !subs.contains(&pi) {
                subs.push(pi);
            }
        }
        if let Some(ci) = producer.condition_index() {
            condition_to_metrics.entry(ci).or_default().push(pi);
        }
    }
    for activation in &config.activations {
        let Some(&pi) = metric_index_by_id.get(&activation.metric_id) else {
            continue;
        };
        for a in &activation.activations {
            if let Some(&mi) = matcher_map.get(&a.activation_matcher) {
                activation_to_metrics.entry(mi).or_default().push(pi);
            }
            if let Some(&mi) = a.deactivation_matcher.and_then(|d| matcher_map.get(&d)) {
                deactivation_to_metrics.entry(mi).or_default().push(pi);
            }
        }
    }

    EvalGraph {
        matchers,
        conditions: parking_lot::Mutex::new(conditions),
        producers,
        matcher_map,
        condition_map,
        metric_index_by_id,
        tag_to_matchers,
        matcher_to_conditions,
        matcher_to_metrics,
        condition_to_metrics,
        activation_to_metrics,
        deactivation_to_metrics,
    }
}

// --- Per-metric builders ---

struct CommonParts {
    condition_index: Option<usize>,
    condition_sliced: bool,
    links: Vec<CompiledLink>,
    dimensions: Vec<Matcher>,
    dimensions_spec: Option<DimensionSpec>,
    nested_dimensions: bool,
    bucket_size_ns: i64,
    min_bucket_size_ns: i64,
    soft_limit: usize,
    hard_limit: usize,
    split_bucket_for_app_upgrade: bool,
    sampled_fields: Vec<Matcher>,
    shard_count: u32,
    initial_condition: ConditionState,
    activations: Vec<ActivationSlot>,
}

#[allow(clippy::too_many_arguments)]
fn common_parts(
    ctx: &BuildCtx<'_>,
    metric_id: i64,
    condition: Option<i64>,
    links: &[MetricConditionLink],
    dimensions: Option<&DimensionSpec>,
    bucket: Duration,
    min_bucket_size: Option<Duration>,
    guardrail: Option<DimensionGuardrailConfig>,
    split: Option<bool>,
    sampling: Option<&DimensionalSamplingConfig>,
) -> Result<CommonParts, InvalidConfigReason> {
    let bucket_size_ns = duration_ns(bucket);
    if bucket_size_ns <= 0 {
        return Err(InvalidConfigReason::BadBucketSize(metric_id));
    }

    let condition_index = match condition {
        Some(id) => Some(
            *ctx.condition_map
                .get(&id)
                .ok_or(InvalidConfigReason::ConditionNotFound(id))?,
        ),
        None => None,
    };

    let mut compiled_links = Vec::with_capacity(links.len());
    for link in links {
        let link_index = *ctx
            .condition_map
            .get(&link.condition)
            .ok_or(InvalidConfigReason::ConditionNotFound(link.condition))?;
        compiled_links.push(CompiledLink {
            condition_index: link_index,
            fields_in_what: translate_field_matcher(&link.fields_in_what),
            fields_in_condition: translate_field_matcher(&link.fields_in_condition),
        });
    }

    let soft_limit = guardrail
        .and_then(|g| g.soft_limit)
        .unwrap_or(DEFAULT_DIMENSION_SOFT_LIMIT);
    let hard_limit = guardrail
        .and_then(|g| g.hard_limit)
        .unwrap_or(DEFAULT_DIMENSION_HARD_LIMIT);
    if soft_limit > hard_limit {
        return Err(InvalidConfigReason::BadGuardrail(metric_id));
    }

    let (sampled_fields, shard_count) = match sampling {
        Some(s) => {
            if s.shard_count == 0 {
                return Err(InvalidConfigReason::BadShardCount(metric_id));
            }
            (translate_field_matcher(&s.sampled_what_field), s.shard_count)
        }
        None => (Vec::new(), 0),
    };

    let initial_condition = condition_index
        .map(|ci| ctx.conditions[ci].last_value())
        .unwrap_or(ConditionState::True);

    let mut activations = Vec::new();
    if let Some(activation) = ctx.config.activation_for(metric_id) {
        for a in &activation.activations {
            let activation_matcher_index = *ctx
                .matcher_map
                .get(&a.activation_matcher)
                .ok_or(InvalidConfigReason::MatcherNotFound(a.activation_matcher))?;
            let deactivation_matcher_index = match a.deactivation_matcher {
                Some(id) => Some(
                    *ctx.matcher_map
                        .get(&id)
                        .ok_or(InvalidConfigReason::MatcherNotFound(id))?,
                ),
                None => None,
            };
            activations.push(ActivationSlot {
                activation_matcher_index,
                deactivation_matcher_index,
                activation_type: a.activation_type,
                ttl_ns: duration_ns(a.ttl),
                start_ns: 0,
                state: ActivationState::NotActive,
            });
        }
    }

    Ok(CommonParts {
        condition_index,
        condition_sliced: !links.is_empty(),
        links: compiled_links,
        dimensions: dimensions.map(translate_field_matcher).unwrap_or_default(),
        dimensions_spec: dimensions.cloned(),
        nested_dimensions: dimensions.is_some_and(spec_has_position_all),
        bucket_size_ns,
        min_bucket_size_ns: min_bucket_size.map(duration_ns).unwrap_or(0),
        soft_limit,
        hard_limit,
        split_bucket_for_app_upgrade: split.unwrap_or(false),
        sampled_fields,
        shard_count,
        initial_condition,
        activations,
    })
}

fn make_producer(
    ctx: &BuildCtx<'_>,
    metric_id: i64,
    proto_hash: u64,
    what_matcher_index: usize,
    parts: CommonParts,
    kind: KindMeta,
) -> MetricProducer {
    let meta = ProducerMeta {
        metric_id,
        config_key: ctx.config_key,
        proto_hash,
        what_matcher_index,
        condition_index: parts.condition_index,
        condition_sliced: parts.condition_sliced,
        links: parts.links,
        dimensions: parts.dimensions,
        dimensions_spec: parts.dimensions_spec,
        nested_dimensions: parts.nested_dimensions,
        time_base_ns: ctx.time_base_ns,
        bucket_size_ns: parts.bucket_size_ns,
        min_bucket_size_ns: parts.min_bucket_size_ns,
        dimension_soft_limit: parts.soft_limit,
        dimension_hard_limit: parts.hard_limit,
        split_bucket_for_app_upgrade: parts.split_bucket_for_app_upgrade,
        sampled_fields: parts.sampled_fields,
        shard_count: parts.shard_count,
        kind,
    };
    MetricProducer::new(meta, parts.initial_condition, parts.activations)
}

fn build_event_metric(
    ctx: &BuildCtx<'_>,
    m: &config::EventMetricConfig,
) -> Result<MetricProducer, InvalidConfigReason> {
    let what = resolve_matcher(ctx, m.what)?;
    let parts = common_parts(
        ctx,
        m.id,
        m.condition,
        &m.links,
        None,
        // Event output is segmented hourly by default.
        Duration::from_secs(3600),
        None,
        None,
        m.split_bucket_for_app_upgrade,
        None,
    )?;
    let kind = KindMeta::Event(event::EventMeta {
        sampling_percentage: m.sampling_percentage,
    });
    let hash = config::event_metric_hash(ctx.config, m);
    Ok(make_producer(ctx, m.id, hash, what, parts, kind))
}

fn build_count_metric(
    ctx: &BuildCtx<'_>,
    m: &config::CountMetricConfig,
) -> Result<MetricProducer, InvalidConfigReason> {
    let what = resolve_matcher(ctx, m.what)?;
    let parts = common_parts(
        ctx,
        m.id,
        m.condition,
        &m.links,
        m.dimensions_in_what.as_ref(),
        m.bucket,
        m.min_bucket_size,
        m.guardrail,
        m.split_bucket_for_app_upgrade,
        m.sampling.as_ref(),
    )?;
    let kind = KindMeta::Count(count::CountMeta {
        threshold: m.threshold,
    });
    let hash = config::count_metric_hash(ctx.config, m);
    Ok(make_producer(ctx, m.id, hash, what, parts, kind))
}

fn build_duration_metric(
    ctx: &BuildCtx<'_>,
    m: &config::DurationMetricConfig,
) -> Result<MetricProducer, InvalidConfigReason> {
    let what_condition_index = *ctx
        .condition_map
        .get(&m.what)
        .ok_or(InvalidConfigReason::ConditionNotFound(m.what))?;
    let what_tracker = &ctx.conditions[what_condition_index];
    let Some((start, stop, stop_all)) = what_tracker.duration_matchers() else {
        return Err(InvalidConfigReason::DurationWhatNotSimple(m.id, m.what));
    };
    let nested = what_tracker.count_nesting().unwrap_or(true);

    let parts = common_parts(
        ctx,
        m.id,
        m.condition,
        &m.links,
        m.dimensions_in_what.as_ref(),
        m.bucket,
        m.min_bucket_size,
        m.guardrail,
        m.split_bucket_for_app_upgrade,
        None,
    )?;
    let kind = KindMeta::Duration(duration::DurationMeta {
        start_matcher_index: start,
        stop_matcher_index: stop,
        stop_all_matcher_index: stop_all,
        nested,
        aggregation: m.aggregation,
    });
    let hash = config::duration_metric_hash(ctx.config, m);
    Ok(make_producer(ctx, m.id, hash, start, parts, kind))
}

fn build_gauge_metric(
    ctx: &BuildCtx<'_>,
    m: &config::GaugeMetricConfig,
) -> Result<MetricProducer, InvalidConfigReason> {
    let what = resolve_matcher(ctx, m.what)?;
    let atom_id = single_covered_atom(ctx, m.id, m.what, what)?;
    let (trigger_matcher_index, trigger_atom_id) = match m.trigger_event {
        Some(trigger_id) => {
            let trigger_index = resolve_matcher(ctx, trigger_id)?;
            let trigger_atom = single_covered_atom(ctx, m.id, trigger_id, trigger_index)?;
            (Some(trigger_index), Some(trigger_atom))
        }
        None => (None, None),
    };

    let parts = common_parts(
        ctx,
        m.id,
        m.condition,
        &m.links,
        m.dimensions_in_what.as_ref(),
        m.bucket,
        m.min_bucket_size,
        m.guardrail,
        m.split_bucket_for_app_upgrade,
        None,
    )?;
    let kind = KindMeta::Gauge(gauge::GaugeMeta {
        atom_id,
        pull_tag_id: m.pull_tag_id,
        trigger_matcher_index,
        trigger_atom_id,
        sampling_type: m.sampling_type,
        atoms_per_dimension_limit: m.max_num_gauge_atoms_per_bucket.max(1),
        field_filter: m.gauge_fields.as_ref().map(|s| translate_field_matcher(s)),
        max_pull_delay_ns: m
            .max_pull_delay
            .map(duration_ns)
            .unwrap_or(DEFAULT_MAX_PULL_DELAY_NS),
        sampling_percentage: m.sampling_percentage,
    });
    let hash = config::gauge_metric_hash(ctx.config, m);
    Ok(make_producer(ctx, m.id, hash, what, parts, kind))
}

fn build_value_metric(
    ctx: &BuildCtx<'_>,
    m: &config::ValueMetricConfig,
) -> Result<MetricProducer, InvalidConfigReason> {
    let what = resolve_matcher(ctx, m.what)?;
    single_covered_atom(ctx, m.id, m.what, what)?;

    let value_fields = translate_field_matcher(&m.value_fields);
    if value_fields.is_empty() {
        return Err(InvalidConfigReason::MissingValueFields(m.id));
    }
    let aggregations = expand_aggregations(m.id, &m.aggregation_types, value_fields.len())?;

    let parts = common_parts(
        ctx,
        m.id,
        m.condition,
        &m.links,
        m.dimensions_in_what.as_ref(),
        m.bucket,
        m.min_bucket_size,
        m.guardrail,
        m.split_bucket_for_app_upgrade,
        None,
    )?;
    let kind = KindMeta::Value(value::ValueMeta {
        pull_tag_id: m.pull_tag_id,
        value_fields,
        aggregations,
        use_absolute_value_on_reset: m.use_absolute_value_on_reset,
        max_pull_delay_ns: m
            .max_pull_delay
            .map(duration_ns)
            .unwrap_or(DEFAULT_MAX_PULL_DELAY_NS),
    });
    let hash = config::value_metric_hash(ctx.config, m);
    Ok(make_producer(ctx, m.id, hash, what, parts, kind))
}

fn build_kll_metric(
    ctx: &BuildCtx<'_>,
    m: &config::KllMetricConfig,
) -> Result<MetricProducer, InvalidConfigReason> {
    let what = resolve_matcher(ctx, m.what)?;
    single_covered_atom(ctx, m.id, m.what, what)?;

    let value_fields = translate_field_matcher(&m.value_fields);
    if value_fields.is_empty() {
        return Err(InvalidConfigReason::MissingValueFields(m.id));
    }

    let parts = common_parts(
        ctx,
        m.id,
        m.condition,
        &m.links,
        m.dimensions_in_what.as_ref(),
        m.bucket,
        m.min_bucket_size,
        m.guardrail,
        m.split_bucket_for_app_upgrade,
        None,
    )?;
    let kind = KindMeta::Kll(kll::KllMeta { value_fields });
    let hash = config::kll_metric_hash(ctx.config, m);
    Ok(make_producer(ctx, m.id, hash, what, parts, kind))
}

// --- Small helpers ---

fn resolve_matcher(ctx: &BuildCtx<'_>, id: i64) -> Result<usize, InvalidConfigReason> {
    ctx.matcher_map
        .get(&id)
        .copied()
        .ok_or(InvalidConfigReason::MatcherNotFound(id))
}

/// Matchers used where exactly one atom is allowed.
fn single_covered_atom(
    ctx: &BuildCtx<'_>,
    metric_id: i64,
    matcher_id: i64,
    matcher_index: usize,
) -> Result<i32, InvalidConfigReason> {
    let tags = ctx.matchers[matcher_index].covered_tag_ids();
    if tags.len() != 1 {
        return Err(InvalidConfigReason::NotOneAtom(metric_id, matcher_id));
    }
    Ok(*tags.iter().next().unwrap_or(&0))
}

fn expand_aggregations(
    metric_id: i64,
    declared: &[ValueAggregation],
    field_count: usize,
) -> Result<Vec<ValueAggregation>, InvalidConfigReason> {
    match declared.len() {
        1 => Ok(vec![declared[0]; field_count]),
        n if n == field_count => Ok(declared.to_vec()),
        _ => Err(InvalidConfigReason::AggregationArity(metric_id)),
    }
}

fn spec_has_position_all(spec: &DimensionSpec) -> bool {
    fn node_has_all(node: &FieldMatcherNode) -> bool {
        node.position == Some(Position::All) || node.children.iter().any(node_has_all)
    }
    spec.fields.iter().any(node_has_all)
}

fn duration_ns(d: Duration) -> i64 {
    d.as_nanos().min(i64::MAX as u128) as i64
}
