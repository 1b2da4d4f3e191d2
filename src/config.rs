//! Configuration input: the structured description of matchers,
//! conditions, metrics, activations, and alerts that a graph is built
//! from, plus the stable content hash used for update diffing.
//!
//! Everything is serde-deserializable so configs load from YAML the same
//! way operational configs do; every entity carries a 64-bit id.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::event::field::{DimensionSpec, Position};

fn default_true() -> bool {
    true
}

fn default_bucket() -> Duration {
    Duration::from_secs(3600)
}

fn default_gauge_atoms_per_bucket() -> usize {
    10
}

fn default_sampling_percentage() -> u32 {
    100
}

/// Identifies the owner of an installed configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConfigKey {
    pub uid: i32,
    pub id: i64,
}

impl ConfigKey {
    pub fn new(uid: i32, id: i64) -> Self {
        Self { uid, id }
    }
}

/// Top-level configuration: everything one evaluation graph is built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub id: i64,

    #[serde(default)]
    pub atom_matchers: Vec<AtomMatcherConfig>,

    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,

    #[serde(default)]
    pub event_metrics: Vec<EventMetricConfig>,

    #[serde(default)]
    pub count_metrics: Vec<CountMetricConfig>,

    #[serde(default)]
    pub duration_metrics: Vec<DurationMetricConfig>,

    #[serde(default)]
    pub gauge_metrics: Vec<GaugeMetricConfig>,

    #[serde(default)]
    pub value_metrics: Vec<ValueMetricConfig>,

    #[serde(default)]
    pub kll_metrics: Vec<KllMetricConfig>,

    #[serde(default)]
    pub activations: Vec<MetricActivationConfig>,

    #[serde(default)]
    pub alerts: Vec<AlertConfig>,
}

impl TelemetryConfig {
    /// Load a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let cfg: TelemetryConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config from {}", path.display()))?;
        Ok(cfg)
    }

    /// All metric ids across every kind, in declaration order.
    pub fn metric_ids(&self) -> Vec<i64> {
        let mut ids = Vec::new();
        ids.extend(self.event_metrics.iter().map(|m| m.id));
        ids.extend(self.count_metrics.iter().map(|m| m.id));
        ids.extend(self.duration_metrics.iter().map(|m| m.id));
        ids.extend(self.gauge_metrics.iter().map(|m| m.id));
        ids.extend(self.value_metrics.iter().map(|m| m.id));
        ids.extend(self.kll_metrics.iter().map(|m| m.id));
        ids
    }

    pub fn activation_for(&self, metric_id: i64) -> Option<&MetricActivationConfig> {
        self.activations.iter().find(|a| a.metric_id == metric_id)
    }
}

/// An atom matcher: exactly one of `simple` or `combination` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtomMatcherConfig {
    pub id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple: Option<SimpleMatcherConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combination: Option<CombinationConfig>,
}

/// Predicate over a single atom: the atom id plus field constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleMatcherConfig {
    pub atom_id: i32,

    #[serde(default)]
    pub field_value_matchers: Vec<FieldValueMatcherConfig>,

    /// Fields stripped from the transformed event this matcher reports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strip_fields: Vec<DimensionSpec>,
}

/// Equality constraint on one field, possibly positioned over a repeated
/// sub-message. Either `eq_value` (leaf) or `matches_tuple` (constraints
/// on the selected elements' sub-fields) must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldValueMatcherConfig {
    /// 1-based field number at the atom's top level.
    pub field: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eq_value: Option<MatchValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches_tuple: Vec<SubFieldMatcherConfig>,
}

/// Equality constraint on a sub-field of a selected repeated element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubFieldMatcherConfig {
    pub field: u8,
    pub eq_value: MatchValue,
}

/// Scalar a field constraint compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

/// AND/OR/NOT over child entity references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinationConfig {
    pub operation: LogicalOperation,
    #[serde(default)]
    pub children: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperation {
    And,
    Or,
    Not,
}

/// A condition: exactly one of `simple` or `combination` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple: Option<SimpleConditionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combination: Option<CombinationConfig>,
}

/// Start/stop-driven condition with optional dimension slicing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleConditionConfig {
    /// Matcher id whose matches start the condition.
    pub start: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_all: Option<i64>,

    /// Whether repeated starts stack (true) or coalesce (false).
    #[serde(default = "default_true")]
    pub count_nesting: bool,

    /// Slicing dimension; absent means a single unsliced state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<DimensionSpec>,

    #[serde(default)]
    pub initial_value: InitialConditionValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialConditionValue {
    #[default]
    Unknown,
    False,
}

/// Links a metric's extracted fields to a sliced condition's dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConditionLink {
    pub condition: i64,
    pub fields_in_what: DimensionSpec,
    pub fields_in_condition: DimensionSpec,
}

/// Inclusive count range outside which a dimension is suppressed from
/// report output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UploadThresholdConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<i64>,
}

impl UploadThresholdConfig {
    pub fn contains(&self, v: i64) -> bool {
        self.low.map_or(true, |low| v >= low) && self.high.map_or(true, |high| v <= high)
    }
}

/// Deterministic dimension sharding: keep a dimension iff
/// `(hash64(sampled values) + shard offset) % shard_count == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionalSamplingConfig {
    pub sampled_what_field: DimensionSpec,
    pub shard_count: u32,
}

/// Per-metric dimension cardinality overrides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DimensionGuardrailConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetricConfig {
    pub id: i64,
    /// Matcher id for the events this metric records.
    pub what: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<MetricConditionLink>,
    #[serde(default = "default_sampling_percentage")]
    pub sampling_percentage: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_bucket_for_app_upgrade: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountMetricConfig {
    pub id: i64,
    pub what: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions_in_what: Option<DimensionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<MetricConditionLink>,
    #[serde(default = "default_bucket", with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_bucket_size: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<UploadThresholdConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<DimensionalSamplingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<DimensionGuardrailConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_bucket_for_app_upgrade: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationAggregation {
    Sum,
    MaxSparse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationMetricConfig {
    pub id: i64,
    /// Condition id of a *simple* condition whose start/stop/stop-all
    /// matchers drive the duration state machine.
    pub what: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions_in_what: Option<DimensionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<MetricConditionLink>,
    pub aggregation: DurationAggregation,
    #[serde(default = "default_bucket", with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_bucket_size: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<DimensionGuardrailConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_bucket_for_app_upgrade: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeSamplingType {
    #[default]
    RandomOneSample,
    FirstNSamples,
    ConditionChangeToTrue,
    AllConditionChanges,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaugeMetricConfig {
    pub id: i64,
    pub what: i64,
    /// Atom id served by the platform puller; absent means push-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_tag_id: Option<i32>,
    /// Matcher id whose matches trigger a synchronous pull.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions_in_what: Option<DimensionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<MetricConditionLink>,
    #[serde(default)]
    pub sampling_type: GaugeSamplingType,
    /// Gauge field filter; absent captures every field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gauge_fields: Option<DimensionSpec>,
    #[serde(default = "default_gauge_atoms_per_bucket")]
    pub max_num_gauge_atoms_per_bucket: usize,
    #[serde(default = "default_bucket", with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_bucket_size: Option<Duration>,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_pull_delay: Option<Duration>,
    #[serde(default = "default_sampling_percentage")]
    pub sampling_percentage: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<DimensionGuardrailConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_bucket_for_app_upgrade: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueAggregation {
    Sum,
    Min,
    Max,
    Avg,
    Diff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueMetricConfig {
    pub id: i64,
    pub what: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_tag_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions_in_what: Option<DimensionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<MetricConditionLink>,
    /// Numeric fields to aggregate.
    pub value_fields: DimensionSpec,
    /// One aggregation per value field; a single entry applies to all.
    pub aggregation_types: Vec<ValueAggregation>,
    #[serde(default)]
    pub use_absolute_value_on_reset: bool,
    #[serde(default = "default_bucket", with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_bucket_size: Option<Duration>,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_pull_delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<DimensionGuardrailConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_bucket_for_app_upgrade: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KllMetricConfig {
    pub id: i64,
    pub what: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions_in_what: Option<DimensionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<MetricConditionLink>,
    pub value_fields: DimensionSpec,
    #[serde(default = "default_bucket", with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_bucket_size: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<DimensionGuardrailConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_bucket_for_app_upgrade: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationType {
    /// Active as soon as the activation event arrives.
    #[default]
    Immediate,
    /// Armed by the activation event, active from the next init-complete.
    OnBoot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventActivationConfig {
    /// Matcher id whose matches (re-)arm this activation.
    pub activation_matcher: i64,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivation_matcher: Option<i64>,
    #[serde(default)]
    pub activation_type: ActivationType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricActivationConfig {
    pub metric_id: i64,
    pub activations: Vec<EventActivationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub id: i64,
    pub metric_id: i64,
    /// Trailing window length in buckets.
    pub num_buckets: u32,
    pub trigger_if_sum_gt: i64,
    #[serde(default, with = "humantime_serde")]
    pub refractory_period: Duration,
}

/// Why a configuration was rejected at construction. Partial installation
/// never happens: the first reason aborts the whole install.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidConfigReason {
    #[error("matcher {0} referenced but not defined")]
    MatcherNotFound(i64),

    #[error("condition {0} referenced but not defined")]
    ConditionNotFound(i64),

    #[error("matcher {0} must set exactly one of simple/combination")]
    MatcherMalformed(i64),

    #[error("condition {0} must set exactly one of simple/combination")]
    ConditionMalformed(i64),

    #[error("cycle through matcher {0}")]
    MatcherCycle(i64),

    #[error("cycle through condition {0}")]
    ConditionCycle(i64),

    #[error("NOT combination in entity {0} must have exactly one child")]
    NotArity(i64),

    #[error("duplicate entity id {0}")]
    DuplicateId(i64),

    #[error("metric {0}: duration what {1} must be a simple condition")]
    DurationWhatNotSimple(i64, i64),

    #[error("metric {0}: matcher {1} must cover exactly one atom")]
    NotOneAtom(i64, i64),

    #[error("metric {0}: at least one value field is required")]
    MissingValueFields(i64),

    #[error("metric {0}: aggregation count must be 1 or match value field count")]
    AggregationArity(i64),

    #[error("metric {0}: bucket size must be positive")]
    BadBucketSize(i64),

    #[error("metric {0}: dimension soft limit must not exceed hard limit")]
    BadGuardrail(i64),

    #[error("metric {0}: shard count must be positive")]
    BadShardCount(i64),

    #[error("activation references missing metric {0}")]
    ActivationMetricNotFound(i64),

    #[error("alert {0} references missing metric {1}")]
    AlertMetricNotFound(i64, i64),
}

// --- Stable content hashing for update diffs ---
//
// References are folded in by content, not by id, so renaming an entity
// without changing its meaning leaves dependent metric hashes unchanged
// while any semantic change propagates.

fn yaml_digest<T: Serialize>(hasher: &mut Sha256, value: &T) {
    // Struct-field ordering is fixed, so the YAML form is canonical.
    let text = serde_yaml::to_string(value).unwrap_or_default();
    hasher.update(text.as_bytes());
}

fn finish(hasher: Sha256) -> u64 {
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn matcher_content_hash(config: &TelemetryConfig, id: i64, seen: &mut HashSet<i64>) -> u64 {
    if !seen.insert(id) {
        // Cycle; graph construction rejects it separately.
        return 0;
    }
    let mut hasher = Sha256::new();
    if let Some(m) = config.atom_matchers.iter().find(|m| m.id == id) {
        if let Some(simple) = &m.simple {
            hasher.update(b"simple-matcher");
            yaml_digest(&mut hasher, simple);
        }
        if let Some(comb) = &m.combination {
            hasher.update(b"combination-matcher");
            yaml_digest(&mut hasher, &comb.operation);
            for &child in &comb.children {
                hasher.update(matcher_content_hash(config, child, seen).to_be_bytes());
            }
        }
    }
    seen.remove(&id);
    finish(hasher)
}

fn condition_content_hash(config: &TelemetryConfig, id: i64, seen: &mut HashSet<i64>) -> u64 {
    if !seen.insert(id) {
        return 0;
    }
    let mut hasher = Sha256::new();
    if let Some(c) = config.conditions.iter().find(|c| c.id == id) {
        if let Some(simple) = &c.simple {
            hasher.update(b"simple-condition");
            hasher.update(matcher_hash(config, simple.start).to_be_bytes());
            if let Some(stop) = simple.stop {
                hasher.update(matcher_hash(config, stop).to_be_bytes());
            }
            if let Some(stop_all) = simple.stop_all {
                hasher.update(matcher_hash(config, stop_all).to_be_bytes());
            }
            hasher.update([u8::from(simple.count_nesting)]);
            yaml_digest(&mut hasher, &simple.dimensions);
            yaml_digest(&mut hasher, &simple.initial_value);
        }
        if let Some(comb) = &c.combination {
            hasher.update(b"combination-condition");
            yaml_digest(&mut hasher, &comb.operation);
            for &child in &comb.children {
                hasher.update(condition_content_hash(config, child, seen).to_be_bytes());
            }
        }
    }
    seen.remove(&id);
    finish(hasher)
}

fn matcher_hash(config: &TelemetryConfig, id: i64) -> u64 {
    matcher_content_hash(config, id, &mut HashSet::new())
}

fn condition_hash(config: &TelemetryConfig, id: i64) -> u64 {
    condition_content_hash(config, id, &mut HashSet::new())
}

fn metric_hash_base<T: Serialize>(
    config: &TelemetryConfig,
    tag: &[u8],
    metric_id: i64,
    what_hash: u64,
    condition: Option<i64>,
    links: &[MetricConditionLink],
    body: &T,
) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update(what_hash.to_be_bytes());
    if let Some(cond) = condition {
        hasher.update(condition_hash(config, cond).to_be_bytes());
    }
    for link in links {
        hasher.update(condition_hash(config, link.condition).to_be_bytes());
        yaml_digest(&mut hasher, &link.fields_in_what);
        yaml_digest(&mut hasher, &link.fields_in_condition);
    }
    if let Some(activation) = config.activation_for(metric_id) {
        for a in &activation.activations {
            hasher.update(matcher_hash(config, a.activation_matcher).to_be_bytes());
            if let Some(d) = a.deactivation_matcher {
                hasher.update(matcher_hash(config, d).to_be_bytes());
            }
            yaml_digest(&mut hasher, &(a.ttl, a.activation_type));
        }
    }
    yaml_digest(&mut hasher, body);
    finish(hasher)
}

pub fn event_metric_hash(config: &TelemetryConfig, m: &EventMetricConfig) -> u64 {
    metric_hash_base(
        config,
        b"event-metric",
        m.id,
        matcher_hash(config, m.what),
        m.condition,
        &m.links,
        &(&m.sampling_percentage, &m.split_bucket_for_app_upgrade),
    )
}

pub fn count_metric_hash(config: &TelemetryConfig, m: &CountMetricConfig) -> u64 {
    metric_hash_base(
        config,
        b"count-metric",
        m.id,
        matcher_hash(config, m.what),
        m.condition,
        &m.links,
        &(
            &m.dimensions_in_what,
            &m.bucket,
            &m.min_bucket_size,
            &m.threshold,
            &m.sampling,
            &m.guardrail,
            &m.split_bucket_for_app_upgrade,
        ),
    )
}

pub fn duration_metric_hash(config: &TelemetryConfig, m: &DurationMetricConfig) -> u64 {
    metric_hash_base(
        config,
        b"duration-metric",
        m.id,
        condition_hash(config, m.what),
        m.condition,
        &m.links,
        &(
            &m.dimensions_in_what,
            &m.aggregation,
            &m.bucket,
            &m.min_bucket_size,
            &m.guardrail,
            &m.split_bucket_for_app_upgrade,
        ),
    )
}

pub fn gauge_metric_hash(config: &TelemetryConfig, m: &GaugeMetricConfig) -> u64 {
    let trigger_hash = m.trigger_event.map(|t| matcher_hash(config, t));
    metric_hash_base(
        config,
        b"gauge-metric",
        m.id,
        matcher_hash(config, m.what),
        m.condition,
        &m.links,
        &(
            &m.pull_tag_id,
            &trigger_hash,
            &m.dimensions_in_what,
            &m.sampling_type,
            &m.gauge_fields,
            &m.max_num_gauge_atoms_per_bucket,
            &m.bucket,
            &m.min_bucket_size,
            &m.max_pull_delay,
            &m.sampling_percentage,
            &m.guardrail,
            &m.split_bucket_for_app_upgrade,
        ),
    )
}

pub fn value_metric_hash(config: &TelemetryConfig, m: &ValueMetricConfig) -> u64 {
    metric_hash_base(
        config,
        b"value-metric",
        m.id,
        matcher_hash(config, m.what),
        m.condition,
        &m.links,
        &(
            &m.pull_tag_id,
            &m.dimensions_in_what,
            &m.value_fields,
            &m.aggregation_types,
            &m.use_absolute_value_on_reset,
            &m.bucket,
            &m.min_bucket_size,
            &m.max_pull_delay,
            &m.guardrail,
            &m.split_bucket_for_app_upgrade,
        ),
    )
}

pub fn kll_metric_hash(config: &TelemetryConfig, m: &KllMetricConfig) -> u64 {
    metric_hash_base(
        config,
        b"kll-metric",
        m.id,
        matcher_hash(config, m.what),
        m.condition,
        &m.links,
        &(
            &m.dimensions_in_what,
            &m.value_fields,
            &m.bucket,
            &m.min_bucket_size,
            &m.guardrail,
            &m.split_bucket_for_app_upgrade,
        ),
    )
}
