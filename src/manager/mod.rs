//! The metrics manager: graph ownership, dispatch, and config updates.
//!
//! One manager owns one configuration's evaluation graph. All cross-node
//! references inside the graph are vector indices; the manager is the
//! only owner of the arenas. Dispatch takes the graph read lock and the
//! condition lock; producers serialize behind their own mutexes; graph
//! mutation (config update) takes the write lock.

mod build;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::ElapsedClock;
use crate::condition::{self, ConditionTracker};
use crate::config::{ConfigKey, InvalidConfigReason, TelemetryConfig};
use crate::event::Event;
use crate::matcher::wizard::{MatchCache, MatcherWizard};
use crate::matcher::{AtomMatcherTracker, MatchResult};
use crate::metrics::{DispatchContext, MetricProducer};
use crate::puller::{PullReceiver, PullResult, PullerManager};
use crate::report::{write_length_delimited, ProtoWriter};
use crate::stats::{EngineStats, ShardOffsetProvider};

/// One configuration's arenas and reverse indices.
pub(crate) struct EvalGraph {
    pub matchers: Vec<AtomMatcherTracker>,
    /// Condition state mutates on the dispatch path only.
    pub conditions: Mutex<Vec<ConditionTracker>>,
    pub producers: Vec<MetricProducer>,
    #[allow(dead_code)]
    pub matcher_map: HashMap<i64, usize>,
    #[allow(dead_code)]
    pub condition_map: HashMap<i64, usize>,
    pub metric_index_by_id: HashMap<i64, usize>,
    pub tag_to_matchers: HashMap<i32, Vec<usize>>,
    pub matcher_to_conditions: HashMap<usize, Vec<usize>>,
    pub matcher_to_metrics: HashMap<usize, Vec<usize>>,
    pub condition_to_metrics: HashMap<usize, Vec<usize>>,
    pub activation_to_metrics: HashMap<usize, Vec<usize>>,
    pub deactivation_to_metrics: HashMap<usize, Vec<usize>>,
}

/// Per-config manager: dispatches events through the graph and serves
/// the administrative surface.
pub struct MetricsManager {
    config_key: ConfigKey,
    clock: Arc<dyn ElapsedClock>,
    stats: Arc<EngineStats>,
    shard_provider: Arc<ShardOffsetProvider>,
    puller: Arc<PullerManager>,
    graph: RwLock<EvalGraph>,
}

impl MetricsManager {
    pub fn new(
        config: &TelemetryConfig,
        config_key: ConfigKey,
        time_base_ns: i64,
        clock: Arc<dyn ElapsedClock>,
        stats: Arc<EngineStats>,
        shard_provider: Arc<ShardOffsetProvider>,
        puller: Arc<PullerManager>,
    ) -> Result<Arc<Self>, InvalidConfigReason> {
        let graph = build::build_graph(config, config_key, time_base_ns).inspect_err(|e| {
            stats.note_config_rejected();
            warn!(config_id = config.id, error = %e, "config rejected");
        })?;

        info!(
            config_id = config.id,
            matchers = graph.matchers.len(),
            conditions = graph.conditions.lock().len(),
            metrics = graph.producers.len(),
            "config installed"
        );

        let manager = Arc::new(Self {
            config_key,
            clock,
            stats,
            shard_provider,
            puller,
            graph: RwLock::new(graph),
        });
        manager.register_pulled_metrics();
        manager.prepare_first_buckets();
        Ok(manager)
    }

    pub fn config_key(&self) -> ConfigKey {
        self.config_key
    }

    fn register_pulled_metrics(self: &Arc<Self>) {
        let graph = self.graph.read();
        for producer in &graph.producers {
            if let Some((tag_id, first_pull_ns, period_ns)) = producer.pull_registration() {
                self.puller.register_receiver(
                    tag_id,
                    self.config_key,
                    producer.metric_id(),
                    Arc::downgrade(self) as Weak<dyn PullReceiver>,
                    first_pull_ns,
                    period_ns,
                );
            }
        }
    }

    fn prepare_first_buckets(&self) {
        let graph = self.graph.read();
        let conditions = graph.conditions.lock();
        let ctx = self.dispatch_context(&graph, &conditions);
        for producer in &graph.producers {
            producer.prepare_first_bucket(&ctx);
        }
    }

    fn dispatch_context<'a>(
        &'a self,
        graph: &'a EvalGraph,
        conditions: &'a [ConditionTracker],
    ) -> DispatchContext<'a> {
        DispatchContext {
            matchers: MatcherWizard::new(&graph.matchers),
            conditions: crate::condition::wizard::ConditionWizard::new(conditions),
            stats: &*self.stats,
            clock: self.clock.as_ref(),
            shard_offset: self.shard_provider.shard_offset(),
            puller: Some(&*self.puller),
        }
    }

    /// Ingest one event: matchers, activations, conditions, metrics.
    pub fn on_event(&self, event: &Event) {
        self.stats.note_event_dispatched();
        let graph = self.graph.read();
        let Some(tag_matchers) = graph.tag_to_matchers.get(&event.atom_id()) else {
            return;
        };

        let wizard = MatcherWizard::new(&graph.matchers);
        let mut cache = MatchCache::new(graph.matchers.len());
        let mut matched: Vec<usize> = Vec::new();
        for &mi in tag_matchers {
            if wizard.match_event(&mut cache, event, mi) == MatchResult::Matched {
                matched.push(mi);
            }
        }
        if matched.is_empty() {
            return;
        }

        // Conditions absorb the event before anything reads them, so
        // metrics always observe condition state from the same or
        // earlier events.
        let mut conditions = graph.conditions.lock();
        let condition_count = conditions.len();
        let mut simple_changed = vec![false; condition_count];
        let mut touched = false;
        for &mi in &matched {
            if let Some(dependents) = graph.matcher_to_conditions.get(&mi) {
                for &ci in dependents {
                    simple_changed[ci] |= conditions[ci].handle_matched(mi, event);
                    touched = true;
                }
            }
        }
        let changed = if touched {
            condition::refresh(&mut conditions, &simple_changed)
        } else {
            vec![false; condition_count]
        };

        let conditions = &*conditions;
        let ctx = self.dispatch_context(&graph, conditions);
        let ts = event.elapsed_ns();

        for &mi in &matched {
            if let Some(metrics) = graph.activation_to_metrics.get(&mi) {
                for &pi in metrics {
                    graph.producers[pi].activate(mi, ts, &ctx);
                }
            }
            if let Some(metrics) = graph.deactivation_to_metrics.get(&mi) {
                for &pi in metrics {
                    graph.producers[pi].cancel_event_activation(mi, ts, &ctx);
                }
            }
        }

        for (ci, was_changed) in changed.iter().enumerate() {
            if !was_changed {
                continue;
            }
            let Some(metrics) = graph.condition_to_metrics.get(&ci) else {
                continue;
            };
            let new_value = conditions[ci].last_value();
            let sliced_tracker = conditions[ci].is_sliced();
            for &pi in metrics {
                let producer = &graph.producers[pi];
                if sliced_tracker || producer.condition_sliced() {
                    producer.on_sliced_condition_may_change(new_value.is_true(), ts, &ctx);
                } else {
                    producer.on_condition_changed(new_value, ts, &ctx);
                }
            }
        }

        for &mi in &matched {
            let Some(metrics) = graph.matcher_to_metrics.get(&mi) else {
                continue;
            };
            let dispatched = ctx.matchers.transformed(&cache, mi).unwrap_or(event);
            for &pi in metrics {
                graph.producers[pi].on_matched_event(mi, dispatched, &ctx);
            }
        }
    }

    /// Serialize every producer's report as a length-delimited record
    /// stream.
    pub fn on_dump_report(
        &self,
        dump_time_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
    ) -> Vec<u8> {
        let graph = self.graph.read();
        let mut out = Vec::new();
        for producer in &graph.producers {
            if !producer.is_valid() {
                continue;
            }
            let mut record = ProtoWriter::new();
            producer.on_dump_report(
                dump_time_ns,
                include_current_partial_bucket,
                erase_data,
                &self.stats,
                &mut record,
            );
            write_length_delimited(&mut out, record.bytes());
        }
        out
    }

    /// Install an updated configuration. Producers whose content hash is
    /// unchanged carry their accumulated state over; the rest are
    /// destroyed and rebuilt. Rejection leaves the current graph intact.
    pub fn on_config_updated(
        &self,
        new_config: &TelemetryConfig,
        update_time_ns: i64,
    ) -> Result<(), InvalidConfigReason> {
        let new_graph =
            build::build_graph(new_config, self.config_key, update_time_ns).inspect_err(|e| {
                self.stats.note_config_rejected();
                warn!(config_id = new_config.id, error = %e, "config update rejected");
            })?;

        {
            let mut graph = self.graph.write();
            // Close partial buckets so carried state resumes cleanly at
            // the update boundary.
            for producer in &graph.producers {
                producer.split_bucket(update_time_ns, &self.stats);
            }
            let old_graph = std::mem::replace(&mut *graph, new_graph);
            let mut carried = 0usize;
            for old in old_graph.producers {
                if let Some(&idx) = graph.metric_index_by_id.get(&old.metric_id()) {
                    if graph.producers[idx].proto_hash() == old.proto_hash() {
                        graph.producers[idx].adopt(old);
                        carried += 1;
                    }
                }
            }
            debug!(config_id = new_config.id, carried, "config updated");
        }

        self.puller.unregister_config(self.config_key);
        Ok(())
    }

    /// Re-register pulled metrics after a config update. Split from
    /// [`on_config_updated`](Self::on_config_updated) because
    /// registration needs the `Arc`.
    pub fn register_pullers(self: &Arc<Self>) {
        self.register_pulled_metrics();
        self.prepare_first_buckets();
    }

    /// Force a partial-bucket split for metrics that opted into it.
    pub fn notify_app_upgrade(&self, event_time_ns: i64) {
        let graph = self.graph.read();
        for producer in &graph.producers {
            producer.notify_app_upgrade(event_time_ns, &self.stats);
        }
    }

    pub fn on_init_completed(&self, event_time_ns: i64) {
        let graph = self.graph.read();
        for producer in &graph.producers {
            producer.on_init_completed(event_time_ns, &self.stats);
        }
    }

    /// Drop all past buckets, preserving in-flight state.
    pub fn drop_data(&self, drop_time_ns: i64) {
        let graph = self.graph.read();
        for producer in &graph.producers {
            producer.drop_data(drop_time_ns, &self.stats);
        }
    }

    /// Approximate memory footprint of all producers.
    pub fn byte_size(&self) -> usize {
        let graph = self.graph.read();
        graph.producers.iter().map(MetricProducer::byte_size).sum()
    }

    /// Drop past data when the soft memory threshold is exceeded; the
    /// next report carries the memory-drop marker.
    pub fn enforce_memory_limit(&self, limit_bytes: usize, now_ns: i64) -> bool {
        if self.byte_size() <= limit_bytes {
            return false;
        }
        warn!(limit_bytes, "memory limit exceeded; dropping past buckets");
        let graph = self.graph.read();
        for producer in &graph.producers {
            producer.note_memory_drop(now_ns);
            producer.drop_data(now_ns, &self.stats);
        }
        true
    }

    /// Per-producer metadata for the persistence collaborator.
    pub fn write_metadata(&self) -> HashMap<i64, Vec<(i64, HashMap<crate::event::field::MetricDimensionKey, i64>)>> {
        let graph = self.graph.read();
        graph
            .producers
            .iter()
            .map(|p| (p.metric_id(), p.write_metadata()))
            .collect()
    }

    /// Restore metadata written by [`write_metadata`](Self::write_metadata).
    /// Tolerates absent or partial input.
    pub fn load_metadata(
        &self,
        metadata: HashMap<i64, Vec<(i64, HashMap<crate::event::field::MetricDimensionKey, i64>)>>,
    ) {
        let graph = self.graph.read();
        for (metric_id, entries) in metadata {
            if let Some(&idx) = graph.metric_index_by_id.get(&metric_id) {
                graph.producers[idx].load_metadata(entries);
            }
        }
    }

    /// Producer count, mostly for tests and introspection.
    pub fn metric_count(&self) -> usize {
        self.graph.read().producers.len()
    }

    pub fn is_metric_active(&self, metric_id: i64) -> Option<bool> {
        let graph = self.graph.read();
        let idx = *graph.metric_index_by_id.get(&metric_id)?;
        Some(graph.producers[idx].is_active())
    }
}

impl PullReceiver for MetricsManager {
    fn on_pulled_data(
        &self,
        metric_id: i64,
        events: Vec<Event>,
        result: PullResult,
        original_pull_time_ns: i64,
    ) {
        let graph = self.graph.read();
        let Some(&idx) = graph.metric_index_by_id.get(&metric_id) else {
            return;
        };
        let conditions = graph.conditions.lock();
        let ctx = self.dispatch_context(&graph, &conditions);
        graph.producers[idx].on_data_pulled(&events, result, original_pull_time_ns, &ctx);
    }
}
