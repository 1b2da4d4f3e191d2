//! Anomaly detection over finalized buckets.
//!
//! An anomaly tracker keeps a trailing window of per-dimension numeric
//! bucket values and declares an anomaly when the window sum plus the
//! in-flight value crosses the alert threshold. Declarations go to the
//! alert subscriber list; the dispatcher behind it is a collaborator.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{AlertConfig, ConfigKey};
use crate::event::field::MetricDimensionKey;

/// Receives anomaly declarations. Implemented by the alarm dispatcher.
pub trait AlertSubscriber: Send + Sync {
    fn on_anomaly(
        &self,
        alert_id: i64,
        metric_id: i64,
        key: &MetricDimensionKey,
        timestamp_ns: i64,
    );
}

/// Sliding-window threshold detector attached to one metric producer.
pub struct AnomalyTracker {
    alert: AlertConfig,
    config_key: ConfigKey,
    /// Finalized buckets inside the trailing window, oldest first.
    past: VecDeque<(i64, HashMap<MetricDimensionKey, i64>)>,
    /// Running per-dimension sum over `past`.
    window_sums: HashMap<MetricDimensionKey, i64>,
    last_alarm_ns: HashMap<MetricDimensionKey, i64>,
    subscribers: Vec<Arc<dyn AlertSubscriber>>,
}

impl AnomalyTracker {
    pub fn new(alert: AlertConfig, config_key: ConfigKey) -> Self {
        Self {
            alert,
            config_key,
            past: VecDeque::new(),
            window_sums: HashMap::new(),
            last_alarm_ns: HashMap::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn alert_id(&self) -> i64 {
        self.alert.id
    }

    pub fn config_key(&self) -> ConfigKey {
        self.config_key
    }

    pub fn add_subscriber(&mut self, subscriber: Arc<dyn AlertSubscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Past buckets that may still contribute to a window ending at the
    /// current bucket: the window covers `num_buckets` buckets including
    /// the current one.
    fn window_len(&self) -> i64 {
        i64::from(self.alert.num_buckets.max(1)) - 1
    }

    fn evict_before(&mut self, oldest_allowed: i64) {
        while let Some((num, values)) = self.past.front() {
            if *num >= oldest_allowed {
                break;
            }
            for (key, v) in values {
                if let Some(sum) = self.window_sums.get_mut(key) {
                    *sum -= v;
                    if *sum == 0 {
                        self.window_sums.remove(key);
                    }
                }
            }
            self.past.pop_front();
        }
    }

    /// Feed a finalized full bucket into the window.
    pub fn add_past_bucket(&mut self, values: &HashMap<MetricDimensionKey, i64>, bucket_num: i64) {
        if self.window_len() == 0 {
            return;
        }
        self.evict_before(bucket_num - self.window_len() + 1);
        for (key, v) in values {
            *self.window_sums.entry(key.clone()).or_insert(0) += v;
        }
        self.past.push_back((bucket_num, values.clone()));
    }

    /// Check the in-flight value for one dimension against the threshold
    /// and declare an anomaly if it crosses.
    pub fn detect_and_declare(
        &mut self,
        event_time_ns: i64,
        bucket_num: i64,
        metric_id: i64,
        key: &MetricDimensionKey,
        current_value: i64,
    ) {
        self.evict_before(bucket_num - self.window_len());
        let past_sum = self.window_sums.get(key).copied().unwrap_or(0);
        if past_sum + current_value <= self.alert.trigger_if_sum_gt {
            return;
        }
        self.declare(event_time_ns, metric_id, key);
    }

    fn declare(&mut self, event_time_ns: i64, metric_id: i64, key: &MetricDimensionKey) {
        let refractory_ns = duration_ns(self.alert.refractory_period);
        if let Some(last) = self.last_alarm_ns.get(key) {
            if event_time_ns < last + refractory_ns {
                return;
            }
        }
        self.last_alarm_ns.insert(key.clone(), event_time_ns);
        debug!(
            alert_id = self.alert.id,
            metric_id,
            "anomaly declared"
        );
        for subscriber in &self.subscribers {
            subscriber.on_anomaly(self.alert.id, metric_id, key, event_time_ns);
        }
    }

    /// Refractory timestamps, for the metadata persistence hooks.
    pub fn alarm_timestamps(&self) -> &HashMap<MetricDimensionKey, i64> {
        &self.last_alarm_ns
    }

    /// Restore refractory timestamps from persisted metadata. Idempotent.
    pub fn load_alarm_timestamps(&mut self, timestamps: HashMap<MetricDimensionKey, i64>) {
        for (key, ts) in timestamps {
            let entry = self.last_alarm_ns.entry(key).or_insert(ts);
            *entry = (*entry).max(ts);
        }
    }
}

fn duration_ns(d: Duration) -> i64 {
    d.as_nanos().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    struct CountingSubscriber {
        fired: AtomicU64,
    }

    impl AlertSubscriber for CountingSubscriber {
        fn on_anomaly(&self, _alert: i64, _metric: i64, _key: &MetricDimensionKey, _ts: i64) {
            self.fired.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn alert(num_buckets: u32, threshold: i64, refractory: Duration) -> AlertConfig {
        AlertConfig {
            id: 5,
            metric_id: 1,
            num_buckets,
            trigger_if_sum_gt: threshold,
            refractory_period: refractory,
        }
    }

    fn bucket(value: i64) -> HashMap<MetricDimensionKey, i64> {
        HashMap::from([(MetricDimensionKey::default(), value)])
    }

    #[test]
    fn test_triggers_when_window_sum_crosses() {
        let subscriber = Arc::new(CountingSubscriber {
            fired: AtomicU64::new(0),
        });
        let mut tracker = AnomalyTracker::new(alert(3, 10, Duration::ZERO), ConfigKey::default());
        tracker.add_subscriber(subscriber.clone());

        tracker.add_past_bucket(&bucket(4), 0);
        tracker.add_past_bucket(&bucket(4), 1);

        // 4 + 4 + 2 = 10, not strictly greater.
        tracker.detect_and_declare(100, 2, 1, &MetricDimensionKey::default(), 2);
        assert_eq!(subscriber.fired.load(Ordering::Relaxed), 0);

        tracker.detect_and_declare(200, 2, 1, &MetricDimensionKey::default(), 3);
        assert_eq!(subscriber.fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_old_buckets_leave_window() {
        let subscriber = Arc::new(CountingSubscriber {
            fired: AtomicU64::new(0),
        });
        let mut tracker = AnomalyTracker::new(alert(2, 10, Duration::ZERO), ConfigKey::default());
        tracker.add_subscriber(subscriber.clone());

        tracker.add_past_bucket(&bucket(9), 0);
        // Window is 2 buckets; by bucket 5 the value from bucket 0 is gone.
        tracker.detect_and_declare(100, 5, 1, &MetricDimensionKey::default(), 2);
        assert_eq!(subscriber.fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_refractory_period_suppresses() {
        let subscriber = Arc::new(CountingSubscriber {
            fired: AtomicU64::new(0),
        });
        let mut tracker =
            AnomalyTracker::new(alert(1, 5, Duration::from_secs(1)), ConfigKey::default());
        tracker.add_subscriber(subscriber.clone());

        tracker.detect_and_declare(0, 0, 1, &MetricDimensionKey::default(), 10);
        tracker.detect_and_declare(500_000_000, 0, 1, &MetricDimensionKey::default(), 10);
        assert_eq!(subscriber.fired.load(Ordering::Relaxed), 1);

        tracker.detect_and_declare(1_500_000_000, 1, 1, &MetricDimensionKey::default(), 10);
        assert_eq!(subscriber.fired.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_load_alarm_timestamps_idempotent() {
        let mut tracker = AnomalyTracker::new(alert(1, 5, Duration::ZERO), ConfigKey::default());
        let ts = HashMap::from([(MetricDimensionKey::default(), 42i64)]);
        tracker.load_alarm_timestamps(ts.clone());
        tracker.load_alarm_timestamps(ts);
        assert_eq!(
            tracker.alarm_timestamps().get(&MetricDimensionKey::default()),
            Some(&42)
        );
    }
}
