//! Pulled-atom coordination.
//!
//! Pulled metrics do not see a pushed event stream; they ask a platform
//! puller for atoms. The puller manager owns the tag → puller table and
//! the periodic registrations, and drives them from one timer task. The
//! puller itself is a collaborator behind [`AtomPuller`].

use std::sync::{Arc, Weak};

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::ElapsedClock;
use crate::config::ConfigKey;
use crate::event::Event;
use crate::stats::EngineStats;

/// Outcome of an asynchronous pull delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    Success,
    Failure,
}

/// The platform puller collaborator: materializes atoms on demand.
pub trait AtomPuller: Send + Sync {
    fn pull(&self, tag_id: i32) -> Result<Vec<Event>>;
}

/// Receives periodic pull deliveries; implemented by the metrics manager,
/// which routes to the producer by metric id.
pub trait PullReceiver: Send + Sync {
    fn on_pulled_data(
        &self,
        metric_id: i64,
        events: Vec<Event>,
        result: PullResult,
        original_pull_time_ns: i64,
    );
}

struct ReceiverInfo {
    tag_id: i32,
    config_key: ConfigKey,
    metric_id: i64,
    next_pull_ns: i64,
    period_ns: i64,
    receiver: Weak<dyn PullReceiver>,
}

/// Registry of pullers and periodic pull registrations.
pub struct PullerManager {
    pullers: DashMap<i32, Arc<dyn AtomPuller>>,
    receivers: Mutex<Vec<ReceiverInfo>>,
    clock: Arc<dyn ElapsedClock>,
    stats: Arc<EngineStats>,
}

impl PullerManager {
    pub fn new(clock: Arc<dyn ElapsedClock>, stats: Arc<EngineStats>) -> Self {
        Self {
            pullers: DashMap::new(),
            receivers: Mutex::new(Vec::new()),
            clock,
            stats,
        }
    }

    pub fn register_puller(&self, tag_id: i32, puller: Arc<dyn AtomPuller>) {
        self.pullers.insert(tag_id, puller);
    }

    /// Arrange periodic pull callbacks at `first_pull_ns + k * period_ns`.
    #[allow(clippy::too_many_arguments)]
    pub fn register_receiver(
        &self,
        tag_id: i32,
        config_key: ConfigKey,
        metric_id: i64,
        receiver: Weak<dyn PullReceiver>,
        first_pull_ns: i64,
        period_ns: i64,
    ) {
        debug!(tag_id, metric_id, first_pull_ns, period_ns, "pull receiver registered");
        self.receivers.lock().push(ReceiverInfo {
            tag_id,
            config_key,
            metric_id,
            next_pull_ns: first_pull_ns,
            period_ns: period_ns.max(1),
            receiver,
        });
    }

    pub fn unregister_receiver(&self, tag_id: i32, config_key: ConfigKey, metric_id: i64) {
        self.receivers.lock().retain(|r| {
            !(r.tag_id == tag_id && r.config_key == config_key && r.metric_id == metric_id)
        });
    }

    /// Drop every registration belonging to a config.
    pub fn unregister_config(&self, config_key: ConfigKey) {
        self.receivers.lock().retain(|r| r.config_key != config_key);
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.lock().len()
    }

    /// Synchronous best-effort pull. The caller measures delivery delay
    /// against its own deadline; failures are counted here.
    pub fn pull(&self, tag_id: i32) -> Result<Vec<Event>> {
        self.stats.note_pull(tag_id);
        let Some(puller) = self.pullers.get(&tag_id).map(|p| Arc::clone(&*p)) else {
            self.stats.note_pull_failed(tag_id);
            anyhow::bail!("no puller registered for tag {tag_id}");
        };
        match puller.pull(tag_id) {
            Ok(events) => Ok(events),
            Err(e) => {
                self.stats.note_pull_failed(tag_id);
                Err(e)
            }
        }
    }

    /// Fire every registration due at `now_ns`. Registrations whose
    /// receiver is gone are dropped; in-flight results for them are
    /// discarded rather than cancelled.
    pub fn fire_alarms(&self, now_ns: i64) {
        let due: Vec<(i32, i64, i64, Weak<dyn PullReceiver>)> = {
            let mut receivers = self.receivers.lock();
            receivers.retain(|r| r.receiver.strong_count() > 0);
            let mut due = Vec::new();
            for r in receivers.iter_mut() {
                if now_ns >= r.next_pull_ns {
                    let requested = r.next_pull_ns;
                    // Skip forward past any missed periods.
                    let missed = (now_ns - r.next_pull_ns) / r.period_ns + 1;
                    r.next_pull_ns += missed * r.period_ns;
                    due.push((r.tag_id, r.metric_id, requested, r.receiver.clone()));
                }
            }
            due
        };

        for (tag_id, metric_id, requested_ns, receiver) in due {
            let Some(receiver) = receiver.upgrade() else {
                continue;
            };
            match self.pull(tag_id) {
                Ok(events) => {
                    receiver.on_pulled_data(metric_id, events, PullResult::Success, requested_ns);
                }
                Err(e) => {
                    warn!(tag_id, metric_id, error = %e, "periodic pull failed");
                    receiver.on_pulled_data(metric_id, Vec::new(), PullResult::Failure, requested_ns);
                }
            }
        }
    }

    /// Spawn the timer task driving [`fire_alarms`](Self::fire_alarms)
    /// until cancelled.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("puller alarm task stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        manager.fire_alarms(manager.clock.elapsed_ns());
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::clock::FakeClock;
    use crate::event::EventBuilder;

    struct FixedPuller {
        atoms: usize,
    }

    impl AtomPuller for FixedPuller {
        fn pull(&self, tag_id: i32) -> Result<Vec<Event>> {
            Ok((0..self.atoms)
                .map(|i| EventBuilder::new(tag_id, i as i64).build())
                .collect())
        }
    }

    struct FailingPuller;

    impl AtomPuller for FailingPuller {
        fn pull(&self, _tag_id: i32) -> Result<Vec<Event>> {
            anyhow::bail!("sensor unavailable")
        }
    }

    #[derive(Default)]
    struct RecordingReceiver {
        deliveries: AtomicU64,
        failures: AtomicU64,
    }

    impl PullReceiver for RecordingReceiver {
        fn on_pulled_data(
            &self,
            _metric_id: i64,
            _events: Vec<Event>,
            result: PullResult,
            _original_pull_time_ns: i64,
        ) {
            self.deliveries.fetch_add(1, Ordering::Relaxed);
            if result == PullResult::Failure {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn manager() -> (PullerManager, Arc<EngineStats>) {
        let stats = Arc::new(EngineStats::new());
        let clock = Arc::new(FakeClock::new(0));
        (PullerManager::new(clock, Arc::clone(&stats)), stats)
    }

    #[test]
    fn test_pull_success_and_failure() {
        let (mgr, stats) = manager();
        mgr.register_puller(10, Arc::new(FixedPuller { atoms: 3 }));
        mgr.register_puller(11, Arc::new(FailingPuller));

        let events = mgr.pull(10).expect("pull succeeds");
        assert_eq!(events.len(), 3);
        assert!(mgr.pull(11).is_err());
        assert!(mgr.pull(99).is_err());

        let snap = stats.snapshot();
        assert_eq!(snap.pull_stats.get(&10).map(|p| p.pulls), Some(1));
        assert_eq!(snap.pull_stats.get(&11).map(|p| p.pull_failures), Some(1));
        assert_eq!(snap.pull_stats.get(&99).map(|p| p.pull_failures), Some(1));
    }

    #[test]
    fn test_fire_alarms_periodic() {
        let (mgr, _) = manager();
        mgr.register_puller(10, Arc::new(FixedPuller { atoms: 1 }));

        let receiver = Arc::new(RecordingReceiver::default());
        let weak: Weak<dyn PullReceiver> = Arc::downgrade(&receiver) as Weak<dyn PullReceiver>;
        mgr.register_receiver(10, ConfigKey::default(), 1, weak, 1_000, 1_000);

        mgr.fire_alarms(500);
        assert_eq!(receiver.deliveries.load(Ordering::Relaxed), 0);

        mgr.fire_alarms(1_000);
        assert_eq!(receiver.deliveries.load(Ordering::Relaxed), 1);

        // A long stall fires once and skips past missed periods.
        mgr.fire_alarms(5_500);
        assert_eq!(receiver.deliveries.load(Ordering::Relaxed), 2);
        mgr.fire_alarms(5_900);
        assert_eq!(receiver.deliveries.load(Ordering::Relaxed), 2);
        mgr.fire_alarms(6_000);
        assert_eq!(receiver.deliveries.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_failure_delivered_as_failure() {
        let (mgr, _) = manager();
        mgr.register_puller(11, Arc::new(FailingPuller));
        let receiver = Arc::new(RecordingReceiver::default());
        mgr.register_receiver(
            11,
            ConfigKey::default(),
            1,
            Arc::downgrade(&receiver) as Weak<dyn PullReceiver>,
            0,
            1_000,
        );

        mgr.fire_alarms(0);
        assert_eq!(receiver.deliveries.load(Ordering::Relaxed), 1);
        assert_eq!(receiver.failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dead_receiver_dropped() {
        let (mgr, _) = manager();
        mgr.register_puller(10, Arc::new(FixedPuller { atoms: 1 }));
        {
            let receiver = Arc::new(RecordingReceiver::default());
            mgr.register_receiver(
                10,
                ConfigKey::default(),
                1,
                Arc::downgrade(&receiver) as Weak<dyn PullReceiver>,
                0,
                1_000,
            );
        }
        assert_eq!(mgr.receiver_count(), 1);
        mgr.fire_alarms(0);
        assert_eq!(mgr.receiver_count(), 0);
    }

    #[test]
    fn test_unregister_receiver() {
        let (mgr, _) = manager();
        let receiver = Arc::new(RecordingReceiver::default());
        mgr.register_receiver(
            10,
            ConfigKey::new(0, 7),
            1,
            Arc::downgrade(&receiver) as Weak<dyn PullReceiver>,
            0,
            1_000,
        );
        mgr.register_receiver(
            12,
            ConfigKey::new(0, 7),
            2,
            Arc::downgrade(&receiver) as Weak<dyn PullReceiver>,
            0,
            1_000,
        );

        mgr.unregister_receiver(10, ConfigKey::new(0, 7), 1);
        assert_eq!(mgr.receiver_count(), 1);
        mgr.unregister_config(ConfigKey::new(0, 7));
        assert_eq!(mgr.receiver_count(), 0);
    }
}
