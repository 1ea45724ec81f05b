use crate::errors::BlackboxError;
use crate::logging::append_run_log;
use crate::reconciler::Reconciler;
use crate::runtime::Clock;
use crate::types::ResourceKey;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub submitted: usize,
    pub deduplicated: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub failures: usize,
}

#[derive(Debug)]
struct DelayedEntry {
    due: SystemTime,
    key: ResourceKey,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<ResourceKey>,
    ready_set: HashSet<ResourceKey>,
    delayed: Vec<DelayedEntry>,
    in_flight: usize,
    attempts: HashMap<ResourceKey, u32>,
    metrics: QueueMetrics,
    closed: bool,
}

/// Level-triggered delivery of reconcile keys: at-least-once submissions
/// deduplicated while pending, delayed re-submission for `requeue_after`,
/// and exponential per-key backoff on failure (reset on success). One key
/// is handed to one worker at a time.
pub struct ReconcileQueue {
    clock: Arc<dyn Clock>,
    backoff_base: Duration,
    backoff_cap: Duration,
    inner: Mutex<QueueInner>,
    wake: Condvar,
}

impl ReconcileQueue {
    pub fn new(clock: Arc<dyn Clock>, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            clock,
            backoff_base,
            backoff_cap,
            inner: Mutex::new(QueueInner::default()),
            wake: Condvar::new(),
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.inner.lock().expect("queue lock poisoned").metrics.clone()
    }

    /// Change-notification entry point. A key already waiting is collapsed;
    /// a key parked on a delay is promoted to run now.
    pub fn submit(&self, key: ResourceKey) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.metrics.submitted += 1;
        if inner.ready_set.contains(&key) {
            inner.metrics.deduplicated += 1;
            return;
        }
        inner.delayed.retain(|entry| entry.key != key);
        inner.ready_set.insert(key.clone());
        inner.ready.push_back(key);
        drop(inner);
        self.wake.notify_one();
    }

    /// Stops delivery; workers drain in-flight work and exit.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.closed = true;
        drop(inner);
        self.wake.notify_all();
    }

    /// Non-blocking delivery: promotes due delayed entries, then pops the
    /// next ready key.
    pub fn try_next(&self) -> Option<ResourceKey> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        self.pop_ready(&mut inner)
    }

    /// Blocking delivery. Returns `None` once the queue is closed or fully
    /// idle (nothing ready, nothing delayed, nothing in flight).
    pub fn next(&self) -> Option<ResourceKey> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        loop {
            if let Some(key) = self.pop_ready(&mut inner) {
                return Some(key);
            }
            if inner.closed
                || (inner.ready.is_empty() && inner.delayed.is_empty() && inner.in_flight == 0)
            {
                self.wake.notify_all();
                return None;
            }

            let wait = self
                .earliest_due(&inner)
                .map(|due| {
                    due.duration_since(self.clock.now())
                        .unwrap_or(Duration::ZERO)
                })
                .unwrap_or(Duration::from_millis(200));
            let (guard, _timeout) = self
                .wake
                .wait_timeout(inner, wait.max(Duration::from_millis(1)))
                .expect("queue lock poisoned");
            inner = guard;
        }
    }

    /// Reports one invocation's outcome and schedules any follow-up.
    pub fn complete(&self, key: ResourceKey, outcome: &Result<Option<Duration>, BlackboxError>) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.in_flight = inner.in_flight.saturating_sub(1);
        match outcome {
            Ok(Some(requeue_after)) => {
                inner.attempts.remove(&key);
                inner.metrics.requeued += 1;
                let due = self.clock.now() + *requeue_after;
                inner.delayed.push(DelayedEntry { due, key });
            }
            Ok(None) => {
                inner.attempts.remove(&key);
            }
            Err(error) => {
                let attempts = inner.attempts.entry(key.clone()).or_insert(0);
                *attempts = attempts.saturating_add(1);
                let attempt_count = *attempts;
                let delay = backoff_delay(self.backoff_base, self.backoff_cap, attempt_count);
                inner.metrics.failures += 1;
                append_run_log(
                    "warn",
                    "queue.reconcile_failed",
                    json!({
                        "key": key.to_string(),
                        "attempts": attempt_count,
                        "retry_in_ms": delay.as_millis() as u64,
                        "error": error.to_string(),
                    }),
                );
                let due = self.clock.now() + delay;
                inner.delayed.push(DelayedEntry { due, key });
            }
        }
        drop(inner);
        self.wake.notify_all();
    }

    /// Runs `parallelism` workers against the reconciler until the queue is
    /// idle, or until `quit_after` deliveries when set.
    pub fn run(
        &self,
        reconciler: &Reconciler,
        parallelism: usize,
        quit_after: Option<u64>,
    ) -> QueueMetrics {
        std::thread::scope(|scope| {
            for _ in 0..parallelism.max(1) {
                scope.spawn(|| {
                    while let Some(key) = self.next() {
                        let outcome = reconciler.reconcile(&key);
                        self.complete(key, &outcome);
                        if let Some(limit) = quit_after {
                            if self.delivered() >= limit {
                                self.close();
                            }
                        }
                    }
                });
            }
        });
        self.metrics()
    }

    fn delivered(&self) -> u64 {
        self.inner.lock().expect("queue lock poisoned").metrics.delivered as u64
    }

    fn pop_ready(&self, inner: &mut QueueInner) -> Option<ResourceKey> {
        let now = self.clock.now();
        let mut promoted = Vec::new();
        inner.delayed.retain(|entry| {
            if entry.due <= now {
                promoted.push(entry.key.clone());
                false
            } else {
                true
            }
        });
        for key in promoted {
            if inner.ready_set.insert(key.clone()) {
                inner.ready.push_back(key);
            }
        }

        let key = inner.ready.pop_front()?;
        inner.ready_set.remove(&key);
        inner.in_flight += 1;
        inner.metrics.delivered += 1;
        Some(key)
    }

    fn earliest_due(&self, inner: &QueueInner) -> Option<SystemTime> {
        inner.delayed.iter().map(|entry| entry.due).min()
    }
}

fn backoff_delay(base: Duration, cap: Duration, attempts: u32) -> Duration {
    let shift = attempts.saturating_sub(1).min(16);
    let ms = (base.as_millis() as u64).saturating_mul(1u64 << shift);
    Duration::from_millis(ms.min(cap.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::{backoff_delay, ReconcileQueue};
    use crate::errors::BlackboxError;
    use crate::runtime::FakeClock;
    use crate::types::ResourceKey;
    use std::sync::Arc;
    use std::time::Duration;

    fn queue(clock: &FakeClock) -> ReconcileQueue {
        ReconcileQueue::new(
            Arc::new(clock.clone()),
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("prod", name)
    }

    #[test]
    fn duplicate_submissions_of_a_pending_key_collapse() {
        let clock = FakeClock::default();
        let q = queue(&clock);
        q.submit(key("rec1"));
        q.submit(key("rec1"));
        q.submit(key("rec2"));

        assert_eq!(q.try_next(), Some(key("rec1")));
        assert_eq!(q.try_next(), Some(key("rec2")));
        assert_eq!(q.try_next(), None);
        let metrics = q.metrics();
        assert_eq!(metrics.submitted, 3);
        assert_eq!(metrics.deduplicated, 1);
    }

    #[test]
    fn requeue_after_delays_redelivery_until_the_clock_reaches_it() {
        let clock = FakeClock::default();
        let q = queue(&clock);
        q.submit(key("rec1"));
        let delivered = q.try_next().expect("delivered");
        q.complete(delivered, &Ok(Some(Duration::from_secs(10))));

        assert_eq!(q.try_next(), None);
        clock.advance(Duration::from_secs(9));
        assert_eq!(q.try_next(), None);
        clock.advance(Duration::from_secs(1));
        assert_eq!(q.try_next(), Some(key("rec1")));
    }

    #[test]
    fn a_submission_promotes_a_parked_key_to_run_now() {
        let clock = FakeClock::default();
        let q = queue(&clock);
        q.submit(key("rec1"));
        let delivered = q.try_next().expect("delivered");
        q.complete(delivered, &Ok(Some(Duration::from_secs(10))));

        q.submit(key("rec1"));
        assert_eq!(q.try_next(), Some(key("rec1")));
    }

    #[test]
    fn failures_back_off_exponentially_and_reset_on_success() {
        let clock = FakeClock::default();
        let q = queue(&clock);

        q.submit(key("rec1"));
        let k = q.try_next().expect("delivered");
        q.complete(k, &Err(BlackboxError::Remote("boom".to_string())));
        clock.advance(Duration::from_millis(499));
        assert_eq!(q.try_next(), None);
        clock.advance(Duration::from_millis(1));
        let k = q.try_next().expect("first retry after 500ms");

        q.complete(k, &Err(BlackboxError::Remote("boom".to_string())));
        clock.advance(Duration::from_millis(500));
        assert_eq!(q.try_next(), None, "second retry waits 1000ms");
        clock.advance(Duration::from_millis(500));
        let k = q.try_next().expect("second retry");

        q.complete(k, &Ok(Some(Duration::from_millis(100))));
        clock.advance(Duration::from_millis(100));
        let k = q.try_next().expect("requeue");
        q.complete(k, &Err(BlackboxError::Remote("boom".to_string())));
        clock.advance(Duration::from_millis(500));
        assert_eq!(
            q.try_next(),
            Some(key("rec1")),
            "attempt counter was reset by the success"
        );
        assert_eq!(q.metrics().failures, 3);
    }

    #[test]
    fn backoff_is_capped() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, cap, 7), cap);
        assert_eq!(backoff_delay(base, cap, 40), cap);
    }
}
