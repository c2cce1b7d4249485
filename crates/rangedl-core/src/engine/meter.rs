//! Throughput meter
//!
//! Workers push byte samples as they stream; a periodic recompute prunes the
//! window, derives a speed per transfer and pushes the result to subscribers.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rangedl_types::ThroughputState;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Receives every freshly computed set of throughput states
#[async_trait]
pub trait ThroughputSubscriber: Send + Sync {
    /// Short label used when logging failures
    fn name(&self) -> &str {
        "subscriber"
    }

    async fn on_snapshot(&self, snapshot: &HashMap<Uuid, ThroughputState>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    bytes: u64,
    at_ms: u64,
}

/// Sliding-window speed meter shared by every worker
pub struct ThroughputMeter {
    window_ms: u64,
    samples: Mutex<HashMap<Uuid, VecDeque<Sample>>>,
    states: RwLock<HashMap<Uuid, ThroughputState>>,
    subscribers: RwLock<Vec<Arc<dyn ThroughputSubscriber>>>,
}

impl ThroughputMeter {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            samples: Mutex::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Milliseconds since the Unix epoch, the clock `record_now` uses
    pub fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    /// Append a sample. Zero-byte samples are ignored.
    pub fn record(&self, transfer_id: Uuid, bytes: u64, at_ms: u64) {
        if bytes == 0 {
            return;
        }
        self.samples
            .lock()
            .entry(transfer_id)
            .or_default()
            .push_back(Sample { bytes, at_ms });
    }

    pub fn record_now(&self, transfer_id: Uuid, bytes: u64) {
        self.record(transfer_id, bytes, Self::now_ms());
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ThroughputSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Prune every window against `now_ms`, recompute states and publish them.
    ///
    /// A transfer whose window emptied is published once as idle and then
    /// dropped until it records again.
    pub async fn recompute(&self, now_ms: u64) -> HashMap<Uuid, ThroughputState> {
        let cutoff = now_ms.saturating_sub(self.window_ms);

        let fresh: HashMap<Uuid, ThroughputState> = {
            let mut samples = self.samples.lock();
            let mut fresh = HashMap::with_capacity(samples.len());
            samples.retain(|id, window| {
                while window.front().is_some_and(|s| s.at_ms < cutoff) {
                    window.pop_front();
                }
                fresh.insert(*id, self.state_of(window));
                !window.is_empty()
            });
            fresh
        };

        *self.states.write() = fresh.clone();

        let subscribers: Vec<_> = self.subscribers.read().clone();
        for subscriber in subscribers {
            if let Err(e) = subscriber.on_snapshot(&fresh).await {
                warn!("Throughput subscriber {} failed: {:#}", subscriber.name(), e);
            }
        }

        fresh
    }

    pub async fn recompute_now(&self) -> HashMap<Uuid, ThroughputState> {
        self.recompute(Self::now_ms()).await
    }

    fn state_of(&self, window: &VecDeque<Sample>) -> ThroughputState {
        let (Some(oldest), Some(newest)) = (window.front(), window.back()) else {
            return ThroughputState::idle(self.window_ms);
        };
        let total: u64 = window.iter().map(|s| s.bytes).sum();
        let span = newest.at_ms.saturating_sub(oldest.at_ms).max(1);
        let avg = total as f64 * 1000.0 / span as f64;
        ThroughputState {
            avg_bytes_per_sec: avg,
            peak_bytes_per_sec: avg,
            window_millis: self.window_ms,
        }
    }

    /// State from the last recompute; idle if the transfer is not tracked
    pub fn state(&self, transfer_id: Uuid) -> ThroughputState {
        self.states
            .read()
            .get(&transfer_id)
            .copied()
            .unwrap_or_else(|| ThroughputState::idle(self.window_ms))
    }

    pub fn snapshot(&self) -> HashMap<Uuid, ThroughputState> {
        self.states.read().clone()
    }

    /// Drop samples and state of a deleted transfer
    pub fn forget(&self, transfer_id: Uuid) {
        self.samples.lock().remove(&transfer_id);
        self.states.write().remove(&transfer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl ThroughputSubscriber for Counting {
        async fn on_snapshot(&self, _: &HashMap<Uuid, ThroughputState>) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ThroughputSubscriber for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_snapshot(&self, _: &HashMap<Uuid, ThroughputState>) -> anyhow::Result<()> {
            anyhow::bail!("store unavailable")
        }
    }

    #[tokio::test]
    async fn window_average_then_pruned() {
        let meter = ThroughputMeter::new(3000);
        let id = Uuid::new_v4();
        meter.record(id, 100, 0);
        meter.record(id, 100, 500);
        meter.record(id, 100, 1000);

        let states = meter.recompute(1000).await;
        assert_eq!(states[&id].avg_bytes_per_sec, 300.0);
        assert_eq!(meter.state(id).avg_bytes_per_sec, 300.0);
        assert_eq!(meter.state(id).window_millis, 3000);

        let states = meter.recompute(4200).await;
        assert_eq!(states[&id], ThroughputState::idle(3000));
        assert_eq!(meter.state(id).avg_bytes_per_sec, 0.0);
    }

    #[tokio::test]
    async fn single_sample_uses_one_ms_span() {
        let meter = ThroughputMeter::new(3000);
        let id = Uuid::new_v4();
        meter.record(id, 5, 10);
        meter.record(id, 0, 20);

        let states = meter.recompute(20).await;
        assert_eq!(states[&id].avg_bytes_per_sec, 5000.0);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_stop_others() {
        let meter = ThroughputMeter::new(3000);
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        meter.subscribe(Arc::new(Failing));
        meter.subscribe(counting.clone());

        meter.record(Uuid::new_v4(), 10, 0);
        meter.recompute(0).await;
        meter.recompute(10).await;
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forget_drops_everything() {
        let meter = ThroughputMeter::new(3000);
        let id = Uuid::new_v4();
        meter.record(id, 10, 0);
        meter.recompute(0).await;
        assert!(meter.snapshot().contains_key(&id));

        meter.forget(id);
        assert!(meter.snapshot().is_empty());
        assert!(meter.recompute(1).await.is_empty());
    }
}
