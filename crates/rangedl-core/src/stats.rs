//! Stats recorder - persists meter snapshots into per-transfer stats

use crate::engine::ThroughputSubscriber;
use crate::store::TransferStore;
use async_trait::async_trait;
use rangedl_types::{ThroughputState, TransferStats};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Keeps `avg_speed_bps` current and `max_speed_bps` at its high-water mark
pub struct StatsRecorder {
    store: Arc<dyn TransferStore>,
}

impl StatsRecorder {
    pub fn new(store: Arc<dyn TransferStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ThroughputSubscriber for StatsRecorder {
    fn name(&self) -> &str {
        "stats-recorder"
    }

    async fn on_snapshot(&self, snapshot: &HashMap<Uuid, ThroughputState>) -> anyhow::Result<()> {
        for (id, state) in snapshot {
            let (avg, peak) = (state.avg_bytes_per_sec, state.peak_bytes_per_sec);
            if self.store.record_speed(*id, avg, peak).await? {
                continue;
            }
            // deleted since the samples were taken
            if self.store.find_transfer(*id).await?.is_none() {
                continue;
            }
            let mut stats = TransferStats::new(*id);
            stats.avg_speed_bps = avg;
            stats.max_speed_bps = peak;
            self.store.save_stats(&stats).await?;
        }
        Ok(())
    }
}
