//! Persistence contract for transfers, segments, settings and stats
//!
//! The engine treats the store as the single source of truth: workers re-read
//! it to pick up pause/cancel/delete, and every progress update goes through
//! the narrow `update_*` operations so a stale snapshot never overwrites a
//! status written by someone else.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use async_trait::async_trait;
use rangedl_types::{Segment, SegmentStatus, Settings, Transfer, TransferStats, TransferStatus};
use std::path::Path;
use uuid::Uuid;

/// CRUD-style store for everything the engine persists.
///
/// Implementations must be consistent on read-after-write within a process.
#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn find_transfer(&self, id: Uuid) -> Result<Option<Transfer>>;

    async fn transfers_by_owner(&self, owner: Uuid) -> Result<Vec<Transfer>>;

    async fn transfers_with_status(&self, status: TransferStatus) -> Result<Vec<Transfer>>;

    /// Insert or replace the whole record
    async fn save_transfer(&self, transfer: &Transfer) -> Result<()>;

    /// Remove the transfer together with its segments and stats
    async fn delete_transfer(&self, id: Uuid) -> Result<()>;

    /// Set the status unconditionally. Returns `false` if the transfer is gone.
    async fn update_transfer_status(&self, id: Uuid, status: TransferStatus) -> Result<bool>;

    /// Set the status only if it currently equals `expected`.
    /// Terminal statuses also stamp `finished_at`.
    async fn update_transfer_status_if(
        &self,
        id: Uuid,
        expected: TransferStatus,
        status: TransferStatus,
    ) -> Result<bool>;

    async fn update_transfer_received(&self, id: Uuid, received: u64) -> Result<bool>;

    /// Record the resolved destination of a transfer
    async fn update_transfer_target(&self, id: Uuid, file_name: &str, save_dir: &Path) -> Result<bool>;

    /// Record what the range probe learned
    async fn update_transfer_probe(
        &self,
        id: Uuid,
        total_size: Option<u64>,
        range_supported: bool,
    ) -> Result<bool>;

    /// Segments of one transfer, ordered by index
    async fn segments_for(&self, transfer_id: Uuid) -> Result<Vec<Segment>>;

    async fn find_segment(&self, transfer_id: Uuid, index: u32) -> Result<Option<Segment>>;

    async fn save_segment(&self, segment: &Segment) -> Result<()>;

    /// Update progress and status of an existing segment.
    /// Returns `false` (and writes nothing) if the segment is gone.
    async fn update_segment(
        &self,
        transfer_id: Uuid,
        index: u32,
        received: u64,
        status: SegmentStatus,
    ) -> Result<bool>;

    async fn delete_segments(&self, transfer_id: Uuid) -> Result<()>;

    /// Settings for `owner`, created with defaults on first access
    async fn settings_for(&self, owner: Uuid) -> Result<Settings>;

    async fn save_settings(&self, settings: &Settings) -> Result<()>;

    async fn find_stats(&self, transfer_id: Uuid) -> Result<Option<TransferStats>>;

    async fn save_stats(&self, stats: &TransferStats) -> Result<()>;

    /// Set the current speed and raise the max to `peak` if higher.
    /// Returns `false` if no stats record exists.
    async fn record_speed(&self, transfer_id: Uuid, avg: f64, peak: f64) -> Result<bool>;

    async fn delete_stats(&self, transfer_id: Uuid) -> Result<()>;

    /// Recompute `transfer.received` as the sum over its segments
    async fn recompute_received(&self, transfer_id: Uuid) -> Result<Option<u64>> {
        let total: u64 = self
            .segments_for(transfer_id)
            .await?
            .iter()
            .map(|s| s.received)
            .sum();
        if self.update_transfer_received(transfer_id, total).await? {
            Ok(Some(total))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every store implementation must share

    use super::*;
    use rangedl_types::TransferStatus;

    pub async fn exercise(store: &dyn TransferStore) {
        let owner = Uuid::new_v4();
        let mut transfer = Transfer::new(owner, "http://example.com/a.bin".into());
        transfer.file_name = "a.bin".into();
        store.save_transfer(&transfer).await.unwrap();

        let loaded = store.find_transfer(transfer.id).await.unwrap().unwrap();
        assert_eq!(loaded.url, transfer.url);
        assert_eq!(loaded.status, TransferStatus::Queued);
        assert_eq!(store.transfers_by_owner(owner).await.unwrap().len(), 1);
        assert!(store.transfers_by_owner(Uuid::new_v4()).await.unwrap().is_empty());

        // status CAS
        assert!(!store
            .update_transfer_status_if(transfer.id, TransferStatus::Running, TransferStatus::Completed)
            .await
            .unwrap());
        assert!(store
            .update_transfer_status(transfer.id, TransferStatus::Running)
            .await
            .unwrap());
        assert_eq!(
            store.transfers_with_status(TransferStatus::Running).await.unwrap().len(),
            1
        );

        // segments come back ordered by index
        for (index, start, end) in [(1u32, 50u64, 99u64), (0, 0, 49)] {
            store
                .save_segment(&Segment::new(transfer.id, index, start, Some(end)))
                .await
                .unwrap();
        }
        let segments = store.segments_for(transfer.id).await.unwrap();
        assert_eq!(segments.iter().map(|s| s.index).collect::<Vec<_>>(), vec![0, 1]);

        assert!(store
            .update_segment(transfer.id, 0, 20, SegmentStatus::Running)
            .await
            .unwrap());
        assert!(store
            .update_segment(transfer.id, 1, 7, SegmentStatus::Running)
            .await
            .unwrap());
        assert!(!store
            .update_segment(transfer.id, 9, 7, SegmentStatus::Running)
            .await
            .unwrap());
        assert_eq!(store.recompute_received(transfer.id).await.unwrap(), Some(27));

        assert!(store
            .update_transfer_target(transfer.id, "b.bin", Path::new("/tmp/out"))
            .await
            .unwrap());
        assert!(store
            .update_transfer_probe(transfer.id, Some(100), true)
            .await
            .unwrap());
        let probed = store.find_transfer(transfer.id).await.unwrap().unwrap();
        assert_eq!(probed.file_name, "b.bin");
        assert_eq!(probed.destination(), Some(Path::new("/tmp/out/b.bin").to_path_buf()));
        assert_eq!(probed.total_size, Some(100));
        assert!(probed.range_supported);
        assert_eq!(probed.status, TransferStatus::Running);
        assert_eq!(store.find_transfer(transfer.id).await.unwrap().unwrap().received, 27);

        assert!(store
            .update_transfer_status_if(transfer.id, TransferStatus::Running, TransferStatus::Completed)
            .await
            .unwrap());
        let done = store.find_transfer(transfer.id).await.unwrap().unwrap();
        assert_eq!(done.status, TransferStatus::Completed);
        assert!(done.finished_at.is_some());

        // settings are created on first access
        let mut settings = store.settings_for(owner).await.unwrap();
        assert_eq!(settings.default_segments, 4);
        settings.global_speed_limit_bps = 1000;
        store.save_settings(&settings).await.unwrap();
        assert_eq!(
            store.settings_for(owner).await.unwrap().global_speed_limit_bps,
            1000
        );

        let mut stats = TransferStats::new(transfer.id);
        stats.retries = 2;
        store.save_stats(&stats).await.unwrap();
        assert_eq!(store.find_stats(transfer.id).await.unwrap().unwrap().retries, 2);

        assert!(store.record_speed(transfer.id, 50.0, 80.0).await.unwrap());
        assert!(store.record_speed(transfer.id, 10.0, 20.0).await.unwrap());
        let speeds = store.find_stats(transfer.id).await.unwrap().unwrap();
        assert_eq!((speeds.avg_speed_bps, speeds.max_speed_bps), (10.0, 80.0));
        assert_eq!(speeds.retries, 2);
        assert!(!store.record_speed(Uuid::new_v4(), 1.0, 1.0).await.unwrap());

        store.delete_transfer(transfer.id).await.unwrap();
        assert!(store.find_transfer(transfer.id).await.unwrap().is_none());
        assert!(store.segments_for(transfer.id).await.unwrap().is_empty());
        assert!(store.find_stats(transfer.id).await.unwrap().is_none());
        assert!(!store
            .update_transfer_received(transfer.id, 1)
            .await
            .unwrap());
        assert_eq!(store.recompute_received(transfer.id).await.unwrap(), None);
    }
}
