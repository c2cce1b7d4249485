//! In-process store, used by tests and embedders that persist elsewhere

use super::TransferStore;
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rangedl_types::{Segment, SegmentStatus, Settings, Transfer, TransferStats, TransferStatus};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    transfers: HashMap<Uuid, Transfer>,
    segments: HashMap<Uuid, BTreeMap<u32, Segment>>,
    settings: HashMap<Uuid, Settings>,
    stats: HashMap<Uuid, TransferStats>,
}

/// Store backed by in-memory maps
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn find_transfer(&self, id: Uuid) -> Result<Option<Transfer>> {
        Ok(self.tables.read().transfers.get(&id).cloned())
    }

    async fn transfers_by_owner(&self, owner: Uuid) -> Result<Vec<Transfer>> {
        let mut out: Vec<Transfer> = self
            .tables
            .read()
            .transfers
            .values()
            .filter(|t| t.owner == owner)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    async fn transfers_with_status(&self, status: TransferStatus) -> Result<Vec<Transfer>> {
        let mut out: Vec<Transfer> = self
            .tables
            .read()
            .transfers
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    async fn save_transfer(&self, transfer: &Transfer) -> Result<()> {
        self.tables
            .write()
            .transfers
            .insert(transfer.id, transfer.clone());
        Ok(())
    }

    async fn delete_transfer(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        tables.transfers.remove(&id);
        tables.segments.remove(&id);
        tables.stats.remove(&id);
        Ok(())
    }

    async fn update_transfer_status(&self, id: Uuid, status: TransferStatus) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(transfer) = tables.transfers.get_mut(&id) else {
            return Ok(false);
        };
        transfer.status = status;
        transfer.touch();
        if status.is_terminal() {
            transfer.finished_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn update_transfer_status_if(
        &self,
        id: Uuid,
        expected: TransferStatus,
        status: TransferStatus,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.transfers.get_mut(&id) {
            Some(transfer) if transfer.status == expected => {
                transfer.status = status;
                transfer.touch();
                if status.is_terminal() {
                    transfer.finished_at = Some(Utc::now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_transfer_received(&self, id: Uuid, received: u64) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(transfer) = tables.transfers.get_mut(&id) else {
            return Ok(false);
        };
        transfer.received = received;
        transfer.touch();
        Ok(true)
    }

    async fn update_transfer_target(&self, id: Uuid, file_name: &str, save_dir: &Path) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(transfer) = tables.transfers.get_mut(&id) else {
            return Ok(false);
        };
        transfer.file_name = file_name.to_string();
        transfer.save_dir = Some(save_dir.to_path_buf());
        transfer.touch();
        Ok(true)
    }

    async fn update_transfer_probe(
        &self,
        id: Uuid,
        total_size: Option<u64>,
        range_supported: bool,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(transfer) = tables.transfers.get_mut(&id) else {
            return Ok(false);
        };
        transfer.total_size = total_size;
        transfer.range_supported = range_supported;
        transfer.touch();
        Ok(true)
    }

    async fn segments_for(&self, transfer_id: Uuid) -> Result<Vec<Segment>> {
        Ok(self
            .tables
            .read()
            .segments
            .get(&transfer_id)
            .map(|segs| segs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_segment(&self, transfer_id: Uuid, index: u32) -> Result<Option<Segment>> {
        Ok(self
            .tables
            .read()
            .segments
            .get(&transfer_id)
            .and_then(|segs| segs.get(&index))
            .cloned())
    }

    async fn save_segment(&self, segment: &Segment) -> Result<()> {
        self.tables
            .write()
            .segments
            .entry(segment.transfer_id)
            .or_default()
            .insert(segment.index, segment.clone());
        Ok(())
    }

    async fn update_segment(
        &self,
        transfer_id: Uuid,
        index: u32,
        received: u64,
        status: SegmentStatus,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(segment) = tables
            .segments
            .get_mut(&transfer_id)
            .and_then(|segs| segs.get_mut(&index))
        else {
            return Ok(false);
        };
        segment.received = received;
        segment.status = status;
        Ok(true)
    }

    async fn delete_segments(&self, transfer_id: Uuid) -> Result<()> {
        self.tables.write().segments.remove(&transfer_id);
        Ok(())
    }

    async fn settings_for(&self, owner: Uuid) -> Result<Settings> {
        Ok(self
            .tables
            .write()
            .settings
            .entry(owner)
            .or_insert_with(|| Settings::new(owner))
            .clone())
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.tables
            .write()
            .settings
            .insert(settings.owner, settings.clone());
        Ok(())
    }

    async fn find_stats(&self, transfer_id: Uuid) -> Result<Option<TransferStats>> {
        Ok(self.tables.read().stats.get(&transfer_id).cloned())
    }

    async fn save_stats(&self, stats: &TransferStats) -> Result<()> {
        self.tables
            .write()
            .stats
            .insert(stats.transfer_id, stats.clone());
        Ok(())
    }

    async fn record_speed(&self, transfer_id: Uuid, avg: f64, peak: f64) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(stats) = tables.stats.get_mut(&transfer_id) else {
            return Ok(false);
        };
        stats.avg_speed_bps = avg;
        stats.max_speed_bps = stats.max_speed_bps.max(peak);
        Ok(true)
    }

    async fn delete_stats(&self, transfer_id: Uuid) -> Result<()> {
        self.tables.write().stats.remove(&transfer_id);
        Ok(())
    }
}
