//! Transfer orchestrator - the per-tick coordinator
//!
//! Each tick walks every Running transfer:
//! - resolves its destination and creates the directory
//! - probes and plans segments the first time it is seen
//! - dispatches pending segments onto the bounded worker pool
//! - finalizes the transfer once every segment is Done

use crate::config::EngineConfig;
use crate::engine::meter::ThroughputMeter;
use crate::engine::ordering::{pick, SegmentOrder};
use crate::engine::planner::ensure_planned;
use crate::engine::probe::RangeProber;
use crate::engine::registry::{TaskHandle, TaskRegistry};
use crate::engine::segment_worker::{SegmentJob, SegmentWorker};
use crate::error::Result;
use crate::paths;
use crate::store::TransferStore;
use chrono::Utc;
use rangedl_types::{SegmentStatus, Transfer, TransferStats, TransferStatus};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// What one tick did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Running transfers looked at
    pub active: usize,
    /// Workers spawned
    pub dispatched: usize,
    /// Transfers finalized as Completed
    pub completed: usize,
    /// Transfers that failed this tick
    pub failed: usize,
}

/// Turns Running transfers into dispatched segment workers
pub struct Orchestrator {
    store: Arc<dyn TransferStore>,
    meter: Arc<ThroughputMeter>,
    registry: Arc<TaskRegistry>,
    prober: RangeProber,
    client: Client,
    config: Arc<EngineConfig>,
    pool: Arc<Semaphore>,
    /// Parent of every worker token
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TransferStore>,
        meter: Arc<ThroughputMeter>,
        registry: Arc<TaskRegistry>,
        client: Client,
        config: Arc<EngineConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        let prober = RangeProber::new(client.clone(), config.probe_timeout());
        let pool = Arc::new(Semaphore::new(config.pool_size()));
        Self {
            store,
            meter,
            registry,
            prober,
            client,
            config,
            pool,
            shutdown,
        }
    }

    /// One pass over every Running transfer.
    ///
    /// A failure in one transfer marks it Error and the pass goes on; only a
    /// failure to list the Running transfers is returned.
    pub async fn tick(&self) -> Result<TickReport> {
        let transfers = self.store.transfers_with_status(TransferStatus::Running).await?;
        let mut report = TickReport {
            active: transfers.len(),
            ..TickReport::default()
        };

        for transfer in transfers {
            let id = transfer.id;
            match self.advance(transfer).await {
                Ok(Progress::Dispatched(n)) => report.dispatched += n,
                Ok(Progress::Completed) => report.completed += 1,
                Err(e) => {
                    error!("Transfer {} failed ({}): {}", id, e.class(), e);
                    report.failed += 1;
                    self.fail(id).await;
                }
            }
        }

        self.registry.prune_finished();
        Ok(report)
    }

    async fn advance(&self, transfer: Transfer) -> Result<Progress> {
        let id = transfer.id;
        let settings = self.store.settings_for(transfer.owner).await?;
        let segment_count = settings.default_segments.max(1);

        let file_name = if transfer.file_name.is_empty() {
            paths::file_name_from_url(&transfer.url)
        } else {
            transfer.file_name.clone()
        };
        let save_dir = match (&transfer.save_dir, &settings.default_save_dir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) => dir.clone(),
            (None, None) => paths::default_save_dir(),
        };
        if transfer.save_dir.as_ref() != Some(&save_dir) || transfer.file_name != file_name {
            self.store.update_transfer_target(id, &file_name, &save_dir).await?;
        }
        tokio::fs::create_dir_all(&save_dir).await?;

        let mut range_supported = transfer.range_supported;
        let mut segments = self.store.segments_for(id).await?;
        if segments.is_empty() {
            let probe = self.prober.probe(&transfer.url).await?;
            range_supported = probe.range_supported;
            self.store
                .update_transfer_probe(id, probe.total_length, probe.range_supported)
                .await?;
            segments = ensure_planned(
                self.store.as_ref(),
                id,
                probe.total_length,
                segment_count,
                probe.range_supported,
            )
            .await?;
            info!(
                "Planned transfer {} ({}): {} segments, total={:?}, ranges={}",
                id,
                file_name,
                segments.len(),
                probe.total_length,
                probe.range_supported
            );
        }

        if !segments.is_empty() && segments.iter().all(|s| s.status == SegmentStatus::Done) {
            self.finalize(id).await?;
            return Ok(Progress::Completed);
        }

        let destination = save_dir.join(&file_name);
        let mut dispatched = 0;
        for segment in pick(&segments, SegmentOrder::ByLeftmostGap, segment_count as usize) {
            let claimed = self
                .store
                .update_segment(id, segment.index, segment.received, SegmentStatus::Running)
                .await?;
            if !claimed {
                continue;
            }

            let job = SegmentJob {
                transfer_id: id,
                segment_index: segment.index,
                url: transfer.url.clone(),
                destination: destination.clone(),
                range_supported,
                speed_limit_bps: settings.global_speed_limit_bps,
                segment_count,
            };
            self.dispatch(job);
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!("Dispatched {} segments of transfer {}", dispatched, id);
        }
        Ok(Progress::Dispatched(dispatched))
    }

    fn dispatch(&self, job: SegmentJob) {
        let transfer_id = job.transfer_id;
        let segment_index = job.segment_index;
        let token = self.shutdown.child_token();
        let worker = SegmentWorker::new(
            job,
            self.store.clone(),
            self.meter.clone(),
            self.client.clone(),
            self.config.clone(),
            token.clone(),
        );
        let pool = self.pool.clone();
        let cancel = token.clone();

        let join = tokio::spawn(async move {
            // a worker cancelled while queued still runs, to release its claim
            let _permit = tokio::select! {
                permit = pool.acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                _ = cancel.cancelled() => None,
            };
            let outcome = worker.run().await;
            debug!(
                "Segment {} of transfer {} finished: {:?}",
                segment_index, transfer_id, outcome
            );
        });
        self.registry
            .register(transfer_id, TaskHandle::new(segment_index, token, join));
    }

    async fn finalize(&self, id: Uuid) -> Result<()> {
        if !self
            .store
            .update_transfer_status_if(id, TransferStatus::Running, TransferStatus::Completed)
            .await?
        {
            return Ok(());
        }

        if let Some(received) = self.store.recompute_received(id).await? {
            if let Some(transfer) = self.store.find_transfer(id).await? {
                if transfer.total_size.is_none() {
                    self.store
                        .update_transfer_probe(id, Some(received), transfer.range_supported)
                        .await?;
                }
            }
        }

        let mut stats = self
            .store
            .find_stats(id)
            .await?
            .unwrap_or_else(|| TransferStats::new(id));
        stats.last_finished_at = Some(Utc::now());
        self.store.save_stats(&stats).await?;

        self.registry.drain(id);
        info!("Transfer {} completed", id);
        Ok(())
    }

    /// Mark the transfer Error. Workers already streaming its other
    /// segments run to their own outcome.
    async fn fail(&self, id: Uuid) {
        if let Err(e) = self
            .store
            .update_transfer_status_if(id, TransferStatus::Running, TransferStatus::Error)
            .await
        {
            error!("Failed to mark transfer {} as errored: {}", id, e);
        }
    }
}

enum Progress {
    Dispatched(usize),
    Completed,
}
