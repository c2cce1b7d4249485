//! Segment worker - streams one byte range into the destination file
//!
//! Every worker opens the destination on its own and only writes inside its
//! segment's range, so siblings never coordinate. Pause, cancel and delete
//! reach the worker through the store (polled) and through its cancellation
//! token (checked per chunk).

use crate::config::EngineConfig;
use crate::engine::meter::ThroughputMeter;
use crate::engine::throttle::SegmentThrottle;
use crate::error::{EngineError, Result};
use crate::store::TransferStore;
use futures::StreamExt;
use rangedl_types::{Segment, SegmentStatus, TransferStatus};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a worker needs to know about the segment it runs
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub transfer_id: Uuid,
    pub segment_index: u32,
    pub url: String,
    pub destination: PathBuf,
    pub range_supported: bool,
    /// Per-transfer cap in bytes per second, 0 for unlimited
    pub speed_limit_bps: u64,
    /// Configured segment count the cap is split across
    pub segment_count: u32,
}

/// How a worker run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Range fully written, segment Done
    Done,
    /// Transfer no longer running, segment back to Pending
    Released,
    /// Segment Canceled with its progress kept
    Canceled,
    /// Transfer or segment vanished; nothing more was written
    Vanished,
    /// Segment Error, transfer Error if it was still running
    Failed,
}

enum Stop {
    Pause,
    Cancel,
    Vanish,
}

/// Streams one segment
pub struct SegmentWorker {
    job: SegmentJob,
    store: Arc<dyn TransferStore>,
    meter: Arc<ThroughputMeter>,
    client: Client,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
    /// Progress of the segment as last known, persisted or not
    received: u64,
}

impl SegmentWorker {
    pub fn new(
        job: SegmentJob,
        store: Arc<dyn TransferStore>,
        meter: Arc<ThroughputMeter>,
        client: Client,
        config: Arc<EngineConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job,
            store,
            meter,
            client,
            config,
            cancel,
            received: 0,
        }
    }

    /// Run the segment to one of its outcomes. Never panics on I/O or HTTP failures.
    pub async fn run(mut self) -> SegmentOutcome {
        match self.execute().await {
            Ok(outcome) => outcome,
            Err(e) => self.fail(e).await,
        }
    }

    async fn execute(&mut self) -> Result<SegmentOutcome> {
        let id = self.job.transfer_id;
        let index = self.job.segment_index;

        let Some(segment) = self.store.find_segment(id, index).await? else {
            debug!("Segment {} of transfer {} is gone", index, id);
            return Ok(SegmentOutcome::Vanished);
        };
        let Some(transfer) = self.store.find_transfer(id).await? else {
            debug!("Transfer {} is gone before segment {} started", id, index);
            return Ok(SegmentOutcome::Vanished);
        };
        self.received = segment.received;

        if transfer.status != TransferStatus::Running {
            info!(
                "Transfer {} is {}, releasing segment {}",
                id, transfer.status, index
            );
            return self.persist_outcome(SegmentStatus::Pending, SegmentOutcome::Released).await;
        }
        if self.cancel.is_cancelled() {
            return self.stop(Stop::Cancel).await;
        }

        if let Some(len) = segment.len() {
            if segment.received >= len {
                info!("Segment {} of transfer {} already complete", index, id);
                return self.persist_outcome(SegmentStatus::Done, SegmentOutcome::Done).await;
            }
        }

        self.stream(&segment).await
    }

    async fn stream(&mut self, segment: &Segment) -> Result<SegmentOutcome> {
        let id = self.job.transfer_id;
        let index = segment.index;

        let mut offset = segment.start + self.received;
        if !self.job.range_supported && offset > segment.start {
            warn!(
                "Source of transfer {} ignores ranges, restarting segment {} from byte {}",
                id, index, segment.start
            );
            self.restart_at(segment).await?;
            offset = segment.start;
        }

        info!(
            "Starting segment {} for transfer {} (bytes {}-{})",
            index,
            id,
            offset,
            segment.end.map_or_else(String::new, |e| e.to_string())
        );

        let mut request = self.client.get(&self.job.url);
        let ranged = self.job.range_supported && (offset > 0 || segment.end.is_some());
        if ranged {
            let range = match segment.end {
                Some(end) => format!("bytes={}-{}", offset, end),
                None => format!("bytes={}-", offset),
            };
            debug!("Segment {} requesting range: {}", index, range);
            request = request.header(RANGE, range);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Server {
                status: status.as_u16(),
                message: format!("Failed to fetch segment {}", index),
            });
        }
        if ranged && status != StatusCode::PARTIAL_CONTENT && offset > 0 {
            if segment.start > 0 {
                return Err(EngineError::Server {
                    status: status.as_u16(),
                    message: format!("Server ignored the range of segment {}", index),
                });
            }
            warn!(
                "Server answered {} to a ranged request, restarting segment {} of transfer {}",
                status, index, id
            );
            self.restart_at(segment).await?;
            offset = segment.start;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.job.destination)
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut throttle =
            SegmentThrottle::new(self.job.speed_limit_bps, self.job.segment_count);
        if let Some(throttle) = throttle.as_mut() {
            throttle.reset(std::time::Instant::now());
        }

        let length = segment.len();
        let chunk_size = self.config.chunk_size.max(1);
        let mut last_poll = Instant::now();
        let mut last_persist = Instant::now();
        let mut body = response.bytes_stream();

        'stream: loop {
            // a stalled read must not outlive a cancel
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    file.flush().await?;
                    return self.stop(Stop::Cancel).await;
                }
                item = body.next() => item,
            };
            let Some(item) = item else {
                break 'stream;
            };
            let mut chunk = item?;
            while !chunk.is_empty() {
                if self.cancel.is_cancelled() {
                    file.flush().await?;
                    return self.stop(Stop::Cancel).await;
                }

                if last_poll.elapsed() >= self.config.status_poll() {
                    last_poll = Instant::now();
                    if let Some(stop) = self.poll_status().await? {
                        file.flush().await?;
                        return self.stop(stop).await;
                    }
                }

                let left = length.map_or(usize::MAX, |len| {
                    usize::try_from(len.saturating_sub(self.received)).unwrap_or(usize::MAX)
                });
                if left == 0 {
                    break 'stream;
                }
                let piece = chunk.split_to(chunk.len().min(chunk_size).min(left));
                let n = piece.len() as u64;

                file.write_all(&piece).await?;
                self.received += n;
                self.meter.record_now(id, n);

                if last_persist.elapsed() >= self.config.progress_persist() {
                    last_persist = Instant::now();
                    if !self.persist(SegmentStatus::Running).await? {
                        return Ok(SegmentOutcome::Vanished);
                    }
                }

                if let Some(throttle) = throttle.as_mut() {
                    if !throttle.pace(n, &self.cancel).await {
                        file.flush().await?;
                        return self.stop(Stop::Cancel).await;
                    }
                }
            }
        }

        file.flush().await?;

        if let Some(len) = length {
            if self.received < len {
                self.persist(SegmentStatus::Running).await?;
                return Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "segment {} ended after {} of {} bytes",
                        index, self.received, len
                    ),
                )));
            }
        }

        match self.store.find_transfer(id).await?.map(|t| t.status) {
            None => Ok(SegmentOutcome::Vanished),
            // a sibling's failure does not undo a fully written range
            Some(TransferStatus::Running | TransferStatus::Error) => {
                info!(
                    "Segment {} of transfer {} complete ({} bytes)",
                    index, id, self.received
                );
                self.persist_outcome(SegmentStatus::Done, SegmentOutcome::Done).await
            }
            Some(TransferStatus::Canceled) => self.stop(Stop::Cancel).await,
            Some(_) => self.stop(Stop::Pause).await,
        }
    }

    /// Discard progress and persist it right away, so a crash cannot resume
    /// from an offset the source will not honour.
    async fn restart_at(&mut self, segment: &Segment) -> Result<()> {
        debug!("Segment {} progress reset from {}", segment.index, self.received);
        self.received = 0;
        self.persist(SegmentStatus::Running).await?;
        Ok(())
    }

    async fn poll_status(&self) -> Result<Option<Stop>> {
        let status = self
            .store
            .find_transfer(self.job.transfer_id)
            .await?
            .map(|t| t.status);
        Ok(match status {
            None => Some(Stop::Vanish),
            // a failed sibling leaves this segment streaming
            Some(TransferStatus::Running | TransferStatus::Error) => None,
            Some(TransferStatus::Canceled) => Some(Stop::Cancel),
            Some(_) => Some(Stop::Pause),
        })
    }

    async fn stop(&self, stop: Stop) -> Result<SegmentOutcome> {
        let index = self.job.segment_index;
        let id = self.job.transfer_id;
        match stop {
            Stop::Vanish => {
                info!("Transfer {} vanished, segment {} stops", id, index);
                Ok(SegmentOutcome::Vanished)
            }
            Stop::Pause => {
                info!(
                    "Segment {} of transfer {} paused at {} bytes",
                    index, id, self.received
                );
                self.persist_outcome(SegmentStatus::Pending, SegmentOutcome::Released).await
            }
            Stop::Cancel => {
                info!(
                    "Segment {} of transfer {} cancelled at {} bytes",
                    index, id, self.received
                );
                self.persist_outcome(SegmentStatus::Canceled, SegmentOutcome::Canceled).await
            }
        }
    }

    /// Persist progress with `status`; a vanished segment turns the outcome into `Vanished`
    async fn persist_outcome(
        &self,
        status: SegmentStatus,
        outcome: SegmentOutcome,
    ) -> Result<SegmentOutcome> {
        if self.persist(status).await? {
            Ok(outcome)
        } else {
            Ok(SegmentOutcome::Vanished)
        }
    }

    /// Write `received` + `status` and refresh the transfer aggregate.
    /// Returns `false` if the segment no longer exists.
    async fn persist(&self, status: SegmentStatus) -> Result<bool> {
        let updated = self
            .store
            .update_segment(
                self.job.transfer_id,
                self.job.segment_index,
                self.received,
                status,
            )
            .await?;
        if updated {
            self.store.recompute_received(self.job.transfer_id).await?;
        }
        Ok(updated)
    }

    async fn fail(&self, err: EngineError) -> SegmentOutcome {
        let id = self.job.transfer_id;
        let index = self.job.segment_index;
        error!(
            "Segment {} of transfer {} failed ({}): {}",
            index,
            id,
            err.class(),
            err
        );

        match self.persist(SegmentStatus::Error).await {
            Ok(true) => {}
            Ok(false) => return SegmentOutcome::Vanished,
            Err(e) => {
                error!("Failed to record error of segment {}: {}", index, e);
                return SegmentOutcome::Failed;
            }
        }

        if let Err(e) = self
            .store
            .update_transfer_status_if(id, TransferStatus::Running, TransferStatus::Error)
            .await
        {
            error!("Failed to mark transfer {} as errored: {}", id, e);
        }
        SegmentOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rangedl_types::Transfer;

    async fn fixture(status: TransferStatus, segment: Segment) -> (Arc<MemoryStore>, SegmentWorker) {
        let store = Arc::new(MemoryStore::new());
        let mut transfer = Transfer::new(Uuid::nil(), "http://127.0.0.1:9/file.bin".into());
        transfer.id = segment.transfer_id;
        transfer.status = status;
        store.save_transfer(&transfer).await.unwrap();
        store.save_segment(&segment).await.unwrap();

        let job = SegmentJob {
            transfer_id: segment.transfer_id,
            segment_index: segment.index,
            url: transfer.url.clone(),
            destination: std::env::temp_dir().join(format!("rangedl-worker-{}", segment.transfer_id)),
            range_supported: true,
            speed_limit_bps: 0,
            segment_count: 1,
        };
        let worker = SegmentWorker::new(
            job,
            store.clone(),
            Arc::new(ThroughputMeter::new(3000)),
            Client::new(),
            Arc::new(EngineConfig::default()),
            CancellationToken::new(),
        );
        (store, worker)
    }

    #[tokio::test]
    async fn not_running_releases_segment() {
        let mut segment = Segment::new(Uuid::new_v4(), 0, 0, Some(99));
        segment.status = SegmentStatus::Running;
        segment.received = 10;
        let (store, worker) = fixture(TransferStatus::Paused, segment.clone()).await;

        assert_eq!(worker.run().await, SegmentOutcome::Released);
        let stored = store.find_segment(segment.transfer_id, 0).await.unwrap().unwrap();
        assert_eq!(stored.status, SegmentStatus::Pending);
        assert_eq!(stored.received, 10);
    }

    #[tokio::test]
    async fn fully_received_segment_is_done_without_request() {
        let mut segment = Segment::new(Uuid::new_v4(), 0, 0, Some(99));
        segment.status = SegmentStatus::Running;
        segment.received = 100;
        let (store, worker) = fixture(TransferStatus::Running, segment.clone()).await;

        assert_eq!(worker.run().await, SegmentOutcome::Done);
        let stored = store.find_segment(segment.transfer_id, 0).await.unwrap().unwrap();
        assert_eq!(stored.status, SegmentStatus::Done);
        let transfer = store.find_transfer(segment.transfer_id).await.unwrap().unwrap();
        assert_eq!(transfer.received, 100);
    }

    #[tokio::test]
    async fn missing_segment_is_a_silent_abort() {
        let segment = Segment::new(Uuid::new_v4(), 0, 0, Some(99));
        let (store, worker) = fixture(TransferStatus::Running, segment.clone()).await;
        store.delete_segments(segment.transfer_id).await.unwrap();

        assert_eq!(worker.run().await, SegmentOutcome::Vanished);
        let transfer = store.find_transfer(segment.transfer_id).await.unwrap().unwrap();
        assert_eq!(transfer.status, TransferStatus::Running);
    }

    #[tokio::test]
    async fn pre_cancelled_token_keeps_progress() {
        let mut segment = Segment::new(Uuid::new_v4(), 0, 0, Some(99));
        segment.status = SegmentStatus::Running;
        segment.received = 42;
        let (store, worker) = fixture(TransferStatus::Running, segment.clone()).await;
        worker.cancel.cancel();

        assert_eq!(worker.run().await, SegmentOutcome::Canceled);
        let stored = store.find_segment(segment.transfer_id, 0).await.unwrap().unwrap();
        assert_eq!(stored.status, SegmentStatus::Canceled);
        assert_eq!(stored.received, 42);
    }

    #[tokio::test]
    async fn unreachable_source_fails_segment_and_transfer() {
        let mut segment = Segment::new(Uuid::new_v4(), 0, 0, Some(99));
        segment.status = SegmentStatus::Running;
        let (store, worker) = fixture(TransferStatus::Running, segment.clone()).await;

        assert_eq!(worker.run().await, SegmentOutcome::Failed);
        let stored = store.find_segment(segment.transfer_id, 0).await.unwrap().unwrap();
        assert_eq!(stored.status, SegmentStatus::Error);
        let transfer = store.find_transfer(segment.transfer_id).await.unwrap().unwrap();
        assert_eq!(transfer.status, TransferStatus::Error);
    }
}
