//! Transfer control - the commands users issue against transfers
//!
//! Every status change goes through [`transition`], a closed table over
//! `(status, command)`. Writes are compare-and-set against the status the
//! decision was made on, so a racing worker or second client cannot be
//! overwritten with a stale decision.

use crate::engine::{TaskRegistry, ThroughputMeter};
use crate::error::{EngineError, Result};
use crate::paths;
use crate::store::TransferStore;
use chrono::Utc;
use rangedl_types::{Segment, SegmentStatus, Settings, Transfer, TransferStats, TransferStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_BACKOFF: Duration = Duration::from_millis(300);
const CAS_ATTEMPTS: u32 = 5;
const WORKER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Commands a user can apply to a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Pause,
    Cancel,
    Delete,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Cancel => "cancel",
            Command::Delete => "delete",
        }
    }
}

/// Outcome of applying a status command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already in the requested state
    Noop,
    /// Move to the given status
    To(TransferStatus),
}

/// The transition table for the status commands.
///
/// `Delete` is always allowed and handled by [`TransferControl::delete`].
pub fn transition(from: TransferStatus, command: Command) -> Result<Transition> {
    use TransferStatus::*;

    let next = match (command, from) {
        (Command::Delete, _) => return Ok(Transition::To(Canceled)),
        (_, Completed) => None,

        (Command::Start, Running) => return Ok(Transition::Noop),
        (Command::Start, Queued | Paused | Error | Canceled) => Some(Running),

        (Command::Pause, Paused) => return Ok(Transition::Noop),
        (Command::Pause, Queued | Running) => Some(Paused),
        (Command::Pause, Error | Canceled) => None,

        (Command::Cancel, Canceled) => return Ok(Transition::Noop),
        (Command::Cancel, Queued | Running | Paused | Error) => Some(Canceled),
    };

    next.map(Transition::To)
        .ok_or(EngineError::InvalidTransition {
            from,
            command: command.as_str(),
        })
}

/// Check that `url` is an absolute http(s) URL with a host
pub fn validate_url(url: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(url.trim()).map_err(|_| EngineError::InvalidUrl(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        _ => return Err(EngineError::InvalidUrl(url.to_string())),
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(EngineError::InvalidUrl(url.to_string()));
    }
    Ok(parsed)
}

/// Applies user commands through the store
#[derive(Clone)]
pub struct TransferControl {
    store: Arc<dyn TransferStore>,
    registry: Arc<TaskRegistry>,
    meter: Arc<ThroughputMeter>,
}

impl TransferControl {
    pub fn new(
        store: Arc<dyn TransferStore>,
        registry: Arc<TaskRegistry>,
        meter: Arc<ThroughputMeter>,
    ) -> Self {
        Self {
            store,
            registry,
            meter,
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// The transfer `id` if it belongs to `owner`
    pub async fn transfer(&self, owner: Uuid, id: Uuid) -> Result<Transfer> {
        self.store
            .find_transfer(id)
            .await?
            .filter(|t| t.owner == owner)
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn transfers(&self, owner: Uuid) -> Result<Vec<Transfer>> {
        let mut transfers = self.store.transfers_by_owner(owner).await?;
        transfers.sort_by_key(|t| t.created_at);
        Ok(transfers)
    }

    pub async fn segments(&self, owner: Uuid, id: Uuid) -> Result<Vec<Segment>> {
        self.transfer(owner, id).await?;
        self.store.segments_for(id).await
    }

    pub async fn stats(&self, owner: Uuid, id: Uuid) -> Result<Option<TransferStats>> {
        self.transfer(owner, id).await?;
        self.store.find_stats(id).await
    }

    pub async fn settings(&self, owner: Uuid) -> Result<Settings> {
        self.store.settings_for(owner).await
    }

    pub async fn update_settings(&self, settings: &Settings) -> Result<()> {
        let mut settings = settings.clone();
        settings.default_segments = settings.default_segments.max(1);
        self.store.save_settings(&settings).await
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Create a Queued transfer for `url`
    pub async fn add_url(
        &self,
        owner: Uuid,
        url: &str,
        file_name: Option<String>,
        save_dir: Option<PathBuf>,
    ) -> Result<Transfer> {
        let parsed = validate_url(url)?;

        let mut transfer = Transfer::new(owner, parsed.to_string());
        transfer.file_name = file_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| paths::file_name_from_url(parsed.as_str()));
        transfer.save_dir = save_dir;

        self.store.save_transfer(&transfer).await?;
        self.store.save_stats(&TransferStats::new(transfer.id)).await?;

        info!("Added transfer {}: {} -> {}", transfer.id, transfer.url, transfer.file_name);
        Ok(transfer)
    }

    /// Apply `command`; returns the transfer afterwards (`None` once deleted)
    pub async fn apply(&self, owner: Uuid, id: Uuid, command: Command) -> Result<Option<Transfer>> {
        match command {
            Command::Delete => {
                self.delete(owner, id).await?;
                Ok(None)
            }
            Command::Start => self.start(owner, id).await.map(Some),
            Command::Pause => self.pause(owner, id).await.map(Some),
            Command::Cancel => self.cancel(owner, id).await.map(Some),
        }
    }

    pub async fn start(&self, owner: Uuid, id: Uuid) -> Result<Transfer> {
        self.change_status(owner, id, Command::Start).await
    }

    pub async fn pause(&self, owner: Uuid, id: Uuid) -> Result<Transfer> {
        self.change_status(owner, id, Command::Pause).await
    }

    pub async fn cancel(&self, owner: Uuid, id: Uuid) -> Result<Transfer> {
        self.change_status(owner, id, Command::Cancel).await
    }

    async fn change_status(&self, owner: Uuid, id: Uuid, command: Command) -> Result<Transfer> {
        for _ in 0..CAS_ATTEMPTS {
            let transfer = self.transfer(owner, id).await?;
            let from = transfer.status;
            let to = match transition(from, command)? {
                Transition::Noop => return Ok(transfer),
                Transition::To(to) => to,
            };

            if to == TransferStatus::Running {
                self.prepare_restart(&transfer).await?;
            }

            if !self.store.update_transfer_status_if(id, from, to).await? {
                debug!("Transfer {} changed while applying {}, retrying", id, command.as_str());
                continue;
            }
            info!("Transfer {}: {} -> {}", id, from, to);

            self.after_transition(id, to).await?;
            return self.transfer(owner, id).await;
        }

        // Lost every race; report whatever the transfer settled on
        self.transfer(owner, id).await
    }

    /// Re-arm segments before a transfer re-enters Running
    async fn prepare_restart(&self, transfer: &Transfer) -> Result<()> {
        match transfer.status {
            TransferStatus::Canceled => {
                info!("Restarting canceled transfer {} from scratch", transfer.id);
                self.store.delete_segments(transfer.id).await?;
                self.store.update_transfer_probe(transfer.id, None, false).await?;
                self.store.update_transfer_received(transfer.id, 0).await?;
            }
            TransferStatus::Error | TransferStatus::Paused => {
                for segment in self.store.segments_for(transfer.id).await? {
                    if matches!(segment.status, SegmentStatus::Error | SegmentStatus::Canceled) {
                        self.store
                            .update_segment(
                                transfer.id,
                                segment.index,
                                segment.received,
                                SegmentStatus::Pending,
                            )
                            .await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn after_transition(&self, id: Uuid, to: TransferStatus) -> Result<()> {
        let mut stats = self
            .store
            .find_stats(id)
            .await?
            .unwrap_or_else(|| TransferStats::new(id));

        match to {
            TransferStatus::Running => {
                stats.retries += 1;
                stats.last_started_at = Some(Utc::now());
            }
            TransferStatus::Canceled => {
                stats.last_finished_at = Some(Utc::now());
                self.stop_workers(id).await;
            }
            _ => return Ok(()),
        }
        self.store.save_stats(&stats).await
    }

    /// Cancel, forget and remove a transfer together with its file
    pub async fn delete(&self, owner: Uuid, id: Uuid) -> Result<()> {
        let transfer = self.transfer(owner, id).await?;

        self.store.update_transfer_status(id, TransferStatus::Canceled).await?;
        self.stop_workers(id).await;

        self.store.delete_segments(id).await?;
        self.store.delete_stats(id).await?;
        self.store.delete_transfer(id).await?;
        self.meter.forget(id);

        if let Some(path) = transfer.destination() {
            remove_with_retry(&path).await;
        }
        info!("Deleted transfer {}", id);
        Ok(())
    }

    /// Cancel the workers of `id` and wait for them to persist their last
    /// progress, so nothing they write lands on a later plan's segments.
    async fn stop_workers(&self, id: Uuid) {
        let handles = self.registry.cancel_all(id);
        if handles.is_empty() {
            return;
        }
        info!("Cancelling {} workers of transfer {}", handles.len(), id);
        for handle in handles {
            if tokio::time::timeout(WORKER_STOP_GRACE, handle.join()).await.is_err() {
                warn!("Worker of transfer {} did not stop in time", id);
            }
        }
    }

    /// Re-arm segments whose worker died with a previous process.
    ///
    /// Running segments go back to Pending everywhere. A Running transfer
    /// also gets its Canceled segments back, which is what an engine
    /// shutdown leaves behind.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for status in [
            TransferStatus::Queued,
            TransferStatus::Running,
            TransferStatus::Paused,
            TransferStatus::Error,
            TransferStatus::Canceled,
        ] {
            for transfer in self.store.transfers_with_status(status).await? {
                for segment in self.store.segments_for(transfer.id).await? {
                    let rearm = match segment.status {
                        SegmentStatus::Running => true,
                        SegmentStatus::Canceled => status == TransferStatus::Running,
                        _ => false,
                    };
                    if rearm
                        && self
                            .store
                            .update_segment(
                                transfer.id,
                                segment.index,
                                segment.received,
                                SegmentStatus::Pending,
                            )
                            .await?
                    {
                        recovered += 1;
                    }
                }
            }
        }
        if recovered > 0 {
            info!("Recovered {} interrupted segments", recovered);
        }
        Ok(recovered)
    }
}

async fn remove_with_retry(path: &Path) {
    for attempt in 1..=REMOVE_ATTEMPTS {
        match tokio::fs::remove_file(path).await {
            Ok(()) => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(
                    "Failed to remove {} (attempt {}/{}): {}",
                    path.display(),
                    attempt,
                    REMOVE_ATTEMPTS,
                    e
                );
                if attempt < REMOVE_ATTEMPTS {
                    tokio::time::sleep(REMOVE_BACKOFF).await;
                }
            }
        }
    }
}
