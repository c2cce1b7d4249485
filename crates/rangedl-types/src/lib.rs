//! Shared types for rangedl
//!
//! This crate contains the records exchanged between the transfer engine,
//! its persistence collaborators and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Transfer Types
// ============================================================================

/// One user-requested file retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    /// Owner of the transfer. `Uuid::nil()` is the local, single-user owner.
    pub owner: Uuid,
    pub url: String,
    /// File name inside `save_dir`. Resolved from the URL when empty.
    pub file_name: String,
    /// Destination directory. Resolved from settings when `None`.
    pub save_dir: Option<PathBuf>,
    /// Total size in bytes, unknown until probed
    pub total_size: Option<u64>,
    /// Sum of `received` over all segments
    pub received: u64,
    /// Whether the source answered the range probe with partial content
    #[serde(default)]
    pub range_supported: bool,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Transfer {
    pub fn new(owner: Uuid, url: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner,
            url,
            file_name: String::new(),
            save_dir: None,
            total_size: None,
            received: 0,
            range_supported: false,
            status: TransferStatus::Queued,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Full destination path, if the save directory is resolved
    pub fn destination(&self) -> Option<PathBuf> {
        self.save_dir.as_ref().map(|dir| dir.join(&self.file_name))
    }

    pub fn progress(&self) -> f64 {
        match self.total_size {
            Some(size) if size > 0 => (self.received as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// Bump `updated_at` to now
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Created, never requested
    Queued,
    /// Requested active; the orchestrator dispatches its segments
    Running,
    Paused,
    Completed,
    Canceled,
    Error,
}

impl TransferStatus {
    /// Completed, canceled and errored transfers leave the engine's purview
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Canceled | TransferStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Queued => "queued",
            TransferStatus::Running => "running",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Canceled => "canceled",
            TransferStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TransferStatus::Queued),
            "running" => Some(TransferStatus::Running),
            "paused" => Some(TransferStatus::Paused),
            "completed" => Some(TransferStatus::Completed),
            "canceled" => Some(TransferStatus::Canceled),
            "error" => Some(TransferStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Segment Types
// ============================================================================

/// One contiguous byte range of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub transfer_id: Uuid,
    pub index: u32,
    pub start: u64,
    /// Inclusive end offset. `None` for an open-ended range of unknown length.
    pub end: Option<u64>,
    pub received: u64,
    pub status: SegmentStatus,
}

impl Segment {
    pub fn new(transfer_id: Uuid, index: u32, start: u64, end: Option<u64>) -> Self {
        Self {
            transfer_id,
            index,
            start,
            end,
            received: 0,
            status: SegmentStatus::Pending,
        }
    }

    /// Length of this segment in bytes, `None` when open-ended
    pub fn len(&self) -> Option<u64> {
        self.end
            .filter(|end| *end >= self.start)
            .map(|end| end - self.start + 1)
    }

    pub fn is_open_ended(&self) -> bool {
        self.end.is_none()
    }

    /// Bytes still to fetch; open-ended segments never run out
    pub fn remaining(&self) -> u64 {
        match self.len() {
            Some(len) => len.saturating_sub(self.received),
            None => u64::MAX,
        }
    }

    pub fn progress(&self) -> f64 {
        match self.len() {
            Some(len) if len > 0 => (self.received as f64 / len as f64) * 100.0,
            _ => 0.0,
        }
    }
}

/// Status of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Pending,
    Running,
    Done,
    Canceled,
    Error,
}

impl SegmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentStatus::Pending => "pending",
            SegmentStatus::Running => "running",
            SegmentStatus::Done => "done",
            SegmentStatus::Canceled => "canceled",
            SegmentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SegmentStatus::Pending),
            "running" => Some(SegmentStatus::Running),
            "done" => Some(SegmentStatus::Done),
            "canceled" => Some(SegmentStatus::Canceled),
            "error" => Some(SegmentStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Per-owner transfer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub owner: Uuid,
    /// Segments planned per transfer, also the per-transfer parallelism cap
    pub default_segments: u32,
    /// Per-transfer speed cap in bytes per second (0 = unlimited)
    pub global_speed_limit_bps: u64,
    /// Directory used when a transfer has no save directory
    pub default_save_dir: Option<PathBuf>,
}

impl Settings {
    pub fn new(owner: Uuid) -> Self {
        Self {
            owner,
            default_segments: 4,
            global_speed_limit_bps: 0,
            default_save_dir: None,
        }
    }
}

// ============================================================================
// Statistics Types
// ============================================================================

/// Long-lived per-transfer statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStats {
    pub transfer_id: Uuid,
    pub avg_speed_bps: f64,
    /// Highest window speed ever observed
    pub max_speed_bps: f64,
    /// Number of times the transfer was (re)started
    pub retries: u32,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

impl TransferStats {
    pub fn new(transfer_id: Uuid) -> Self {
        Self {
            transfer_id,
            avg_speed_bps: 0.0,
            max_speed_bps: 0.0,
            retries: 0,
            last_started_at: None,
            last_finished_at: None,
        }
    }
}

/// Speed derived from the live sample window of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputState {
    pub avg_bytes_per_sec: f64,
    pub peak_bytes_per_sec: f64,
    pub window_millis: u64,
}

impl ThroughputState {
    pub fn idle(window_millis: u64) -> Self {
        Self {
            avg_bytes_per_sec: 0.0,
            peak_bytes_per_sec: 0.0,
            window_millis,
        }
    }
}

// ============================================================================
// Probe Types
// ============================================================================

/// What a range probe learned about a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub range_supported: bool,
    pub total_length: Option<u64>,
}

impl ProbeResult {
    pub fn unknown() -> Self {
        Self {
            range_supported: false,
            total_length: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_len_and_remaining() {
        let mut seg = Segment::new(Uuid::nil(), 0, 100, Some(199));
        assert_eq!(seg.len(), Some(100));
        seg.received = 40;
        assert_eq!(seg.remaining(), 60);

        let open = Segment::new(Uuid::nil(), 0, 0, None);
        assert!(open.is_open_ended());
        assert_eq!(open.len(), None);
        assert_eq!(open.remaining(), u64::MAX);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            TransferStatus::Queued,
            TransferStatus::Running,
            TransferStatus::Paused,
            TransferStatus::Completed,
            TransferStatus::Canceled,
            TransferStatus::Error,
        ] {
            assert_eq!(TransferStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SegmentStatus::parse("done"), Some(SegmentStatus::Done));
        assert_eq!(SegmentStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Error.is_terminal());
        assert!(!TransferStatus::Paused.is_terminal());
        assert!(!TransferStatus::Running.is_terminal());
    }
}
