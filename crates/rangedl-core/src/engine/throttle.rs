//! Per-segment speed throttle
//!
//! The transfer-level cap is split evenly between its segments. Each segment
//! keeps a one-second accounting window: once it has consumed more than its
//! share for the elapsed part of the window it sleeps off the excess. The cap
//! is exact on window boundaries and bursty but bounded within a window.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Windowed byte budget for one segment worker
#[derive(Debug, Clone)]
pub struct SegmentThrottle {
    per_segment_bps: u64,
    window_start: Instant,
    bytes_in_window: u64,
}

impl SegmentThrottle {
    /// `None` when `cap_bps` is 0 (unlimited)
    pub fn new(cap_bps: u64, segments: u32) -> Option<Self> {
        if cap_bps == 0 {
            return None;
        }
        let per_segment_bps = (cap_bps / u64::from(segments.max(1))).max(1);
        Some(Self {
            per_segment_bps,
            window_start: Instant::now(),
            bytes_in_window: 0,
        })
    }

    pub fn per_segment_bps(&self) -> u64 {
        self.per_segment_bps
    }

    /// Restart accounting, e.g. when the stream begins
    pub fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.bytes_in_window = 0;
    }

    /// Account for `bytes` just read at `now`; returns how long to sleep.
    pub fn on_chunk(&mut self, bytes: u64, now: Instant) -> Option<Duration> {
        self.bytes_in_window += bytes;
        let elapsed_ms = now.saturating_duration_since(self.window_start).as_millis() as u64;

        let allowed = self.per_segment_bps.saturating_mul(elapsed_ms) / 1000;
        let delay = (self.bytes_in_window > allowed)
            .then(|| (self.bytes_in_window - allowed).saturating_mul(1000) / self.per_segment_bps)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        if elapsed_ms >= 1000 {
            self.reset(now);
        }

        delay
    }

    /// Account for `bytes` and sleep if over budget.
    ///
    /// Returns `false` if `cancel` fired during the sleep.
    pub async fn pace(&mut self, bytes: u64, cancel: &CancellationToken) -> bool {
        let Some(delay) = self.on_chunk(bytes, Instant::now()) else {
            return true;
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
