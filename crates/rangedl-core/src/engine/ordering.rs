//! Segment selection ordering
//!
//! Pure transformations over a snapshot of segment records.

use rangedl_types::{Segment, SegmentStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Order in which pending segments are handed to workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentOrder {
    #[default]
    ByIndex,
    /// Earliest unstarted region first: start offset, then received bytes
    ByLeftmostGap,
    /// Nearly-finished segments first: remaining bytes, then index
    BySmallestRemaining,
}

impl SegmentOrder {
    pub fn compare(self, a: &Segment, b: &Segment) -> Ordering {
        match self {
            SegmentOrder::ByIndex => a.index.cmp(&b.index),
            SegmentOrder::ByLeftmostGap => a
                .start
                .cmp(&b.start)
                .then_with(|| a.received.cmp(&b.received)),
            SegmentOrder::BySmallestRemaining => a
                .remaining()
                .cmp(&b.remaining())
                .then_with(|| a.index.cmp(&b.index)),
        }
    }
}

/// Sorted copy of `segments`, optionally restricted to pending ones
pub fn ordered(segments: &[Segment], order: SegmentOrder, only_pending: bool) -> Vec<Segment> {
    let mut prepared: Vec<Segment> = segments
        .iter()
        .filter(|s| !only_pending || s.status == SegmentStatus::Pending)
        .cloned()
        .collect();
    prepared.sort_by(|a, b| order.compare(a, b));
    prepared
}

/// Up to `limit` (at least one) pending segments in `order`
pub fn pick(segments: &[Segment], order: SegmentOrder, limit: usize) -> Vec<Segment> {
    let mut picked = ordered(segments, order, true);
    picked.truncate(limit.max(1));
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn seg(index: u32, start: u64, end: Option<u64>, received: u64, status: SegmentStatus) -> Segment {
        Segment {
            transfer_id: Uuid::nil(),
            index,
            start,
            end,
            received,
            status,
        }
    }

    fn indices(segments: &[Segment]) -> Vec<u32> {
        segments.iter().map(|s| s.index).collect()
    }

    #[test]
    fn by_index() {
        let segments = vec![
            seg(2, 200, Some(299), 0, SegmentStatus::Pending),
            seg(0, 0, Some(99), 0, SegmentStatus::Pending),
            seg(1, 100, Some(199), 0, SegmentStatus::Done),
        ];
        assert_eq!(indices(&ordered(&segments, SegmentOrder::ByIndex, false)), vec![0, 1, 2]);
        assert_eq!(indices(&ordered(&segments, SegmentOrder::ByIndex, true)), vec![0, 2]);
    }

    #[test]
    fn leftmost_gap_breaks_ties_on_received() {
        let segments = vec![
            seg(3, 300, Some(399), 0, SegmentStatus::Pending),
            seg(1, 100, Some(199), 50, SegmentStatus::Pending),
            seg(7, 100, Some(199), 10, SegmentStatus::Pending),
        ];
        assert_eq!(
            indices(&ordered(&segments, SegmentOrder::ByLeftmostGap, true)),
            vec![7, 1, 3]
        );
    }

    #[test]
    fn smallest_remaining_first() {
        let segments = vec![
            seg(0, 0, Some(99), 10, SegmentStatus::Pending),   // 90 left
            seg(1, 100, Some(199), 95, SegmentStatus::Pending), // 5 left
            seg(2, 200, None, 0, SegmentStatus::Pending),       // unbounded
            seg(3, 300, Some(304), 0, SegmentStatus::Pending),  // 5 left
        ];
        assert_eq!(
            indices(&ordered(&segments, SegmentOrder::BySmallestRemaining, true)),
            vec![1, 3, 0, 2]
        );
    }

    #[test]
    fn pick_respects_limit_and_status() {
        let segments = vec![
            seg(0, 0, Some(9), 0, SegmentStatus::Running),
            seg(1, 10, Some(19), 0, SegmentStatus::Pending),
            seg(2, 20, Some(29), 0, SegmentStatus::Pending),
            seg(3, 30, Some(39), 0, SegmentStatus::Error),
        ];
        assert_eq!(indices(&pick(&segments, SegmentOrder::ByLeftmostGap, 1)), vec![1]);
        assert_eq!(indices(&pick(&segments, SegmentOrder::ByLeftmostGap, 8)), vec![1, 2]);
        assert_eq!(indices(&pick(&segments, SegmentOrder::ByLeftmostGap, 0)), vec![1]);
    }

    #[test]
    fn ordering_does_not_mutate_input() {
        let segments = vec![
            seg(1, 10, Some(19), 0, SegmentStatus::Pending),
            seg(0, 0, Some(9), 0, SegmentStatus::Pending),
        ];
        let before = segments.clone();
        let _ = ordered(&segments, SegmentOrder::ByIndex, true);
        assert_eq!(segments, before);
    }
}
