//! Segment planning

use crate::error::Result;
use crate::store::TransferStore;
use rangedl_types::Segment;
use tracing::info;
use uuid::Uuid;

/// Split `total` bytes into contiguous inclusive ranges.
///
/// Without range support, or with an unknown/zero length, the plan is a
/// single range starting at 0; its end is `None` when the length is unknown
/// or zero. Otherwise `desired` is clamped to `1..=total` and the last range
/// absorbs the remainder.
pub fn plan(total: Option<u64>, desired: u32, range_supported: bool) -> Vec<(u64, Option<u64>)> {
    let total = match total {
        Some(total) if range_supported && total > 0 => total,
        other => return vec![(0, other.and_then(|t| t.checked_sub(1)))],
    };

    let count = u64::from(desired.max(1)).min(total);
    let part = total / count;

    let mut ranges = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for i in 0..count {
        let end = if i == count - 1 {
            total - 1
        } else {
            start + part - 1
        };
        ranges.push((start, Some(end)));
        start = end + 1;
    }
    ranges
}

/// Plan and persist segments for a transfer that has none yet.
///
/// Returns the transfer's segments; existing segments are returned untouched.
pub async fn ensure_planned(
    store: &dyn TransferStore,
    transfer_id: Uuid,
    total: Option<u64>,
    desired: u32,
    range_supported: bool,
) -> Result<Vec<Segment>> {
    let existing = store.segments_for(transfer_id).await?;
    if !existing.is_empty() {
        return Ok(existing);
    }

    for (index, (start, end)) in plan(total, desired, range_supported).into_iter().enumerate() {
        let segment = Segment::new(transfer_id, index as u32, start, end);
        info!(
            "Segment created transfer={} idx={} [{}, {:?}]",
            transfer_id, index, start, end
        );
        store.save_segment(&segment).await?;
    }

    store.segments_for(transfer_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rangedl_types::SegmentStatus;

    fn assert_partition(ranges: &[(u64, Option<u64>)], total: u64) {
        let mut next = 0u64;
        for (start, end) in ranges {
            let end = end.expect("planned range has an end");
            assert_eq!(*start, next, "gap or overlap at {}", start);
            assert!(end >= *start, "empty range at {}", start);
            next = end + 1;
        }
        assert_eq!(next, total);
    }

    #[test]
    fn partitions_for_many_shapes() {
        for total in [1u64, 2, 3, 7, 100, 1023, 10_000, 1 << 20] {
            for count in 1u32..=9 {
                let ranges = plan(Some(total), count, true);
                assert_eq!(ranges.len() as u64, u64::from(count).min(total));
                assert_partition(&ranges, total);
            }
        }
    }

    #[test]
    fn ten_thousand_bytes_in_four() {
        assert_eq!(
            plan(Some(10_000), 4, true),
            vec![
                (0, Some(2499)),
                (2500, Some(4999)),
                (5000, Some(7499)),
                (7500, Some(9999)),
            ]
        );
    }

    #[test]
    fn last_range_absorbs_remainder() {
        assert_eq!(
            plan(Some(10), 3, true),
            vec![(0, Some(2)), (3, Some(5)), (6, Some(9))]
        );
    }

    #[test]
    fn zero_count_means_one() {
        assert_eq!(plan(Some(50), 0, true), vec![(0, Some(49))]);
    }

    #[test]
    fn without_range_support_single_segment() {
        for count in [1u32, 4, 16] {
            assert_eq!(plan(Some(10_000), count, false), vec![(0, Some(9999))]);
        }
        assert_eq!(plan(None, 8, false), vec![(0, None)]);
        assert_eq!(plan(None, 8, true), vec![(0, None)]);
        assert_eq!(plan(Some(0), 8, true), vec![(0, None)]);
    }

    #[tokio::test]
    async fn planning_is_idempotent() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        let first = ensure_planned(&store, id, Some(1000), 4, true).await.unwrap();
        assert_eq!(first.len(), 4);

        store
            .update_segment(id, 2, 100, SegmentStatus::Running)
            .await
            .unwrap();

        let second = ensure_planned(&store, id, Some(5000), 8, true).await.unwrap();
        assert_eq!(second.len(), 4);
        assert_eq!(second[2].received, 100);
        assert_eq!(second[3].end, Some(999));
    }
}
