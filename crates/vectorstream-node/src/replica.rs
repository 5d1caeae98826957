//! DN Segment Replica
//!
//! In-memory, per-channel view of the segments a data node mutates: row
//! counts, checkpoints, primary-key statistics and membership filters.
//! Memory is the only store; durability is the flush pipeline's job.
//! The coordinator never reads this directly; its contents surface only
//! through flush reports.
//!
//! Two sets are kept: *normal* segments still receiving rows, and
//! *flushed* segments the node must still route deletes to. A per-segment
//! bloom filter over inserted primary keys buckets delete traffic.

use bloomfilter::Bloom;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

use vectorstream_core::codec::PkStatistics;
use vectorstream_core::{CollectionId, PartitionId, Position, SegmentId};
use vectorstream_meta::SegmentStartPosition;

use crate::error::{NodeError, Result};

const PK_FILTER_ITEMS: usize = 1 << 17;
const PK_FILTER_FP_RATE: f64 = 0.005;

/// How far one segment has consumed the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCheckpoint {
    pub num_rows: i64,
    pub position: Position,
}

struct ReplicaSegment {
    collection_id: CollectionId,
    partition_id: PartitionId,
    channel: String,
    num_rows: i64,
    checkpoint: Option<SegmentCheckpoint>,
    /// Set once when the node opens the segment; drained into the next
    /// flush report.
    new_start_position: Option<Position>,
    stats: PkStatistics,
    pk_filter: Bloom<i64>,
    is_flushing: bool,
}

impl ReplicaSegment {
    fn new(
        collection_id: CollectionId,
        partition_id: PartitionId,
        channel: String,
        num_rows: i64,
    ) -> Self {
        Self {
            collection_id,
            partition_id,
            channel,
            num_rows,
            checkpoint: None,
            new_start_position: None,
            stats: PkStatistics::default(),
            pk_filter: Bloom::new_for_fp_rate(PK_FILTER_ITEMS, PK_FILTER_FP_RATE),
            is_flushing: false,
        }
    }
}

pub struct SegmentReplica {
    collection_id: CollectionId,
    inner: RwLock<ReplicaInner>,
}

#[derive(Default)]
struct ReplicaInner {
    normal: HashMap<SegmentId, ReplicaSegment>,
    flushed: HashMap<SegmentId, ReplicaSegment>,
}

impl SegmentReplica {
    pub fn new(collection_id: CollectionId) -> Self {
        Self {
            collection_id,
            inner: RwLock::new(ReplicaInner::default()),
        }
    }

    pub fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    /// Open a brand-new segment on first insert. Its start position is
    /// reported to the coordinator with the next flush pack.
    pub fn add_new_segment(
        &self,
        segment_id: SegmentId,
        collection_id: CollectionId,
        partition_id: PartitionId,
        channel: &str,
        start_position: Position,
    ) {
        let mut inner = self.inner.write().unwrap();
        let mut seg = ReplicaSegment::new(collection_id, partition_id, channel.to_string(), 0);
        seg.new_start_position = Some(start_position);
        debug!(segment_id, channel, "new segment opened in replica");
        inner.normal.insert(segment_id, seg);
    }

    /// Re-add an unflushed segment during recovery.
    pub fn add_normal_segment(
        &self,
        segment_id: SegmentId,
        collection_id: CollectionId,
        partition_id: PartitionId,
        channel: &str,
        num_rows: i64,
        checkpoint: Option<SegmentCheckpoint>,
    ) {
        let mut inner = self.inner.write().unwrap();
        let mut seg =
            ReplicaSegment::new(collection_id, partition_id, channel.to_string(), num_rows);
        seg.checkpoint = checkpoint;
        inner.normal.insert(segment_id, seg);
    }

    /// Track a flushed segment (recovery); deletes still route to it.
    pub fn add_flushed_segment(
        &self,
        segment_id: SegmentId,
        collection_id: CollectionId,
        partition_id: PartitionId,
        channel: &str,
        num_rows: i64,
        pk_range: Option<(i64, i64)>,
    ) {
        let mut inner = self.inner.write().unwrap();
        let mut seg =
            ReplicaSegment::new(collection_id, partition_id, channel.to_string(), num_rows);
        if let Some((min, max)) = pk_range {
            seg.stats = PkStatistics {
                row_count: num_rows,
                pk_min: min,
                pk_max: max,
            };
        }
        inner.flushed.insert(segment_id, seg);
    }

    pub fn has_segment(&self, segment_id: SegmentId, include_flushed: bool) -> bool {
        let inner = self.inner.read().unwrap();
        inner.normal.contains_key(&segment_id)
            || (include_flushed && inner.flushed.contains_key(&segment_id))
    }

    pub fn normal_segments(&self) -> Vec<SegmentId> {
        let mut ids: Vec<_> = self.inner.read().unwrap().normal.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Fold freshly inserted rows into counters and the pk filter.
    pub fn update_statistics(&self, segment_id: SegmentId, pks: &[i64]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let seg = inner
            .normal
            .get_mut(&segment_id)
            .ok_or(NodeError::SegmentNotFound(segment_id))?;
        seg.num_rows += pks.len() as i64;
        for pk in pks {
            seg.stats.observe(*pk);
            seg.pk_filter.set(pk);
        }
        Ok(())
    }

    /// Record how far the segment has consumed the channel.
    pub fn update_checkpoint(&self, segment_id: SegmentId, position: Position) {
        let mut inner = self.inner.write().unwrap();
        if let Some(seg) = inner.normal.get_mut(&segment_id) {
            let stale = seg
                .checkpoint
                .as_ref()
                .is_some_and(|cp| position.msg_id <= cp.position.msg_id);
            if !stale {
                seg.checkpoint = Some(SegmentCheckpoint {
                    num_rows: seg.num_rows,
                    position,
                });
            }
        }
    }

    pub fn checkpoint(&self, segment_id: SegmentId) -> Option<SegmentCheckpoint> {
        self.inner
            .read()
            .unwrap()
            .normal
            .get(&segment_id)
            .and_then(|s| s.checkpoint.clone())
    }

    /// `(num_rows, checkpoint)` snapshot used to build flush reports.
    pub fn statistics(&self, segment_id: SegmentId) -> Option<(i64, Option<SegmentCheckpoint>)> {
        let inner = self.inner.read().unwrap();
        inner
            .normal
            .get(&segment_id)
            .or_else(|| inner.flushed.get(&segment_id))
            .map(|s| (s.num_rows, s.checkpoint.clone()))
    }

    pub fn collection_and_partition(
        &self,
        segment_id: SegmentId,
    ) -> Result<(CollectionId, PartitionId)> {
        let inner = self.inner.read().unwrap();
        inner
            .normal
            .get(&segment_id)
            .or_else(|| inner.flushed.get(&segment_id))
            .map(|s| (s.collection_id, s.partition_id))
            .ok_or(NodeError::SegmentNotFound(segment_id))
    }

    /// Drain-and-return the start positions of segments opened since the
    /// last flush report.
    pub fn list_new_segments_start_positions(&self) -> Vec<SegmentStartPosition> {
        let mut inner = self.inner.write().unwrap();
        let mut out = Vec::new();
        for (id, seg) in inner.normal.iter_mut() {
            if let Some(position) = seg.new_start_position.take() {
                out.push(SegmentStartPosition {
                    segment_id: *id,
                    position,
                });
            }
        }
        out
    }

    /// Segments a delete for `pk` may touch. Normal segments answer via
    /// their pk filter; flushed segments via their recovered pk range.
    pub fn segments_for_pk(&self, pk: i64) -> Vec<SegmentId> {
        let inner = self.inner.read().unwrap();
        let mut out = Vec::new();
        for (id, seg) in &inner.normal {
            if seg.num_rows > 0 && seg.pk_filter.check(&pk) {
                out.push(*id);
            }
        }
        for (id, seg) in &inner.flushed {
            if seg.stats.row_count > 0 && pk >= seg.stats.pk_min && pk <= seg.stats.pk_max {
                out.push(*id);
            }
        }
        out.sort_unstable();
        out
    }

    pub fn flushed_segments(&self) -> Vec<SegmentId> {
        let mut ids: Vec<_> = self.inner.read().unwrap().flushed.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn set_flushing(&self, segment_id: SegmentId, flushing: bool) {
        if let Some(seg) = self.inner.write().unwrap().normal.get_mut(&segment_id) {
            seg.is_flushing = flushing;
        }
    }

    pub fn is_flushing(&self, segment_id: SegmentId) -> bool {
        self.inner
            .read()
            .unwrap()
            .normal
            .get(&segment_id)
            .is_some_and(|s| s.is_flushing)
    }

    /// Move a segment from the normal set into the flushed set once its
    /// final pack is acknowledged.
    pub fn segment_flushed(&self, segment_id: SegmentId) {
        let mut inner = self.inner.write().unwrap();
        match inner.normal.remove(&segment_id) {
            Some(seg) => {
                inner.flushed.insert(segment_id, seg);
            }
            None => warn!(segment_id, "segment_flushed for unknown segment"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(msg_id: u64) -> Position {
        Position::new("ch-0", msg_id, msg_id * 10)
    }

    #[test]
    fn test_new_segment_start_positions_drain_once() {
        let replica = SegmentReplica::new(1);
        replica.add_new_segment(10, 1, 2, "ch-0", pos(3));
        replica.add_new_segment(11, 1, 2, "ch-0", pos(4));

        let mut drained = replica.list_new_segments_start_positions();
        drained.sort_by_key(|p| p.segment_id);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].segment_id, 10);
        assert!(replica.list_new_segments_start_positions().is_empty());
    }

    #[test]
    fn test_statistics_and_checkpoint_progress() {
        let replica = SegmentReplica::new(1);
        replica.add_new_segment(10, 1, 2, "ch-0", pos(1));
        replica.update_statistics(10, &[5, 9, 7]).unwrap();
        replica.update_checkpoint(10, pos(2));
        // Stale checkpoints are ignored.
        replica.update_checkpoint(10, pos(1));

        let (rows, cp) = replica.statistics(10).unwrap();
        assert_eq!(rows, 3);
        assert_eq!(cp.unwrap().position.msg_id, 2);
    }

    #[test]
    fn test_pk_routing_covers_normal_and_flushed() {
        let replica = SegmentReplica::new(1);
        replica.add_new_segment(10, 1, 2, "ch-0", pos(1));
        replica.update_statistics(10, &[100, 101]).unwrap();
        replica.add_flushed_segment(20, 1, 2, "ch-0", 50, Some((0, 49)));

        assert_eq!(replica.segments_for_pk(100), vec![10]);
        assert_eq!(replica.segments_for_pk(25), vec![20]);
        assert!(replica.segments_for_pk(5000).is_empty());
    }

    #[test]
    fn test_segment_flushed_moves_between_sets() {
        let replica = SegmentReplica::new(1);
        replica.add_new_segment(10, 1, 2, "ch-0", pos(1));
        assert!(replica.has_segment(10, false));
        replica.segment_flushed(10);
        assert!(!replica.has_segment(10, false));
        assert!(replica.has_segment(10, true));
        assert_eq!(replica.flushed_segments(), vec![10]);
    }
}
