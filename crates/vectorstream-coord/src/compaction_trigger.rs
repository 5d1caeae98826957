//! Compaction Trigger
//!
//! Decides *what* to compact; the handler decides how it runs. Three
//! entry points:
//!
//! - `manual_compaction`: merge every eligible flushed segment of a
//!   collection, grouped per `(partition, channel)`.
//! - `trigger_single`: after a segment flushes, rewrite it alone when its
//!   delete-log ratio crossed the threshold.
//! - `periodic_check`: merge small flushed segments that share a
//!   `(collection, partition, channel)` group.
//!
//! Every plan carries a timetravel bound: segments with writes newer
//! than the bound are excluded so MVCC visibility at that timestamp is
//! preserved.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use vectorstream_core::{
    ts_physical_ms, ts_sub_ms, Allocator, CollectionId, PartitionId, PlanId, Timestamp,
};
use vectorstream_meta::{SegmentInfo, SegmentMeta, SegmentState};
use vectorstream_rpc::{CompactionPlan, CompactionPlanType};

use crate::compaction::CompactionHandler;
use crate::config::CompactionConfig;
use crate::error::{CoordError, Result};

pub struct CompactionTrigger {
    meta: Arc<SegmentMeta>,
    allocator: Arc<dyn Allocator>,
    handler: Arc<CompactionHandler>,
    config: CompactionConfig,
}

impl CompactionTrigger {
    pub fn new(
        meta: Arc<SegmentMeta>,
        allocator: Arc<dyn Allocator>,
        handler: Arc<CompactionHandler>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            meta,
            allocator,
            handler,
            config,
        }
    }

    fn eligible(seg: &SegmentInfo, timetravel: Timestamp) -> bool {
        if seg.state != SegmentState::Flushed {
            return false;
        }
        // Segments with writes newer than the bound stay out of the plan.
        match &seg.dml_position {
            Some(p) => p.timestamp <= timetravel,
            None => true,
        }
    }

    /// Force-merge a collection; returns the trigger signal ID used to
    /// poll aggregate state.
    pub async fn manual_compaction(
        &self,
        collection_id: CollectionId,
        timetravel: Timestamp,
    ) -> Result<PlanId> {
        let signal_id = self.allocator.alloc_id().await?;

        let mut groups: HashMap<(PartitionId, String), Vec<SegmentInfo>> = HashMap::new();
        for seg in self.meta.list_segments().await {
            if seg.collection_id == collection_id && Self::eligible(&seg, timetravel) {
                groups
                    .entry((seg.partition_id, seg.insert_channel.clone()))
                    .or_default()
                    .push(seg);
            }
        }

        let mut plans = 0usize;
        for ((partition_id, channel), mut segments) in groups {
            if segments.len() < self.config.min_merge_segments {
                continue;
            }
            segments.sort_by_key(|s| s.num_rows);
            for chunk in segments.chunks(self.config.max_merge_segments) {
                if chunk.len() < self.config.min_merge_segments {
                    continue;
                }
                let plan = CompactionPlan {
                    plan_id: self.allocator.alloc_id().await?,
                    plan_type: CompactionPlanType::Merge,
                    collection_id,
                    partition_id,
                    channel: channel.clone(),
                    segment_ids: chunk.iter().map(|s| s.id).collect(),
                    timetravel,
                };
                match self.handler.execute_plan(signal_id, plan).await {
                    Ok(()) => plans += 1,
                    Err(CoordError::ConflictingCompaction { plan_id, segment_id }) => {
                        debug!(plan_id, segment_id, "skipping conflicting merge");
                    }
                    Err(e) => warn!(error = %e, "failed to dispatch merge plan"),
                }
            }
        }
        info!(collection_id, signal_id, plans, "manual compaction triggered");
        Ok(signal_id)
    }

    /// Post-flush check of one segment's delete-log ratio. The threshold
    /// is inclusive: a segment whose ratio lands exactly on
    /// `delete_ratio` is compacted.
    pub async fn trigger_single(&self, segment: &SegmentInfo) -> Result<()> {
        if segment.num_rows == 0 {
            return Ok(());
        }
        let deleted: u64 = segment.deltalogs.iter().map(|d| d.record_entries).sum();
        let ratio = deleted as f64 / segment.num_rows as f64;
        if ratio < self.config.delete_ratio {
            return Ok(());
        }
        if self.handler.in_flight_on(&[segment.id]).await {
            return Ok(());
        }

        let now = self.allocator.alloc_timestamp().await?;
        let timetravel = ts_sub_ms(now, self.config.retention.as_millis() as i64);
        let signal_id = self.allocator.alloc_id().await?;
        let plan = CompactionPlan {
            plan_id: self.allocator.alloc_id().await?,
            plan_type: CompactionPlanType::SingleMerge,
            collection_id: segment.collection_id,
            partition_id: segment.partition_id,
            channel: segment.insert_channel.clone(),
            segment_ids: vec![segment.id],
            timetravel,
        };
        info!(
            segment_id = segment.id,
            delete_ratio = ratio,
            "single-segment compaction triggered"
        );
        self.handler.execute_plan(signal_id, plan).await
    }

    /// Periodic merge of small flushed segments.
    pub async fn periodic_check(&self) -> Result<()> {
        let now = self.allocator.alloc_timestamp().await?;
        let timetravel = ts_sub_ms(now, self.config.retention.as_millis() as i64);

        let mut groups: HashMap<(CollectionId, PartitionId, String), Vec<SegmentInfo>> =
            HashMap::new();
        for seg in self.meta.list_segments().await {
            if !Self::eligible(&seg, timetravel) {
                continue;
            }
            let small = seg.max_rows > 0
                && (seg.num_rows as f64) < self.config.small_segment_ratio * seg.max_rows as f64;
            if !small {
                continue;
            }
            groups
                .entry((seg.collection_id, seg.partition_id, seg.insert_channel.clone()))
                .or_default()
                .push(seg);
        }

        for ((collection_id, partition_id, channel), mut segments) in groups {
            if segments.len() < self.config.min_merge_segments {
                continue;
            }
            segments.sort_by_key(|s| s.num_rows);
            let chunk: Vec<_> = segments
                .into_iter()
                .take(self.config.max_merge_segments)
                .collect();
            let segment_ids: Vec<_> = chunk.iter().map(|s| s.id).collect();
            if self.handler.in_flight_on(&segment_ids).await {
                continue;
            }
            let signal_id = self.allocator.alloc_id().await?;
            let plan = CompactionPlan {
                plan_id: self.allocator.alloc_id().await?,
                plan_type: CompactionPlanType::Merge,
                collection_id,
                partition_id,
                channel,
                segment_ids,
                timetravel,
            };
            debug!(
                signal_id,
                cutoff_ms = ts_physical_ms(timetravel),
                "periodic merge plan"
            );
            if let Err(e) = self.handler.execute_plan(signal_id, plan).await {
                warn!(error = %e, "periodic merge dispatch failed");
            }
        }
        Ok(())
    }
}
