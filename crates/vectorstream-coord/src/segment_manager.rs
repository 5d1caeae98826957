//! Segment Allocator and Seal Policy
//!
//! The write path asks for row capacity (`AssignSegmentID`); this module
//! answers with short-lived reservations on growing segments, creating a
//! new segment when the current one cannot hold the request. A background
//! scan seals growing segments once any policy threshold trips:
//!
//! - reserved-or-written rows reached `seal_rows`
//! - estimated size reached `seal_bytes`
//! - the segment has rows but sat idle for `idle_seal`
//! - an explicit `Flush` sealed the whole collection
//!
//! Sealing is one meta state transition; from then on every allocation
//! lands on a fresh segment. Reservations expire on their own; expiry GC
//! runs with the seal scan.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vectorstream_core::{
    ts_add_ms, ts_physical_ms, Allocator, CollectionId, PartitionId, SegmentId, Timestamp,
};
use vectorstream_meta::{SegmentInfo, SegmentMeta, SegmentState};

use crate::config::CoordConfig;
use crate::error::{CoordError, Result};
use crate::metrics;

/// One row-capacity reservation handed to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub segment_id: SegmentId,
    pub num_of_rows: i64,
    pub expire_time: Timestamp,
}

#[derive(Default)]
struct Inner {
    /// Growing segments this coordinator manages allocations for.
    growing: HashSet<SegmentId>,
    /// Live reservations per segment.
    allocations: HashMap<SegmentId, Vec<Allocation>>,
}

pub struct SegmentManager {
    meta: Arc<SegmentMeta>,
    allocator: Arc<dyn Allocator>,
    config: CoordConfig,
    inner: Mutex<Inner>,
}

impl SegmentManager {
    /// Rebuilds the growing set from meta, so a restarted coordinator
    /// keeps allocating into pre-existing growing segments.
    pub async fn open(
        meta: Arc<SegmentMeta>,
        allocator: Arc<dyn Allocator>,
        config: CoordConfig,
    ) -> Self {
        let mut inner = Inner::default();
        for seg in meta.list_segments().await {
            if seg.state == SegmentState::Growing {
                inner.growing.insert(seg.id);
            }
        }
        info!(growing = inner.growing.len(), "segment manager recovered");
        Self {
            meta,
            allocator,
            config,
            inner: Mutex::new(inner),
        }
    }

    fn allocated_rows(inner: &Inner, id: SegmentId) -> i64 {
        inner
            .allocations
            .get(&id)
            .map(|a| a.iter().map(|x| x.num_of_rows).sum())
            .unwrap_or(0)
    }

    /// Reserve `count` rows on a growing segment of the triple, creating
    /// one if none has room.
    pub async fn alloc_segment(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
        channel: &str,
        count: i64,
        max_rows: i64,
    ) -> Result<Vec<Allocation>> {
        let mut inner = self.inner.lock().await;

        let mut stale = Vec::new();
        let mut target: Option<SegmentId> = None;
        let mut candidates: Vec<SegmentId> = inner.growing.iter().copied().collect();
        candidates.sort_unstable();
        for id in candidates {
            let Some(seg) = self.meta.get_segment(id).await else {
                stale.push(id);
                continue;
            };
            if seg.state != SegmentState::Growing {
                stale.push(id);
                continue;
            }
            if seg.collection_id != collection_id
                || seg.partition_id != partition_id
                || seg.insert_channel != channel
            {
                continue;
            }
            let used = seg.num_rows.max(Self::allocated_rows(&inner, id));
            if used + count <= seg.max_rows {
                target = Some(id);
                break;
            }
        }
        for id in stale {
            inner.growing.remove(&id);
            inner.allocations.remove(&id);
        }

        let segment_id = match target {
            Some(id) => id,
            None => {
                let id = self.allocator.alloc_id().await?;
                let mut info = SegmentInfo::new(id, collection_id, partition_id, channel, max_rows);
                info.start_position = self.meta.channel_checkpoint(channel).await;
                self.meta.add_segment(info).await?;
                inner.growing.insert(id);
                debug!(
                    segment_id = id,
                    collection_id,
                    partition_id,
                    channel,
                    "growing segment created"
                );
                id
            }
        };

        let now = self.allocator.alloc_timestamp().await?;
        let expire_time = ts_add_ms(now, self.config.allocation_ttl.as_millis() as i64);
        let allocation = Allocation {
            segment_id,
            num_of_rows: count,
            expire_time,
        };
        inner
            .allocations
            .entry(segment_id)
            .or_default()
            .push(allocation.clone());
        self.meta.set_last_expire_time(segment_id, expire_time).await?;

        Ok(vec![allocation])
    }

    /// Forget a segment: no more allocations, no more policy checks.
    /// Called when its flush or drop report lands.
    pub async fn drop_segment(&self, id: SegmentId) {
        let mut inner = self.inner.lock().await;
        inner.growing.remove(&id);
        inner.allocations.remove(&id);
    }

    pub async fn drop_segments_of_channel(&self, channel: &str) {
        let mut inner = self.inner.lock().await;
        let mut doomed = Vec::new();
        for &id in &inner.growing {
            if let Some(seg) = self.meta.get_segment(id).await {
                if seg.insert_channel == channel {
                    doomed.push(id);
                }
            }
        }
        for id in doomed {
            inner.growing.remove(&id);
            inner.allocations.remove(&id);
        }
    }

    /// Seal every growing segment of the collection; returns their IDs.
    pub async fn seal_all_segments(&self, collection_id: CollectionId) -> Result<Vec<SegmentId>> {
        let mut inner = self.inner.lock().await;
        let mut sealed = Vec::new();
        for seg in self.meta.list_segments().await {
            if seg.collection_id != collection_id || seg.state != SegmentState::Growing {
                continue;
            }
            self.meta.set_state(seg.id, SegmentState::Sealed).await?;
            inner.growing.remove(&seg.id);
            inner.allocations.remove(&seg.id);
            metrics::SEGMENTS_SEALED_TOTAL
                .with_label_values(&["flush"])
                .inc();
            sealed.push(seg.id);
        }
        sealed.sort_unstable();
        info!(collection_id, segments = ?sealed, "sealed all growing segments");
        Ok(sealed)
    }

    /// One policy scan: GC expired reservations, then seal what trips a
    /// threshold. Returns the sealed IDs so the caller can notify owners.
    pub async fn try_seal_by_policy(&self) -> Result<Vec<SegmentId>> {
        let now = self.allocator.alloc_timestamp().await?;
        let now_ms = ts_physical_ms(now);
        let mut inner = self.inner.lock().await;

        for allocs in inner.allocations.values_mut() {
            allocs.retain(|a| a.expire_time > now);
        }

        let mut sealed = Vec::new();
        let ids: Vec<SegmentId> = inner.growing.iter().copied().collect();
        for id in ids {
            let Some(seg) = self.meta.get_segment(id).await else {
                inner.growing.remove(&id);
                continue;
            };
            if seg.state != SegmentState::Growing {
                inner.growing.remove(&id);
                inner.allocations.remove(&id);
                continue;
            }
            let estimated_rows = seg.num_rows.max(Self::allocated_rows(&inner, id));
            let estimated_bytes = estimated_rows as u64 * self.config.estimated_row_bytes;

            let cause = if estimated_rows >= self.config.seal_rows {
                Some("rows")
            } else if estimated_bytes >= self.config.seal_bytes {
                Some("size")
            } else if seg.num_rows > 0 && self.idle_for_ms(&seg, now_ms) >= self.config.idle_seal.as_millis() as i64 {
                Some("idle")
            } else {
                None
            };

            if let Some(cause) = cause {
                match self.meta.set_state(id, SegmentState::Sealed).await {
                    Ok(()) => {
                        inner.growing.remove(&id);
                        inner.allocations.remove(&id);
                        metrics::SEGMENTS_SEALED_TOTAL.with_label_values(&[cause]).inc();
                        info!(segment_id = id, cause, rows = estimated_rows, "segment sealed");
                        sealed.push(id);
                    }
                    Err(e) => warn!(segment_id = id, error = %e, "seal failed"),
                }
            }
        }
        Ok(sealed)
    }

    fn idle_for_ms(&self, seg: &SegmentInfo, now_ms: i64) -> i64 {
        // Last activity: the newest allocation (expiry minus TTL) or the
        // newest applied write, whichever is later.
        let ttl_ms = self.config.allocation_ttl.as_millis() as i64;
        let alloc_ms = if seg.last_expire_time > 0 {
            ts_physical_ms(seg.last_expire_time) - ttl_ms
        } else {
            0
        };
        let dml_ms = seg
            .dml_position
            .as_ref()
            .map(|p| ts_physical_ms(p.timestamp))
            .unwrap_or(0);
        now_ms - alloc_ms.max(dml_ms)
    }
}
