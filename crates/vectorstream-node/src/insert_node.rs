//! Insert buffer node.
//!
//! Buffers rows per segment, opens unknown segments in the replica, and
//! decides what flushes at each batch boundary:
//!
//! - segments named on the seal-notification channel flush with
//!   `flushed = true`;
//! - buffers crossing the size threshold auto-flush with
//!   `flushed = false`;
//! - a collection drop flushes every segment with `dropped = true`.
//!
//! Rows at positions at or before a segment's checkpoint are replayed
//! input after recovery and are skipped. At every batch boundary the
//! replica checkpoint of each touched segment advances, whether or not
//! anything flushed.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use vectorstream_core::{SegmentId, Timestamp};

use crate::buffer::InsertBuffer;
use crate::cache::FlushingCache;
use crate::error::Result;
use crate::flow_graph::{FlowMsg, FlowNode};
use crate::flush_manager::RendezvousFlushManager;
use crate::metrics;
use crate::replica::SegmentReplica;

pub struct InsertBufferNode {
    replica: Arc<SegmentReplica>,
    flush_manager: Arc<RendezvousFlushManager>,
    flushing_cache: Arc<FlushingCache>,
    flush_rx: mpsc::UnboundedReceiver<(SegmentId, Timestamp)>,
    buffers: HashMap<SegmentId, InsertBuffer>,
    /// Seal notifications waiting for their flush timestamp to pass.
    pending_seals: HashMap<SegmentId, Timestamp>,
    flush_buffer_bytes: usize,
}

impl InsertBufferNode {
    pub fn new(
        replica: Arc<SegmentReplica>,
        flush_manager: Arc<RendezvousFlushManager>,
        flushing_cache: Arc<FlushingCache>,
        flush_rx: mpsc::UnboundedReceiver<(SegmentId, Timestamp)>,
        flush_buffer_bytes: usize,
    ) -> Self {
        Self {
            replica,
            flush_manager,
            flushing_cache,
            flush_rx,
            buffers: HashMap::new(),
            pending_seals: HashMap::new(),
            flush_buffer_bytes,
        }
    }

    async fn flush_all_dropped(&mut self, msg: &mut FlowMsg) {
        for segment_id in self.replica.normal_segments() {
            let outcome = self
                .flush_manager
                .flush_buffer_data(self.buffers.get(&segment_id), segment_id, false, true, &msg.position)
                .await;
            match outcome {
                Ok(()) => {
                    self.buffers.remove(&segment_id);
                    metrics::FLUSH_PACKS_TOTAL.with_label_values(&["drop"]).inc();
                    msg.segments_to_flush.push(segment_id);
                }
                Err(e) => warn!(segment_id, error = %e, "drop flush enqueue failed"),
            }
        }
    }
}

#[async_trait]
impl FlowNode for InsertBufferNode {
    fn name(&self) -> &'static str {
        "insert-buffer"
    }

    async fn process(&mut self, mut msg: FlowMsg) -> Result<FlowMsg> {
        if msg.drop_collection {
            self.flush_all_dropped(&mut msg).await;
            return Ok(msg);
        }

        // Buffer rows, opening segments on first sight.
        let mut touched: HashSet<SegmentId> = HashSet::new();
        for insert in &msg.inserts {
            let segment_id = insert.segment_id;
            if let Some(cp) = self.replica.checkpoint(segment_id) {
                if msg.position.msg_id <= cp.position.msg_id {
                    // Replayed input from recovery; already durable.
                    continue;
                }
            }
            if !self.replica.has_segment(segment_id, false) {
                if self.replica.has_segment(segment_id, true) {
                    debug!(segment_id, "insert for flushed segment skipped");
                    continue;
                }
                self.replica.add_new_segment(
                    segment_id,
                    insert.collection_id,
                    insert.partition_id,
                    &insert.channel,
                    msg.position.clone(),
                );
            }
            let buffer = self
                .buffers
                .entry(segment_id)
                .or_insert_with(|| InsertBuffer::new(insert));
            if let Err(e) = buffer.append(insert) {
                warn!(segment_id, error = %e, "insert batch rejected");
                continue;
            }
            self.replica
                .update_statistics(segment_id, &insert.primary_keys)?;
            touched.insert(segment_id);
        }

        // Seal notifications: each is gated on its flush timestamp, so
        // every row produced under a reservation is consumed before the
        // segment flushes.
        while let Ok((segment_id, flush_ts)) = self.flush_rx.try_recv() {
            if self.replica.has_segment(segment_id, true)
                && !self.replica.has_segment(segment_id, false)
            {
                debug!(segment_id, "seal notification for flushed segment ignored");
                continue;
            }
            if !self.flushing_cache.insert(segment_id) {
                debug!(segment_id, "segment already flushing");
                continue;
            }
            self.replica.set_flushing(segment_id, true);
            self.pending_seals.entry(segment_id).or_insert(flush_ts);
        }

        let mut flush_set: Vec<(SegmentId, bool)> = Vec::new();
        let due: Vec<SegmentId> = self
            .pending_seals
            .iter()
            .filter(|(_, gate)| msg.timetick >= **gate)
            .map(|(id, _)| *id)
            .collect();
        for segment_id in due {
            self.pending_seals.remove(&segment_id);
            flush_set.push((segment_id, true));
        }

        // Auto flush on buffer size.
        for (segment_id, buffer) in &self.buffers {
            if buffer.size_bytes >= self.flush_buffer_bytes
                && !flush_set.iter().any(|(id, _)| id == segment_id)
            {
                flush_set.push((*segment_id, false));
            }
        }

        for (segment_id, flushed) in flush_set {
            let outcome = self
                .flush_manager
                .flush_buffer_data(self.buffers.get(&segment_id), segment_id, flushed, false, &msg.position)
                .await;
            match outcome {
                Ok(()) => {
                    self.buffers.remove(&segment_id);
                    let trigger = if flushed { "flush" } else { "auto" };
                    metrics::FLUSH_PACKS_TOTAL.with_label_values(&[trigger]).inc();
                    msg.segments_to_flush.push(segment_id);
                }
                Err(e) => {
                    // Buffer stays; the flush retries at the next batch.
                    warn!(segment_id, error = %e, "flush enqueue failed");
                    if flushed {
                        self.pending_seals.insert(segment_id, 0);
                    }
                }
            }
        }

        // Time tick boundary: checkpoints advance without flushing.
        for segment_id in touched {
            self.replica
                .update_checkpoint(segment_id, msg.position.clone());
        }

        Ok(msg)
    }
}
