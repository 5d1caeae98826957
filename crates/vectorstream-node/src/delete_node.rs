//! Delete buffer node.
//!
//! Buckets primary-key deletes per segment through the replica's pk
//! filters and submits the delete half of every flush the insert node
//! started, with or without buffered deletes, because the rendezvous
//! completes only when both halves arrive.
//!
//! Deletes aimed at already-flushed segments cannot ride a segment
//! flush; at flush boundaries their delta logs are paired with an empty
//! insert half so they reach durability too.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use vectorstream_core::SegmentId;

use crate::buffer::DeleteBuffer;
use crate::error::Result;
use crate::flow_graph::{FlowMsg, FlowNode};
use crate::flush_manager::RendezvousFlushManager;
use crate::replica::SegmentReplica;

pub struct DeleteBufferNode {
    replica: Arc<SegmentReplica>,
    flush_manager: Arc<RendezvousFlushManager>,
    buffers: HashMap<SegmentId, DeleteBuffer>,
}

impl DeleteBufferNode {
    pub fn new(replica: Arc<SegmentReplica>, flush_manager: Arc<RendezvousFlushManager>) -> Self {
        Self {
            replica,
            flush_manager,
            buffers: HashMap::new(),
        }
    }

    async fn flush_segment_deltas(&mut self, segment_id: SegmentId, msg: &FlowMsg) {
        let outcome = self
            .flush_manager
            .flush_delete_data(self.buffers.get(&segment_id), segment_id, &msg.position)
            .await;
        match outcome {
            Ok(()) => {
                self.buffers.remove(&segment_id);
            }
            Err(e) => warn!(segment_id, error = %e, "delete flush enqueue failed"),
        }
    }

    /// Deltas of flushed segments get an empty insert half so their
    /// rendezvous completes.
    async fn flush_stale_deltas(&mut self, msg: &FlowMsg) {
        let flushed: Vec<SegmentId> = self
            .buffers
            .keys()
            .copied()
            .filter(|id| !self.replica.has_segment(*id, false) && self.replica.has_segment(*id, true))
            .collect();
        for segment_id in flushed {
            if let Err(e) = self
                .flush_manager
                .flush_buffer_data(None, segment_id, false, false, &msg.position)
                .await
            {
                warn!(segment_id, error = %e, "stale delta insert half failed");
                continue;
            }
            self.flush_segment_deltas(segment_id, msg).await;
        }
    }
}

#[async_trait]
impl FlowNode for DeleteBufferNode {
    fn name(&self) -> &'static str {
        "delete-buffer"
    }

    async fn process(&mut self, mut msg: FlowMsg) -> Result<FlowMsg> {
        // Bucket deletes by the segments that may hold each key.
        for delete in &msg.deletes {
            for (pk, ts) in delete
                .primary_keys
                .iter()
                .copied()
                .zip(delete.timestamps.iter().copied())
            {
                for segment_id in self.replica.segments_for_pk(pk) {
                    self.buffers
                        .entry(segment_id)
                        .or_insert_with(|| DeleteBuffer::new(segment_id))
                        .append(pk, ts);
                }
            }
        }

        if msg.drop_collection {
            // Close out every rendezvous the insert node opened, then
            // drop whatever delete state is left.
            let segments = std::mem::take(&mut msg.segments_to_flush);
            for segment_id in &segments {
                self.flush_segment_deltas(*segment_id, &msg).await;
            }
            self.buffers.clear();
            msg.segments_to_flush = segments;
            return Ok(msg);
        }

        for segment_id in msg.segments_to_flush.clone() {
            self.flush_segment_deltas(segment_id, &msg).await;
        }

        if !msg.segments_to_flush.is_empty() {
            self.flush_stale_deltas(&msg).await;
        }

        Ok(msg)
    }
}
