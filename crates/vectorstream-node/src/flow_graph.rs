//! Ordered per-channel pipeline.
//!
//! Four stages (stream source, dd filter, insert buffer, delete buffer)
//! joined by bounded queues. Each stage processes batches strictly in
//! arrival order; a full queue backpressures upstream all the way into
//! the stream source. Closing cancels the source, lets the queues drain
//! within a grace deadline, then force-aborts whatever is left.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use vectorstream_core::{
    CollectionId, DeleteMessage, InsertMessage, MsgBatch, PartitionId, Position, SegmentId,
    StreamMessage, Timestamp,
};

use crate::error::Result;
use crate::stream::MsgStream;

/// One batch flowing through the graph.
#[derive(Debug, Clone, Default)]
pub struct FlowMsg {
    pub inserts: Vec<InsertMessage>,
    pub deletes: Vec<DeleteMessage>,
    pub dropped_collections: Vec<CollectionId>,
    pub dropped_partitions: Vec<(CollectionId, PartitionId)>,
    pub timetick: Timestamp,
    pub position: Position,

    /// Segments whose insert buffers were handed to the flush manager in
    /// this batch; the delete node must submit the matching delete half.
    pub segments_to_flush: Vec<SegmentId>,
    /// This channel's collection was dropped; flush everything as
    /// dropped and shut the graph down.
    pub drop_collection: bool,
}

impl FlowMsg {
    fn from_batch(batch: MsgBatch) -> Self {
        let mut msg = FlowMsg {
            timetick: batch.timetick,
            position: batch.position,
            ..FlowMsg::default()
        };
        for message in batch.messages {
            match message {
                StreamMessage::Insert(insert) => msg.inserts.push(insert),
                StreamMessage::Delete(delete) => msg.deletes.push(delete),
                StreamMessage::DropCollection(id) => msg.dropped_collections.push(id),
                StreamMessage::DropPartition {
                    collection_id,
                    partition_id,
                } => msg.dropped_partitions.push((collection_id, partition_id)),
            }
        }
        msg
    }
}

/// One pipeline stage. Stages share nothing but the queues between them.
#[async_trait]
pub trait FlowNode: Send {
    fn name(&self) -> &'static str;

    async fn process(&mut self, msg: FlowMsg) -> Result<FlowMsg>;

    async fn close(&mut self) {}
}

pub struct FlowGraph {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl FlowGraph {
    /// Spawn the source and every node; batches start flowing at once.
    pub fn start(
        mut stream: Box<dyn MsgStream>,
        nodes: Vec<Box<dyn FlowNode>>,
        queue_length: usize,
        cancel: CancellationToken,
    ) -> Self {
        let mut handles = Vec::with_capacity(nodes.len() + 1);

        let (source_tx, mut prev_rx) = mpsc::channel::<FlowMsg>(queue_length);
        let source_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = source_cancel.cancelled() => break,
                    batch = stream.next() => batch,
                };
                match batch {
                    Ok(Some(batch)) => {
                        if source_tx.send(FlowMsg::from_batch(batch)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("stream ended, closing source");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "stream read failed, closing source");
                        break;
                    }
                }
            }
            // Dropping the sender drains the pipeline tail-first.
        }));

        let count = nodes.len();
        for (idx, mut node) in nodes.into_iter().enumerate() {
            let is_last = idx + 1 == count;
            let (tx, next_rx) = mpsc::channel::<FlowMsg>(queue_length);
            let mut rx = std::mem::replace(&mut prev_rx, next_rx);
            handles.push(tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    match node.process(msg).await {
                        Ok(out) => {
                            if !is_last && tx.send(out).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(node = node.name(), error = %e, "batch processing failed");
                        }
                    }
                }
                node.close().await;
                debug!(node = node.name(), "flow node closed");
            }));
        }
        // Tail receiver dropped here; the last node's sends are skipped.

        Self { handles, cancel }
    }

    /// Stop pulling from the stream, drain in-flight batches within the
    /// grace deadline, then force-close.
    pub async fn close(self, grace: Duration) {
        self.cancel.cancel();
        for handle in self.handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("flow node did not drain within grace, aborted");
            }
        }
    }
}
