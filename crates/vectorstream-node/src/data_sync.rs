//! Per-channel data sync service.
//!
//! Owns one flow graph, its segment replica and its flush manager, and
//! wires the flush notifier that reports packs to the coordinator. The
//! builder recovers replica state from the coordinator's channel info
//! before the first batch flows.
//!
//! Construction order is graph-on-top-of-manager-on-top-of-replica;
//! `close` tears down in reverse: stop the graph (drain with grace),
//! then the flush manager, and let the replica drop last.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use async_trait::async_trait;
use object_store::ObjectStore;
use vectorstream_core::codec::PkStatistics;
use vectorstream_core::{Allocator, CollectionId, NodeId, SegmentId, PRIMARY_KEY_FIELD};
use vectorstream_meta::{CheckPoint, FieldBinlog, SegmentInfo};
use vectorstream_rpc::{reason, DataCoordService, SaveBinlogPathsRequest, VchannelInfo};

use crate::cache::FlushingCache;
use crate::config::NodeConfig;
use crate::dd_node::DdFilterNode;
use crate::delete_node::DeleteBufferNode;
use crate::error::Result;
use crate::flow_graph::{FlowGraph, FlowNode};
use crate::flush_manager::{FlushNotifier, FlushPack, RendezvousFlushManager};
use crate::insert_node::InsertBufferNode;
use crate::replica::{SegmentCheckpoint, SegmentReplica};
use crate::stream::MsgStreamFactory;

pub struct DataSyncService {
    collection_id: CollectionId,
    channel: String,
    replica: Arc<SegmentReplica>,
    flush_manager: Arc<RendezvousFlushManager>,
    flush_tx: mpsc::UnboundedSender<(SegmentId, vectorstream_core::Timestamp)>,
    graph: Mutex<Option<FlowGraph>>,
    cancel: CancellationToken,
    config: NodeConfig,
}

impl DataSyncService {
    /// Build and start the pipeline for one virtual channel.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        config: NodeConfig,
        vchannel: &VchannelInfo,
        coord: Arc<dyn DataCoordService>,
        allocator: Arc<dyn Allocator>,
        store: Arc<dyn ObjectStore>,
        factory: &dyn MsgStreamFactory,
        clear_tx: mpsc::UnboundedSender<CollectionId>,
        flushing_cache: Arc<FlushingCache>,
    ) -> Result<Arc<Self>> {
        let collection_id = vchannel.collection_id;
        let channel = vchannel.channel.clone();
        let replica = Arc::new(SegmentReplica::new(collection_id));

        // Recover pre-existing segments from the coordinator's view.
        for seg in &vchannel.unflushed_segments {
            if seg.collection_id != collection_id || seg.insert_channel != channel {
                warn!(
                    segment_id = seg.id,
                    "recovery segment does not match channel, skipped"
                );
                continue;
            }
            info!(
                segment_id = seg.id,
                num_rows = seg.num_rows,
                "recovering unflushed segment"
            );
            let checkpoint = seg.dml_position.clone().map(|position| SegmentCheckpoint {
                num_rows: seg.num_rows,
                position,
            });
            replica.add_normal_segment(
                seg.id,
                seg.collection_id,
                seg.partition_id,
                &seg.insert_channel,
                seg.num_rows,
                checkpoint,
            );
        }
        for seg in &vchannel.flushed_segments {
            if seg.collection_id != collection_id || seg.insert_channel != channel {
                continue;
            }
            let pk_range = read_pk_range(&store, seg).await;
            replica.add_flushed_segment(
                seg.id,
                seg.collection_id,
                seg.partition_id,
                &seg.insert_channel,
                seg.num_rows,
                pk_range,
            );
        }

        let cancel = CancellationToken::new();
        let notifier = Arc::new(CoordNotifier {
            node_id: config.node_id,
            collection_id,
            coord,
            replica: replica.clone(),
            flushing_cache: flushing_cache.clone(),
            cancel: cancel.clone(),
            config: config.clone(),
        });
        let flush_manager = Arc::new(RendezvousFlushManager::new(
            replica.clone(),
            store,
            allocator,
            notifier,
            config.clone(),
        ));

        let mut stream = factory.subscribe(&channel);
        if let Some(seek) = &vchannel.seek_position {
            info!(channel = %channel, msg_id = seek.msg_id, "seeking stream to checkpoint");
            stream.seek(seek).await?;
        }

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let nodes: Vec<Box<dyn FlowNode>> = vec![
            Box::new(DdFilterNode::new(collection_id, clear_tx)),
            Box::new(InsertBufferNode::new(
                replica.clone(),
                flush_manager.clone(),
                flushing_cache,
                flush_rx,
                config.flush_buffer_bytes,
            )),
            Box::new(DeleteBufferNode::new(replica.clone(), flush_manager.clone())),
        ];
        let graph = FlowGraph::start(stream, nodes, config.max_queue_length, cancel.clone());

        info!(channel = %channel, collection_id, "data sync service started");
        Ok(Arc::new(Self {
            collection_id,
            channel,
            replica,
            flush_manager,
            flush_tx,
            graph: Mutex::new(Some(graph)),
            cancel,
            config,
        }))
    }

    pub fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn replica(&self) -> &Arc<SegmentReplica> {
        &self.replica
    }

    pub fn flush_manager(&self) -> &Arc<RendezvousFlushManager> {
        &self.flush_manager
    }

    /// Forward seal notifications into the insert buffer node. The
    /// flush executes once the consumed time tick passes `flush_ts`.
    pub fn flush_segments(&self, segment_ids: &[SegmentId], flush_ts: vectorstream_core::Timestamp) {
        for &id in segment_ids {
            if self.flush_tx.send((id, flush_ts)).is_err() {
                warn!(segment_id = id, "flow graph gone, seal notification dropped");
            }
        }
    }

    /// Stop consuming, drain, then tear down the flush pipeline.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(graph) = self.graph.lock().await.take() {
            graph.close(self.config.graceful_shutdown).await;
        }
        self.flush_manager.close();
        info!(channel = %self.channel, "data sync service closed");
    }
}

async fn read_pk_range(
    store: &Arc<dyn ObjectStore>,
    seg: &SegmentInfo,
) -> Option<(i64, i64)> {
    let path = seg
        .statslogs
        .iter()
        .find(|f| f.field_id == PRIMARY_KEY_FIELD)
        .and_then(|f| f.binlogs.last())?;
    let location = object_store::path::Path::from(path.as_str());
    let payload = match store.get(&location).await {
        Ok(result) => match result.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(segment_id = seg.id, error = %e, "stats log unreadable");
                return None;
            }
        },
        Err(e) => {
            warn!(segment_id = seg.id, error = %e, "stats log missing");
            return None;
        }
    };
    match serde_json::from_slice::<PkStatistics>(&payload) {
        Ok(stats) => Some((stats.pk_min, stats.pk_max)),
        Err(e) => {
            warn!(segment_id = seg.id, error = %e, "stats log corrupt");
            None
        }
    }
}

/// Reports finished packs to the coordinator.
///
/// A pack carrying an error and a non-retryable rejection both panic
/// the node: continuing would publish stale checkpoints, and a restart
/// replays cleanly from persisted state. The one exception is
/// `channel-not-watched`: ownership moved, so this pipeline stops
/// consuming and leaves the channel to the new owner.
struct CoordNotifier {
    node_id: NodeId,
    collection_id: CollectionId,
    coord: Arc<dyn DataCoordService>,
    replica: Arc<SegmentReplica>,
    flushing_cache: Arc<FlushingCache>,
    cancel: CancellationToken,
    config: NodeConfig,
}

#[async_trait]
impl FlushNotifier for CoordNotifier {
    async fn notify(&self, pack: FlushPack) {
        if let Some(err) = &pack.err {
            error!(segment_id = pack.segment_id, error = %err, "flush pack failed, stopping node");
            panic!("flush pack error on segment {}: {err}", pack.segment_id);
        }

        let field_binlogs: Vec<FieldBinlog> = pack
            .insert_logs
            .iter()
            .map(|(field_id, path)| FieldBinlog {
                field_id: *field_id,
                binlogs: vec![path.clone()],
            })
            .collect();
        let field_statslogs: Vec<FieldBinlog> = pack
            .stats_logs
            .iter()
            .map(|(field_id, path)| FieldBinlog {
                field_id: *field_id,
                binlogs: vec![path.clone()],
            })
            .collect();
        let checkpoints = self
            .replica
            .statistics(pack.segment_id)
            .map(|(num_rows, _)| {
                vec![CheckPoint {
                    segment_id: pack.segment_id,
                    num_rows,
                    position: pack.position.clone(),
                }]
            })
            .unwrap_or_default();

        let req = SaveBinlogPathsRequest {
            source_node_id: self.node_id,
            segment_id: pack.segment_id,
            collection_id: self.collection_id,
            flushed: pack.flushed,
            dropped: pack.dropped,
            field_binlogs,
            field_statslogs,
            deltalogs: pack.delta_logs.clone(),
            checkpoints,
            start_positions: self.replica.list_new_segments_start_positions(),
        };

        debug!(
            segment_id = pack.segment_id,
            msg_id = pack.position.msg_id,
            flushed = pack.flushed,
            dropped = pack.dropped,
            "reporting flush pack"
        );

        // Retry transient rejections forever: the report is idempotent
        // on (segment, position), so replays are safe.
        let mut backoff = self.config.retry.initial_backoff;
        loop {
            let status = self.coord.save_binlog_paths(req.clone()).await;
            if status.is_success() {
                break;
            }
            if status.reason == reason::CHANNEL_NOT_WATCHED {
                warn!(
                    segment_id = pack.segment_id,
                    "channel ownership moved, stopping this pipeline"
                );
                self.cancel.cancel();
                return;
            }
            if status.is_retryable() {
                warn!(
                    segment_id = pack.segment_id,
                    reason = %status.reason,
                    "flush report rejected, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.retry.max_backoff);
                continue;
            }
            error!(
                segment_id = pack.segment_id,
                reason = %status.reason,
                "flush report failed terminally, stopping node"
            );
            panic!(
                "save binlog paths failed for segment {}: {}",
                pack.segment_id, status.reason
            );
        }

        if pack.flushed || pack.dropped {
            self.replica.segment_flushed(pack.segment_id);
        }
        self.flushing_cache.remove(pack.segment_id);
    }
}
