//! Data Coordinator Server
//!
//! Wires the allocator, meta store, channel manager, segment manager and
//! compaction machinery together and serves the RPC surface. When the
//! server is not healthy every RPC answers `serverNotServing` and has no
//! side effects.
//!
//! Background loops (all shut down through one cancellation token):
//! - seal scan: applies the flush policy and tells owners to flush
//! - flush watcher: moves reported segments `Flushing -> Flushed`,
//!   writes the handoff record for the external indexer
//! - reconcile: node liveness and channel reassignment
//! - compaction: plan timeout sweep and the periodic merge trigger

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use async_trait::async_trait;
use vectorstream_core::{Allocator, CollectionId, NodeId, SegmentId};
use vectorstream_meta::{
    MetaKv, SegmentMeta, SegmentState, UpdateFlushInfo,
};
use vectorstream_rpc::{reason, Status, *};

use crate::allocator::KvTsoAllocator;
use crate::channel_manager::ChannelManager;
use crate::cluster::Cluster;
use crate::compaction::{CompactionHandler, CompactionTaskState};
use crate::compaction_trigger::CompactionTrigger;
use crate::config::CoordConfig;
use crate::error::Result;
use crate::metrics;
use crate::segment_manager::SegmentManager;

const STATE_INITIALIZING: u8 = 0;
const STATE_HEALTHY: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Collection registration pushed from the root coordinator.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub collection_id: CollectionId,
    pub name: String,
    pub vchannels: Vec<String>,
    pub max_rows_per_segment: i64,
}

pub struct DataCoordServer {
    config: CoordConfig,
    meta: Arc<SegmentMeta>,
    allocator: Arc<dyn Allocator>,
    cluster: Arc<Cluster>,
    channel_manager: Arc<ChannelManager>,
    segment_manager: Arc<SegmentManager>,
    compaction_handler: Arc<CompactionHandler>,
    compaction_trigger: Arc<CompactionTrigger>,

    collections: RwLock<HashMap<CollectionId, CollectionInfo>>,
    serving: AtomicU8,
    flush_tx: mpsc::Sender<SegmentId>,
    flush_rx: Mutex<Option<mpsc::Receiver<SegmentId>>>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DataCoordServer {
    pub async fn new(config: CoordConfig, kv: Arc<dyn MetaKv>) -> Result<Arc<Self>> {
        metrics::register_metrics();

        let meta = Arc::new(SegmentMeta::open(kv.clone()).await?);
        let allocator: Arc<dyn Allocator> = Arc::new(KvTsoAllocator::open(kv.clone()).await?);
        let cluster = Arc::new(Cluster::new(config.node_stale_after));
        let channel_manager = Arc::new(ChannelManager::new(cluster.clone(), meta.clone()));
        let segment_manager = Arc::new(
            SegmentManager::open(meta.clone(), allocator.clone(), config.clone()).await,
        );
        let compaction_handler = Arc::new(
            CompactionHandler::open(
                meta.clone(),
                kv,
                cluster.clone(),
                channel_manager.clone(),
                config.compaction.clone(),
            )
            .await?,
        );
        let compaction_trigger = Arc::new(CompactionTrigger::new(
            meta.clone(),
            allocator.clone(),
            compaction_handler.clone(),
            config.compaction.clone(),
        ));

        let (flush_tx, flush_rx) = mpsc::channel(1024);
        Ok(Arc::new(Self {
            config,
            meta,
            allocator,
            cluster,
            channel_manager,
            segment_manager,
            compaction_handler,
            compaction_trigger,
            collections: RwLock::new(HashMap::new()),
            serving: AtomicU8::new(STATE_INITIALIZING),
            flush_tx,
            flush_rx: Mutex::new(Some(flush_rx)),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }))
    }

    /// Start background loops and begin serving.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;

        let server = self.clone();
        let mut flush_rx = self
            .flush_rx
            .lock()
            .await
            .take()
            .expect("server started twice");
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(segment_id) = flush_rx.recv() => server.post_flush(segment_id).await,
                    _ = server.shutdown.cancelled() => break,
                }
            }
        }));

        let server = self.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(server.config.seal_check_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = server.segment_manager.try_seal_by_policy().await {
                            warn!(error = %e, "seal scan failed");
                        }
                        server.flush_ready_sealed().await;
                    }
                    _ = server.shutdown.cancelled() => break,
                }
            }
        }));

        let server = self.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(server.config.liveness_check_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => server.channel_manager.reconcile().await,
                    _ = server.shutdown.cancelled() => break,
                }
            }
        }));

        if self.config.enable_compaction {
            let server = self.clone();
            handles.push(tokio::spawn(async move {
                let mut sweep = tokio::time::interval(std::time::Duration::from_secs(1));
                let mut periodic = tokio::time::interval(server.config.compaction.check_interval);
                // The first periodic tick fires immediately; skip it so a
                // fresh server does not compact before anything flushed.
                periodic.tick().await;
                loop {
                    tokio::select! {
                        _ = sweep.tick() => server.compaction_handler.sweep_timeouts().await,
                        _ = periodic.tick() => {
                            if let Err(e) = server.compaction_trigger.periodic_check().await {
                                warn!(error = %e, "periodic compaction check failed");
                            }
                        }
                        _ = server.shutdown.cancelled() => break,
                    }
                }
            }));
        }

        self.serving.store(STATE_HEALTHY, Ordering::SeqCst);
        info!(node_id = self.config.node_id, "data coordinator serving");
    }

    pub async fn stop(&self) {
        self.serving.store(STATE_STOPPED, Ordering::SeqCst);
        self.shutdown.cancel();
        for handle in self.handles.lock().await.drain(..) {
            let _ = handle.await;
        }
        info!("data coordinator stopped");
    }

    fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst) == STATE_HEALTHY
    }

    // ---------------------------------------------------------------
    // Wiring (stand-ins for root-coord sync and node registration)
    // ---------------------------------------------------------------

    pub async fn register_collection(&self, info: CollectionInfo) {
        self.collections
            .write()
            .await
            .insert(info.collection_id, info);
    }

    pub async fn register_data_node(&self, node_id: NodeId, client: Arc<dyn DataNodeService>) {
        self.cluster.register(node_id, client).await;
    }

    pub async fn node_heartbeat(&self, node_id: NodeId) {
        self.cluster.heartbeat(node_id).await;
    }

    pub fn meta(&self) -> &Arc<SegmentMeta> {
        &self.meta
    }

    pub fn channel_manager(&self) -> &Arc<ChannelManager> {
        &self.channel_manager
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    /// Flushed-segment watcher body: finalize state and hand off to the
    /// external indexer.
    async fn post_flush(&self, segment_id: SegmentId) {
        let Some(seg) = self.meta.get_segment(segment_id).await else {
            warn!(segment_id, "flushed segment vanished from meta");
            return;
        };
        if seg.state != SegmentState::Flushing {
            debug!(segment_id, state = ?seg.state, "skipping post-flush");
            return;
        }
        if let Err(e) = self.meta.set_state(segment_id, SegmentState::Flushed).await {
            error!(segment_id, error = %e, "failed to finalize flushed segment");
            return;
        }
        metrics::SEGMENTS_FLUSHED_TOTAL.inc();
        let mut seg = seg;
        seg.state = SegmentState::Flushed;
        if let Err(e) = self.meta.save_handoff(&seg).await {
            warn!(segment_id, error = %e, "failed to write handoff record");
        }
        debug!(segment_id, "segment flushed");
    }

    /// Sealed segments are flushed only after their reservations expire:
    /// by then every granted row is in the stream, so a node flushing
    /// past the notification timestamp cannot lose trailing rows.
    /// Notification repeats every scan until the flush report lands
    /// (the segment leaves Sealed); nodes dedup via their flushing cache.
    async fn flush_ready_sealed(&self) {
        let now = vectorstream_core::compose_ts(chrono::Utc::now().timestamp_millis(), 0);
        let mut ready = Vec::new();
        for seg in self.meta.list_segments().await {
            if seg.state == SegmentState::Sealed && seg.last_expire_time <= now {
                ready.push(seg.id);
            }
        }
        if !ready.is_empty() {
            self.notify_flush(&ready, now).await;
        }
    }

    /// Tell the owning nodes to flush freshly sealed segments.
    async fn notify_flush(&self, sealed: &[SegmentId], flush_ts: vectorstream_core::Timestamp) {
        // node -> collection -> segments
        let mut by_node: HashMap<NodeId, HashMap<CollectionId, Vec<SegmentId>>> = HashMap::new();
        for &id in sealed {
            let Some(seg) = self.meta.get_segment(id).await else {
                continue;
            };
            let Some(node) = self.channel_manager.watching_node(&seg.insert_channel).await else {
                debug!(segment_id = id, channel = %seg.insert_channel, "sealed segment has no watcher yet");
                continue;
            };
            by_node
                .entry(node)
                .or_default()
                .entry(seg.collection_id)
                .or_default()
                .push(id);
        }
        for (node, collections) in by_node {
            let Some(client) = self.cluster.client(node).await else {
                continue;
            };
            for (collection_id, segment_ids) in collections {
                let status = client
                    .flush_segments(FlushSegmentsRequest {
                        collection_id,
                        segment_ids: segment_ids.clone(),
                        flush_ts,
                    })
                    .await;
                if !status.is_success() {
                    warn!(node, reason = %status.reason, segments = ?segment_ids, "flush notify rejected");
                }
            }
        }
    }

    async fn channel_drained(&self, channel: &str) -> bool {
        !self.meta.channel_has_blocking_segments(channel).await
    }
}

#[async_trait]
impl DataCoordService for DataCoordServer {
    async fn flush(&self, req: FlushRequest) -> FlushResponse {
        if !self.is_serving() {
            return FlushResponse {
                status: Status::not_serving(),
                collection_id: req.collection_id,
                segment_ids: vec![],
            };
        }
        debug!(collection_id = req.collection_id, "flush requested");
        // Sealing is immediate; the actual flush happens once each
        // segment's reservations have expired (flush_ready_sealed).
        match self.segment_manager.seal_all_segments(req.collection_id).await {
            Ok(sealed) => {
                FlushResponse {
                    status: Status::success(),
                    collection_id: req.collection_id,
                    segment_ids: sealed,
                }
            }
            Err(e) => FlushResponse {
                status: Status::error(format!("failed to flush {}: {e}", req.collection_id)),
                collection_id: req.collection_id,
                segment_ids: vec![],
            },
        }
    }

    async fn assign_segment_id(&self, req: AssignSegmentIdRequest) -> AssignSegmentIdResponse {
        if !self.is_serving() {
            return AssignSegmentIdResponse {
                status: Status::not_serving(),
                assignments: vec![],
            };
        }
        let mut assignments = Vec::with_capacity(req.requests.len());
        for r in req.requests {
            let max_rows = {
                let mut collections = self.collections.write().await;
                let Some(info) = collections.get_mut(&r.collection_id) else {
                    warn!(collection_id = r.collection_id, "assign for unknown collection skipped");
                    continue;
                };
                if !info.vchannels.contains(&r.channel) {
                    info.vchannels.push(r.channel.clone());
                }
                info.max_rows_per_segment
            };

            if let Err(e) = self.channel_manager.watch(&r.channel, r.collection_id).await {
                warn!(channel = %r.channel, error = %e, "channel watch failed");
            }

            match self
                .segment_manager
                .alloc_segment(
                    r.collection_id,
                    r.partition_id,
                    &r.channel,
                    r.count as i64,
                    max_rows,
                )
                .await
            {
                Ok(allocs) => {
                    for alloc in allocs {
                        assignments.push(SegmentIdAssignment {
                            segment_id: alloc.segment_id,
                            channel: r.channel.clone(),
                            count: alloc.num_of_rows as u32,
                            expire_time: alloc.expire_time,
                            status: Status::success(),
                        });
                    }
                }
                Err(e) => {
                    warn!(
                        collection_id = r.collection_id,
                        channel = %r.channel,
                        error = %e,
                        "segment allocation failed"
                    );
                }
            }
        }
        AssignSegmentIdResponse {
            status: Status::success(),
            assignments,
        }
    }

    async fn save_binlog_paths(&self, req: SaveBinlogPathsRequest) -> Status {
        if !self.is_serving() {
            return Status::not_serving();
        }
        debug!(
            segment_id = req.segment_id,
            node_id = req.source_node_id,
            flushed = req.flushed,
            dropped = req.dropped,
            "flush report received"
        );

        let Some(segment) = self.meta.get_segment(req.segment_id).await else {
            metrics::FLUSH_REPORTS_REJECTED_TOTAL
                .with_label_values(&["segment-not-found"])
                .inc();
            return Status::error(reason::SEGMENT_NOT_FOUND);
        };
        let channel = segment.insert_channel.clone();

        // Fence: stale owners cannot mutate meta.
        if !self
            .channel_manager
            .match_node(req.source_node_id, &channel)
            .await
        {
            warn!(
                channel = %channel,
                node_id = req.source_node_id,
                "flush report from non-owner rejected"
            );
            metrics::FLUSH_REPORTS_REJECTED_TOTAL
                .with_label_values(&["channel-not-watched"])
                .inc();
            return Status::error(reason::CHANNEL_NOT_WATCHED);
        }

        if req.dropped {
            self.segment_manager.drop_segment(req.segment_id).await;
        }

        let update = UpdateFlushInfo {
            flushed: req.flushed,
            dropped: req.dropped,
            binlogs: req.field_binlogs,
            statslogs: req.field_statslogs,
            deltalogs: req.deltalogs,
            checkpoints: req.checkpoints,
            start_positions: req.start_positions,
        };
        if let Err(e) = self
            .meta
            .update_flush_segments_info(req.segment_id, update)
            .await
        {
            error!(segment_id = req.segment_id, error = %e, "flush report not applied");
            return Status::error(e.to_string());
        }
        metrics::FLUSH_REPORTS_TOTAL.inc();

        if req.dropped && self.channel_drained(&channel).await {
            info!(channel = %channel, "channel drained, removing");
            self.channel_manager.remove_channel(&channel).await;
            self.segment_manager.drop_segments_of_channel(&channel).await;
        }

        if req.flushed {
            self.segment_manager.drop_segment(req.segment_id).await;
            if let Err(e) = self.flush_tx.send(req.segment_id).await {
                error!(segment_id = req.segment_id, error = %e, "flush watcher gone");
            }
            if self.config.enable_compaction {
                if let Some(seg) = self.meta.get_segment(req.segment_id).await {
                    if let Err(e) = self.compaction_trigger.trigger_single(&seg).await {
                        warn!(segment_id = req.segment_id, error = %e, "single compaction trigger failed");
                    }
                }
            }
        }
        Status::success()
    }

    async fn get_segment_info(&self, req: GetSegmentInfoRequest) -> GetSegmentInfoResponse {
        if !self.is_serving() {
            return GetSegmentInfoResponse {
                status: Status::not_serving(),
                infos: vec![],
            };
        }
        let mut infos = Vec::with_capacity(req.segment_ids.len());
        for id in req.segment_ids {
            match self.meta.get_segment(id).await {
                Some(info) => infos.push(info),
                None => {
                    return GetSegmentInfoResponse {
                        status: Status::error(format!("failed to get segment {id}")),
                        infos: vec![],
                    }
                }
            }
        }
        GetSegmentInfoResponse {
            status: Status::success(),
            infos,
        }
    }

    async fn get_segment_states(&self, req: GetSegmentStatesRequest) -> GetSegmentStatesResponse {
        if !self.is_serving() {
            return GetSegmentStatesResponse {
                status: Status::not_serving(),
                states: vec![],
            };
        }
        let mut states = Vec::with_capacity(req.segment_ids.len());
        for id in req.segment_ids {
            match self.meta.get_segment(id).await {
                Some(seg) => states.push(SegmentStateInfo {
                    segment_id: id,
                    state: Some(seg.state),
                    start_position: seg.start_position,
                    status: Status::success(),
                }),
                None => states.push(SegmentStateInfo {
                    segment_id: id,
                    state: None,
                    start_position: None,
                    status: Status::error(format!("failed to get segment {id}")),
                }),
            }
        }
        GetSegmentStatesResponse {
            status: Status::success(),
            states,
        }
    }

    async fn get_insert_binlog_paths(
        &self,
        req: GetInsertBinlogPathsRequest,
    ) -> GetInsertBinlogPathsResponse {
        if !self.is_serving() {
            return GetInsertBinlogPathsResponse {
                status: Status::not_serving(),
                field_ids: vec![],
                paths: vec![],
            };
        }
        let Some(seg) = self.meta.get_segment(req.segment_id).await else {
            return GetInsertBinlogPathsResponse {
                status: Status::error(reason::SEGMENT_NOT_FOUND),
                field_ids: vec![],
                paths: vec![],
            };
        };
        let mut field_ids = Vec::with_capacity(seg.binlogs.len());
        let mut paths = Vec::with_capacity(seg.binlogs.len());
        for field in seg.binlogs {
            field_ids.push(field.field_id);
            paths.push(field.binlogs);
        }
        GetInsertBinlogPathsResponse {
            status: Status::success(),
            field_ids,
            paths,
        }
    }

    async fn get_collection_statistics(
        &self,
        req: GetCollectionStatisticsRequest,
    ) -> GetCollectionStatisticsResponse {
        if !self.is_serving() {
            return GetCollectionStatisticsResponse {
                status: Status::not_serving(),
                row_count: 0,
            };
        }
        GetCollectionStatisticsResponse {
            status: Status::success(),
            row_count: self.meta.num_rows_of_collection(req.collection_id).await,
        }
    }

    async fn get_recovery_info(&self, req: GetRecoveryInfoRequest) -> GetRecoveryInfoResponse {
        if !self.is_serving() {
            return GetRecoveryInfoResponse {
                status: Status::not_serving(),
                binlogs: vec![],
                channels: vec![],
            };
        }
        info!(
            collection_id = req.collection_id,
            partition_id = req.partition_id,
            "recovery info requested"
        );

        let segment_ids = if req.partition_id < 0 {
            self.meta.segment_ids_of_collection(req.collection_id).await
        } else {
            self.meta
                .segment_ids_of_partition(req.collection_id, req.partition_id)
                .await
        };

        let mut binlogs = Vec::new();
        for id in segment_ids {
            let Some(seg) = self.meta.get_segment(id).await else {
                return GetRecoveryInfoResponse {
                    status: Status::error(format!("failed to get segment {id}")),
                    binlogs: vec![],
                    channels: vec![],
                };
            };
            if !matches!(seg.state, SegmentState::Flushed | SegmentState::Flushing) {
                continue;
            }
            binlogs.push(SegmentBinlogs {
                segment_id: id,
                num_rows: seg.num_rows,
                field_binlogs: seg.binlogs,
                statslogs: seg.statslogs,
                deltalogs: seg.deltalogs,
            });
        }

        let vchannels = self
            .collections
            .read()
            .await
            .get(&req.collection_id)
            .map(|c| c.vchannels.clone())
            .unwrap_or_default();
        let mut channels = Vec::with_capacity(vchannels.len());
        for channel in vchannels {
            channels.push(
                self.channel_manager
                    .build_vchannel_info(&channel, req.collection_id)
                    .await,
            );
        }

        GetRecoveryInfoResponse {
            status: Status::success(),
            binlogs,
            channels,
        }
    }

    async fn get_flushed_segments(
        &self,
        req: GetFlushedSegmentsRequest,
    ) -> GetFlushedSegmentsResponse {
        if !self.is_serving() {
            return GetFlushedSegmentsResponse {
                status: Status::not_serving(),
                segment_ids: vec![],
            };
        }
        let ids = if req.partition_id < 0 {
            self.meta.segment_ids_of_collection(req.collection_id).await
        } else {
            self.meta
                .segment_ids_of_partition(req.collection_id, req.partition_id)
                .await
        };
        let mut segment_ids = Vec::with_capacity(ids.len());
        for id in ids {
            match self.meta.get_segment(id).await {
                Some(seg) if seg.state == SegmentState::Flushed => segment_ids.push(id),
                Some(_) => {}
                None => {
                    // Fail closed: a missing record is assumed compacted
                    // away, but the occurrence is metered so real meta
                    // loss does not hide here.
                    warn!(segment_id = id, "no meta record, assuming compacted");
                    metrics::FLUSHED_LOOKUP_MISSING_META_TOTAL.inc();
                    segment_ids.push(id);
                }
            }
        }
        GetFlushedSegmentsResponse {
            status: Status::success(),
            segment_ids,
        }
    }

    async fn watch_channels(&self, req: WatchChannelsRequest) -> WatchChannelsResponse {
        if !self.is_serving() {
            return WatchChannelsResponse {
                status: Status::not_serving(),
            };
        }
        {
            let mut collections = self.collections.write().await;
            let entry = collections
                .entry(req.collection_id)
                .or_insert_with(|| CollectionInfo {
                    collection_id: req.collection_id,
                    name: format!("collection-{}", req.collection_id),
                    vchannels: vec![],
                    max_rows_per_segment: self.config.default_max_rows_per_segment,
                });
            for channel in &req.channels {
                if !entry.vchannels.contains(channel) {
                    entry.vchannels.push(channel.clone());
                }
            }
        }
        for channel in &req.channels {
            if let Err(e) = self.channel_manager.watch(channel, req.collection_id).await {
                warn!(channel = %channel, error = %e, "watch failed");
                return WatchChannelsResponse {
                    status: Status::error(e.to_string()),
                };
            }
        }
        WatchChannelsResponse {
            status: Status::success(),
        }
    }

    async fn manual_compaction(&self, req: ManualCompactionRequest) -> ManualCompactionResponse {
        if !self.is_serving() {
            return ManualCompactionResponse {
                status: Status::not_serving(),
                compaction_id: 0,
            };
        }
        if !self.config.enable_compaction {
            return ManualCompactionResponse {
                status: Status::error(reason::COMPACTION_DISABLED),
                compaction_id: 0,
            };
        }
        match self
            .compaction_trigger
            .manual_compaction(req.collection_id, req.timetravel)
            .await
        {
            Ok(id) => ManualCompactionResponse {
                status: Status::success(),
                compaction_id: id,
            },
            Err(e) => ManualCompactionResponse {
                status: Status::error(e.to_string()),
                compaction_id: 0,
            },
        }
    }

    async fn get_compaction_state(
        &self,
        req: GetCompactionStateRequest,
    ) -> GetCompactionStateResponse {
        if !self.is_serving() {
            return GetCompactionStateResponse {
                status: Status::not_serving(),
                state: CompactionStateCode::Completed,
                executing_plan_count: 0,
                completed_plan_count: 0,
                timeout_plan_count: 0,
            };
        }
        if !self.config.enable_compaction {
            return GetCompactionStateResponse {
                status: Status::error(reason::COMPACTION_DISABLED),
                state: CompactionStateCode::Completed,
                executing_plan_count: 0,
                completed_plan_count: 0,
                timeout_plan_count: 0,
            };
        }
        let tasks = self.compaction_handler.tasks_by_trigger(req.compaction_id).await;
        let executing = tasks
            .iter()
            .filter(|t| !t.state.is_terminal())
            .count();
        let completed = tasks
            .iter()
            .filter(|t| t.state == CompactionTaskState::Completed)
            .count();
        let timeout = tasks
            .iter()
            .filter(|t| t.state == CompactionTaskState::Timeout)
            .count();
        GetCompactionStateResponse {
            status: Status::success(),
            state: if executing > 0 {
                CompactionStateCode::Executing
            } else {
                CompactionStateCode::Completed
            },
            executing_plan_count: executing,
            completed_plan_count: completed,
            timeout_plan_count: timeout,
        }
    }

    async fn complete_compaction(&self, result: CompactionResult) -> Status {
        if !self.is_serving() {
            return Status::not_serving();
        }
        if !self.config.enable_compaction {
            return Status::error(reason::COMPACTION_DISABLED);
        }
        debug!(
            plan_id = result.plan_id,
            segment_id = result.segment_id,
            "compaction result received"
        );
        match self.compaction_handler.complete_compaction(result).await {
            Ok(()) => Status::success(),
            Err(e) => {
                error!(error = %e, "failed to complete compaction");
                Status::error(e.to_string())
            }
        }
    }

    async fn get_component_states(&self) -> ComponentStates {
        let state_code = match self.serving.load(Ordering::SeqCst) {
            STATE_INITIALIZING => StateCode::Initializing,
            STATE_HEALTHY => StateCode::Healthy,
            _ => StateCode::Abnormal,
        };
        ComponentStates {
            node_id: self.config.node_id,
            role: "datacoord".to_string(),
            state_code,
            status: Status::success(),
        }
    }
}
