//! Data node: owns one data sync service per watched virtual channel
//! and serves the coordinator-facing RPCs.

use async_trait::async_trait;
use object_store::ObjectStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vectorstream_core::{Allocator, CollectionId};
use vectorstream_rpc::{
    CompactionPlan, DataCoordService, DataNodeService, FlushSegmentsRequest, Status,
    WatchDmChannelsRequest,
};

use crate::cache::FlushingCache;
use crate::compactor;
use crate::config::NodeConfig;
use crate::data_sync::DataSyncService;
use crate::error::Result;
use crate::metrics;
use crate::stream::MsgStreamFactory;

pub struct DataNode {
    config: NodeConfig,
    coord: Arc<dyn DataCoordService>,
    store: Arc<dyn ObjectStore>,
    allocator: Arc<dyn Allocator>,
    factory: Arc<dyn MsgStreamFactory>,
    flushing_cache: Arc<FlushingCache>,

    services: RwLock<HashMap<String, Arc<DataSyncService>>>,
    clear_tx: mpsc::UnboundedSender<CollectionId>,
    clear_rx: Mutex<Option<mpsc::UnboundedReceiver<CollectionId>>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DataNode {
    pub fn new(
        config: NodeConfig,
        coord: Arc<dyn DataCoordService>,
        store: Arc<dyn ObjectStore>,
        allocator: Arc<dyn Allocator>,
        factory: Arc<dyn MsgStreamFactory>,
    ) -> Arc<Self> {
        metrics::register_metrics();
        let (clear_tx, clear_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            coord,
            store,
            allocator,
            factory,
            flushing_cache: Arc::new(FlushingCache::new()),
            services: RwLock::new(HashMap::new()),
            clear_tx,
            clear_rx: Mutex::new(Some(clear_rx)),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Start the clear-signal watcher that tears down flow graphs of
    /// dropped collections.
    pub async fn start(self: &Arc<Self>) {
        let node = self.clone();
        let mut clear_rx = self
            .clear_rx
            .lock()
            .await
            .take()
            .expect("data node started twice");
        self.handles.lock().await.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(collection_id) = clear_rx.recv() => {
                        node.release_collection(collection_id).await;
                    }
                    _ = node.cancel.cancelled() => break,
                }
            }
        }));
        info!(node_id = self.config.node_id, "data node started");
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let services: Vec<Arc<DataSyncService>> =
            self.services.write().await.drain().map(|(_, s)| s).collect();
        for service in services {
            service.close().await;
        }
        for handle in self.handles.lock().await.drain(..) {
            handle.abort();
        }
        info!(node_id = self.config.node_id, "data node closed");
    }

    pub async fn service(&self, channel: &str) -> Option<Arc<DataSyncService>> {
        self.services.read().await.get(channel).cloned()
    }

    async fn release_collection(&self, collection_id: CollectionId) {
        let doomed: Vec<(String, Arc<DataSyncService>)> = {
            let mut services = self.services.write().await;
            let channels: Vec<String> = services
                .iter()
                .filter(|(_, s)| s.collection_id() == collection_id)
                .map(|(c, _)| c.clone())
                .collect();
            channels
                .into_iter()
                .filter_map(|c| services.remove(&c).map(|s| (c, s)))
                .collect()
        };
        for (channel, service) in doomed {
            info!(collection_id, channel = %channel, "releasing dropped collection's pipeline");
            service.close().await;
        }
    }

    async fn watch_one(&self, vchannel: &vectorstream_rpc::VchannelInfo) -> Result<()> {
        if let Some(stale) = self.services.write().await.remove(&vchannel.channel) {
            warn!(channel = %vchannel.channel, "re-watch replaces existing pipeline");
            stale.close().await;
        }
        let service = DataSyncService::start(
            self.config.clone(),
            vchannel,
            self.coord.clone(),
            self.allocator.clone(),
            self.store.clone(),
            self.factory.as_ref(),
            self.clear_tx.clone(),
            self.flushing_cache.clone(),
        )
        .await?;
        self.services
            .write()
            .await
            .insert(vchannel.channel.clone(), service);
        Ok(())
    }
}

#[async_trait]
impl DataNodeService for DataNode {
    async fn watch_dm_channels(&self, req: WatchDmChannelsRequest) -> Status {
        for vchannel in &req.vchannels {
            if let Err(e) = self.watch_one(vchannel).await {
                warn!(channel = %vchannel.channel, error = %e, "watch failed");
                return Status::error(e.to_string());
            }
        }
        Status::success()
    }

    async fn flush_segments(&self, req: FlushSegmentsRequest) -> Status {
        let services = self.services.read().await;
        for service in services.values() {
            if service.collection_id() != req.collection_id {
                continue;
            }
            let owned: Vec<_> = req
                .segment_ids
                .iter()
                .copied()
                .filter(|id| service.replica().has_segment(*id, false))
                .collect();
            let owned: Vec<_> = owned
                .into_iter()
                .filter(|id| !self.flushing_cache.contains(*id))
                .collect();
            if !owned.is_empty() {
                info!(channel = %service.channel(), segments = ?owned, "flush requested");
                service.flush_segments(&owned, req.flush_ts);
            }
        }
        Status::success()
    }

    async fn compaction(&self, plan: CompactionPlan) -> Status {
        let Some(service) = self.service(&plan.channel).await else {
            return Status::error(format!("channel {} is not served here", plan.channel));
        };
        let store = self.store.clone();
        let allocator = self.allocator.clone();
        let coord = self.coord.clone();
        let config = self.config.clone();
        let plan_id = plan.plan_id;
        tokio::spawn(async move {
            if let Err(e) =
                compactor::execute_plan(plan, service, store, allocator, coord, config).await
            {
                warn!(plan_id, error = %e, "compaction plan failed");
            }
        });
        Status::success()
    }
}
