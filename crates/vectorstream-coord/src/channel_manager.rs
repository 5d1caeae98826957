//! Channel Manager
//!
//! Assigns every virtual channel to exactly one live data node and drives
//! the per-channel watch state machine:
//!
//! ```text
//! Unassigned --watch(node)--> ToWatch --(ack)--> Watching
//! Watching   --node down----> ToWatch (new node chosen by reconcile)
//! Watching   --remove-------> Released --(ack)--> Unassigned
//! ```
//!
//! Assignment picks the least-loaded live node (load = channels it
//! watches or is acquiring). The outgoing owner of a channel is always
//! out of `Watching` before the incoming owner enters it, so at any
//! instant at most one node watches a channel; `match_node` is the fence
//! that rejects flush reports from evicted owners.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use vectorstream_core::{CollectionId, NodeId};
use vectorstream_meta::{SegmentMeta, SegmentState};
use vectorstream_rpc::{VchannelInfo, WatchDmChannelsRequest};

use crate::cluster::Cluster;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Unassigned,
    ToWatch,
    Watching,
    Released,
}

#[derive(Debug, Clone)]
struct ChannelEntry {
    collection_id: CollectionId,
    node: Option<NodeId>,
    state: WatchState,
}

pub struct ChannelManager {
    cluster: Arc<Cluster>,
    meta: Arc<SegmentMeta>,
    channels: RwLock<HashMap<String, ChannelEntry>>,
}

impl ChannelManager {
    pub fn new(cluster: Arc<Cluster>, meta: Arc<SegmentMeta>) -> Self {
        Self {
            cluster,
            meta,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// True only when `channel` is currently `Watching` on `node_id`.
    pub async fn match_node(&self, node_id: NodeId, channel: &str) -> bool {
        self.channels
            .read()
            .await
            .get(channel)
            .is_some_and(|e| e.state == WatchState::Watching && e.node == Some(node_id))
    }

    pub async fn watching_node(&self, channel: &str) -> Option<NodeId> {
        self.channels
            .read()
            .await
            .get(channel)
            .filter(|e| e.state == WatchState::Watching)
            .and_then(|e| e.node)
    }

    pub async fn watch_state(&self, channel: &str) -> Option<(WatchState, Option<NodeId>)> {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|e| (e.state, e.node))
    }

    /// Channels currently owned (or being acquired) per node.
    async fn node_load(&self) -> HashMap<NodeId, usize> {
        let channels = self.channels.read().await;
        let mut load = HashMap::new();
        for entry in channels.values() {
            if let Some(node) = entry.node {
                if matches!(entry.state, WatchState::Watching | WatchState::ToWatch) {
                    *load.entry(node).or_insert(0) += 1;
                }
            }
        }
        load
    }

    async fn pick_node(&self) -> Option<NodeId> {
        let live = self.cluster.live_nodes().await;
        if live.is_empty() {
            return None;
        }
        let load = self.node_load().await;
        live.into_iter()
            .min_by_key(|id| (load.get(id).copied().unwrap_or(0), *id))
    }

    /// Ensure the channel is watched on some live node. Idempotent; if no
    /// node is live the channel is parked `ToWatch` and picked up by the
    /// reconcile loop.
    pub async fn watch(&self, channel: &str, collection_id: CollectionId) -> Result<()> {
        {
            let mut channels = self.channels.write().await;
            match channels.get(channel) {
                Some(e) if matches!(e.state, WatchState::Watching | WatchState::ToWatch) => {
                    return Ok(())
                }
                _ => {}
            }
            channels.insert(
                channel.to_string(),
                ChannelEntry {
                    collection_id,
                    node: None,
                    state: WatchState::ToWatch,
                },
            );
        }
        self.try_assign(channel).await;
        Ok(())
    }

    /// Drop the channel mapping entirely. The outgoing owner leaves
    /// `Watching` (via `Released`) before the entry is removed, so a
    /// late flush report from it no longer matches.
    pub async fn remove_channel(&self, channel: &str) {
        let mut channels = self.channels.write().await;
        if let Some(entry) = channels.get_mut(channel) {
            if entry.state == WatchState::Watching {
                entry.state = WatchState::Released;
                info!(channel, node = ?entry.node, "channel released");
            }
            channels.remove(channel);
        }
    }

    /// Channels watched by one node move back to `ToWatch` when it dies.
    pub async fn on_node_down(&self, node_id: NodeId) {
        let mut reassign = Vec::new();
        {
            let mut channels = self.channels.write().await;
            for (name, entry) in channels.iter_mut() {
                if entry.node == Some(node_id) {
                    warn!(channel = %name, node_id, "owner died, channel back to ToWatch");
                    entry.state = WatchState::ToWatch;
                    entry.node = None;
                    reassign.push(name.clone());
                }
            }
        }
        for channel in reassign {
            self.try_assign(&channel).await;
        }
    }

    /// Reconcile pass: deregister dead nodes and re-home their channels,
    /// then retry any channel still waiting for a node.
    pub async fn reconcile(&self) {
        for node_id in self.cluster.dead_nodes().await {
            self.cluster.deregister(node_id).await;
            self.on_node_down(node_id).await;
        }
        let pending: Vec<String> = {
            let channels = self.channels.read().await;
            channels
                .iter()
                .filter(|(_, e)| e.state == WatchState::ToWatch)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for channel in pending {
            self.try_assign(&channel).await;
        }
    }

    /// Attempt one assignment round for a `ToWatch` channel.
    async fn try_assign(&self, channel: &str) {
        let collection_id = {
            let mut channels = self.channels.write().await;
            let Some(entry) = channels.get_mut(channel) else {
                return;
            };
            if entry.state != WatchState::ToWatch || entry.node.is_some() {
                return;
            }
            entry.collection_id
        };

        let Some(node_id) = self.pick_node().await else {
            debug!(channel, "no live node to watch channel");
            return;
        };
        {
            let mut channels = self.channels.write().await;
            let Some(entry) = channels.get_mut(channel) else {
                return;
            };
            if entry.state != WatchState::ToWatch {
                return;
            }
            entry.node = Some(node_id);
        }

        let Some(client) = self.cluster.client(node_id).await else {
            let mut channels = self.channels.write().await;
            if let Some(entry) = channels.get_mut(channel) {
                entry.node = None;
            }
            return;
        };

        let vchannel = self.build_vchannel_info(channel, collection_id).await;
        let status = client
            .watch_dm_channels(WatchDmChannelsRequest {
                vchannels: vec![vchannel],
            })
            .await;

        let mut channels = self.channels.write().await;
        let Some(entry) = channels.get_mut(channel) else {
            return;
        };
        if entry.state != WatchState::ToWatch || entry.node != Some(node_id) {
            return;
        }
        if status.is_success() {
            entry.state = WatchState::Watching;
            info!(channel, node_id, "channel watching");
        } else {
            warn!(channel, node_id, reason = %status.reason, "watch rejected, will retry");
            entry.node = None;
        }
    }

    /// Recovery view of one channel: resume position plus the segments
    /// the node must know about.
    pub async fn build_vchannel_info(
        &self,
        channel: &str,
        collection_id: CollectionId,
    ) -> VchannelInfo {
        let segments = self.meta.segments_of_channel(channel).await;
        let mut unflushed = Vec::new();
        let mut flushed = Vec::new();
        for seg in segments {
            if seg.collection_id != collection_id {
                continue;
            }
            match seg.state {
                SegmentState::Flushed => flushed.push(seg),
                s if s.is_unflushed() => unflushed.push(seg),
                _ => {}
            }
        }
        let seek_position = match self.meta.channel_checkpoint(channel).await {
            Some(cp) => Some(cp),
            None => unflushed
                .iter()
                .filter_map(|s| s.dml_position.as_ref().or(s.start_position.as_ref()))
                .min_by_key(|p| p.msg_id)
                .cloned(),
        };
        VchannelInfo {
            channel: channel.to_string(),
            collection_id,
            seek_position,
            unflushed_segments: unflushed,
            flushed_segments: flushed,
        }
    }
}
