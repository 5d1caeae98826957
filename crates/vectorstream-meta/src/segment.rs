//! Segment Meta Store
//!
//! The authoritative record of every segment's lifecycle. All reads are
//! served from an in-memory cache; every mutation is persisted through the
//! [`MetaKv`] first and only then applied to the cache, so a crash between
//! the two leaves the durable state ahead of (never behind) the cache.
//! The cache is rebuilt on startup with a full prefix scan.
//!
//! The flush-report update is the critical write: one report from a data
//! node folds new binlog paths, checkpoints, and start positions into a
//! single atomic multi-key commit together with the channel checkpoint.
//! Reports are idempotent: a retried report finds its paths already
//! present and its checkpoint already advanced, and changes nothing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use vectorstream_core::{
    CollectionId, FieldId, PartitionId, Position, SegmentId, Timestamp,
};

use crate::error::{MetaError, Result};
use crate::keys;
use crate::kv::MetaKv;

/// Lifecycle state of a segment.
///
/// Transitions move only forward on `Growing -> Sealed -> Flushing ->
/// Flushed`; `Dropped` is reachable from every state and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentState {
    Growing,
    Sealed,
    Flushing,
    Flushed,
    Dropped,
}

impl SegmentState {
    fn lattice_index(self) -> u8 {
        match self {
            SegmentState::Growing => 0,
            SegmentState::Sealed => 1,
            SegmentState::Flushing => 2,
            SegmentState::Flushed => 3,
            SegmentState::Dropped => 4,
        }
    }

    /// Whether a transition `self -> to` is legal. Forward jumps are
    /// allowed (a seal-and-flush report may skip `Sealed`); reversals
    /// never are, and nothing leaves `Dropped`.
    pub fn can_transition_to(self, to: SegmentState) -> bool {
        if self == SegmentState::Dropped {
            return to == SegmentState::Dropped;
        }
        to == SegmentState::Dropped || to.lattice_index() >= self.lattice_index()
    }

    /// Growing, Sealed and Flushing segments still own unflushed rows.
    pub fn is_unflushed(self) -> bool {
        matches!(
            self,
            SegmentState::Growing | SegmentState::Sealed | SegmentState::Flushing
        )
    }
}

/// Binlog paths of one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBinlog {
    pub field_id: FieldId,
    pub binlogs: Vec<String>,
}

/// Descriptor of one delete log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaLogInfo {
    pub record_entries: u64,
    pub timestamp_from: Timestamp,
    pub timestamp_to: Timestamp,
    pub delta_log_path: String,
    pub delta_log_size: u64,
}

/// How far a segment has consumed its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPoint {
    pub segment_id: SegmentId,
    pub num_rows: i64,
    pub position: Position,
}

/// First stream position of a freshly opened segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentStartPosition {
    pub segment_id: SegmentId,
    pub position: Position,
}

/// Persistent record of one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub insert_channel: String,

    pub state: SegmentState,
    pub num_rows: i64,
    pub max_rows: i64,

    pub start_position: Option<Position>,
    pub dml_position: Option<Position>,

    pub binlogs: Vec<FieldBinlog>,
    pub statslogs: Vec<FieldBinlog>,
    pub deltalogs: Vec<DeltaLogInfo>,

    pub compaction_from: Vec<SegmentId>,
    pub created_by_compaction: bool,

    /// Latest reservation expiry stamped by the segment allocator.
    pub last_expire_time: Timestamp,
}

impl SegmentInfo {
    pub fn new(
        id: SegmentId,
        collection_id: CollectionId,
        partition_id: PartitionId,
        insert_channel: impl Into<String>,
        max_rows: i64,
    ) -> Self {
        Self {
            id,
            collection_id,
            partition_id,
            insert_channel: insert_channel.into(),
            state: SegmentState::Growing,
            num_rows: 0,
            max_rows,
            start_position: None,
            dml_position: None,
            binlogs: Vec::new(),
            statslogs: Vec::new(),
            deltalogs: Vec::new(),
            compaction_from: Vec::new(),
            created_by_compaction: false,
            last_expire_time: 0,
        }
    }

    fn meta_key(&self) -> String {
        keys::segment_key(self.collection_id, self.partition_id, self.id)
    }

    fn encoded(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Arguments of the atomic flush-report update.
#[derive(Debug, Clone, Default)]
pub struct UpdateFlushInfo {
    pub flushed: bool,
    pub dropped: bool,
    pub binlogs: Vec<FieldBinlog>,
    pub statslogs: Vec<FieldBinlog>,
    pub deltalogs: Vec<DeltaLogInfo>,
    pub checkpoints: Vec<CheckPoint>,
    pub start_positions: Vec<SegmentStartPosition>,
}

/// In-memory cache + persistence for segment records and channel
/// checkpoints.
pub struct SegmentMeta {
    kv: Arc<dyn MetaKv>,
    state: RwLock<MetaState>,
}

struct MetaState {
    segments: HashMap<SegmentId, SegmentInfo>,
    channel_checkpoints: HashMap<String, Position>,
}

impl SegmentMeta {
    /// Open the store, rebuilding the cache from a full scan.
    pub async fn open(kv: Arc<dyn MetaKv>) -> Result<Self> {
        let mut segments = HashMap::new();
        for (key, value) in kv.load_with_prefix(keys::SEGMENT_PREFIX).await? {
            match serde_json::from_slice::<SegmentInfo>(&value) {
                Ok(info) => {
                    segments.insert(info.id, info);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable segment record"),
            }
        }
        let mut channel_checkpoints = HashMap::new();
        for (key, value) in kv.load_with_prefix(keys::CHANNEL_CP_PREFIX).await? {
            match serde_json::from_slice::<Position>(&value) {
                Ok(pos) => {
                    let channel = key.trim_start_matches(keys::CHANNEL_CP_PREFIX).to_string();
                    channel_checkpoints.insert(channel, pos);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable channel checkpoint"),
            }
        }
        info!(
            segments = segments.len(),
            channels = channel_checkpoints.len(),
            "segment meta cache rebuilt"
        );
        Ok(Self {
            kv,
            state: RwLock::new(MetaState {
                segments,
                channel_checkpoints,
            }),
        })
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    pub async fn get_segment(&self, id: SegmentId) -> Option<SegmentInfo> {
        self.state.read().await.segments.get(&id).cloned()
    }

    pub async fn list_segments(&self) -> Vec<SegmentInfo> {
        self.state.read().await.segments.values().cloned().collect()
    }

    pub async fn segments_of_channel(&self, channel: &str) -> Vec<SegmentInfo> {
        self.state
            .read()
            .await
            .segments
            .values()
            .filter(|s| s.insert_channel == channel)
            .cloned()
            .collect()
    }

    pub async fn segment_ids_of_collection(&self, collection_id: CollectionId) -> Vec<SegmentId> {
        let mut ids: Vec<_> = self
            .state
            .read()
            .await
            .segments
            .values()
            .filter(|s| s.collection_id == collection_id)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn segment_ids_of_partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> Vec<SegmentId> {
        let mut ids: Vec<_> = self
            .state
            .read()
            .await
            .segments
            .values()
            .filter(|s| s.collection_id == collection_id && s.partition_id == partition_id)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn num_rows_of_collection(&self, collection_id: CollectionId) -> i64 {
        self.state
            .read()
            .await
            .segments
            .values()
            .filter(|s| s.collection_id == collection_id && s.state != SegmentState::Dropped)
            .map(|s| s.num_rows)
            .sum()
    }

    pub async fn channel_checkpoint(&self, channel: &str) -> Option<Position> {
        self.state.read().await.channel_checkpoints.get(channel).cloned()
    }

    /// A channel still blocks removal while any non-compaction segment
    /// with a start position is alive on it.
    pub async fn channel_has_blocking_segments(&self, channel: &str) -> bool {
        self.state.read().await.segments.values().any(|s| {
            s.insert_channel == channel
                && s.start_position.is_some()
                && s.compaction_from.is_empty()
                && s.state != SegmentState::Dropped
        })
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    pub async fn add_segment(&self, info: SegmentInfo) -> Result<()> {
        let mut state = self.state.write().await;
        self.kv.save(&info.meta_key(), info.encoded()?).await?;
        debug!(
            segment_id = info.id,
            collection_id = info.collection_id,
            channel = %info.insert_channel,
            "segment added to meta"
        );
        state.segments.insert(info.id, info);
        Ok(())
    }

    /// Move one segment to `to`, enforcing the one-way lattice.
    pub async fn set_state(&self, id: SegmentId, to: SegmentState) -> Result<()> {
        let mut state = self.state.write().await;
        let seg = state
            .segments
            .get(&id)
            .ok_or(MetaError::SegmentNotFound(id))?;
        if !seg.state.can_transition_to(to) {
            return Err(MetaError::InvalidStateTransition {
                segment_id: id,
                from: seg.state,
                to,
            });
        }
        let mut updated = seg.clone();
        updated.state = to;
        self.kv.save(&updated.meta_key(), updated.encoded()?).await?;
        state.segments.insert(id, updated);
        Ok(())
    }

    /// Stamp the newest allocation expiry onto the segment record.
    pub async fn set_last_expire_time(&self, id: SegmentId, expire: Timestamp) -> Result<()> {
        let mut state = self.state.write().await;
        let seg = state
            .segments
            .get(&id)
            .ok_or(MetaError::SegmentNotFound(id))?;
        let mut updated = seg.clone();
        updated.last_expire_time = updated.last_expire_time.max(expire);
        self.kv.save(&updated.meta_key(), updated.encoded()?).await?;
        state.segments.insert(id, updated);
        Ok(())
    }

    /// Fold one flush report into meta: binlog paths, checkpoints, state
    /// change and the channel checkpoint, persisted as one atomic batch.
    pub async fn update_flush_segments_info(
        &self,
        segment_id: SegmentId,
        update: UpdateFlushInfo,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        let current = state
            .segments
            .get(&segment_id)
            .ok_or(MetaError::SegmentNotFound(segment_id))?;
        if current.state == SegmentState::Dropped {
            return Err(MetaError::StaleMeta(segment_id));
        }

        // Work on clones; nothing is visible until the KV commit lands.
        let mut modified: BTreeMap<SegmentId, SegmentInfo> = BTreeMap::new();
        let mut seg = current.clone();

        if update.flushed {
            if !seg.state.can_transition_to(SegmentState::Flushing) {
                return Err(MetaError::InvalidStateTransition {
                    segment_id,
                    from: seg.state,
                    to: SegmentState::Flushing,
                });
            }
            seg.state = SegmentState::Flushing;
        }
        if update.dropped {
            seg.state = SegmentState::Dropped;
        }

        merge_field_binlogs(&mut seg.binlogs, &update.binlogs);
        merge_field_binlogs(&mut seg.statslogs, &update.statslogs);
        for delta in &update.deltalogs {
            if !seg
                .deltalogs
                .iter()
                .any(|d| d.delta_log_path == delta.delta_log_path)
            {
                seg.deltalogs.push(delta.clone());
            }
        }

        let channel = seg.insert_channel.clone();
        modified.insert(segment_id, seg);

        // Checkpoints may reference sibling segments of the channel.
        for cp in &update.checkpoints {
            let target = modified
                .get(&cp.segment_id)
                .cloned()
                .or_else(|| state.segments.get(&cp.segment_id).cloned());
            let Some(mut target) = target else {
                warn!(segment_id = cp.segment_id, "checkpoint for unknown segment ignored");
                continue;
            };
            if target.state == SegmentState::Dropped {
                continue;
            }
            if let Some(dml) = &target.dml_position {
                if cp.position.msg_id <= dml.msg_id {
                    // Stale or replayed checkpoint; idempotent no-op.
                    continue;
                }
            }
            target.dml_position = Some(cp.position.clone());
            target.num_rows = target.num_rows.max(cp.num_rows);
            modified.insert(target.id, target);
        }

        for sp in &update.start_positions {
            let target = modified
                .get(&sp.segment_id)
                .cloned()
                .or_else(|| state.segments.get(&sp.segment_id).cloned());
            let Some(mut target) = target else {
                warn!(
                    segment_id = sp.segment_id,
                    "start position for unknown segment ignored"
                );
                continue;
            };
            if target.start_position.is_none() {
                target.start_position = Some(sp.position.clone());
                modified.insert(target.id, target);
            }
        }

        // Channel checkpoint: the earliest position any unflushed segment
        // of this channel still needs replayed.
        let new_cp = {
            let unflushed_min = state
                .segments
                .values()
                .filter(|s| s.insert_channel == channel)
                .map(|s| modified.get(&s.id).unwrap_or(s))
                .filter(|s| s.state.is_unflushed())
                .filter_map(|s| s.dml_position.as_ref().or(s.start_position.as_ref()))
                .min_by_key(|p| p.msg_id)
                .cloned();
            unflushed_min.or_else(|| {
                update
                    .checkpoints
                    .iter()
                    .find(|cp| cp.segment_id == segment_id)
                    .map(|cp| cp.position.clone())
            })
        };

        let mut saves: Vec<(String, Vec<u8>)> = Vec::with_capacity(modified.len() + 1);
        for seg in modified.values() {
            saves.push((seg.meta_key(), seg.encoded()?));
        }
        let mut cp_to_cache = None;
        if let Some(cp) = new_cp {
            let monotonic = state
                .channel_checkpoints
                .get(&channel)
                .map_or(true, |old| cp.msg_id >= old.msg_id);
            if monotonic {
                saves.push((keys::channel_cp_key(&channel), serde_json::to_vec(&cp)?));
                cp_to_cache = Some(cp);
            } else {
                warn!(channel = %channel, msg_id = cp.msg_id, "channel checkpoint would move backwards, keeping old");
            }
        }

        self.kv.multi_save(saves).await?;

        for (id, seg) in modified {
            state.segments.insert(id, seg);
        }
        if let Some(cp) = cp_to_cache {
            state.channel_checkpoints.insert(channel, cp);
        }
        Ok(())
    }

    /// Atomically publish a compaction result: the merged segment appears,
    /// every source is dropped, and the plan record is rewritten, all in
    /// one commit. Readers never observe a partial swap.
    pub async fn complete_compaction(
        &self,
        sources: &[SegmentId],
        result: SegmentInfo,
        plan_record: (String, Vec<u8>),
    ) -> Result<()> {
        let mut state = self.state.write().await;

        let mut saves: Vec<(String, Vec<u8>)> = Vec::new();
        let mut dropped: Vec<SegmentInfo> = Vec::new();
        for id in sources {
            let seg = state
                .segments
                .get(id)
                .ok_or(MetaError::SegmentNotFound(*id))?;
            let mut seg = seg.clone();
            seg.state = SegmentState::Dropped;
            saves.push((seg.meta_key(), seg.encoded()?));
            dropped.push(seg);
        }
        saves.push((result.meta_key(), result.encoded()?));
        saves.push(plan_record);

        self.kv.multi_save(saves).await?;

        for seg in dropped {
            state.segments.insert(seg.id, seg);
        }
        state.segments.insert(result.id, result);
        Ok(())
    }

    /// Record a freshly flushed segment for the external indexer.
    pub async fn save_handoff(&self, seg: &SegmentInfo) -> Result<()> {
        let key = keys::handoff_key(seg.collection_id, seg.partition_id, seg.id);
        self.kv.save(&key, seg.encoded()?).await?;
        Ok(())
    }
}

fn merge_field_binlogs(existing: &mut Vec<FieldBinlog>, incoming: &[FieldBinlog]) {
    for field in incoming {
        match existing.iter_mut().find(|f| f.field_id == field.field_id) {
            Some(entry) => {
                for path in &field.binlogs {
                    if !entry.binlogs.contains(path) {
                        entry.binlogs.push(path.clone());
                    }
                }
            }
            None => existing.push(field.clone()),
        }
    }
}
