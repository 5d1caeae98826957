//! Request and response shapes of the RPC surface.

use serde::{Deserialize, Serialize};

use vectorstream_core::{
    CollectionId, NodeId, PartitionId, PlanId, Position, SegmentId, Timestamp,
};
use vectorstream_meta::{
    CheckPoint, DeltaLogInfo, FieldBinlog, SegmentInfo, SegmentStartPosition, SegmentState,
};

use crate::status::Status;

// ---------------------------------------------------------------
// Flush / assignment
// ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushRequest {
    pub collection_id: CollectionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushResponse {
    pub status: Status,
    pub collection_id: CollectionId,
    pub segment_ids: Vec<SegmentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentIdRequest {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub channel: String,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignSegmentIdRequest {
    pub requests: Vec<SegmentIdRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentIdAssignment {
    pub segment_id: SegmentId,
    pub channel: String,
    pub count: u32,
    pub expire_time: Timestamp,
    pub status: Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignSegmentIdResponse {
    pub status: Status,
    pub assignments: Vec<SegmentIdAssignment>,
}

// ---------------------------------------------------------------
// Flush reports
// ---------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveBinlogPathsRequest {
    pub source_node_id: NodeId,
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub flushed: bool,
    pub dropped: bool,
    pub field_binlogs: Vec<FieldBinlog>,
    pub field_statslogs: Vec<FieldBinlog>,
    pub deltalogs: Vec<DeltaLogInfo>,
    pub checkpoints: Vec<CheckPoint>,
    pub start_positions: Vec<SegmentStartPosition>,
}

// ---------------------------------------------------------------
// Segment inspection
// ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSegmentInfoRequest {
    pub segment_ids: Vec<SegmentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSegmentInfoResponse {
    pub status: Status,
    pub infos: Vec<SegmentInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSegmentStatesRequest {
    pub segment_ids: Vec<SegmentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentStateInfo {
    pub segment_id: SegmentId,
    pub state: Option<SegmentState>,
    pub start_position: Option<Position>,
    pub status: Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSegmentStatesResponse {
    pub status: Status,
    pub states: Vec<SegmentStateInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetInsertBinlogPathsRequest {
    pub segment_id: SegmentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetInsertBinlogPathsResponse {
    pub status: Status,
    pub field_ids: Vec<vectorstream_core::FieldId>,
    pub paths: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCollectionStatisticsRequest {
    pub collection_id: CollectionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCollectionStatisticsResponse {
    pub status: Status,
    pub row_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFlushedSegmentsRequest {
    pub collection_id: CollectionId,
    /// Negative = ignore the partition filter.
    pub partition_id: PartitionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFlushedSegmentsResponse {
    pub status: Status,
    pub segment_ids: Vec<SegmentId>,
}

// ---------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------

/// Everything a data node needs to resume one virtual channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VchannelInfo {
    pub channel: String,
    pub collection_id: CollectionId,
    pub seek_position: Option<Position>,
    pub unflushed_segments: Vec<SegmentInfo>,
    pub flushed_segments: Vec<SegmentInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentBinlogs {
    pub segment_id: SegmentId,
    pub num_rows: i64,
    pub field_binlogs: Vec<FieldBinlog>,
    pub statslogs: Vec<FieldBinlog>,
    pub deltalogs: Vec<DeltaLogInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRecoveryInfoRequest {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRecoveryInfoResponse {
    pub status: Status,
    pub binlogs: Vec<SegmentBinlogs>,
    pub channels: Vec<VchannelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchChannelsRequest {
    pub collection_id: CollectionId,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchChannelsResponse {
    pub status: Status,
}

// ---------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionPlanType {
    Merge,
    SingleMerge,
}

/// Plan pushed from the coordinator to the channel's data node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionPlan {
    pub plan_id: PlanId,
    pub plan_type: CompactionPlanType,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub channel: String,
    pub segment_ids: Vec<SegmentId>,
    /// Deletes at or below this timestamp are applied during the merge;
    /// newer ones are preserved as deltas of the result segment.
    pub timetravel: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionResult {
    pub plan_id: PlanId,
    pub segment_id: SegmentId,
    pub num_rows: i64,
    pub insert_logs: Vec<FieldBinlog>,
    pub statslogs: Vec<FieldBinlog>,
    pub deltalogs: Vec<DeltaLogInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualCompactionRequest {
    pub collection_id: CollectionId,
    pub timetravel: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualCompactionResponse {
    pub status: Status,
    pub compaction_id: PlanId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionStateCode {
    Executing,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCompactionStateRequest {
    pub compaction_id: PlanId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCompactionStateResponse {
    pub status: Status,
    pub state: CompactionStateCode,
    pub executing_plan_count: usize,
    pub completed_plan_count: usize,
    pub timeout_plan_count: usize,
}

// ---------------------------------------------------------------
// Component state
// ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateCode {
    Initializing,
    Healthy,
    Abnormal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStates {
    pub node_id: NodeId,
    pub role: String,
    pub state_code: StateCode,
    pub status: Status,
}

// ---------------------------------------------------------------
// Data-node RPCs
// ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchDmChannelsRequest {
    pub vchannels: Vec<VchannelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushSegmentsRequest {
    pub collection_id: CollectionId,
    pub segment_ids: Vec<SegmentId>,
    /// Rows of these segments were all produced before this timestamp;
    /// the node flushes once its consumed time tick passes it.
    pub flush_ts: Timestamp,
}
