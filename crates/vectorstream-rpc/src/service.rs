//! Service traits implemented by the coordinator and the data nodes.
//!
//! Responses always carry a [`Status`]; transport-level failures are the
//! binding's concern. When a server is not healthy, every method returns
//! `serverNotServing` and performs no side effects.

use async_trait::async_trait;

use crate::messages::*;
use crate::status::Status;

/// RPCs served by the data coordinator.
#[async_trait]
pub trait DataCoordService: Send + Sync {
    /// Seal all growing segments of a collection; returns their IDs.
    /// Flushing itself happens asynchronously on the data nodes.
    async fn flush(&self, req: FlushRequest) -> FlushResponse;

    async fn assign_segment_id(&self, req: AssignSegmentIdRequest) -> AssignSegmentIdResponse;

    /// Accept one flush report from a data node. Rejected with
    /// `channel-not-watched` when the reporting node no longer owns the
    /// segment's channel.
    async fn save_binlog_paths(&self, req: SaveBinlogPathsRequest) -> Status;

    async fn get_segment_info(&self, req: GetSegmentInfoRequest) -> GetSegmentInfoResponse;

    async fn get_segment_states(&self, req: GetSegmentStatesRequest) -> GetSegmentStatesResponse;

    async fn get_insert_binlog_paths(
        &self,
        req: GetInsertBinlogPathsRequest,
    ) -> GetInsertBinlogPathsResponse;

    async fn get_collection_statistics(
        &self,
        req: GetCollectionStatisticsRequest,
    ) -> GetCollectionStatisticsResponse;

    async fn get_recovery_info(&self, req: GetRecoveryInfoRequest) -> GetRecoveryInfoResponse;

    async fn get_flushed_segments(
        &self,
        req: GetFlushedSegmentsRequest,
    ) -> GetFlushedSegmentsResponse;

    async fn watch_channels(&self, req: WatchChannelsRequest) -> WatchChannelsResponse;

    async fn manual_compaction(&self, req: ManualCompactionRequest) -> ManualCompactionResponse;

    async fn get_compaction_state(
        &self,
        req: GetCompactionStateRequest,
    ) -> GetCompactionStateResponse;

    async fn complete_compaction(&self, result: CompactionResult) -> Status;

    async fn get_component_states(&self) -> ComponentStates;
}

/// RPCs served by a data node, called by the coordinator.
#[async_trait]
pub trait DataNodeService: Send + Sync {
    /// Start (or resume) consuming the given virtual channels.
    async fn watch_dm_channels(&self, req: WatchDmChannelsRequest) -> Status;

    /// Flush the given sealed segments out of the node's buffers.
    async fn flush_segments(&self, req: FlushSegmentsRequest) -> Status;

    /// Execute a compaction plan; the node reports back through
    /// [`DataCoordService::complete_compaction`].
    async fn compaction(&self, plan: CompactionPlan) -> Status;
}

#[async_trait]
impl<T: DataCoordService + ?Sized> DataCoordService for std::sync::Arc<T> {
    async fn flush(&self, req: FlushRequest) -> FlushResponse {
        (**self).flush(req).await
    }

    async fn assign_segment_id(&self, req: AssignSegmentIdRequest) -> AssignSegmentIdResponse {
        (**self).assign_segment_id(req).await
    }

    async fn save_binlog_paths(&self, req: SaveBinlogPathsRequest) -> Status {
        (**self).save_binlog_paths(req).await
    }

    async fn get_segment_info(&self, req: GetSegmentInfoRequest) -> GetSegmentInfoResponse {
        (**self).get_segment_info(req).await
    }

    async fn get_segment_states(&self, req: GetSegmentStatesRequest) -> GetSegmentStatesResponse {
        (**self).get_segment_states(req).await
    }

    async fn get_insert_binlog_paths(
        &self,
        req: GetInsertBinlogPathsRequest,
    ) -> GetInsertBinlogPathsResponse {
        (**self).get_insert_binlog_paths(req).await
    }

    async fn get_collection_statistics(
        &self,
        req: GetCollectionStatisticsRequest,
    ) -> GetCollectionStatisticsResponse {
        (**self).get_collection_statistics(req).await
    }

    async fn get_recovery_info(&self, req: GetRecoveryInfoRequest) -> GetRecoveryInfoResponse {
        (**self).get_recovery_info(req).await
    }

    async fn get_flushed_segments(
        &self,
        req: GetFlushedSegmentsRequest,
    ) -> GetFlushedSegmentsResponse {
        (**self).get_flushed_segments(req).await
    }

    async fn watch_channels(&self, req: WatchChannelsRequest) -> WatchChannelsResponse {
        (**self).watch_channels(req).await
    }

    async fn manual_compaction(&self, req: ManualCompactionRequest) -> ManualCompactionResponse {
        (**self).manual_compaction(req).await
    }

    async fn get_compaction_state(
        &self,
        req: GetCompactionStateRequest,
    ) -> GetCompactionStateResponse {
        (**self).get_compaction_state(req).await
    }

    async fn complete_compaction(&self, result: CompactionResult) -> Status {
        (**self).complete_compaction(result).await
    }

    async fn get_component_states(&self) -> ComponentStates {
        (**self).get_component_states().await
    }
}

#[async_trait]
impl<T: DataNodeService + ?Sized> DataNodeService for std::sync::Arc<T> {
    async fn watch_dm_channels(&self, req: WatchDmChannelsRequest) -> Status {
        (**self).watch_dm_channels(req).await
    }

    async fn flush_segments(&self, req: FlushSegmentsRequest) -> Status {
        (**self).flush_segments(req).await
    }

    async fn compaction(&self, plan: CompactionPlan) -> Status {
        (**self).compaction(plan).await
    }
}
