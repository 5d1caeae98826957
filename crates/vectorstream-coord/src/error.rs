use thiserror::Error;
use vectorstream_core::{CollectionId, NodeId, PlanId, SegmentId};

pub type Result<T> = std::result::Result<T, CoordError>;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("collection {0} is not registered")]
    NoCollection(CollectionId),

    #[error("allocator unavailable: {0}")]
    AllocatorUnavailable(String),

    #[error(transparent)]
    Meta(#[from] vectorstream_meta::MetaError),

    #[error("no live data node available")]
    NoLiveNodes,

    #[error("data node {0} is not registered")]
    NodeNotFound(NodeId),

    #[error("channel {channel} is not watched on node {node_id}")]
    ChannelNotWatched { channel: String, node_id: NodeId },

    #[error("compaction is disabled")]
    CompactionDisabled,

    #[error("segment {segment_id} already part of compaction plan {plan_id}")]
    ConflictingCompaction {
        plan_id: PlanId,
        segment_id: SegmentId,
    },

    #[error("compaction plan {0} not found")]
    PlanNotFound(PlanId),

    #[error("compaction plan {plan_id} is {state}, refusing completion")]
    PlanNotExecuting { plan_id: PlanId, state: &'static str },

    #[error("server is not serving")]
    NotServing,
}

impl From<vectorstream_core::Error> for CoordError {
    fn from(e: vectorstream_core::Error) -> Self {
        CoordError::AllocatorUnavailable(e.to_string())
    }
}
