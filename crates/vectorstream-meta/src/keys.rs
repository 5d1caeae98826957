//! Meta KV key layout.
//!
//! ```text
//! segment/{collectionID}/{partitionID}/{segmentID}   serialized SegmentInfo
//! channel-cp/{channel}                               last committed Position
//! compaction-plan/{planID}                           serialized plan state
//! handoff/{collectionID}/{partitionID}/{segmentID}   segment awaiting index
//! allocator/id-high-water                            ID allocator window mark
//! allocator/ts-high-water                            timestamp allocator mark
//! ```

use vectorstream_core::{CollectionId, PartitionId, PlanId, SegmentId};

pub const SEGMENT_PREFIX: &str = "segment/";
pub const CHANNEL_CP_PREFIX: &str = "channel-cp/";
pub const COMPACTION_PLAN_PREFIX: &str = "compaction-plan/";
pub const HANDOFF_PREFIX: &str = "handoff/";
pub const ALLOC_ID_KEY: &str = "allocator/id-high-water";
pub const ALLOC_TS_KEY: &str = "allocator/ts-high-water";

pub fn segment_key(collection_id: CollectionId, partition_id: PartitionId, segment_id: SegmentId) -> String {
    format!("{SEGMENT_PREFIX}{collection_id}/{partition_id}/{segment_id}")
}

pub fn channel_cp_key(channel: &str) -> String {
    format!("{CHANNEL_CP_PREFIX}{channel}")
}

pub fn compaction_plan_key(plan_id: PlanId) -> String {
    format!("{COMPACTION_PLAN_PREFIX}{plan_id}")
}

pub fn handoff_key(collection_id: CollectionId, partition_id: PartitionId, segment_id: SegmentId) -> String {
    format!("{HANDOFF_PREFIX}{collection_id}/{partition_id}/{segment_id}")
}
