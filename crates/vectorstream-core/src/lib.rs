pub mod allocator;
pub mod codec;
pub mod error;
pub mod message;
pub mod position;
pub mod varint;

pub use allocator::Allocator;
pub use error::{Error, Result};
pub use message::{DeleteMessage, InsertMessage, MsgBatch, StreamMessage};
pub use position::{compose_ts, ts_add_ms, ts_physical_ms, ts_sub_ms, Position, Timestamp};

/// Globally unique 64-bit identifier, allocated by the coordinator's
/// ID allocator. Collections, partitions, segments, fields and log
/// indexes all draw from the same ID space.
pub type UniqueId = i64;

pub type CollectionId = UniqueId;
pub type PartitionId = UniqueId;
pub type SegmentId = UniqueId;
pub type FieldId = UniqueId;
pub type NodeId = UniqueId;
pub type PlanId = UniqueId;

/// Field ID reserved for the row-ID pseudo column in binlogs.
pub const ROW_ID_FIELD: FieldId = 0;
/// Field ID reserved for the timestamp pseudo column in binlogs.
pub const TIMESTAMP_FIELD: FieldId = 1;
/// Field ID reserved for the primary-key column in binlogs and stats.
pub const PRIMARY_KEY_FIELD: FieldId = 2;
/// First ID usable for user-declared fields.
pub const START_USER_FIELD: FieldId = 100;
