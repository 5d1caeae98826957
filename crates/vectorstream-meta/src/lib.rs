pub mod error;
pub mod keys;
pub mod kv;
pub mod segment;
pub mod sqlite;

pub use error::{MetaError, Result};
pub use kv::{MemoryMetaKv, MetaKv};
pub use segment::{
    CheckPoint, DeltaLogInfo, FieldBinlog, SegmentInfo, SegmentMeta, SegmentStartPosition,
    SegmentState, UpdateFlushInfo,
};
pub use sqlite::SqliteMetaKv;
