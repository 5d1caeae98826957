use thiserror::Error;
use vectorstream_core::SegmentId;

use crate::segment::SegmentState;

pub type Result<T> = std::result::Result<T, MetaError>;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("segment {0} not found in meta")]
    SegmentNotFound(SegmentId),

    /// The segment was dropped; the caller is operating on stale meta.
    #[error("segment {0} is dropped, refusing stale update")]
    StaleMeta(SegmentId),

    #[error("segment {segment_id}: illegal state transition {from:?} -> {to:?}")]
    InvalidStateTransition {
        segment_id: SegmentId,
        from: SegmentState,
        to: SegmentState,
    },

    #[error("meta storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("compare-and-swap conflict on key {0}")]
    CasConflict(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for MetaError {
    fn from(e: sqlx::Error) -> Self {
        MetaError::StorageUnavailable(e.to_string())
    }
}
