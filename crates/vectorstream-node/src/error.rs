use thiserror::Error;
use vectorstream_core::SegmentId;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("segment {0} not found in replica")]
    SegmentNotFound(SegmentId),

    #[error("object storage error: {0}")]
    Storage(String),

    /// Codec or allocator failure surfaced from the core crate.
    #[error(transparent)]
    Core(#[from] vectorstream_core::Error),

    #[error("stream closed for channel {0}")]
    StreamClosed(String),

    #[error("channel {0} is not served by this node")]
    ChannelNotServed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("column mismatch in insert batch: {0}")]
    ColumnMismatch(String),
}

impl From<object_store::Error> for NodeError {
    fn from(e: object_store::Error) -> Self {
        NodeError::Storage(e.to_string())
    }
}
