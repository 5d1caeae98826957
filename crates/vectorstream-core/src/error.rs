use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("binlog truncated: expected {expected} more bytes, {remaining} left")]
    Truncated { expected: usize, remaining: usize },

    #[error("bad binlog magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported binlog version: {0}")]
    UnsupportedVersion(u8),

    #[error("binlog kind mismatch: expected {expected:?}, found {found}")]
    KindMismatch { expected: crate::codec::LogKind, found: u8 },

    #[error("column length mismatch: {field} has {rows} rows, batch has {expected}")]
    ColumnLengthMismatch {
        field: crate::FieldId,
        rows: usize,
        expected: usize,
    },

    #[error("varint overflows 64 bits")]
    VarintOverflow,

    #[error("allocator unavailable: {0}")]
    AllocatorUnavailable(String),
}
