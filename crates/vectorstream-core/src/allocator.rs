//! ID and timestamp allocation seam.
//!
//! Both the coordinator and the data nodes draw unique IDs (segment IDs,
//! binlog indexes, compaction plan IDs) and logical timestamps from the
//! same allocator. The trait is deliberately narrow so a remote TSO client
//! and the coordinator-local implementation are interchangeable.

use async_trait::async_trait;

use crate::{Result, Timestamp, UniqueId};

#[async_trait]
pub trait Allocator: Send + Sync {
    /// Allocate `count` contiguous IDs; returns the half-open range
    /// `(start, end)` with `end - start == count`.
    ///
    /// Fails with [`crate::Error::AllocatorUnavailable`] when the backing
    /// service cannot be reached; callers surface the error instead of
    /// stalling the flush pipeline.
    async fn alloc_id_batch(&self, count: u32) -> Result<(UniqueId, UniqueId)>;

    /// Allocate a single ID.
    async fn alloc_id(&self) -> Result<UniqueId> {
        let (start, _) = self.alloc_id_batch(1).await?;
        Ok(start)
    }

    /// Allocate one logical timestamp, monotonic across the process.
    async fn alloc_timestamp(&self) -> Result<Timestamp>;
}
