//! Coordinator configuration.
//!
//! One immutable record passed to every constructor; nothing reads
//! ambient globals.

use std::time::Duration;
use vectorstream_core::NodeId;

#[derive(Debug, Clone)]
pub struct CoordConfig {
    pub node_id: NodeId,

    /// Seal a growing segment once its (estimated) row count reaches this.
    pub seal_rows: i64,
    /// Seal once the estimated byte size reaches this.
    pub seal_bytes: u64,
    /// Bytes-per-row estimate used for the size policy.
    pub estimated_row_bytes: u64,
    /// Seal a segment that has rows but saw no allocation for this long.
    pub idle_seal: Duration,
    /// How often the seal policy scans growing segments.
    pub seal_check_interval: Duration,

    /// Lifetime of one row-capacity reservation.
    pub allocation_ttl: Duration,
    /// Fallback segment capacity for collections without their own policy.
    pub default_max_rows_per_segment: i64,

    /// A node whose last heartbeat is older than this is dead.
    pub node_stale_after: Duration,
    /// How often channel assignments are reconciled against liveness.
    pub liveness_check_interval: Duration,

    pub enable_compaction: bool,
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// How often the periodic merge trigger scans flushed segments.
    pub check_interval: Duration,
    /// Executing plans older than this move to Timeout.
    pub plan_timeout: Duration,
    /// Merge plans need at least this many source segments.
    pub min_merge_segments: usize,
    /// And at most this many.
    pub max_merge_segments: usize,
    /// A flushed segment is "small" below this fraction of its max rows.
    pub small_segment_ratio: f64,
    /// Per-segment trigger fires once deltalog entries reach this
    /// fraction of the segment's rows; the boundary itself triggers.
    pub delete_ratio: f64,
    /// Lower bound window for timetravel on automatic triggers.
    pub retention: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(600),
            plan_timeout: Duration::from_secs(120),
            min_merge_segments: 2,
            max_merge_segments: 10,
            small_segment_ratio: 0.5,
            delete_ratio: 0.2,
            retention: Duration::from_secs(3600),
        }
    }
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            seal_rows: 1 << 20,
            seal_bytes: 512 << 20,
            estimated_row_bytes: 512,
            idle_seal: Duration::from_secs(600),
            seal_check_interval: Duration::from_millis(200),
            allocation_ttl: Duration::from_secs(2 * 3600),
            default_max_rows_per_segment: 1 << 20,
            node_stale_after: Duration::from_secs(60),
            liveness_check_interval: Duration::from_secs(5),
            enable_compaction: true,
            compaction: CompactionConfig::default(),
        }
    }
}
