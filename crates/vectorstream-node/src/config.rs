//! Data node configuration: one immutable record handed to every
//! constructor.

use std::time::Duration;
use vectorstream_core::NodeId;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,

    /// Bound of every flow-graph queue.
    pub max_queue_length: usize,
    /// Upper bound on concurrent batches inside one node. Batches are
    /// processed in order; this caps read-ahead, not reordering.
    pub max_parallelism: usize,

    /// Insert buffer auto-flush threshold, bytes per segment.
    pub flush_buffer_bytes: usize,

    /// Object-store path roots.
    pub insert_log_root: String,
    pub stats_log_root: String,
    pub delta_log_root: String,

    /// Depth of the per-segment injection queue.
    pub inject_queue_depth: usize,

    /// Drain deadline when closing a flow graph.
    pub graceful_shutdown: Duration,

    pub retry: RetryConfig,
}

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// `None` = retry forever (flush reports must eventually land).
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 100,
            max_queue_length: 1024,
            max_parallelism: 1024,
            flush_buffer_bytes: 16 << 20,
            insert_log_root: "insert_log".to_string(),
            stats_log_root: "stats_log".to_string(),
            delta_log_root: "delta_log".to_string(),
            inject_queue_depth: 100,
            graceful_shutdown: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}
