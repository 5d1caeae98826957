//! Stream positions and logical timestamps.
//!
//! A [`Position`] is a cursor into one virtual channel of the write stream.
//! Positions on the same channel are totally ordered by `msg_id`; the
//! coordinator and the data nodes only ever compare positions of the same
//! channel. The logical [`Timestamp`] is a 64-bit value issued by the
//! timestamp allocator and is order-comparable process-wide.

use serde::{Deserialize, Serialize};

/// Logical timestamp issued by the timestamp allocator.
///
/// Hybrid layout: the upper bits carry wall-clock milliseconds, the low
/// [`TS_LOGICAL_BITS`] a per-millisecond counter, so timestamps are both
/// order-comparable and convertible back to coarse physical time.
pub type Timestamp = u64;

/// Low bits of a [`Timestamp`] reserved for the logical counter.
pub const TS_LOGICAL_BITS: u32 = 18;

/// Build a timestamp from wall-clock milliseconds and a logical counter.
pub fn compose_ts(physical_ms: i64, logical: u64) -> Timestamp {
    ((physical_ms as u64) << TS_LOGICAL_BITS) | (logical & ((1 << TS_LOGICAL_BITS) - 1))
}

/// Wall-clock milliseconds a timestamp was issued at.
pub fn ts_physical_ms(ts: Timestamp) -> i64 {
    (ts >> TS_LOGICAL_BITS) as i64
}

/// Shift a timestamp forward by wall-clock milliseconds.
pub fn ts_add_ms(ts: Timestamp, ms: i64) -> Timestamp {
    compose_ts(ts_physical_ms(ts) + ms, ts & ((1 << TS_LOGICAL_BITS) - 1))
}

/// Shift a timestamp backward by wall-clock milliseconds, saturating at 0.
pub fn ts_sub_ms(ts: Timestamp, ms: i64) -> Timestamp {
    compose_ts((ts_physical_ms(ts) - ms).max(0), ts & ((1 << TS_LOGICAL_BITS) - 1))
}

/// Cursor into a virtual channel of the message stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Virtual channel this position belongs to.
    pub channel: String,

    /// Opaque, monotonically increasing message ID within the channel.
    pub msg_id: u64,

    /// Logical timestamp of the message at this position.
    pub timestamp: Timestamp,
}

impl Position {
    pub fn new(channel: impl Into<String>, msg_id: u64, timestamp: Timestamp) -> Self {
        Self {
            channel: channel.into(),
            msg_id,
            timestamp,
        }
    }

    /// Key form of the message ID used to index in-flight flush tasks.
    pub fn msg_id_key(&self) -> u64 {
        self.msg_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_compose_roundtrip() {
        let ts = compose_ts(1_700_000_000_123, 42);
        assert_eq!(ts_physical_ms(ts), 1_700_000_000_123);
        assert_eq!(ts & ((1 << TS_LOGICAL_BITS) - 1), 42);
        assert_eq!(ts_physical_ms(ts_add_ms(ts, 5_000)), 1_700_000_005_123);
        assert_eq!(ts_physical_ms(ts_sub_ms(ts, 5_000)), 1_699_999_995_123);
    }

    #[test]
    fn test_position_ordering_by_msg_id() {
        let a = Position::new("ch-1", 3, 30);
        let b = Position::new("ch-1", 7, 70);
        assert!(a.msg_id < b.msg_id);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
