//! Message batches delivered by the virtual-channel stream.
//!
//! The stream transport is an external collaborator; these are the shapes
//! the data node's flow graph consumes. A [`MsgBatch`] carries the messages
//! read since the previous batch, the time tick that closes the batch, and
//! the stream position of its last message.
//!
//! Insert messages arrive pre-routed: the producer obtained a segment
//! assignment from the coordinator (`AssignSegmentID`) and stamped every
//! row batch with the target segment. The flow graph never re-routes rows;
//! it only buffers them per segment.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{CollectionId, FieldId, PartitionId, Position, SegmentId, Timestamp};

/// One columnar batch of rows bound for a single segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertMessage {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
    pub channel: String,

    /// Row IDs, one per row.
    pub row_ids: Vec<i64>,
    /// Logical timestamps, one per row.
    pub timestamps: Vec<Timestamp>,
    /// Primary keys, one per row.
    pub primary_keys: Vec<i64>,
    /// Field columns; every column must have exactly one value per row.
    pub fields: BTreeMap<FieldId, Vec<Bytes>>,
}

impl InsertMessage {
    pub fn row_count(&self) -> usize {
        self.row_ids.len()
    }

    /// Rough payload size, used by the insert buffer to decide auto flush.
    pub fn estimated_size(&self) -> usize {
        let column_bytes: usize = self
            .fields
            .values()
            .map(|col| col.iter().map(Bytes::len).sum::<usize>())
            .sum();
        column_bytes + self.row_count() * (8 + 8 + 8)
    }
}

/// Primary-key deletes for a collection, not yet bucketed per segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteMessage {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub channel: String,

    pub primary_keys: Vec<i64>,
    pub timestamps: Vec<Timestamp>,
}

/// A single logical message on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamMessage {
    Insert(InsertMessage),
    Delete(DeleteMessage),
    DropCollection(CollectionId),
    DropPartition {
        collection_id: CollectionId,
        partition_id: PartitionId,
    },
}

/// Ordered batch of messages closed by a time tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgBatch {
    pub messages: Vec<StreamMessage>,

    /// Every message with timestamp <= `timetick` has been delivered.
    pub timetick: Timestamp,

    /// Position of the last message folded into this batch.
    pub position: Position,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_message_size_estimate_counts_all_columns() {
        let mut fields = BTreeMap::new();
        fields.insert(100, vec![Bytes::from(vec![0u8; 16]), Bytes::from(vec![0u8; 16])]);
        let msg = InsertMessage {
            collection_id: 1,
            partition_id: 2,
            segment_id: 3,
            channel: "ch-0".into(),
            row_ids: vec![1, 2],
            timestamps: vec![10, 11],
            primary_keys: vec![100, 101],
            fields,
        };
        assert_eq!(msg.row_count(), 2);
        // 32 payload bytes plus 24 bytes of per-row fixed columns.
        assert_eq!(msg.estimated_size(), 32 + 48);
    }
}
