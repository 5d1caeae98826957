//! Per-segment mutable buffers filled by the flow graph.

use bytes::Bytes;
use std::collections::BTreeMap;

use vectorstream_core::codec::PkStatistics;
use vectorstream_core::{
    CollectionId, FieldId, InsertMessage, PartitionId, SegmentId, Timestamp,
};

use crate::error::{NodeError, Result};

/// Columnar accumulation of rows bound for one segment.
#[derive(Debug, Clone)]
pub struct InsertBuffer {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
    pub channel: String,

    pub row_ids: Vec<i64>,
    pub timestamps: Vec<Timestamp>,
    pub primary_keys: Vec<i64>,
    pub fields: BTreeMap<FieldId, Vec<Bytes>>,

    pub size_bytes: usize,
}

impl InsertBuffer {
    pub fn new(msg: &InsertMessage) -> Self {
        Self {
            collection_id: msg.collection_id,
            partition_id: msg.partition_id,
            segment_id: msg.segment_id,
            channel: msg.channel.clone(),
            row_ids: Vec::new(),
            timestamps: Vec::new(),
            primary_keys: Vec::new(),
            fields: BTreeMap::new(),
            size_bytes: 0,
        }
    }

    /// Append one message's rows; every column must stay aligned.
    pub fn append(&mut self, msg: &InsertMessage) -> Result<()> {
        let rows = msg.row_count();
        if msg.timestamps.len() != rows || msg.primary_keys.len() != rows {
            return Err(NodeError::ColumnMismatch(format!(
                "segment {}: {} row ids, {} timestamps, {} primary keys",
                msg.segment_id,
                rows,
                msg.timestamps.len(),
                msg.primary_keys.len()
            )));
        }
        for (field_id, column) in &msg.fields {
            if column.len() != rows {
                return Err(NodeError::ColumnMismatch(format!(
                    "segment {}: field {} has {} values for {} rows",
                    msg.segment_id,
                    field_id,
                    column.len(),
                    rows
                )));
            }
        }

        self.row_ids.extend_from_slice(&msg.row_ids);
        self.timestamps.extend_from_slice(&msg.timestamps);
        self.primary_keys.extend_from_slice(&msg.primary_keys);
        for (field_id, column) in &msg.fields {
            self.fields
                .entry(*field_id)
                .or_default()
                .extend(column.iter().cloned());
        }
        self.size_bytes += msg.estimated_size();
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.row_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }

    pub fn pk_statistics(&self) -> PkStatistics {
        let mut stats = PkStatistics::default();
        for pk in &self.primary_keys {
            stats.observe(*pk);
        }
        stats
    }
}

/// Buffered primary-key deletes of one segment.
#[derive(Debug, Clone)]
pub struct DeleteBuffer {
    pub segment_id: SegmentId,
    pub primary_keys: Vec<i64>,
    pub timestamps: Vec<Timestamp>,
    pub ts_from: Timestamp,
    pub ts_to: Timestamp,
}

impl DeleteBuffer {
    pub fn new(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            primary_keys: Vec::new(),
            timestamps: Vec::new(),
            ts_from: Timestamp::MAX,
            ts_to: 0,
        }
    }

    pub fn append(&mut self, pk: i64, ts: Timestamp) {
        self.primary_keys.push(pk);
        self.timestamps.push(ts);
        self.ts_from = self.ts_from.min(ts);
        self.ts_to = self.ts_to.max(ts);
    }

    pub fn entries(&self) -> Vec<(i64, Timestamp)> {
        self.primary_keys
            .iter()
            .copied()
            .zip(self.timestamps.iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.primary_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary_keys.is_empty()
    }
}
