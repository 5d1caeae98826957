//! Binlog wire format.
//!
//! A binlog is a write-once blob holding one column of one segment (insert
//! logs), or the delete deltas of one segment (delta logs). Every blob
//! starts with the same fixed header so a reader can validate what it
//! fetched before trusting the payload:
//!
//! ```text
//! magic      u32   0x56534C31 ("VSL1")
//! version    u8
//! kind       u8    1 = bytes column, 2 = i64 column, 3 = delta log
//! collection i64
//! partition  i64
//! segment    i64
//! field      i64   (0 for delta logs)
//! row_count  u32
//! payload    ...
//! ```
//!
//! Bytes columns store each value length-prefixed with a varint. i64
//! columns (row IDs, timestamps) store the first value raw and every
//! following value as the ZigZag varint of its delta. Delta logs store
//! `(primary key, timestamp)` pairs the same delta-encoded way.
//!
//! Stats logs are not binary: they are the JSON form of [`PkStatistics`],
//! kept human-readable so operators can inspect them in place.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::varint;
use crate::{CollectionId, Error, FieldId, PartitionId, Result, SegmentId, Timestamp};

const MAGIC: u32 = 0x5653_4C31;
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 1 + 8 * 4 + 4;

/// What a binlog blob contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogKind {
    BytesColumn = 1,
    Int64Column = 2,
    Delta = 3,
}

impl TryFrom<u8> for LogKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LogKind::BytesColumn),
            2 => Ok(LogKind::Int64Column),
            3 => Ok(LogKind::Delta),
            other => Err(Error::KindMismatch {
                expected: LogKind::BytesColumn,
                found: other,
            }),
        }
    }
}

/// Decoded binlog header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    pub kind: LogKind,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
    pub field_id: FieldId,
    pub row_count: u32,
}

fn put_header(buf: &mut BytesMut, header: &LogHeader) {
    buf.put_u32(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(header.kind as u8);
    buf.put_i64(header.collection_id);
    buf.put_i64(header.partition_id);
    buf.put_i64(header.segment_id);
    buf.put_i64(header.field_id);
    buf.put_u32(header.row_count);
}

fn read_header(buf: &mut impl Buf) -> Result<LogHeader> {
    if buf.remaining() < HEADER_LEN {
        return Err(Error::Truncated {
            expected: HEADER_LEN,
            remaining: buf.remaining(),
        });
    }
    let magic = buf.get_u32();
    if magic != MAGIC {
        return Err(Error::BadMagic(magic));
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let kind = LogKind::try_from(buf.get_u8())?;
    Ok(LogHeader {
        kind,
        collection_id: buf.get_i64(),
        partition_id: buf.get_i64(),
        segment_id: buf.get_i64(),
        field_id: buf.get_i64(),
        row_count: buf.get_u32(),
    })
}

/// Encode one variable-width field column.
pub fn encode_bytes_column(
    collection_id: CollectionId,
    partition_id: PartitionId,
    segment_id: SegmentId,
    field_id: FieldId,
    rows: &[Bytes],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + rows.iter().map(|r| r.len() + 2).sum::<usize>());
    put_header(
        &mut buf,
        &LogHeader {
            kind: LogKind::BytesColumn,
            collection_id,
            partition_id,
            segment_id,
            field_id,
            row_count: rows.len() as u32,
        },
    );
    for row in rows {
        varint::encode_u64(&mut buf, row.len() as u64);
        buf.put_slice(row);
    }
    buf.freeze()
}

/// Decode a variable-width field column.
pub fn decode_bytes_column(blob: &Bytes) -> Result<(LogHeader, Vec<Bytes>)> {
    let mut buf = blob.clone();
    let header = read_header(&mut buf)?;
    if header.kind != LogKind::BytesColumn {
        return Err(Error::KindMismatch {
            expected: LogKind::BytesColumn,
            found: header.kind as u8,
        });
    }
    let mut rows = Vec::with_capacity(header.row_count as usize);
    for _ in 0..header.row_count {
        let len = varint::decode_u64(&mut buf)? as usize;
        if buf.remaining() < len {
            return Err(Error::Truncated {
                expected: len,
                remaining: buf.remaining(),
            });
        }
        rows.push(buf.copy_to_bytes(len));
    }
    Ok((header, rows))
}

/// Encode a fixed-width i64 column (row IDs, timestamps), delta form.
pub fn encode_i64_column(
    collection_id: CollectionId,
    partition_id: PartitionId,
    segment_id: SegmentId,
    field_id: FieldId,
    values: &[i64],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + values.len() * 2 + 8);
    put_header(
        &mut buf,
        &LogHeader {
            kind: LogKind::Int64Column,
            collection_id,
            partition_id,
            segment_id,
            field_id,
            row_count: values.len() as u32,
        },
    );
    let mut prev = 0i64;
    for (idx, value) in values.iter().enumerate() {
        if idx == 0 {
            buf.put_i64(*value);
        } else {
            varint::encode_i64(&mut buf, value.wrapping_sub(prev));
        }
        prev = *value;
    }
    buf.freeze()
}

/// Decode a fixed-width i64 column.
pub fn decode_i64_column(blob: &Bytes) -> Result<(LogHeader, Vec<i64>)> {
    let mut buf = blob.clone();
    let header = read_header(&mut buf)?;
    if header.kind != LogKind::Int64Column {
        return Err(Error::KindMismatch {
            expected: LogKind::Int64Column,
            found: header.kind as u8,
        });
    }
    let mut values = Vec::with_capacity(header.row_count as usize);
    let mut prev = 0i64;
    for idx in 0..header.row_count {
        let value = if idx == 0 {
            if buf.remaining() < 8 {
                return Err(Error::Truncated {
                    expected: 8,
                    remaining: buf.remaining(),
                });
            }
            buf.get_i64()
        } else {
            prev.wrapping_add(varint::decode_i64(&mut buf)?)
        };
        values.push(value);
        prev = value;
    }
    Ok((header, values))
}

/// Encode the delete deltas of a segment: `(primary key, timestamp)` pairs.
pub fn encode_delta_log(
    collection_id: CollectionId,
    partition_id: PartitionId,
    segment_id: SegmentId,
    entries: &[(i64, Timestamp)],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + entries.len() * 4 + 16);
    put_header(
        &mut buf,
        &LogHeader {
            kind: LogKind::Delta,
            collection_id,
            partition_id,
            segment_id,
            field_id: 0,
            row_count: entries.len() as u32,
        },
    );
    let mut prev_pk = 0i64;
    let mut prev_ts = 0i64;
    for (idx, (pk, ts)) in entries.iter().enumerate() {
        let ts = *ts as i64;
        if idx == 0 {
            buf.put_i64(*pk);
            buf.put_i64(ts);
        } else {
            varint::encode_i64(&mut buf, pk.wrapping_sub(prev_pk));
            varint::encode_i64(&mut buf, ts.wrapping_sub(prev_ts));
        }
        prev_pk = *pk;
        prev_ts = ts;
    }
    buf.freeze()
}

/// Decode a delta log back into `(primary key, timestamp)` pairs.
pub fn decode_delta_log(blob: &Bytes) -> Result<(LogHeader, Vec<(i64, Timestamp)>)> {
    let mut buf = blob.clone();
    let header = read_header(&mut buf)?;
    if header.kind != LogKind::Delta {
        return Err(Error::KindMismatch {
            expected: LogKind::Delta,
            found: header.kind as u8,
        });
    }
    let mut entries = Vec::with_capacity(header.row_count as usize);
    let mut prev_pk = 0i64;
    let mut prev_ts = 0i64;
    for idx in 0..header.row_count {
        let (pk, ts) = if idx == 0 {
            if buf.remaining() < 16 {
                return Err(Error::Truncated {
                    expected: 16,
                    remaining: buf.remaining(),
                });
            }
            (buf.get_i64(), buf.get_i64())
        } else {
            (
                prev_pk.wrapping_add(varint::decode_i64(&mut buf)?),
                prev_ts.wrapping_add(varint::decode_i64(&mut buf)?),
            )
        };
        entries.push((pk, ts as Timestamp));
        prev_pk = pk;
        prev_ts = ts;
    }
    Ok((header, entries))
}

/// Primary-key statistics persisted as the segment's stats log (JSON).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkStatistics {
    pub row_count: i64,
    pub pk_min: i64,
    pub pk_max: i64,
}

impl PkStatistics {
    pub fn observe(&mut self, pk: i64) {
        if self.row_count == 0 {
            self.pk_min = pk;
            self.pk_max = pk;
        } else {
            self.pk_min = self.pk_min.min(pk);
            self.pk_max = self.pk_max.max(pk);
        }
        self.row_count += 1;
    }

    pub fn merge(&mut self, other: &PkStatistics) {
        if other.row_count == 0 {
            return;
        }
        if self.row_count == 0 {
            *self = other.clone();
            return;
        }
        self.pk_min = self.pk_min.min(other.pk_min);
        self.pk_max = self.pk_max.max(other.pk_max);
        self.row_count += other.row_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_column_roundtrip() {
        let rows = vec![Bytes::from_static(b"alpha"), Bytes::new(), Bytes::from(vec![7u8; 300])];
        let blob = encode_bytes_column(1, 2, 3, 100, &rows);
        let (header, decoded) = decode_bytes_column(&blob).unwrap();
        assert_eq!(header.segment_id, 3);
        assert_eq!(header.field_id, 100);
        assert_eq!(header.row_count, 3);
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_i64_column_delta_compresses_sequences() {
        let values: Vec<i64> = (1000..2000).collect();
        let blob = encode_i64_column(1, 2, 3, 0, &values);
        // First value raw, then one byte per delta of 1.
        assert!(blob.len() < values.len() * 8 / 4);
        let (_, decoded) = decode_i64_column(&blob).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_delta_log_roundtrip() {
        let entries = vec![(42i64, 100u64), (7, 105), (9000, 105)];
        let blob = encode_delta_log(1, 2, 3, &entries);
        let (header, decoded) = decode_delta_log(&blob).unwrap();
        assert_eq!(header.kind, LogKind::Delta);
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let blob = encode_i64_column(1, 2, 3, 0, &[1, 2, 3]);
        assert!(decode_bytes_column(&blob).is_err());
        assert!(decode_delta_log(&blob).is_err());
    }

    #[test]
    fn test_corrupt_magic_rejected() {
        let blob = encode_i64_column(1, 2, 3, 0, &[1]);
        let mut raw = blob.to_vec();
        raw[0] ^= 0xFF;
        assert!(matches!(
            decode_i64_column(&Bytes::from(raw)),
            Err(Error::BadMagic(_))
        ));
    }

    #[test]
    fn test_pk_statistics_observe_and_merge() {
        let mut a = PkStatistics::default();
        a.observe(10);
        a.observe(-3);
        let mut b = PkStatistics::default();
        b.observe(99);
        a.merge(&b);
        assert_eq!(a.row_count, 3);
        assert_eq!(a.pk_min, -3);
        assert_eq!(a.pk_max, 99);
    }
}
