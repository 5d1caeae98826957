//! Segment compaction executor.
//!
//! Merges the source segments of a plan into one new segment: reads
//! their binlogs, applies every delete at or below the plan's timetravel
//! bound, concatenates the surviving rows in stream order, and writes
//! the merged binlogs under a freshly allocated segment ID. Deletes
//! newer than the bound are preserved as a delta log of the result so
//! visibility at the bound is unchanged.
//!
//! Before touching any data the executor takes an injection barrier on
//! every source segment, so no flush can interleave with the merge; the
//! barrier is released before the result is reported.

use bytes::Bytes;
use object_store::ObjectStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use vectorstream_core::{
    codec, Allocator, FieldId, SegmentId, Timestamp, PRIMARY_KEY_FIELD, ROW_ID_FIELD,
    START_USER_FIELD, TIMESTAMP_FIELD,
};
use vectorstream_meta::{DeltaLogInfo, FieldBinlog, SegmentInfo};
use vectorstream_rpc::{
    CompactionPlan, CompactionResult, DataCoordService, GetSegmentInfoRequest,
};

use crate::config::NodeConfig;
use crate::data_sync::DataSyncService;
use crate::error::{NodeError, Result};
use crate::metrics;
use crate::retry;

#[derive(Default)]
struct MergedRows {
    row_ids: Vec<i64>,
    timestamps: Vec<i64>,
    primary_keys: Vec<i64>,
    fields: BTreeMap<FieldId, Vec<Bytes>>,
}

pub async fn execute_plan(
    plan: CompactionPlan,
    service: Arc<DataSyncService>,
    store: Arc<dyn ObjectStore>,
    allocator: Arc<dyn Allocator>,
    coord: Arc<dyn DataCoordService>,
    config: NodeConfig,
) -> Result<()> {
    info!(
        plan_id = plan.plan_id,
        segments = ?plan.segment_ids,
        timetravel = plan.timetravel,
        "executing compaction plan"
    );

    // Barrier first: no flush may interleave with the merge.
    let handles = service
        .flush_manager()
        .inject_flush(&plan.segment_ids, None)
        .await;
    let mut held = Vec::with_capacity(handles.len());
    for mut handle in handles {
        if !handle.wait_injected().await {
            return Err(NodeError::Storage(format!(
                "flush barrier lost on segment {}",
                handle.segment_id()
            )));
        }
        held.push(handle);
    }

    let merge = merge_sources(&plan, &store, &coord).await;
    // Release the barrier before reporting; the merged data is written.
    let (merged, preserved_deletes, sources) = match merge {
        Ok(parts) => parts,
        Err(e) => {
            for handle in held {
                handle.release();
            }
            return Err(e);
        }
    };

    let result_segment = allocator.alloc_id().await?;
    let (insert_logs, statslogs, deltalogs) = write_result(
        &plan,
        result_segment,
        &merged,
        &preserved_deletes,
        &store,
        &allocator,
        &config,
    )
    .await?;

    for handle in held {
        handle.release();
    }

    let result = CompactionResult {
        plan_id: plan.plan_id,
        segment_id: result_segment,
        num_rows: merged.row_ids.len() as i64,
        insert_logs,
        statslogs,
        deltalogs,
    };
    info!(
        plan_id = plan.plan_id,
        result_segment,
        num_rows = result.num_rows,
        sources = ?sources,
        "compaction merge written, reporting"
    );

    let mut backoff = config.retry.initial_backoff;
    loop {
        let status = coord.complete_compaction(result.clone()).await;
        if status.is_success() {
            break;
        }
        if status.is_retryable() {
            warn!(plan_id = plan.plan_id, reason = %status.reason, "completion rejected, retrying");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(config.retry.max_backoff);
            continue;
        }
        return Err(NodeError::Storage(format!(
            "compaction completion refused: {}",
            status.reason
        )));
    }
    metrics::COMPACTIONS_TOTAL.inc();
    Ok(())
}

async fn merge_sources(
    plan: &CompactionPlan,
    store: &Arc<dyn ObjectStore>,
    coord: &Arc<dyn DataCoordService>,
) -> Result<(MergedRows, Vec<(i64, Timestamp)>, Vec<SegmentId>)> {
    let response = coord
        .get_segment_info(GetSegmentInfoRequest {
            segment_ids: plan.segment_ids.clone(),
        })
        .await;
    if !response.status.is_success() {
        return Err(NodeError::Storage(format!(
            "cannot resolve plan sources: {}",
            response.status.reason
        )));
    }

    // Collect all deletes; split at the timetravel bound.
    let mut delete_ceiling: HashMap<i64, Timestamp> = HashMap::new();
    let mut preserved: Vec<(i64, Timestamp)> = Vec::new();
    for info in &response.infos {
        for delta in &info.deltalogs {
            let blob = fetch(store, &delta.delta_log_path).await?;
            let (_, entries) = codec::decode_delta_log(&blob)?;
            for (pk, ts) in entries {
                if ts <= plan.timetravel {
                    let slot = delete_ceiling.entry(pk).or_insert(ts);
                    *slot = (*slot).max(ts);
                } else {
                    preserved.push((pk, ts));
                }
            }
        }
    }

    let mut merged = MergedRows::default();
    for info in &response.infos {
        let rows = read_segment_rows(store, info).await?;
        let count = rows.row_ids.len();
        for idx in 0..count {
            let pk = rows.primary_keys[idx];
            let ts = rows.timestamps[idx];
            if let Some(deleted_at) = delete_ceiling.get(&pk) {
                if (ts as Timestamp) <= *deleted_at {
                    continue;
                }
            }
            merged.row_ids.push(rows.row_ids[idx]);
            merged.timestamps.push(ts);
            merged.primary_keys.push(pk);
            for (field_id, column) in &rows.fields {
                merged
                    .fields
                    .entry(*field_id)
                    .or_default()
                    .push(column[idx].clone());
            }
        }
    }

    let sources = response.infos.iter().map(|s| s.id).collect();
    Ok((merged, preserved, sources))
}

async fn read_segment_rows(store: &Arc<dyn ObjectStore>, info: &SegmentInfo) -> Result<MergedRows> {
    let mut rows = MergedRows::default();
    for field in &info.binlogs {
        for path in &field.binlogs {
            let blob = fetch(store, path).await?;
            if field.field_id < START_USER_FIELD {
                let (_, values) = codec::decode_i64_column(&blob)?;
                match field.field_id {
                    ROW_ID_FIELD => rows.row_ids.extend(values),
                    TIMESTAMP_FIELD => rows.timestamps.extend(values),
                    PRIMARY_KEY_FIELD => rows.primary_keys.extend(values),
                    other => {
                        warn!(field_id = other, "unknown system column ignored")
                    }
                }
            } else {
                let (_, values) = codec::decode_bytes_column(&blob)?;
                rows.fields.entry(field.field_id).or_default().extend(values);
            }
        }
    }
    if rows.timestamps.len() != rows.row_ids.len()
        || rows.primary_keys.len() != rows.row_ids.len()
        || rows.fields.values().any(|c| c.len() != rows.row_ids.len())
    {
        return Err(NodeError::ColumnMismatch(format!(
            "segment {} binlogs are not aligned",
            info.id
        )));
    }
    Ok(rows)
}

async fn write_result(
    plan: &CompactionPlan,
    segment_id: SegmentId,
    merged: &MergedRows,
    preserved_deletes: &[(i64, Timestamp)],
    store: &Arc<dyn ObjectStore>,
    allocator: &Arc<dyn Allocator>,
    config: &NodeConfig,
) -> Result<(Vec<FieldBinlog>, Vec<FieldBinlog>, Vec<DeltaLogInfo>)> {
    let collection_id = plan.collection_id;
    let partition_id = plan.partition_id;

    // Three system columns, the user fields, and one delta log slot.
    let column_count = 3 + merged.fields.len() + 1;
    let (start, _) = allocator.alloc_id_batch(column_count as u32).await?;
    let mut logidx = start;
    let mut blobs: Vec<(String, Bytes)> = Vec::new();
    let mut insert_logs: Vec<FieldBinlog> = Vec::new();

    let mut push_column = |blobs: &mut Vec<(String, Bytes)>,
                           insert_logs: &mut Vec<FieldBinlog>,
                           field_id: FieldId,
                           blob: Bytes,
                           idx: i64| {
        let path = format!(
            "{}/{collection_id}/{partition_id}/{segment_id}/{field_id}/{idx}",
            config.insert_log_root
        );
        insert_logs.push(FieldBinlog {
            field_id,
            binlogs: vec![path.clone()],
        });
        blobs.push((path, blob));
    };

    push_column(
        &mut blobs,
        &mut insert_logs,
        ROW_ID_FIELD,
        codec::encode_i64_column(collection_id, partition_id, segment_id, ROW_ID_FIELD, &merged.row_ids),
        logidx,
    );
    logidx += 1;
    push_column(
        &mut blobs,
        &mut insert_logs,
        TIMESTAMP_FIELD,
        codec::encode_i64_column(collection_id, partition_id, segment_id, TIMESTAMP_FIELD, &merged.timestamps),
        logidx,
    );
    logidx += 1;
    let pk_logidx = logidx;
    push_column(
        &mut blobs,
        &mut insert_logs,
        PRIMARY_KEY_FIELD,
        codec::encode_i64_column(collection_id, partition_id, segment_id, PRIMARY_KEY_FIELD, &merged.primary_keys),
        logidx,
    );
    logidx += 1;
    for (field_id, column) in &merged.fields {
        push_column(
            &mut blobs,
            &mut insert_logs,
            *field_id,
            codec::encode_bytes_column(collection_id, partition_id, segment_id, *field_id, column),
            logidx,
        );
        logidx += 1;
    }

    let mut stats = codec::PkStatistics::default();
    for pk in &merged.primary_keys {
        stats.observe(*pk);
    }
    let stats_path = format!(
        "{}/{collection_id}/{partition_id}/{segment_id}/{PRIMARY_KEY_FIELD}/{pk_logidx}",
        config.stats_log_root
    );
    let statslogs = vec![FieldBinlog {
        field_id: PRIMARY_KEY_FIELD,
        binlogs: vec![stats_path.clone()],
    }];
    blobs.push((
        stats_path,
        Bytes::from(serde_json::to_vec(&stats).unwrap_or_default()),
    ));

    let mut deltalogs = Vec::new();
    if !preserved_deletes.is_empty() {
        let blob = codec::encode_delta_log(collection_id, partition_id, segment_id, preserved_deletes);
        let path = format!(
            "{}/{collection_id}/{partition_id}/{segment_id}/{logidx}",
            config.delta_log_root
        );
        let ts_from = preserved_deletes.iter().map(|(_, ts)| *ts).min().unwrap_or(0);
        let ts_to = preserved_deletes.iter().map(|(_, ts)| *ts).max().unwrap_or(0);
        deltalogs.push(DeltaLogInfo {
            record_entries: preserved_deletes.len() as u64,
            timestamp_from: ts_from,
            timestamp_to: ts_to,
            delta_log_path: path.clone(),
            delta_log_size: blob.len() as u64,
        });
        blobs.push((path, blob));
    }

    for (path, data) in blobs {
        let location = object_store::path::Path::from(path.as_str());
        retry::retry(&config.retry, "compaction upload", || {
            let data = data.clone();
            let location = location.clone();
            let store = store.clone();
            async move { store.put(&location, data.into()).await }
        })
        .await
        .map_err(|e| NodeError::Storage(format!("compaction upload to {path} failed: {e}")))?;
    }

    Ok((insert_logs, statslogs, deltalogs))
}

async fn fetch(store: &Arc<dyn ObjectStore>, path: &str) -> Result<Bytes> {
    let location = object_store::path::Path::from(path);
    let result = store.get(&location).await?;
    Ok(result.bytes().await?)
}
