//! End-to-end write-path scenarios: a real coordinator and data node
//! wired through the in-memory message bus and object store.

use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vectorstream_coord::{CollectionInfo, CoordConfig, DataCoordServer};
use vectorstream_core::{
    codec, Allocator, CollectionId, InsertMessage, PartitionId, SegmentId, StreamMessage,
    PRIMARY_KEY_FIELD,
};
use vectorstream_meta::{MemoryMetaKv, MetaKv, SegmentState};
use vectorstream_node::{DataNode, MemoryMsgBus, NodeConfig};
use vectorstream_rpc::*;

const COLLECTION: CollectionId = 42;
const PARTITION: PartitionId = 7;
const CHANNEL: &str = "by-dev-c1";

struct TestBed {
    kv: Arc<MemoryMetaKv>,
    server: Arc<DataCoordServer>,
    coord: Arc<dyn DataCoordService>,
    store: Arc<dyn ObjectStore>,
    bus: MemoryMsgBus,
    nodes: Vec<(Arc<DataNode>, Arc<AtomicBool>)>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl TestBed {
    async fn new(coord_config: CoordConfig, max_rows: i64) -> Self {
        let kv = Arc::new(MemoryMetaKv::new());
        let server = DataCoordServer::new(coord_config, kv.clone()).await.unwrap();
        server.start().await;
        server
            .register_collection(CollectionInfo {
                collection_id: COLLECTION,
                name: "e2e".to_string(),
                vchannels: vec![CHANNEL.to_string()],
                max_rows_per_segment: max_rows,
            })
            .await;
        let coord: Arc<dyn DataCoordService> = Arc::new(server.clone());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let bus = MemoryMsgBus::new();

        // Heartbeat time ticks keep flowing so flush gates can pass.
        let ticker = {
            let bus = bus.clone();
            let allocator = server.allocator().clone();
            tokio::spawn(async move {
                loop {
                    if let Ok(ts) = allocator.alloc_timestamp().await {
                        bus.publish(CHANNEL, vec![], ts);
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
        };

        let mut bed = Self {
            kv,
            server,
            coord,
            store,
            bus,
            nodes: Vec::new(),
            tasks: vec![ticker],
        };
        bed.add_node(100).await;
        bed
    }

    /// Register one data node with a controllable heartbeat.
    async fn add_node(&mut self, node_id: i64) -> Arc<DataNode> {
        let node = DataNode::new(
            NodeConfig {
                node_id,
                ..NodeConfig::default()
            },
            self.coord.clone(),
            self.store.clone(),
            self.server.allocator().clone(),
            Arc::new(self.bus.clone()),
        );
        node.start().await;
        self.server
            .register_data_node(node_id, Arc::new(node.clone()))
            .await;

        let alive = Arc::new(AtomicBool::new(true));
        let hb = {
            let server = self.server.clone();
            let alive = alive.clone();
            tokio::spawn(async move {
                loop {
                    if alive.load(Ordering::SeqCst) {
                        server.node_heartbeat(node_id).await;
                    }
                    tokio::time::sleep(Duration::from_millis(40)).await;
                }
            })
        };
        self.tasks.push(hb);
        self.nodes.push((node.clone(), alive));
        node
    }

    fn node(&self) -> &Arc<DataNode> {
        &self.nodes[0].0
    }

    async fn assign(&self, count: u32) -> SegmentId {
        let resp = self
            .coord
            .assign_segment_id(AssignSegmentIdRequest {
                requests: vec![SegmentIdRequest {
                    collection_id: COLLECTION,
                    partition_id: PARTITION,
                    channel: CHANNEL.to_string(),
                    count,
                }],
            })
            .await;
        assert!(resp.status.is_success());
        assert_eq!(
            resp.assignments.iter().map(|a| a.count).sum::<u32>(),
            count
        );
        resp.assignments[0].segment_id
    }

    async fn publish_rows(&self, segment_id: SegmentId, pk_start: i64, count: usize) -> u64 {
        let ts = self.server.allocator().alloc_timestamp().await.unwrap();
        let pks: Vec<i64> = (pk_start..pk_start + count as i64).collect();
        let mut fields = BTreeMap::new();
        fields.insert(
            100,
            pks.iter()
                .map(|pk| Bytes::from(pk.to_le_bytes().to_vec()))
                .collect::<Vec<_>>(),
        );
        let msg = InsertMessage {
            collection_id: COLLECTION,
            partition_id: PARTITION,
            segment_id,
            channel: CHANNEL.to_string(),
            row_ids: pks.clone(),
            timestamps: vec![ts; count],
            primary_keys: pks,
            fields,
        };
        self.bus
            .publish(CHANNEL, vec![StreamMessage::Insert(msg)], ts)
            .msg_id
    }

    async fn replica_rows(&self, node_index: usize, segment_id: SegmentId) -> i64 {
        match self.nodes[node_index].0.service(CHANNEL).await {
            Some(service) => service
                .replica()
                .statistics(segment_id)
                .map(|(rows, _)| rows)
                .unwrap_or(0),
            None => 0,
        }
    }

    async fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
        for (node, _) in &self.nodes {
            node.close().await;
        }
        self.server.stop().await;
    }
}

fn fast_coord_config() -> CoordConfig {
    CoordConfig {
        seal_check_interval: Duration::from_millis(20),
        liveness_check_interval: Duration::from_millis(30),
        allocation_ttl: Duration::from_millis(150),
        node_stale_after: Duration::from_secs(60),
        ..CoordConfig::default()
    }
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------
// Scenario: single-segment flush
// ---------------------------------------------------------------

#[tokio::test]
async fn test_single_segment_flush() {
    let bed = TestBed::new(fast_coord_config(), 10_000).await;

    let segment_id = bed.assign(1000).await;
    let mut last_pos = 0;
    for chunk in 0..4 {
        last_pos = bed.publish_rows(segment_id, chunk * 250, 250).await;
    }
    wait_for("node buffers all rows", || async {
        bed.replica_rows(0, segment_id).await == 1000
    })
    .await;

    let resp = bed.coord.flush(FlushRequest { collection_id: COLLECTION }).await;
    assert!(resp.status.is_success());
    assert_eq!(resp.segment_ids, vec![segment_id]);

    wait_for("segment flushed", || async {
        bed.server
            .meta()
            .get_segment(segment_id)
            .await
            .is_some_and(|s| s.state == SegmentState::Flushed)
    })
    .await;

    let seg = bed.server.meta().get_segment(segment_id).await.unwrap();
    assert_eq!(seg.num_rows, 1000);
    // Row IDs, timestamps, primary keys and one user field: one binlog each.
    assert_eq!(seg.binlogs.len(), 4);
    for field in &seg.binlogs {
        assert_eq!(field.binlogs.len(), 1, "field {}", field.field_id);
    }
    assert!(seg.dml_position.as_ref().unwrap().msg_id >= last_pos);

    // Binlog contents are really in the object store.
    let pk_path = seg
        .binlogs
        .iter()
        .find(|f| f.field_id == PRIMARY_KEY_FIELD)
        .unwrap()
        .binlogs[0]
        .clone();
    let blob = bed
        .store
        .get(&object_store::path::Path::from(pk_path.as_str()))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let (_, pks) = codec::decode_i64_column(&blob).unwrap();
    assert_eq!(pks.len(), 1000);

    // Flushed segments hand off to the external indexer.
    wait_for("handoff written", || async {
        bed.kv
            .load(&vectorstream_meta::keys::handoff_key(
                COLLECTION, PARTITION, segment_id,
            ))
            .await
            .unwrap()
            .is_some()
    })
    .await;

    bed.close().await;
}

// ---------------------------------------------------------------
// Scenario: seal by row policy
// ---------------------------------------------------------------

#[tokio::test]
async fn test_seal_by_rows_rolls_segments() {
    let config = CoordConfig {
        seal_rows: 100,
        ..fast_coord_config()
    };
    let bed = TestBed::new(config, 100).await;

    let mut segments = Vec::new();
    for (count, pk_start) in [(100u32, 0i64), (100, 100), (100, 200), (50, 300)] {
        let segment_id = bed.assign(count).await;
        bed.publish_rows(segment_id, pk_start, count as usize).await;
        if !segments.contains(&segment_id) {
            segments.push(segment_id);
        }
        wait_for("rows buffered", || async {
            let meta_rows = bed
                .server
                .meta()
                .get_segment(segment_id)
                .await
                .map(|s| s.num_rows)
                .unwrap_or(0);
            meta_rows as u32 == count || bed.replica_rows(0, segment_id).await as u32 == count
        })
        .await;
    }

    // Four segments, created in order.
    assert_eq!(segments.len(), 4);
    let mut sorted = segments.clone();
    sorted.sort_unstable();
    assert_eq!(segments, sorted);

    // First three sealed by policy and flushed with 100 rows each.
    for &segment_id in &segments[..3] {
        wait_for("policy-sealed segment flushed", || async {
            bed.server
                .meta()
                .get_segment(segment_id)
                .await
                .is_some_and(|s| s.state == SegmentState::Flushed && s.num_rows == 100)
        })
        .await;
    }

    // The last stays growing with its 50 rows on the node.
    let last = segments[3];
    assert_eq!(
        bed.server.meta().get_segment(last).await.unwrap().state,
        SegmentState::Growing
    );
    assert_eq!(bed.replica_rows(0, last).await, 50);

    bed.close().await;
}

// ---------------------------------------------------------------
// Scenario: channel handover
// ---------------------------------------------------------------

#[tokio::test]
async fn test_channel_handover_replays_without_duplicates() {
    let config = CoordConfig {
        node_stale_after: Duration::from_millis(300),
        ..fast_coord_config()
    };
    let mut bed = TestBed::new(config, 10_000).await;
    bed.add_node(200).await;

    let segment_id = bed.assign(1000).await;
    bed.publish_rows(segment_id, 0, 600).await;
    wait_for("first owner buffers rows", || async {
        bed.replica_rows(0, segment_id).await == 600
    })
    .await;
    assert_eq!(
        bed.server.channel_manager().watching_node(CHANNEL).await,
        Some(100)
    );

    // First owner dies; the channel must move to the second node.
    bed.nodes[0].1.store(false, Ordering::SeqCst);
    wait_for("channel handed to second node", || async {
        bed.server.channel_manager().watching_node(CHANNEL).await == Some(200)
    })
    .await;

    // The new owner replays the stream from the checkpoint.
    wait_for("new owner replays rows", || async {
        bed.replica_rows(1, segment_id).await == 600
    })
    .await;
    bed.publish_rows(segment_id, 600, 400).await;
    wait_for("new owner sees the tail", || async {
        bed.replica_rows(1, segment_id).await == 1000
    })
    .await;

    // A stale report from the evicted owner changes nothing.
    let before = bed.server.meta().get_segment(segment_id).await.unwrap();
    let status = bed
        .coord
        .save_binlog_paths(SaveBinlogPathsRequest {
            source_node_id: 100,
            segment_id,
            collection_id: COLLECTION,
            field_binlogs: vec![vectorstream_meta::FieldBinlog {
                field_id: 100,
                binlogs: vec!["insert_log/stale/path".to_string()],
            }],
            ..SaveBinlogPathsRequest::default()
        })
        .await;
    assert_eq!(status.reason, reason::CHANNEL_NOT_WATCHED);
    assert_eq!(
        bed.server.meta().get_segment(segment_id).await.unwrap(),
        before
    );

    // Flush through the new owner; exactly once, no duplicate paths.
    bed.coord.flush(FlushRequest { collection_id: COLLECTION }).await;
    wait_for("flushed via new owner", || async {
        bed.server
            .meta()
            .get_segment(segment_id)
            .await
            .is_some_and(|s| s.state == SegmentState::Flushed)
    })
    .await;
    let seg = bed.server.meta().get_segment(segment_id).await.unwrap();
    assert_eq!(seg.num_rows, 1000);
    for field in &seg.binlogs {
        let mut paths = field.binlogs.clone();
        paths.dedup();
        assert_eq!(paths.len(), field.binlogs.len(), "duplicate binlog path");
    }

    bed.close().await;
}

// ---------------------------------------------------------------
// Scenario: recovery after node restart
// ---------------------------------------------------------------

#[tokio::test]
async fn test_restart_recovers_from_stream_replay() {
    let config = CoordConfig {
        node_stale_after: Duration::from_millis(300),
        ..fast_coord_config()
    };
    let mut bed = TestBed::new(config, 10_000).await;

    let segment_id = bed.assign(500).await;
    bed.publish_rows(segment_id, 0, 500).await;
    wait_for("rows buffered before crash", || async {
        bed.replica_rows(0, segment_id).await == 500
    })
    .await;

    // Kill the node before anything flushed.
    bed.nodes[0].1.store(false, Ordering::SeqCst);
    bed.nodes[0].0.close().await;

    let _replacement = bed.add_node(200).await;
    wait_for("replacement owns the channel", || async {
        bed.server.channel_manager().watching_node(CHANNEL).await == Some(200)
    })
    .await;
    wait_for("replacement replays the stream", || async {
        bed.replica_rows(1, segment_id).await == 500
    })
    .await;

    bed.coord.flush(FlushRequest { collection_id: COLLECTION }).await;
    wait_for("flushed after recovery", || async {
        bed.server
            .meta()
            .get_segment(segment_id)
            .await
            .is_some_and(|s| s.state == SegmentState::Flushed)
    })
    .await;

    // Final meta matches an uninterrupted run: 500 rows, each pk once.
    let seg = bed.server.meta().get_segment(segment_id).await.unwrap();
    assert_eq!(seg.num_rows, 500);
    let pk_path = seg
        .binlogs
        .iter()
        .find(|f| f.field_id == PRIMARY_KEY_FIELD)
        .unwrap()
        .binlogs[0]
        .clone();
    let blob = bed
        .store
        .get(&object_store::path::Path::from(pk_path.as_str()))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let (_, mut pks) = codec::decode_i64_column(&blob).unwrap();
    pks.sort_unstable();
    pks.dedup();
    assert_eq!(pks.len(), 500);

    bed.close().await;
}

// ---------------------------------------------------------------
// Scenario: compaction merges two flushed segments
// ---------------------------------------------------------------

#[tokio::test]
async fn test_compaction_merges_two_flushed_segments() {
    let bed = TestBed::new(fast_coord_config(), 500).await;

    let s1 = bed.assign(500).await;
    bed.publish_rows(s1, 0, 500).await;
    let s2 = bed.assign(400).await;
    assert_ne!(s1, s2);
    bed.publish_rows(s2, 500, 400).await;

    wait_for("both segments buffered", || async {
        bed.replica_rows(0, s1).await == 500 && bed.replica_rows(0, s2).await == 400
    })
    .await;
    bed.coord.flush(FlushRequest { collection_id: COLLECTION }).await;
    for segment_id in [s1, s2] {
        wait_for("segment flushed", || async {
            bed.server
                .meta()
                .get_segment(segment_id)
                .await
                .is_some_and(|s| s.state == SegmentState::Flushed)
        })
        .await;
    }

    // Observer for compaction atomicity: never a partial swap.
    let partial_swap_seen = Arc::new(AtomicBool::new(false));
    let observer = {
        let meta = bed.server.meta().clone();
        let seen = partial_swap_seen.clone();
        tokio::spawn(async move {
            loop {
                let segments = meta.list_segments().await;
                let dropped = segments
                    .iter()
                    .filter(|s| [s1, s2].contains(&s.id) && s.state == SegmentState::Dropped)
                    .count();
                let result_present = segments.iter().any(|s| s.created_by_compaction);
                let consistent =
                    (dropped == 0 && !result_present) || (dropped == 2 && result_present);
                if !consistent {
                    seen.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let timetravel = bed.server.allocator().alloc_timestamp().await.unwrap();
    let resp = bed
        .coord
        .manual_compaction(ManualCompactionRequest {
            collection_id: COLLECTION,
            timetravel,
        })
        .await;
    assert!(resp.status.is_success());

    wait_for("compaction completes", || async {
        let state = bed
            .coord
            .get_compaction_state(GetCompactionStateRequest {
                compaction_id: resp.compaction_id,
            })
            .await;
        state.completed_plan_count == 1 && state.state == CompactionStateCode::Completed
    })
    .await;
    observer.abort();
    assert!(
        !partial_swap_seen.load(Ordering::SeqCst),
        "a reader observed a partial compaction swap"
    );

    let merged = bed
        .server
        .meta()
        .list_segments()
        .await
        .into_iter()
        .find(|s| s.created_by_compaction)
        .expect("merged segment present");
    assert_eq!(merged.num_rows, 900);
    let mut sources = merged.compaction_from.clone();
    sources.sort_unstable();
    let mut expected = vec![s1, s2];
    expected.sort_unstable();
    assert_eq!(sources, expected);
    assert_eq!(
        bed.server.meta().get_segment(s1).await.unwrap().state,
        SegmentState::Dropped
    );
    assert_eq!(
        bed.server.meta().get_segment(s2).await.unwrap().state,
        SegmentState::Dropped
    );

    bed.close().await;
}

// ---------------------------------------------------------------
// Scenario: collection dropped mid-stream
// ---------------------------------------------------------------

#[tokio::test]
async fn test_dropped_collection_clears_channel() {
    let bed = TestBed::new(fast_coord_config(), 10_000).await;

    let segment_id = bed.assign(100).await;
    bed.publish_rows(segment_id, 0, 100).await;
    wait_for("rows buffered", || async {
        bed.replica_rows(0, segment_id).await == 100
    })
    .await;

    let ts = bed.server.allocator().alloc_timestamp().await.unwrap();
    bed.bus
        .publish(CHANNEL, vec![StreamMessage::DropCollection(COLLECTION)], ts);

    wait_for("segment dropped in meta", || async {
        bed.server
            .meta()
            .get_segment(segment_id)
            .await
            .is_some_and(|s| s.state == SegmentState::Dropped)
    })
    .await;
    wait_for("channel mapping removed", || async {
        bed.server.channel_manager().watch_state(CHANNEL).await.is_none()
    })
    .await;
    wait_for("node released the pipeline", || async {
        bed.node().service(CHANNEL).await.is_none()
    })
    .await;

    bed.close().await;
}
