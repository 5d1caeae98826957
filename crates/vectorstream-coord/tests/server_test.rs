//! Coordinator service integration tests: health gating, allocation,
//! owner fencing and channel handover, against mock data nodes.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vectorstream_coord::{CollectionInfo, CoordConfig, DataCoordServer, WatchState};
use vectorstream_core::ts_physical_ms;
use vectorstream_meta::MemoryMetaKv;
use vectorstream_rpc::*;

/// Data node double that records what the coordinator asks of it.
#[derive(Default)]
struct MockDataNode {
    accept_watch: AtomicBool,
    watch_calls: Mutex<Vec<String>>,
    flush_calls: Mutex<Vec<FlushSegmentsRequest>>,
}

impl MockDataNode {
    fn accepting() -> Arc<Self> {
        let node = Self::default();
        node.accept_watch.store(true, Ordering::SeqCst);
        Arc::new(node)
    }

    fn watched_channels(&self) -> Vec<String> {
        self.watch_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataNodeService for MockDataNode {
    async fn watch_dm_channels(&self, req: WatchDmChannelsRequest) -> Status {
        let mut calls = self.watch_calls.lock().unwrap();
        for vchannel in &req.vchannels {
            calls.push(vchannel.channel.clone());
        }
        if self.accept_watch.load(Ordering::SeqCst) {
            Status::success()
        } else {
            Status::error("not ready")
        }
    }

    async fn flush_segments(&self, req: FlushSegmentsRequest) -> Status {
        self.flush_calls.lock().unwrap().push(req);
        Status::success()
    }

    async fn compaction(&self, _plan: CompactionPlan) -> Status {
        Status::success()
    }
}

fn test_config() -> CoordConfig {
    CoordConfig {
        seal_check_interval: Duration::from_millis(20),
        liveness_check_interval: Duration::from_millis(20),
        node_stale_after: Duration::from_secs(60),
        allocation_ttl: Duration::from_millis(200),
        ..CoordConfig::default()
    }
}

async fn started_server(config: CoordConfig) -> Arc<DataCoordServer> {
    let server = DataCoordServer::new(config, Arc::new(MemoryMetaKv::new()))
        .await
        .unwrap();
    server.start().await;
    server.register_collection(collection(42)).await;
    server
}

fn collection(collection_id: i64) -> CollectionInfo {
    CollectionInfo {
        collection_id,
        name: format!("coll-{collection_id}"),
        vchannels: vec!["c1".to_string()],
        max_rows_per_segment: 1000,
    }
}

fn assign_req(collection_id: i64, channel: &str, count: u32) -> AssignSegmentIdRequest {
    AssignSegmentIdRequest {
        requests: vec![SegmentIdRequest {
            collection_id,
            partition_id: 7,
            channel: channel.to_string(),
            count,
        }],
    }
}

// ---------------------------------------------------------------
// Health gating
// ---------------------------------------------------------------

#[tokio::test]
async fn test_rpcs_rejected_until_serving() {
    let server = DataCoordServer::new(test_config(), Arc::new(MemoryMetaKv::new()))
        .await
        .unwrap();

    let flush = server.flush(FlushRequest { collection_id: 42 }).await;
    assert_eq!(flush.status.reason, reason::SERVER_NOT_SERVING);

    let save = server.save_binlog_paths(SaveBinlogPathsRequest::default()).await;
    assert_eq!(save.reason, reason::SERVER_NOT_SERVING);

    let states = server.get_component_states().await;
    assert_eq!(states.state_code, StateCode::Initializing);

    server.start().await;
    assert_eq!(
        server.get_component_states().await.state_code,
        StateCode::Healthy
    );
    server.stop().await;
    assert_eq!(
        server.get_component_states().await.state_code,
        StateCode::Abnormal
    );
}

// ---------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------

#[tokio::test]
async fn test_assignment_counts_and_expiry() {
    let server = started_server(test_config()).await;
    server.register_data_node(1, Arc::new(MockDataNode::accepting())).await;

    let resp = server.assign_segment_id(assign_req(42, "c1", 250)).await;
    assert!(resp.status.is_success());
    let total: u32 = resp.assignments.iter().map(|a| a.count).sum();
    assert_eq!(total, 250);

    let now_ms = chrono::Utc::now().timestamp_millis();
    for assignment in &resp.assignments {
        assert!(ts_physical_ms(assignment.expire_time) > now_ms);
        assert_eq!(assignment.channel, "c1");
    }

    // Unknown collections are skipped, not failed.
    let resp = server.assign_segment_id(assign_req(99, "c9", 10)).await;
    assert!(resp.status.is_success());
    assert!(resp.assignments.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_assignment_watches_channel_on_live_node() {
    let server = started_server(test_config()).await;
    let node = MockDataNode::accepting();
    server.register_data_node(1, Arc::new(node.clone())).await;

    server.assign_segment_id(assign_req(42, "c1", 10)).await;

    assert_eq!(node.watched_channels(), vec!["c1".to_string()]);
    assert_eq!(server.channel_manager().watching_node("c1").await, Some(1));
    assert!(server.channel_manager().match_node(1, "c1").await);
    assert!(!server.channel_manager().match_node(2, "c1").await);

    server.stop().await;
}

// ---------------------------------------------------------------
// Flush seals
// ---------------------------------------------------------------

#[tokio::test]
async fn test_flush_seals_growing_segments() {
    let server = started_server(test_config()).await;
    server.register_data_node(1, Arc::new(MockDataNode::accepting())).await;

    let assigned = server.assign_segment_id(assign_req(42, "c1", 100)).await;
    let segment_id = assigned.assignments[0].segment_id;

    let resp = server.flush(FlushRequest { collection_id: 42 }).await;
    assert!(resp.status.is_success());
    assert_eq!(resp.segment_ids, vec![segment_id]);
    assert_eq!(
        server.meta().get_segment(segment_id).await.unwrap().state,
        vectorstream_meta::SegmentState::Sealed
    );

    // A second flush has nothing left to seal.
    let resp = server.flush(FlushRequest { collection_id: 42 }).await;
    assert!(resp.segment_ids.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_sealed_segment_flush_notification_waits_for_expiry() {
    let server = started_server(test_config()).await;
    let node = MockDataNode::accepting();
    server.register_data_node(1, Arc::new(node.clone())).await;

    let assigned = server.assign_segment_id(assign_req(42, "c1", 100)).await;
    let segment_id = assigned.assignments[0].segment_id;
    server.flush(FlushRequest { collection_id: 42 }).await;

    // TTL is 200ms; the seal scan must eventually notify the owner.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let calls = node.flush_calls.lock().unwrap().clone();
        if calls.iter().any(|c| c.segment_ids.contains(&segment_id)) {
            assert!(calls.iter().all(|c| c.flush_ts > 0));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "owner never notified");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    server.stop().await;
}

// ---------------------------------------------------------------
// Owner fencing and handover
// ---------------------------------------------------------------

#[tokio::test]
async fn test_save_binlog_paths_from_non_owner_rejected() {
    let server = started_server(test_config()).await;
    server.register_data_node(1, Arc::new(MockDataNode::accepting())).await;

    let assigned = server.assign_segment_id(assign_req(42, "c1", 100)).await;
    let segment_id = assigned.assignments[0].segment_id;
    let before = server.meta().get_segment(segment_id).await.unwrap();

    let req = SaveBinlogPathsRequest {
        source_node_id: 2,
        segment_id,
        collection_id: 42,
        field_binlogs: vec![vectorstream_meta::FieldBinlog {
            field_id: 100,
            binlogs: vec!["insert_log/42/7/x/100/1".to_string()],
        }],
        ..SaveBinlogPathsRequest::default()
    };
    let status = server.save_binlog_paths(req.clone()).await;
    assert_eq!(status.reason, reason::CHANNEL_NOT_WATCHED);
    // Meta unchanged by the rejected report.
    assert_eq!(server.meta().get_segment(segment_id).await.unwrap(), before);

    // The same report from the real owner is accepted.
    let status = server
        .save_binlog_paths(SaveBinlogPathsRequest {
            source_node_id: 1,
            ..req
        })
        .await;
    assert!(status.is_success());
    assert_eq!(
        server.meta().get_segment(segment_id).await.unwrap().binlogs[0].binlogs.len(),
        1
    );

    server.stop().await;
}

#[tokio::test]
async fn test_channel_handover_on_node_death() {
    let config = CoordConfig {
        node_stale_after: Duration::from_millis(150),
        liveness_check_interval: Duration::from_millis(30),
        ..test_config()
    };
    let server = started_server(config).await;
    let node_a = MockDataNode::accepting();
    let node_b = MockDataNode::accepting();
    server.register_data_node(1, Arc::new(node_a.clone())).await;
    server.register_data_node(2, Arc::new(node_b.clone())).await;

    // Keep both alive while the channel lands on A (lowest load, then id).
    let hb = {
        let server = server.clone();
        let a_alive = Arc::new(AtomicBool::new(true));
        let flag = a_alive.clone();
        let handle = tokio::spawn(async move {
            loop {
                if flag.load(Ordering::SeqCst) {
                    server.node_heartbeat(1).await;
                }
                server.node_heartbeat(2).await;
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
        });
        (a_alive, handle)
    };

    server.assign_segment_id(assign_req(42, "c1", 100)).await;
    assert_eq!(server.channel_manager().watching_node("c1").await, Some(1));

    // A stops heartbeating; the reconcile loop must hand the channel to
    // B without ever reporting two watchers or a watching dead node.
    hb.0.store(false, Ordering::SeqCst);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match server.channel_manager().watch_state("c1").await {
            Some((WatchState::Watching, Some(2))) => break,
            Some((WatchState::Watching, Some(1))) | Some((WatchState::ToWatch, _)) | None => {}
            other => panic!("unexpected channel state during handover: {other:?}"),
        }
        assert!(tokio::time::Instant::now() < deadline, "handover never happened");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(!server.channel_manager().match_node(1, "c1").await);
    assert!(server.channel_manager().match_node(2, "c1").await);
    assert!(node_b.watched_channels().contains(&"c1".to_string()));

    hb.1.abort();
    server.stop().await;
}

// ---------------------------------------------------------------
// Flushed-segment listing
// ---------------------------------------------------------------

#[tokio::test]
async fn test_get_flushed_segments_filters_by_state() {
    let server = started_server(test_config()).await;
    server.register_data_node(1, Arc::new(MockDataNode::accepting())).await;

    let a = server.assign_segment_id(assign_req(42, "c1", 100)).await.assignments[0].segment_id;
    let b = server.assign_segment_id(assign_req(42, "c1", 950)).await.assignments[0].segment_id;
    assert_ne!(a, b);

    server.meta().set_state(a, vectorstream_meta::SegmentState::Sealed).await.unwrap();
    server.meta().set_state(a, vectorstream_meta::SegmentState::Flushing).await.unwrap();
    server.meta().set_state(a, vectorstream_meta::SegmentState::Flushed).await.unwrap();

    let resp = server
        .get_flushed_segments(GetFlushedSegmentsRequest {
            collection_id: 42,
            partition_id: -1,
        })
        .await;
    assert!(resp.status.is_success());
    assert_eq!(resp.segment_ids, vec![a]);

    server.stop().await;
}

#[tokio::test]
async fn test_recovery_info_reports_channels_and_binlogs() {
    let server = started_server(test_config()).await;
    server.register_data_node(1, Arc::new(MockDataNode::accepting())).await;

    let segment_id = server.assign_segment_id(assign_req(42, "c1", 100)).await.assignments[0]
        .segment_id;
    let status = server
        .save_binlog_paths(SaveBinlogPathsRequest {
            source_node_id: 1,
            segment_id,
            collection_id: 42,
            flushed: true,
            field_binlogs: vec![vectorstream_meta::FieldBinlog {
                field_id: 100,
                binlogs: vec![format!("insert_log/42/7/{segment_id}/100/1")],
            }],
            checkpoints: vec![vectorstream_meta::CheckPoint {
                segment_id,
                num_rows: 100,
                position: vectorstream_core::Position::new("c1", 9, 90),
            }],
            ..SaveBinlogPathsRequest::default()
        })
        .await;
    assert!(status.is_success());

    let resp = server
        .get_recovery_info(GetRecoveryInfoRequest {
            collection_id: 42,
            partition_id: 7,
        })
        .await;
    assert!(resp.status.is_success());
    assert_eq!(resp.binlogs.len(), 1);
    assert_eq!(resp.binlogs[0].segment_id, segment_id);
    assert_eq!(resp.binlogs[0].num_rows, 100);
    assert_eq!(resp.channels.len(), 1);
    let channel = &resp.channels[0];
    assert_eq!(channel.channel, "c1");
    assert_eq!(channel.seek_position.as_ref().unwrap().msg_id, 9);

    server.stop().await;
}

// ---------------------------------------------------------------
// Compaction gating
// ---------------------------------------------------------------

#[tokio::test]
async fn test_compaction_disabled_is_surfaced() {
    let config = CoordConfig {
        enable_compaction: false,
        ..test_config()
    };
    let server = started_server(config).await;

    let resp = server
        .manual_compaction(ManualCompactionRequest {
            collection_id: 42,
            timetravel: u64::MAX,
        })
        .await;
    assert_eq!(resp.status.reason, reason::COMPACTION_DISABLED);

    let status = server
        .complete_compaction(CompactionResult {
            plan_id: 1,
            segment_id: 2,
            num_rows: 0,
            insert_logs: vec![],
            statslogs: vec![],
            deltalogs: vec![],
        })
        .await;
    assert_eq!(status.reason, reason::COMPACTION_DISABLED);

    server.stop().await;
}
