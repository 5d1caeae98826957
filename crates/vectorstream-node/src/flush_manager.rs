//! DN Rendezvous Flush Manager
//!
//! Serializes, per segment, the flush tasks produced concurrently by the
//! insert-buffer and delete-buffer graph nodes, so flush reports leave
//! the node in stream order, and lets an external party ("injection",
//! e.g. a compaction start) take an exclusive barrier between flushes.
//!
//! Per segment, an order queue holds:
//!
//! - `tail`: a completion token; the newest task (or injection) chains
//!   its start on the previous holder's completion. A fresh queue's tail
//!   is already complete.
//! - `working`: in-flight task runners keyed by message ID. The first
//!   half (insert or delete) to arrive at a position creates the runner;
//!   the second releases its rendezvous. Exactly one flush executes per
//!   `(segment, position)`; late duplicates are ignored.
//! - an injection pump that serves the buffered injection channel only
//!   while no task is running; between `injected` and `inject_over` the
//!   pump holds the tail, so nothing started after the barrier can
//!   report before the injector releases.
//!
//! Cross-task ordering lives entirely in these channels and tokens; the
//! queue's mutex only guards leaf fields and is never held across await.
//!
//! A task whose storage write fails carries the error in its pack; the
//! notifier treats that as fatal (continuing would publish stale
//! checkpoints) and panics the node.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::ObjectStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vectorstream_core::codec;
use vectorstream_core::{
    Allocator, FieldId, Position, SegmentId, PRIMARY_KEY_FIELD, ROW_ID_FIELD, TIMESTAMP_FIELD,
};
use vectorstream_meta::DeltaLogInfo;

use crate::buffer::{DeleteBuffer, InsertBuffer};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::metrics;
use crate::replica::SegmentReplica;
use crate::retry;

/// Result of one flush task, reported to the coordinator in order.
#[derive(Debug, Clone, Default)]
pub struct FlushPack {
    pub segment_id: SegmentId,
    pub insert_logs: HashMap<FieldId, String>,
    pub stats_logs: HashMap<FieldId, String>,
    pub delta_logs: Vec<DeltaLogInfo>,
    pub position: Position,
    pub flushed: bool,
    pub dropped: bool,
    /// Task execution error. Non-nil stops the data node.
    pub err: Option<String>,
}

/// Receives finished packs in per-segment stream order.
#[async_trait]
pub trait FlushNotifier: Send + Sync {
    async fn notify(&self, pack: FlushPack);
}

/// Installed by a completed injection; runs against every later pack.
pub type PostInjectionFn = Arc<dyn Fn(&mut FlushPack) + Send + Sync>;

struct TaskInjection {
    injected_tx: oneshot::Sender<()>,
    inject_over_rx: oneshot::Receiver<()>,
    post_injection: Option<PostInjectionFn>,
}

/// Caller side of one segment's injection barrier.
pub struct InjectionHandle {
    segment_id: SegmentId,
    injected_rx: oneshot::Receiver<()>,
    inject_over_tx: Option<oneshot::Sender<()>>,
}

impl InjectionHandle {
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Wait until the barrier is held. Returns false if the queue went
    /// away before the injection was served.
    pub async fn wait_injected(&mut self) -> bool {
        (&mut self.injected_rx).await.is_ok()
    }

    /// Release the barrier. Dropping the handle releases it too.
    pub fn release(mut self) {
        if let Some(tx) = self.inject_over_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------
// Flush jobs and runners
// ---------------------------------------------------------------

#[derive(Default)]
struct InsertFlushJob {
    blobs: Vec<(String, Bytes)>,
    insert_logs: HashMap<FieldId, String>,
    stats_logs: HashMap<FieldId, String>,
    flushed: bool,
    dropped: bool,
}

#[derive(Default)]
struct DeleteFlushJob {
    blobs: Vec<(String, Bytes)>,
    delta_logs: Vec<DeltaLogInfo>,
}

/// Rendezvous of the insert and delete halves of one flush position.
struct FlushTaskRunner {
    insert_tx: Mutex<Option<oneshot::Sender<InsertFlushJob>>>,
    delete_tx: Mutex<Option<oneshot::Sender<DeleteFlushJob>>>,
}

impl FlushTaskRunner {
    fn submit_insert(&self, job: InsertFlushJob) -> bool {
        match self.insert_tx.lock().unwrap().take() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    fn submit_delete(&self, job: DeleteFlushJob) -> bool {
        match self.delete_tx.lock().unwrap().take() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }
}

// ---------------------------------------------------------------
// Order queue
// ---------------------------------------------------------------

struct QueueState {
    tail: CancellationToken,
    running: usize,
    working: HashMap<u64, Arc<FlushTaskRunner>>,
    post_injection: Option<PostInjectionFn>,
}

struct OrderQueue {
    segment_id: SegmentId,
    store: Arc<dyn ObjectStore>,
    notifier: Arc<dyn FlushNotifier>,
    config: NodeConfig,
    inject_tx: mpsc::Sender<TaskInjection>,
    inner: Mutex<QueueState>,
    /// Wake signal for the injection pump; bumped on every task finish.
    running_rev: watch::Sender<u64>,
    pump_stop: CancellationToken,
}

impl OrderQueue {
    fn new(
        segment_id: SegmentId,
        store: Arc<dyn ObjectStore>,
        notifier: Arc<dyn FlushNotifier>,
        config: NodeConfig,
    ) -> Arc<Self> {
        let (inject_tx, inject_rx) = mpsc::channel(config.inject_queue_depth);
        let (running_rev, _) = watch::channel(0);
        // A fresh queue acts as if its tail task is already done.
        let tail = CancellationToken::new();
        tail.cancel();
        let queue = Arc::new(Self {
            segment_id,
            store,
            notifier,
            config,
            inject_tx,
            inner: Mutex::new(QueueState {
                tail,
                running: 0,
                working: HashMap::new(),
                post_injection: None,
            }),
            running_rev,
            pump_stop: CancellationToken::new(),
        });
        tokio::spawn(Self::inject_pump(queue.clone(), inject_rx));
        queue
    }

    /// Look up or create the runner for `position`, chaining a new
    /// runner after the current tail.
    fn get_runner(self: &Arc<Self>, position: &Position) -> Arc<FlushTaskRunner> {
        let (runner, spawn_args) = {
            let mut state = self.inner.lock().unwrap();
            if let Some(existing) = state.working.get(&position.msg_id) {
                return existing.clone();
            }
            let (insert_tx, insert_rx) = oneshot::channel();
            let (delete_tx, delete_rx) = oneshot::channel();
            let runner = Arc::new(FlushTaskRunner {
                insert_tx: Mutex::new(Some(insert_tx)),
                delete_tx: Mutex::new(Some(delete_tx)),
            });
            state.running += 1;
            let prev_tail = state.tail.clone();
            let finish = CancellationToken::new();
            state.tail = finish.clone();
            state.working.insert(position.msg_id, runner.clone());
            (runner, (insert_rx, delete_rx, prev_tail, finish))
        };

        let (insert_rx, delete_rx, prev_tail, finish) = spawn_args;
        let queue = self.clone();
        let position = position.clone();
        tokio::spawn(async move {
            queue
                .run_task(position, insert_rx, delete_rx, prev_tail, finish)
                .await;
        });
        runner
    }

    async fn run_task(
        self: Arc<Self>,
        position: Position,
        insert_rx: oneshot::Receiver<InsertFlushJob>,
        delete_rx: oneshot::Receiver<DeleteFlushJob>,
        prev_tail: CancellationToken,
        finish: CancellationToken,
    ) {
        // Rendezvous: both halves submitted, then our turn in the chain.
        let insert_job = insert_rx.await.ok();
        let delete_job = delete_rx.await.ok();
        prev_tail.cancelled().await;

        if insert_job.is_none() && delete_job.is_none() {
            // Queue tore down before either half arrived.
            finish.cancel();
            self.abandon(position.msg_id);
            return;
        }
        let insert_job = insert_job.unwrap_or_default();
        let delete_job = delete_job.unwrap_or_default();

        let mut pack = FlushPack {
            segment_id: self.segment_id,
            insert_logs: insert_job.insert_logs,
            stats_logs: insert_job.stats_logs,
            delta_logs: delete_job.delta_logs,
            position: position.clone(),
            flushed: insert_job.flushed,
            dropped: insert_job.dropped,
            err: None,
        };

        for (path, data) in insert_job.blobs.into_iter().chain(delete_job.blobs) {
            let location = object_store::path::Path::from(path.as_str());
            let bytes = data.len() as u64;
            let outcome = retry::retry(&self.config.retry, "binlog upload", || {
                let data = data.clone();
                let location = location.clone();
                let store = self.store.clone();
                async move { store.put(&location, data.into()).await }
            })
            .await;
            match outcome {
                Ok(_) => metrics::FLUSH_BYTES_TOTAL.inc_by(bytes),
                Err(e) => {
                    pack.err = Some(format!("binlog upload to {path} failed: {e}"));
                    break;
                }
            }
        }

        self.finish_task(pack, finish).await;
    }

    /// Bookkeeping + notify, in the order the queue guarantees: remove
    /// from working, release the running count, apply the installed
    /// post-injection, notify, then release the tail for the next task.
    async fn finish_task(self: &Arc<Self>, mut pack: FlushPack, finish: CancellationToken) {
        let post = {
            let mut state = self.inner.lock().unwrap();
            state.working.remove(&pack.position.msg_id);
            state.running -= 1;
            state.post_injection.clone()
        };
        self.running_rev.send_modify(|v| *v += 1);
        if let Some(post) = post {
            post(&mut pack);
        }
        self.notifier.notify(pack).await;
        finish.cancel();
    }

    fn abandon(&self, msg_id: u64) {
        let mut state = self.inner.lock().unwrap();
        if state.working.remove(&msg_id).is_some() {
            state.running -= 1;
        }
        drop(state);
        self.running_rev.send_modify(|v| *v += 1);
    }

    /// Serves the injection channel only while no task runs. Between
    /// `injected` and `inject_over` the pump owns the tail, so any task
    /// created meanwhile chains behind the barrier.
    async fn inject_pump(queue: Arc<OrderQueue>, mut inject_rx: mpsc::Receiver<TaskInjection>) {
        loop {
            let injection = tokio::select! {
                _ = queue.pump_stop.cancelled() => return,
                inj = inject_rx.recv() => match inj {
                    Some(inj) => inj,
                    None => return,
                },
            };

            let inject_done = CancellationToken::new();
            loop {
                let mut wake = queue.running_rev.subscribe();
                let claimed = {
                    let mut state = queue.inner.lock().unwrap();
                    if state.running == 0 {
                        state.tail = inject_done.clone();
                        true
                    } else {
                        false
                    }
                };
                if claimed {
                    break;
                }
                tokio::select! {
                    _ = queue.pump_stop.cancelled() => return,
                    _ = wake.changed() => {}
                }
            }

            metrics::INJECTIONS_TOTAL.inc();
            debug!(segment_id = queue.segment_id, "injection holds flush barrier");
            let _ = injection.injected_tx.send(());
            // Injector works; a dropped handle counts as release.
            let _ = injection.inject_over_rx.await;
            if let Some(post) = injection.post_injection {
                queue.inner.lock().unwrap().post_injection = Some(post);
            }
            inject_done.cancel();
            debug!(segment_id = queue.segment_id, "injection released");
        }
    }

    fn close(&self) {
        self.pump_stop.cancel();
        let mut state = self.inner.lock().unwrap();
        // Dropping the runners drops their submission channels, which
        // unblocks any half-rendezvoused task.
        state.working.clear();
    }
}

// ---------------------------------------------------------------
// Manager
// ---------------------------------------------------------------

pub struct RendezvousFlushManager {
    replica: Arc<SegmentReplica>,
    store: Arc<dyn ObjectStore>,
    allocator: Arc<dyn Allocator>,
    notifier: Arc<dyn FlushNotifier>,
    config: NodeConfig,
    queues: Mutex<HashMap<SegmentId, Arc<OrderQueue>>>,
}

impl RendezvousFlushManager {
    pub fn new(
        replica: Arc<SegmentReplica>,
        store: Arc<dyn ObjectStore>,
        allocator: Arc<dyn Allocator>,
        notifier: Arc<dyn FlushNotifier>,
        config: NodeConfig,
    ) -> Self {
        Self {
            replica,
            store,
            allocator,
            notifier,
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn get_queue(&self, segment_id: SegmentId) -> Arc<OrderQueue> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(segment_id)
            .or_insert_with(|| {
                OrderQueue::new(
                    segment_id,
                    self.store.clone(),
                    self.notifier.clone(),
                    self.config.clone(),
                )
            })
            .clone()
    }

    /// Submit the insert half of the flush at `position`. An empty or
    /// absent buffer still takes its rendezvous slot so the flags reach
    /// the coordinator.
    pub async fn flush_buffer_data(
        &self,
        buffer: Option<&InsertBuffer>,
        segment_id: SegmentId,
        flushed: bool,
        dropped: bool,
        position: &Position,
    ) -> Result<()> {
        let job = match buffer.filter(|b| !b.is_empty()) {
            None => InsertFlushJob {
                flushed,
                dropped,
                ..InsertFlushJob::default()
            },
            Some(buf) => self.build_insert_job(buf, flushed, dropped).await?,
        };

        self.replica.update_checkpoint(segment_id, position.clone());
        let queue = self.get_queue(segment_id);
        if !queue.get_runner(position).submit_insert(job) {
            warn!(
                segment_id,
                msg_id = position.msg_id,
                "duplicate insert flush ignored"
            );
        }
        Ok(())
    }

    /// Submit the delete half of the flush at `position`. Must be called
    /// once for every position given to `flush_buffer_data`, even with
    /// no deletes buffered, or the rendezvous never completes.
    pub async fn flush_delete_data(
        &self,
        buffer: Option<&DeleteBuffer>,
        segment_id: SegmentId,
        position: &Position,
    ) -> Result<()> {
        let job = match buffer.filter(|b| !b.is_empty()) {
            None => DeleteFlushJob::default(),
            Some(buf) => self.build_delete_job(segment_id, buf).await?,
        };

        let queue = self.get_queue(segment_id);
        if !queue.get_runner(position).submit_delete(job) {
            warn!(
                segment_id,
                msg_id = position.msg_id,
                "duplicate delete flush ignored"
            );
        }
        Ok(())
    }

    /// Take an injection barrier on each segment. The caller awaits
    /// `wait_injected` on every handle, does its exclusive work, then
    /// releases. Segments are independent: one barrier never blocks
    /// another segment's flushes.
    pub async fn inject_flush(
        &self,
        segments: &[SegmentId],
        post_injection: Option<PostInjectionFn>,
    ) -> Vec<InjectionHandle> {
        let mut handles = Vec::with_capacity(segments.len());
        for &segment_id in segments {
            let queue = self.get_queue(segment_id);
            let (injected_tx, injected_rx) = oneshot::channel();
            let (inject_over_tx, inject_over_rx) = oneshot::channel();
            let injection = TaskInjection {
                injected_tx,
                inject_over_rx,
                post_injection: post_injection.clone(),
            };
            if queue.inject_tx.send(injection).await.is_err() {
                warn!(segment_id, "inject queue closed");
            }
            handles.push(InjectionHandle {
                segment_id,
                injected_rx,
                inject_over_tx: Some(inject_over_tx),
            });
        }
        handles
    }

    async fn build_insert_job(
        &self,
        buf: &InsertBuffer,
        flushed: bool,
        dropped: bool,
    ) -> Result<InsertFlushJob> {
        let (collection_id, partition_id) = (buf.collection_id, buf.partition_id);
        let segment_id = buf.segment_id;

        let column_count = 3 + buf.fields.len();
        let (start, _) = self.allocator.alloc_id_batch(column_count as u32).await?;
        let mut logidx = start;
        let mut job = InsertFlushJob {
            flushed,
            dropped,
            ..InsertFlushJob::default()
        };

        let mut push_column = |job: &mut InsertFlushJob, field_id: FieldId, blob: Bytes, idx: i64| {
            let path = format!(
                "{}/{collection_id}/{partition_id}/{segment_id}/{field_id}/{idx}",
                self.config.insert_log_root
            );
            job.insert_logs.insert(field_id, path.clone());
            job.blobs.push((path, blob));
        };

        push_column(
            &mut job,
            ROW_ID_FIELD,
            codec::encode_i64_column(collection_id, partition_id, segment_id, ROW_ID_FIELD, &buf.row_ids),
            logidx,
        );
        logidx += 1;

        let timestamps: Vec<i64> = buf.timestamps.iter().map(|t| *t as i64).collect();
        push_column(
            &mut job,
            TIMESTAMP_FIELD,
            codec::encode_i64_column(collection_id, partition_id, segment_id, TIMESTAMP_FIELD, &timestamps),
            logidx,
        );
        logidx += 1;

        let pk_logidx = logidx;
        push_column(
            &mut job,
            PRIMARY_KEY_FIELD,
            codec::encode_i64_column(collection_id, partition_id, segment_id, PRIMARY_KEY_FIELD, &buf.primary_keys),
            logidx,
        );
        logidx += 1;

        for (field_id, column) in &buf.fields {
            push_column(
                &mut job,
                *field_id,
                codec::encode_bytes_column(collection_id, partition_id, segment_id, *field_id, column),
                logidx,
            );
            logidx += 1;
        }

        // Primary-key statistics ride along as the stats log.
        let stats = buf.pk_statistics();
        let stats_blob = Bytes::from(serde_json::to_vec(&stats).unwrap_or_default());
        let stats_path = format!(
            "{}/{collection_id}/{partition_id}/{segment_id}/{PRIMARY_KEY_FIELD}/{pk_logidx}",
            self.config.stats_log_root
        );
        job.stats_logs.insert(PRIMARY_KEY_FIELD, stats_path.clone());
        job.blobs.push((stats_path, stats_blob));

        Ok(job)
    }

    async fn build_delete_job(
        &self,
        segment_id: SegmentId,
        buf: &DeleteBuffer,
    ) -> Result<DeleteFlushJob> {
        let (collection_id, partition_id) = self.replica.collection_and_partition(segment_id)?;
        let entries = buf.entries();
        let blob = codec::encode_delta_log(collection_id, partition_id, segment_id, &entries);
        let logidx = self.allocator.alloc_id().await?;
        let path = format!(
            "{}/{collection_id}/{partition_id}/{segment_id}/{logidx}",
            self.config.delta_log_root
        );
        Ok(DeleteFlushJob {
            delta_logs: vec![DeltaLogInfo {
                record_entries: entries.len() as u64,
                timestamp_from: buf.ts_from,
                timestamp_to: buf.ts_to,
                delta_log_path: path.clone(),
                delta_log_size: blob.len() as u64,
            }],
            blobs: vec![(path, blob)],
        })
    }

    /// Tear down every queue. In-flight rendezvous are released; their
    /// runners exit without reporting.
    pub fn close(&self) {
        let mut queues = self.queues.lock().unwrap();
        for queue in queues.values() {
            queue.close();
        }
        queues.clear();
        debug!("flush manager closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::time::Duration;

    struct RecordingNotifier {
        packs: Mutex<Vec<FlushPack>>,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                packs: Mutex::new(Vec::new()),
            })
        }

        fn packs(&self) -> Vec<FlushPack> {
            self.packs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FlushNotifier for RecordingNotifier {
        async fn notify(&self, pack: FlushPack) {
            self.packs.lock().unwrap().push(pack);
        }
    }

    // A minimal local allocator so the unit tests need no coordinator.
    struct SeqAllocator(std::sync::atomic::AtomicI64);

    #[async_trait]
    impl Allocator for SeqAllocator {
        async fn alloc_id_batch(
            &self,
            count: u32,
        ) -> vectorstream_core::Result<(i64, i64)> {
            let start = self
                .0
                .fetch_add(count as i64, std::sync::atomic::Ordering::SeqCst);
            Ok((start, start + count as i64))
        }

        async fn alloc_timestamp(&self) -> vectorstream_core::Result<u64> {
            Ok(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) as u64)
        }
    }

    async fn manager(
        notifier: Arc<RecordingNotifier>,
    ) -> (Arc<RendezvousFlushManager>, Arc<SegmentReplica>) {
        let replica = Arc::new(SegmentReplica::new(1));
        let allocator = Arc::new(SeqAllocator(std::sync::atomic::AtomicI64::new(1)));
        let fm = Arc::new(RendezvousFlushManager::new(
            replica.clone(),
            Arc::new(InMemory::new()),
            allocator,
            notifier,
            NodeConfig::default(),
        ));
        (fm, replica)
    }

    fn pos(msg_id: u64) -> Position {
        Position::new("ch-0", msg_id, msg_id * 10)
    }

    async fn wait_for_packs(notifier: &RecordingNotifier, count: usize) {
        for _ in 0..500 {
            if notifier.packs().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "expected {count} packs, got {} after timeout",
            notifier.packs().len()
        );
    }

    // ---------------------------------------------------------------
    // Flush ordering
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_notify_order_is_strictly_monotonic_per_segment() {
        let notifier = RecordingNotifier::new();
        let (fm, _replica) = manager(notifier.clone()).await;

        const N: u64 = 24;
        // Insert halves in order, delete halves racing behind.
        let fm2 = fm.clone();
        let inserts = tokio::spawn(async move {
            for i in 1..=N {
                fm2.flush_buffer_data(None, 7, false, false, &pos(i)).await.unwrap();
            }
        });
        let fm3 = fm.clone();
        let deletes = tokio::spawn(async move {
            for i in 1..=N {
                if i % 3 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                fm3.flush_delete_data(None, 7, &pos(i)).await.unwrap();
            }
        });
        inserts.await.unwrap();
        deletes.await.unwrap();

        wait_for_packs(&notifier, N as usize).await;
        let msg_ids: Vec<u64> = notifier.packs().iter().map(|p| p.position.msg_id).collect();
        let mut sorted = msg_ids.clone();
        sorted.sort_unstable();
        assert_eq!(msg_ids, sorted, "notify order must be monotonic");
        assert_eq!(msg_ids.len(), N as usize);
    }

    #[tokio::test]
    async fn test_duplicate_submission_executes_once() {
        let notifier = RecordingNotifier::new();
        let (fm, _replica) = manager(notifier.clone()).await;

        fm.flush_buffer_data(None, 7, true, false, &pos(1)).await.unwrap();
        // Same position again: ignored.
        fm.flush_buffer_data(None, 7, false, false, &pos(1)).await.unwrap();
        fm.flush_delete_data(None, 7, &pos(1)).await.unwrap();

        wait_for_packs(&notifier, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let packs = notifier.packs();
        assert_eq!(packs.len(), 1);
        assert!(packs[0].flushed, "first submission's flags win");
    }

    // ---------------------------------------------------------------
    // Injection barrier
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_injection_blocks_later_flushes_until_release() {
        let notifier = RecordingNotifier::new();
        let (fm, _replica) = manager(notifier.clone()).await;

        let mut handles = fm.inject_flush(&[7], None).await;
        let mut handle = handles.pop().unwrap();
        assert!(handle.wait_injected().await);

        // Flush submitted after the barrier is held.
        fm.flush_buffer_data(None, 7, false, false, &pos(1)).await.unwrap();
        fm.flush_delete_data(None, 7, &pos(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            notifier.packs().is_empty(),
            "no pack may be notified while the barrier is held"
        );

        handle.release();
        wait_for_packs(&notifier, 1).await;
    }

    #[tokio::test]
    async fn test_injection_waits_for_running_tasks() {
        let notifier = RecordingNotifier::new();
        let (fm, _replica) = manager(notifier.clone()).await;

        // A task with only one half submitted keeps the queue busy.
        fm.flush_buffer_data(None, 7, false, false, &pos(1)).await.unwrap();

        let mut handles = fm.inject_flush(&[7], None).await;
        let mut handle = handles.pop().unwrap();
        let injected = tokio::time::timeout(Duration::from_millis(30), handle.wait_injected()).await;
        assert!(injected.is_err(), "injection must wait for the running task");

        // Complete the rendezvous; the injection takes the barrier next.
        fm.flush_delete_data(None, 7, &pos(1)).await.unwrap();
        assert!(handle.wait_injected().await);
        wait_for_packs(&notifier, 1).await;
        handle.release();
    }

    #[tokio::test]
    async fn test_injection_under_load_leaves_a_clean_gap() {
        let notifier = RecordingNotifier::new();
        let (fm, _replica) = manager(notifier.clone()).await;

        // Five tasks in flight: insert halves submitted, delete halves
        // for the last two withheld so the queue stays busy.
        for i in 1..=5u64 {
            fm.flush_buffer_data(None, 7, false, false, &pos(i)).await.unwrap();
        }
        for i in 1..=3u64 {
            fm.flush_delete_data(None, 7, &pos(i)).await.unwrap();
        }

        let mut handles = fm.inject_flush(&[7], None).await;
        let mut handle = handles.pop().unwrap();

        // Release the stragglers; the injection fires after all five.
        fm.flush_delete_data(None, 7, &pos(4)).await.unwrap();
        fm.flush_delete_data(None, 7, &pos(5)).await.unwrap();
        assert!(handle.wait_injected().await);
        // The last pre-injection notify may still be completing when the
        // barrier engages; it belongs before the gap.
        wait_for_packs(&notifier, 5).await;

        // Work submitted during the critical section stays blocked.
        for i in 6..=8u64 {
            fm.flush_buffer_data(None, 7, false, false, &pos(i)).await.unwrap();
            fm.flush_delete_data(None, 7, &pos(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(notifier.packs().len(), 5);

        handle.release();
        wait_for_packs(&notifier, 8).await;
        let msg_ids: Vec<u64> = notifier.packs().iter().map(|p| p.position.msg_id).collect();
        assert_eq!(msg_ids, (1..=8).collect::<Vec<u64>>());
    }

    // ---------------------------------------------------------------
    // Segment independence
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_injection_does_not_block_other_segments() {
        let notifier = RecordingNotifier::new();
        let (fm, _replica) = manager(notifier.clone()).await;

        let mut handles = fm.inject_flush(&[7], None).await;
        let mut handle = handles.pop().unwrap();
        assert!(handle.wait_injected().await);

        fm.flush_buffer_data(None, 8, false, false, &pos(1)).await.unwrap();
        fm.flush_delete_data(None, 8, &pos(1)).await.unwrap();
        wait_for_packs(&notifier, 1).await;
        assert_eq!(notifier.packs()[0].segment_id, 8);

        handle.release();
    }

    // ---------------------------------------------------------------
    // Post-injection
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_post_injection_applies_to_later_packs() {
        let notifier = RecordingNotifier::new();
        let (fm, _replica) = manager(notifier.clone()).await;

        let post: PostInjectionFn = Arc::new(|pack| {
            pack.segment_id = -pack.segment_id;
        });
        let mut handles = fm.inject_flush(&[7], Some(post)).await;
        let mut handle = handles.pop().unwrap();
        assert!(handle.wait_injected().await);
        handle.release();

        fm.flush_buffer_data(None, 7, false, false, &pos(1)).await.unwrap();
        fm.flush_delete_data(None, 7, &pos(1)).await.unwrap();
        wait_for_packs(&notifier, 1).await;
        assert_eq!(notifier.packs()[0].segment_id, -7);
    }
}
