//! ID and timestamp allocation backed by the meta KV.
//!
//! IDs are handed out from an in-memory window; extending the window is a
//! compare-and-swap on the persisted high-water mark, so a restart can
//! never reissue an ID. Timestamps are hybrid (wall millis + logical
//! counter) and likewise protected by a persisted ceiling: no timestamp
//! is issued past what is durable, so monotonicity survives a crash.
//!
//! Every KV failure surfaces as `AllocatorUnavailable`; callers report it
//! instead of stalling the flush pipeline.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use vectorstream_core::{
    compose_ts, ts_physical_ms, Allocator, Error, Result, Timestamp, UniqueId,
};
use vectorstream_meta::keys::{ALLOC_ID_KEY, ALLOC_TS_KEY};
use vectorstream_meta::MetaKv;

/// IDs reserved per window extension.
const ID_WINDOW_STEP: i64 = 1000;
/// Milliseconds of timestamp headroom persisted ahead of wall time.
const TS_CEILING_AHEAD_MS: i64 = 3_000;

pub struct KvTsoAllocator {
    kv: Arc<dyn MetaKv>,
    inner: Mutex<State>,
}

struct State {
    next_id: i64,
    id_window_end: i64,
    last_ts: Timestamp,
    ts_ceiling_ms: i64,
}

fn encode_mark(v: i64) -> Vec<u8> {
    v.to_string().into_bytes()
}

fn decode_mark(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn kv_err(e: vectorstream_meta::MetaError) -> Error {
    Error::AllocatorUnavailable(e.to_string())
}

impl KvTsoAllocator {
    pub async fn open(kv: Arc<dyn MetaKv>) -> Result<Self> {
        let persisted_id = kv
            .load(ALLOC_ID_KEY)
            .await
            .map_err(kv_err)?
            .and_then(|v| decode_mark(&v))
            .unwrap_or(1);
        let persisted_ceiling = kv
            .load(ALLOC_TS_KEY)
            .await
            .map_err(kv_err)?
            .and_then(|v| decode_mark(&v))
            .unwrap_or(0);

        let now_ms = chrono::Utc::now().timestamp_millis();
        let start_ms = now_ms.max(persisted_ceiling);
        Ok(Self {
            kv,
            inner: Mutex::new(State {
                next_id: persisted_id,
                id_window_end: persisted_id,
                last_ts: compose_ts(start_ms, 0),
                ts_ceiling_ms: persisted_ceiling,
            }),
        })
    }

    async fn extend_id_window(&self, state: &mut State, need: i64) -> Result<()> {
        loop {
            let current = state.id_window_end;
            let new_end = current.max(state.next_id) + need.max(ID_WINDOW_STEP);
            let expect = if current > 1 {
                Some(encode_mark(current))
            } else {
                // Fresh store: the mark may not exist yet.
                self.kv.load(ALLOC_ID_KEY).await.map_err(kv_err)?
            };
            let swapped = self
                .kv
                .compare_and_swap(ALLOC_ID_KEY, expect.as_deref(), encode_mark(new_end))
                .await
                .map_err(kv_err)?;
            if swapped {
                debug!(from = state.id_window_end, to = new_end, "ID window extended");
                state.id_window_end = new_end;
                return Ok(());
            }
            // Someone else moved the mark; restart above it.
            let reloaded = self
                .kv
                .load(ALLOC_ID_KEY)
                .await
                .map_err(kv_err)?
                .and_then(|v| decode_mark(&v))
                .ok_or_else(|| Error::AllocatorUnavailable("ID mark vanished".into()))?;
            state.next_id = reloaded;
            state.id_window_end = reloaded;
        }
    }
}

#[async_trait]
impl Allocator for KvTsoAllocator {
    async fn alloc_id_batch(&self, count: u32) -> Result<(UniqueId, UniqueId)> {
        let count = count.max(1) as i64;
        let mut state = self.inner.lock().await;
        if state.next_id + count > state.id_window_end {
            self.extend_id_window(&mut state, count).await?;
        }
        let start = state.next_id;
        state.next_id += count;
        Ok((start, start + count))
    }

    async fn alloc_timestamp(&self) -> Result<Timestamp> {
        let mut state = self.inner.lock().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let candidate = if now_ms > ts_physical_ms(state.last_ts) {
            compose_ts(now_ms, 0)
        } else {
            state.last_ts + 1
        };
        // Never issue past the durable ceiling.
        if ts_physical_ms(candidate) + 1_000 > state.ts_ceiling_ms {
            let new_ceiling = ts_physical_ms(candidate) + TS_CEILING_AHEAD_MS;
            self.kv
                .save(ALLOC_TS_KEY, encode_mark(new_ceiling))
                .await
                .map_err(kv_err)?;
            state.ts_ceiling_ms = new_ceiling;
        }
        state.last_ts = candidate;
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vectorstream_meta::MemoryMetaKv;

    #[tokio::test]
    async fn test_batches_are_contiguous_and_disjoint() {
        let alloc = KvTsoAllocator::open(Arc::new(MemoryMetaKv::new())).await.unwrap();
        let (s1, e1) = alloc.alloc_id_batch(10).await.unwrap();
        let (s2, e2) = alloc.alloc_id_batch(5).await.unwrap();
        assert_eq!(e1 - s1, 10);
        assert_eq!(e2 - s2, 5);
        assert!(s2 >= e1);
    }

    #[tokio::test]
    async fn test_ids_survive_restart_without_reissue() {
        let kv = Arc::new(MemoryMetaKv::new());
        let issued_end = {
            let alloc = KvTsoAllocator::open(kv.clone()).await.unwrap();
            alloc.alloc_id_batch(10).await.unwrap().1
        };
        let alloc = KvTsoAllocator::open(kv).await.unwrap();
        let (start, _) = alloc.alloc_id_batch(1).await.unwrap();
        assert!(start >= issued_end);
    }

    #[tokio::test]
    async fn test_timestamps_strictly_monotonic() {
        let alloc = KvTsoAllocator::open(Arc::new(MemoryMetaKv::new())).await.unwrap();
        let mut last = 0;
        for _ in 0..1000 {
            let ts = alloc.alloc_timestamp().await.unwrap();
            assert!(ts > last);
            last = ts;
        }
    }

    #[tokio::test]
    async fn test_kv_failure_surfaces_as_unavailable() {
        let kv = Arc::new(MemoryMetaKv::new());
        let alloc = KvTsoAllocator::open(kv.clone()).await.unwrap();
        kv.set_fail_writes(true);
        // Exhaust nothing: the very first batch needs a window extension.
        let err = alloc.alloc_id_batch(1).await.unwrap_err();
        assert!(matches!(err, Error::AllocatorUnavailable(_)));
    }
}
