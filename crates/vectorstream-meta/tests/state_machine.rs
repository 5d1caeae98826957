//! Randomized exercise of the segment state lattice: no sequence of
//! operations, sequential or concurrent, may produce a backwards state
//! transition in the meta store.

use std::sync::Arc;
use vectorstream_meta::{MemoryMetaKv, MetaError, SegmentInfo, SegmentMeta, SegmentState};

const STATES: [SegmentState; 5] = [
    SegmentState::Growing,
    SegmentState::Sealed,
    SegmentState::Flushing,
    SegmentState::Flushed,
    SegmentState::Dropped,
];

/// Tiny deterministic xorshift so the test needs no rng dependency.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

async fn seeded_meta(segments: i64) -> Arc<SegmentMeta> {
    let meta = Arc::new(SegmentMeta::open(Arc::new(MemoryMetaKv::new())).await.unwrap());
    for id in 1..=segments {
        meta.add_segment(SegmentInfo::new(id, 42, 7, "ch-0", 1000))
            .await
            .unwrap();
    }
    meta
}

#[tokio::test]
async fn test_sequential_random_transitions_never_reverse() {
    let meta = seeded_meta(4).await;
    let mut rng = XorShift(0x9E3779B97F4A7C15);

    for _ in 0..2000 {
        let segment_id = (rng.next() % 4 + 1) as i64;
        let target = STATES[(rng.next() % STATES.len() as u64) as usize];
        let before = meta.get_segment(segment_id).await.unwrap().state;

        match meta.set_state(segment_id, target).await {
            Ok(()) => {
                assert!(
                    before.can_transition_to(target),
                    "accepted illegal transition {before:?} -> {target:?}"
                );
                assert_eq!(meta.get_segment(segment_id).await.unwrap().state, target);
            }
            Err(MetaError::InvalidStateTransition { from, to, .. }) => {
                assert!(!from.can_transition_to(to));
                assert_eq!(meta.get_segment(segment_id).await.unwrap().state, before);
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}

#[tokio::test]
async fn test_concurrent_random_transitions_keep_lattice_invariants() {
    let meta = seeded_meta(6).await;

    let mut workers = Vec::new();
    for worker in 0..8u64 {
        let meta = meta.clone();
        workers.push(tokio::spawn(async move {
            let mut rng = XorShift(0xDEADBEEF ^ (worker + 1).wrapping_mul(0x2545F4914F6CDD1D));
            // Per segment: highest non-drop target we succeeded with,
            // and whether we ever succeeded dropping it.
            let mut max_reached = [0u8; 7];
            let mut dropped = [false; 7];
            for _ in 0..400 {
                let segment_id = (rng.next() % 6 + 1) as i64;
                let target = STATES[(rng.next() % STATES.len() as u64) as usize];
                if meta.set_state(segment_id, target).await.is_ok() {
                    let idx = segment_id as usize;
                    match target {
                        SegmentState::Dropped => dropped[idx] = true,
                        SegmentState::Growing => max_reached[idx] = max_reached[idx].max(0),
                        SegmentState::Sealed => max_reached[idx] = max_reached[idx].max(1),
                        SegmentState::Flushing => max_reached[idx] = max_reached[idx].max(2),
                        SegmentState::Flushed => max_reached[idx] = max_reached[idx].max(3),
                    }
                }
            }
            (max_reached, dropped)
        }));
    }

    let mut max_reached = [0u8; 7];
    let mut dropped = [false; 7];
    for worker in workers {
        let (reached, drops) = worker.await.unwrap();
        for id in 1..7 {
            max_reached[id] = max_reached[id].max(reached[id]);
            dropped[id] |= drops[id];
        }
    }

    for id in 1..=6i64 {
        let final_state = meta.get_segment(id).await.unwrap().state;
        if dropped[id as usize] {
            // Dropped is terminal: once anyone succeeded, it sticks.
            assert_eq!(final_state, SegmentState::Dropped, "segment {id}");
        } else {
            let final_index = match final_state {
                SegmentState::Growing => 0,
                SegmentState::Sealed => 1,
                SegmentState::Flushing => 2,
                SegmentState::Flushed => 3,
                SegmentState::Dropped => panic!("segment {id} dropped without a recorded drop"),
            };
            assert!(
                final_index >= max_reached[id as usize],
                "segment {id} went backwards: reached {} but ended at {final_index}",
                max_reached[id as usize]
            );
        }
    }
}
