//! Guarding cache of segment IDs currently flushing, so one seal
//! notification cannot enqueue the same flush twice.

use std::collections::HashSet;
use std::sync::Mutex;

use vectorstream_core::SegmentId;

#[derive(Default)]
pub struct FlushingCache {
    inner: Mutex<HashSet<SegmentId>>,
}

impl FlushingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the segment was already marked flushing.
    pub fn insert(&self, id: SegmentId) -> bool {
        self.inner.lock().unwrap().insert(id)
    }

    pub fn remove(&self, id: SegmentId) {
        self.inner.lock().unwrap().remove(&id);
    }

    pub fn contains(&self, id: SegmentId) -> bool {
        self.inner.lock().unwrap().contains(&id)
    }
}
