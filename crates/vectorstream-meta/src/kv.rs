//! Meta KV Contract
//!
//! The coordinator persists all of its metadata through this narrow
//! key-value contract: linearizable reads and writes, an atomic multi-key
//! save (one flush report updates the segment record, channel checkpoint
//! and any new start positions in a single commit), compare-and-swap for
//! the allocator's high-water marks, and a prefix scan for startup
//! rebuild.
//!
//! Two implementations ship: [`MemoryMetaKv`] for tests and
//! [`crate::SqliteMetaKv`] for single-process deployments. A distributed
//! KV (etcd and friends) would implement the same trait.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::error::{MetaError, Result};

#[async_trait]
pub trait MetaKv: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Scan every `(key, value)` whose key starts with `prefix`, in key order.
    async fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    async fn save(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Atomically write every pair; either all land or none do.
    async fn multi_save(&self, kvs: Vec<(String, Vec<u8>)>) -> Result<()>;

    /// Atomically write `saves` and delete `removals`.
    async fn multi_save_and_remove(
        &self,
        saves: Vec<(String, Vec<u8>)>,
        removals: Vec<String>,
    ) -> Result<()>;

    /// Write `value` only if the current value equals `expect`
    /// (`None` = key absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expect: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory KV used by unit and integration tests.
#[derive(Default)]
pub struct MemoryMetaKv {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryMetaKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StorageUnavailable`;
    /// used to exercise the transient-error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MetaError::StorageUnavailable("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetaKv for MemoryMetaKv {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.lock().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn save(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        self.data.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn multi_save(&self, kvs: Vec<(String, Vec<u8>)>) -> Result<()> {
        self.check_writable()?;
        let mut data = self.data.lock().await;
        for (k, v) in kvs {
            data.insert(k, v);
        }
        Ok(())
    }

    async fn multi_save_and_remove(
        &self,
        saves: Vec<(String, Vec<u8>)>,
        removals: Vec<String>,
    ) -> Result<()> {
        self.check_writable()?;
        let mut data = self.data.lock().await;
        for (k, v) in saves {
            data.insert(k, v);
        }
        for k in removals {
            data.remove(&k);
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expect: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool> {
        self.check_writable()?;
        let mut data = self.data.lock().await;
        let current = data.get(key).map(|v| v.as_slice());
        if current == expect {
            data.insert(key.to_string(), value);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.data.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_scan_returns_only_matching_keys() {
        let kv = MemoryMetaKv::new();
        kv.save("segment/1/2/3", b"a".to_vec()).await.unwrap();
        kv.save("segment/1/2/4", b"b".to_vec()).await.unwrap();
        kv.save("channel-cp/ch-0", b"c".to_vec()).await.unwrap();

        let scanned = kv.load_with_prefix("segment/").await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert!(scanned.iter().all(|(k, _)| k.starts_with("segment/")));
    }

    #[tokio::test]
    async fn test_compare_and_swap_semantics() {
        let kv = MemoryMetaKv::new();
        // Absent key: expect None succeeds, expect Some fails.
        assert!(kv.compare_and_swap("k", None, b"1".to_vec()).await.unwrap());
        assert!(!kv.compare_and_swap("k", None, b"2".to_vec()).await.unwrap());
        assert!(!kv
            .compare_and_swap("k", Some(b"0"), b"2".to_vec())
            .await
            .unwrap());
        assert!(kv
            .compare_and_swap("k", Some(b"1"), b"2".to_vec())
            .await
            .unwrap());
        assert_eq!(kv.load("k").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let kv = MemoryMetaKv::new();
        kv.set_fail_writes(true);
        assert!(matches!(
            kv.save("k", vec![]).await,
            Err(MetaError::StorageUnavailable(_))
        ));
        kv.set_fail_writes(false);
        kv.save("k", vec![1]).await.unwrap();
    }
}
