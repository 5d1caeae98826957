//! Data node Prometheus metrics.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Flush packs written, by trigger (auto, flush, drop).
    pub static ref FLUSH_PACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("vectorstream_datanode_flush_packs_total", "Flush packs written"),
        &["trigger"]
    ).expect("metric can be created");

    /// Bytes uploaded to object storage by flushes.
    pub static ref FLUSH_BYTES_TOTAL: IntCounter = IntCounter::new(
        "vectorstream_datanode_flush_bytes_total",
        "Binlog bytes uploaded"
    ).expect("metric can be created");

    /// Injection barriers served.
    pub static ref INJECTIONS_TOTAL: IntCounter = IntCounter::new(
        "vectorstream_datanode_injections_total",
        "Flush-queue injections served"
    ).expect("metric can be created");

    /// Compaction plans executed by this node.
    pub static ref COMPACTIONS_TOTAL: IntCounter = IntCounter::new(
        "vectorstream_datanode_compactions_total",
        "Compaction plans executed"
    ).expect("metric can be created");
}

pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(FLUSH_PACKS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FLUSH_BYTES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(INJECTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(COMPACTIONS_TOTAL.clone()));
}
