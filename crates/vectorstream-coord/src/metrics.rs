//! Coordinator Prometheus metrics.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Coordinator metrics registry.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Segments sealed, by cause (policy rule or explicit flush).
    pub static ref SEGMENTS_SEALED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("vectorstream_datacoord_segments_sealed_total", "Segments sealed"),
        &["cause"]
    ).expect("metric can be created");

    /// Flush reports accepted via SaveBinlogPaths.
    pub static ref FLUSH_REPORTS_TOTAL: IntCounter = IntCounter::new(
        "vectorstream_datacoord_flush_reports_total",
        "Accepted SaveBinlogPaths reports"
    ).expect("metric can be created");

    /// Flush reports rejected, by reason.
    pub static ref FLUSH_REPORTS_REJECTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "vectorstream_datacoord_flush_reports_rejected_total",
            "Rejected SaveBinlogPaths reports"
        ),
        &["reason"]
    ).expect("metric can be created");

    /// Segments that reached the Flushed state.
    pub static ref SEGMENTS_FLUSHED_TOTAL: IntCounter = IntCounter::new(
        "vectorstream_datacoord_segments_flushed_total",
        "Segments transitioned to Flushed"
    ).expect("metric can be created");

    /// Compaction plans submitted to data nodes.
    pub static ref COMPACTION_PLANS_TOTAL: IntCounter = IntCounter::new(
        "vectorstream_datacoord_compaction_plans_total",
        "Compaction plans dispatched"
    ).expect("metric can be created");

    /// GetFlushedSegments lookups that found no meta record and assumed
    /// the segment was compacted away. A rising rate here means meta loss.
    pub static ref FLUSHED_LOOKUP_MISSING_META_TOTAL: IntCounter = IntCounter::new(
        "vectorstream_datacoord_flushed_lookup_missing_meta_total",
        "Flushed-segment lookups with no meta record"
    ).expect("metric can be created");
}

/// Register every coordinator metric with the registry. Safe to call once.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(SEGMENTS_SEALED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FLUSH_REPORTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FLUSH_REPORTS_REJECTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SEGMENTS_FLUSHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(COMPACTION_PLANS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FLUSHED_LOOKUP_MISSING_META_TOTAL.clone()));
}
