//! Metrics collection for the consensus node
//!
//! Collectors live in a process wide registry and are served as prometheus
//! text on `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Entries handed to the state machine
    pub static ref APPLIED_COUNTER: Counter =
        Counter::new("applied_entries", "committed entries applied to the state machine").unwrap();

    /// Proposals by outcome
    pub static ref PROPOSAL_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("proposals", "proposals submitted to the raft node"),
        &["outcome"]
    )
    .unwrap();

    /// Times this node gained or lost leadership
    pub static ref LEADER_CHANGE_COUNTER: Counter =
        Counter::new("leader_changes", "leadership transitions of this node").unwrap();

    /// Snapshots by origin (taken locally or installed from the leader)
    pub static ref SNAPSHOT_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("snapshots", "snapshots taken or installed"),
        &["kind"]
    )
    .unwrap();

    /// Last index applied to the state machine
    pub static ref APPLIED_INDEX_GAUGE: IntGauge =
        IntGauge::new("applied_index", "last applied log index").unwrap();

    /// Time spent in `StateMachine::apply`
    pub static ref APPLY_HISTOGRAM: Histogram = Histogram::with_opts(HistogramOpts::new(
        "apply_cost",
        "state machine apply cost in seconds"
    ))
    .unwrap();
}

static INIT: Once = Once::new();

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    INIT.call_once(|| {
        let _ = REGISTRY_INSTANCE.register(Box::new(APPLIED_COUNTER.clone()));
        let _ = REGISTRY_INSTANCE.register(Box::new(PROPOSAL_COUNTER_VEC.clone()));
        let _ = REGISTRY_INSTANCE.register(Box::new(LEADER_CHANGE_COUNTER.clone()));
        let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOT_COUNTER_VEC.clone()));
        let _ = REGISTRY_INSTANCE.register(Box::new(APPLIED_INDEX_GAUGE.clone()));
        let _ = REGISTRY_INSTANCE.register(Box::new(APPLY_HISTOGRAM.clone()));
    });
}

/// Renders every registered metric in the prometheus text format
pub fn gather_text() -> crate::Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY_INSTANCE.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(buffer)
}

pub fn proposal(outcome: &str) {
    PROPOSAL_COUNTER_VEC.with_label_values(&[outcome]).inc();
}

pub fn snapshot(kind: &str) {
    SNAPSHOT_COUNTER_VEC.with_label_values(&[kind]).inc();
}
