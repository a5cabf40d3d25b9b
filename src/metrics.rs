//! Prometheus instrumentation for the orchestrator's block-append/rewind
//! lifecycle. Registered lazily the first time any metric is touched, the
//! same pattern the teacher's metrics module used with `lazy_static` —
//! rebuilt here on `once_cell::sync::Lazy` since that crate is already
//! pulled in for other global singletons ([`crate::telemetry::global_log_once`]).

use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

const RECOMPUTE_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static CLAIMTRIE_HEIGHT: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("claimtrie_height", "Current orchestrator height").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

pub static BLOCKS_APPENDED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("claimtrie_blocks_appended_total", "Total blocks appended").unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static REWINDS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("claimtrie_rewinds_total", "Total reset_height calls").unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static NAMES_TOUCHED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("claimtrie_names_touched_total", "Total names marked dirty in the trie").unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static FORK_SWEEPS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("claimtrie_fork_sweeps_total", "Total all-claims-in-merkle fork sweeps run").unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static TRIE_RECOMPUTE_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("claimtrie_trie_recompute_seconds", "Time spent recomputing the Merkle root per block")
        .buckets(RECOMPUTE_BUCKETS.to_vec());
    let histogram = Histogram::with_opts(opts).unwrap();
    REGISTRY.register(Box::new(histogram.clone())).ok();
    histogram
});

/// Render the registry in Prometheus text exposition format.
pub fn render() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).expect("prometheus encoding never fails");
    String::from_utf8(buf).expect("prometheus output is always valid UTF-8")
}
