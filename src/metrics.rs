//! Process-wide Prometheus metrics, registered once at startup and
//! shared via `Arc` by every component that emits a counter or gauge.
//!
//! Grounded on the metrics registries used across the enrichment pack
//! (e.g. `prometheus::Registry` + `IntCounterVec`/`Gauge` wiring behind an
//! axum `/metrics` endpoint); the teacher repo has no metrics layer of
//! its own, so this module is built from the pack's idiom rather than
//! generalized from teacher code.

use prometheus::{Encoder, Gauge, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct CaMetrics {
    pub registry: Registry,
    pub signature_count: IntCounterVec,
    pub sign_error_count: IntCounterVec,
    pub adopted_orphan_count: IntCounterVec,
    pub orphan_queue_depth: IntGauge,
    pub batcher_queue_depth: IntGauge,
    pub live_signing_inflight: IntGauge,
    pub ocsp_response_age_seconds: Gauge,
}

impl CaMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let signature_count = IntCounterVec::new(
            Opts::new("ca_signature_total", "Signatures produced, by purpose and issuer"),
            &["purpose", "issuer"],
        )
        .expect("metric definition");
        let sign_error_count = IntCounterVec::new(
            Opts::new("ca_sign_error_total", "Signing errors, labeled by kind"),
            &["label"],
        )
        .expect("metric definition");
        let adopted_orphan_count = IntCounterVec::new(
            Opts::new("ca_adopted_orphan_total", "Orphans successfully integrated, by artifact type"),
            &["type"],
        )
        .expect("metric definition");
        let orphan_queue_depth = IntGauge::new("ca_orphan_queue_depth", "Current depth of the durable orphan queue")
            .expect("metric definition");
        let batcher_queue_depth = IntGauge::new("ca_ocsp_batcher_queue_depth", "Current depth of the OCSP log batcher queue")
            .expect("metric definition");
        let live_signing_inflight = IntGauge::new(
            "ca_live_signing_inflight",
            "Number of live-signing OCSP operations currently holding a semaphore permit",
        )
        .expect("metric definition");
        let ocsp_response_age_seconds = Gauge::new(
            "ca_ocsp_cache_response_age_seconds",
            "Age of the most recently served cached OCSP response",
        )
        .expect("metric definition");

        registry.register(Box::new(signature_count.clone())).expect("register metric");
        registry.register(Box::new(sign_error_count.clone())).expect("register metric");
        registry.register(Box::new(adopted_orphan_count.clone())).expect("register metric");
        registry.register(Box::new(orphan_queue_depth.clone())).expect("register metric");
        registry.register(Box::new(batcher_queue_depth.clone())).expect("register metric");
        registry.register(Box::new(live_signing_inflight.clone())).expect("register metric");
        registry.register(Box::new(ocsp_response_age_seconds.clone())).expect("register metric");

        Self {
            registry,
            signature_count,
            sign_error_count,
            adopted_orphan_count,
            orphan_queue_depth,
            batcher_queue_depth,
            live_signing_inflight,
            ocsp_response_age_seconds,
        }
    }

    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf).expect("encode metrics");
        String::from_utf8(buf).expect("metrics are valid utf8")
    }
}

impl Default for CaMetrics {
    fn default() -> Self {
        Self::new()
    }
}
