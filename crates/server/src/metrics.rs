//! Prometheus metrics for the gateway.
//!
//! Each [`MetricsRecorder`] owns its registry so several gateways (for
//! example in tests) can coexist in one process. The `/metrics` route
//! requires the API key like every other non-health route.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

/// Content type of the text exposition format.
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Fixed request-duration bucket boundaries, in seconds.
pub const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Request counters and latency histogram.
#[derive(Clone)]
pub struct MetricsRecorder {
    registry: Registry,
    requests_total: IntCounter,
    responses_2xx: IntCounter,
    responses_3xx: IntCounter,
    responses_4xx: IntCounter,
    responses_5xx: IntCounter,
    bytes_served: IntCounter,
    request_duration: Histogram,
    audit_dropped: IntCounter,
    digest_hits: IntCounter,
    digest_misses: IntCounter,
}

impl MetricsRecorder {
    /// Create and register all metrics.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let requests_total = counter("requests_total", "Total requests handled")?;
        let responses_2xx = counter("responses_2xx_total", "Responses with a 2xx status")?;
        let responses_3xx = counter("responses_3xx_total", "Responses with a 3xx status")?;
        let responses_4xx = counter("responses_4xx_total", "Responses with a 4xx status")?;
        let responses_5xx = counter("responses_5xx_total", "Responses with a 5xx status")?;
        let bytes_served = counter("bytes_served_total", "Response body bytes served")?;
        let audit_dropped = counter(
            "audit_records_dropped_total",
            "Audit records dropped because the writer queue was full",
        )?;
        let digest_hits = counter(
            "digest_cache_hits_total",
            "Digest lookups answered from the cache",
        )?;
        let digest_misses = counter(
            "digest_cache_misses_total",
            "Digest lookups that hashed the file",
        )?;

        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "request_duration_seconds",
                "Time from request receipt to response headers",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            responses_2xx,
            responses_3xx,
            responses_4xx,
            responses_5xx,
            bytes_served,
            request_duration,
            audit_dropped,
            digest_hits,
            digest_misses,
        })
    }

    /// Record one finished request.
    pub fn observe(&self, status: u16, duration_secs: f64, bytes_served: u64) {
        self.requests_total.inc();
        match status {
            200..=299 => self.responses_2xx.inc(),
            300..=399 => self.responses_3xx.inc(),
            400..=499 => self.responses_4xx.inc(),
            500..=599 => self.responses_5xx.inc(),
            _ => {}
        }
        self.bytes_served.inc_by(bytes_served);
        self.request_duration.observe(duration_secs.max(0.0));
    }

    pub fn record_digest_lookup(&self, cache_hit: bool) {
        if cache_hit {
            self.digest_hits.inc();
        } else {
            self.digest_misses.inc();
        }
    }

    /// Counter the audit trail increments when it drops a record.
    pub fn audit_dropped_counter(&self) -> IntCounter {
        self.audit_dropped.clone()
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.get()
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
