use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Channel metrics
    pub static ref REQUESTS_RECEIVED: IntCounter = IntCounter::new(
        "image_requests_total",
        "Total number of image analysis requests received"
    ).unwrap();

    pub static ref IMAGES_FLAGGED: IntCounter = IntCounter::new(
        "images_flagged_total",
        "Total number of images whose verdict was flagged"
    ).unwrap();

    pub static ref FETCH_FAILURES: IntCounter = IntCounter::new(
        "image_fetch_failures_total",
        "Total number of images that could not be fetched or decoded"
    ).unwrap();

    pub static ref NOT_READY_RETRIES: IntCounter = IntCounter::new(
        "not_ready_retries_total",
        "Total number of analysis calls deferred because models were loading"
    ).unwrap();

    // Model metrics
    pub static ref MODELS_READY: IntGauge = IntGauge::new(
        "models_ready",
        "Number of detection models loaded and warmed up"
    ).unwrap();

    pub static ref STAGE_RUNS: IntCounterVec = IntCounterVec::new(
        Opts::new("cascade_stage_runs_total", "Total number of executions per cascade stage"),
        &["stage"]
    ).unwrap();

    pub static ref STAGE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "cascade_stage_duration_seconds",
            "Model execution latency per cascade stage in seconds"
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["stage"]
    ).unwrap();

    // Cache metrics
    pub static ref CACHE_HITS: IntCounter = IntCounter::new(
        "verdict_cache_hits_total",
        "Total number of candidates skipped because a cache entry existed"
    ).unwrap();

    pub static ref CACHE_MISSES: IntCounter = IntCounter::new(
        "verdict_cache_misses_total",
        "Total number of candidates with no cache entry"
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(REQUESTS_RECEIVED.clone()),
        Box::new(IMAGES_FLAGGED.clone()),
        Box::new(FETCH_FAILURES.clone()),
        Box::new(NOT_READY_RETRIES.clone()),
        Box::new(MODELS_READY.clone()),
        Box::new(STAGE_RUNS.clone()),
        Box::new(STAGE_LATENCY.clone()),
        Box::new(CACHE_HITS.clone()),
        Box::new(CACHE_MISSES.clone()),
    ];

    for collector in collectors {
        // Already registered when called twice (tests)
        let _ = REGISTRY.register(collector);
    }

    tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
}

/// Get cache hit rate as a percentage
pub fn cache_hit_rate() -> f64 {
    let hits = CACHE_HITS.get() as f64;
    let misses = CACHE_MISSES.get() as f64;
    let total = hits + misses;

    if total == 0.0 {
        0.0
    } else {
        (hits / total) * 100.0
    }
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn observe_stage(&self, stage: &str) {
        STAGE_LATENCY
            .with_label_values(&[stage])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
