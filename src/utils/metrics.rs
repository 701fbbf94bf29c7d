use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global metrics collector for the application.
///
/// Tracks queue throughput, inference latency, ledger outcomes, and more.
/// Thread-safe and can be shared across the application.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Queue throughput
    images_enqueued: AtomicUsize,
    images_rejected: AtomicUsize,
    items_done: AtomicUsize,
    items_failed: AtomicUsize,
    batches_started: AtomicUsize,

    // Ledger outcomes
    credits_reserved: AtomicUsize,
    ledger_rejections: AtomicUsize,

    // Best-effort persistence
    persistence_failures: AtomicUsize,

    // Archive exports
    archives_built: AtomicUsize,

    // Inference latency samples (per finished item)
    inference_latency_ms: RwLock<Vec<u64>>,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    // Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                images_enqueued: AtomicUsize::new(0),
                images_rejected: AtomicUsize::new(0),
                items_done: AtomicUsize::new(0),
                items_failed: AtomicUsize::new(0),
                batches_started: AtomicUsize::new(0),
                credits_reserved: AtomicUsize::new(0),
                ledger_rejections: AtomicUsize::new(0),
                persistence_failures: AtomicUsize::new(0),
                archives_built: AtomicUsize::new(0),
                inference_latency_ms: RwLock::new(Vec::new()),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_images_enqueued(&self, count: usize) {
        self.inner.images_enqueued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_image_rejected(&self) {
        self.inner.images_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_started(&self, credits: u32) {
        self.inner.batches_started.fetch_add(1, Ordering::Relaxed);
        self.inner
            .credits_reserved
            .fetch_add(credits as usize, Ordering::Relaxed);
    }

    pub fn record_ledger_rejection(&self) {
        self.inner.ledger_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item_done(&self, inference: Duration) {
        self.inner.items_done.fetch_add(1, Ordering::Relaxed);
        self.inner
            .inference_latency_ms
            .write()
            .push(inference.as_millis() as u64);
    }

    pub fn record_item_failed(&self) {
        self.inner.items_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_failure(&self) {
        self.inner.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_archive_built(&self) {
        self.inner.archives_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.inner.inference_latency_ms.read();
        let latency_avg = avg(&latency);
        let latency_p50 = percentile(&latency, 0.5);
        let latency_p95 = percentile(&latency, 0.95);
        let latency_p99 = percentile(&latency, 0.99);
        drop(latency);

        MetricsSnapshot {
            images_enqueued: self.inner.images_enqueued.load(Ordering::Relaxed),
            images_rejected: self.inner.images_rejected.load(Ordering::Relaxed),
            items_done: self.inner.items_done.load(Ordering::Relaxed),
            items_failed: self.inner.items_failed.load(Ordering::Relaxed),
            batches_started: self.inner.batches_started.load(Ordering::Relaxed),
            credits_reserved: self.inner.credits_reserved.load(Ordering::Relaxed),
            ledger_rejections: self.inner.ledger_rejections.load(Ordering::Relaxed),
            persistence_failures: self.inner.persistence_failures.load(Ordering::Relaxed),
            archives_built: self.inner.archives_built.load(Ordering::Relaxed),
            inference_latency_avg_ms: latency_avg,
            inference_latency_p50_ms: latency_p50,
            inference_latency_p95_ms: latency_p95,
            inference_latency_p99_ms: latency_p99,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP images_enqueued_total Images accepted into the queue
# TYPE images_enqueued_total counter
images_enqueued_total {{}} {}

# HELP images_rejected_total Uploads rejected during preparation
# TYPE images_rejected_total counter
images_rejected_total {{}} {}

# HELP items_done_total Queue items finished successfully
# TYPE items_done_total counter
items_done_total {{}} {}

# HELP items_failed_total Queue items finished with an error
# TYPE items_failed_total counter
items_failed_total {{}} {}

# HELP batches_started_total Accepted batch starts
# TYPE batches_started_total counter
batches_started_total {{}} {}

# HELP credits_reserved_total Credits reserved against the usage ledger
# TYPE credits_reserved_total counter
credits_reserved_total {{}} {}

# HELP ledger_rejections_total Batch starts refused by the usage ledger
# TYPE ledger_rejections_total counter
ledger_rejections_total {{}} {}

# HELP persistence_failures_total Best-effort result uploads that failed
# TYPE persistence_failures_total counter
persistence_failures_total {{}} {}

# HELP archives_built_total Result archives bundled for download
# TYPE archives_built_total counter
archives_built_total {{}} {}

# HELP inference_latency_avg_ms Average per-item inference latency
# TYPE inference_latency_avg_ms gauge
inference_latency_avg_ms {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.images_enqueued,
            snapshot.images_rejected,
            snapshot.items_done,
            snapshot.items_failed,
            snapshot.batches_started,
            snapshot.credits_reserved,
            snapshot.ledger_rejections,
            snapshot.persistence_failures,
            snapshot.archives_built,
            snapshot.inference_latency_avg_ms,
            snapshot.uptime_seconds,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub images_enqueued: usize,
    pub images_rejected: usize,
    pub items_done: usize,
    pub items_failed: usize,
    pub batches_started: usize,
    pub credits_reserved: usize,
    pub ledger_rejections: usize,
    pub persistence_failures: usize,
    pub archives_built: usize,
    pub inference_latency_avg_ms: u64,
    pub inference_latency_p50_ms: u64,
    pub inference_latency_p95_ms: u64,
    pub inference_latency_p99_ms: u64,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_images_enqueued(5);
        metrics.record_batch_started(3);
        metrics.record_item_done(Duration::from_millis(120));
        metrics.record_item_done(Duration::from_millis(80));
        metrics.record_item_failed();
        metrics.record_ledger_rejection();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.images_enqueued, 5);
        assert_eq!(snapshot.batches_started, 1);
        assert_eq!(snapshot.credits_reserved, 3);
        assert_eq!(snapshot.items_done, 2);
        assert_eq!(snapshot.items_failed, 1);
        assert_eq!(snapshot.ledger_rejections, 1);
        assert_eq!(snapshot.inference_latency_avg_ms, 100);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_images_enqueued(2);
        metrics.record_batch_started(1);

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("images_enqueued_total {} 2"));
        assert!(prometheus.contains("batches_started_total {} 1"));
        assert!(prometheus.contains("credits_reserved_total {} 1"));
    }
}
