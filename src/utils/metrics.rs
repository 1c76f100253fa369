use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global metrics collector for the application.
///
/// Tracks API usage, retries, model fallbacks, item outcomes and compositing
/// time. Thread-safe and can be shared across the application.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // API Metrics
    api_calls_total: AtomicUsize,
    api_calls_success: AtomicUsize,
    api_calls_failed: AtomicUsize,
    api_tokens_input: AtomicU64,
    api_tokens_output: AtomicU64,
    api_latency_ms: RwLock<Vec<u64>>,

    // Resilience Metrics
    retries: AtomicUsize,
    model_fallbacks: AtomicUsize,
    calls_per_model: DashMap<String, AtomicUsize>,

    // Run Metrics
    runs_started: AtomicUsize,
    runs_cancelled: AtomicUsize,
    batches_processed: AtomicUsize,
    items_succeeded: AtomicUsize,
    items_failed: AtomicUsize,
    compositing_ms: RwLock<Vec<u64>>,

    // Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                api_calls_total: AtomicUsize::new(0),
                api_calls_success: AtomicUsize::new(0),
                api_calls_failed: AtomicUsize::new(0),
                api_tokens_input: AtomicU64::new(0),
                api_tokens_output: AtomicU64::new(0),
                api_latency_ms: RwLock::new(Vec::new()),
                retries: AtomicUsize::new(0),
                model_fallbacks: AtomicUsize::new(0),
                calls_per_model: DashMap::new(),
                runs_started: AtomicUsize::new(0),
                runs_cancelled: AtomicUsize::new(0),
                batches_processed: AtomicUsize::new(0),
                items_succeeded: AtomicUsize::new(0),
                items_failed: AtomicUsize::new(0),
                compositing_ms: RwLock::new(Vec::new()),
                start_time: Instant::now(),
            }),
        }
    }

    // API Metrics
    pub fn record_api_call(&self, success: bool, duration: Duration, input_tokens: u64, output_tokens: u64) {
        self.inner.api_calls_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.api_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.api_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.api_tokens_input.fetch_add(input_tokens, Ordering::Relaxed);
        self.inner.api_tokens_output.fetch_add(output_tokens, Ordering::Relaxed);
        self.inner.api_latency_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_model_call(&self, model: &str) {
        self.inner
            .calls_per_model
            .entry(model.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Resilience Metrics
    pub fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_model_fallback(&self) {
        self.inner.model_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    // Run Metrics
    pub fn record_run_started(&self) {
        self.inner.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_cancelled(&self) {
        self.inner.runs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_processed(&self) {
        self.inner.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item_outcome(&self, success: bool) {
        if success {
            self.inner.items_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.items_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_compositing(&self, duration: Duration) {
        self.inner.compositing_ms.write().push(duration.as_millis() as u64);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let api_latency = self.inner.api_latency_ms.read();
        let api_latency_avg = avg(&api_latency);
        let api_latency_p50 = percentile(&api_latency, 0.5);
        let api_latency_p95 = percentile(&api_latency, 0.95);
        drop(api_latency);

        let compositing_avg = avg(&self.inner.compositing_ms.read());

        let mut calls_per_model: Vec<(String, usize)> = self
            .inner
            .calls_per_model
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        calls_per_model.sort();

        MetricsSnapshot {
            api_calls_total: self.inner.api_calls_total.load(Ordering::Relaxed),
            api_calls_success: self.inner.api_calls_success.load(Ordering::Relaxed),
            api_calls_failed: self.inner.api_calls_failed.load(Ordering::Relaxed),
            api_tokens_input: self.inner.api_tokens_input.load(Ordering::Relaxed),
            api_tokens_output: self.inner.api_tokens_output.load(Ordering::Relaxed),
            api_latency_avg_ms: api_latency_avg,
            api_latency_p50_ms: api_latency_p50,
            api_latency_p95_ms: api_latency_p95,
            retries: self.inner.retries.load(Ordering::Relaxed),
            model_fallbacks: self.inner.model_fallbacks.load(Ordering::Relaxed),
            calls_per_model,
            runs_started: self.inner.runs_started.load(Ordering::Relaxed),
            runs_cancelled: self.inner.runs_cancelled.load(Ordering::Relaxed),
            batches_processed: self.inner.batches_processed.load(Ordering::Relaxed),
            items_succeeded: self.inner.items_succeeded.load(Ordering::Relaxed),
            items_failed: self.inner.items_failed.load(Ordering::Relaxed),
            compositing_avg_ms: compositing_avg,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP api_calls_total Total number of generation API calls made
# TYPE api_calls_total counter
api_calls_total {{}} {}

# HELP api_calls_success Number of successful API calls
# TYPE api_calls_success counter
api_calls_success {{}} {}

# HELP api_calls_failed Number of failed API calls
# TYPE api_calls_failed counter
api_calls_failed {{}} {}

# HELP api_latency_avg_ms Average API latency in milliseconds
# TYPE api_latency_avg_ms gauge
api_latency_avg_ms {{}} {}

# HELP generation_retries_total Retries after retryable failures
# TYPE generation_retries_total counter
generation_retries_total {{}} {}

# HELP model_fallbacks_total Switches to the next candidate model
# TYPE model_fallbacks_total counter
model_fallbacks_total {{}} {}

# HELP runs_started_total Generation runs started
# TYPE runs_started_total counter
runs_started_total {{}} {}

# HELP runs_cancelled_total Generation runs cancelled
# TYPE runs_cancelled_total counter
runs_cancelled_total {{}} {}

# HELP batches_processed_total Batches processed
# TYPE batches_processed_total counter
batches_processed_total {{}} {}

# HELP items_total Items that reached a terminal state
# TYPE items_total counter
items_total {{outcome="success"}} {}
items_total {{outcome="error"}} {}

# HELP compositing_avg_ms Average compositing time in milliseconds
# TYPE compositing_avg_ms gauge
compositing_avg_ms {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.api_calls_total,
            snapshot.api_calls_success,
            snapshot.api_calls_failed,
            snapshot.api_latency_avg_ms,
            snapshot.retries,
            snapshot.model_fallbacks,
            snapshot.runs_started,
            snapshot.runs_cancelled,
            snapshot.batches_processed,
            snapshot.items_succeeded,
            snapshot.items_failed,
            snapshot.compositing_avg_ms,
            snapshot.uptime_seconds,
        );

        if !snapshot.calls_per_model.is_empty() {
            out.push_str("\n# HELP model_calls_total Calls per candidate model\n# TYPE model_calls_total counter\n");
            for (model, count) in &snapshot.calls_per_model {
                out.push_str(&format!("model_calls_total {{model=\"{}\"}} {}\n", model, count));
            }
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub api_calls_total: usize,
    pub api_calls_success: usize,
    pub api_calls_failed: usize,
    pub api_tokens_input: u64,
    pub api_tokens_output: u64,
    pub api_latency_avg_ms: u64,
    pub api_latency_p50_ms: u64,
    pub api_latency_p95_ms: u64,
    pub retries: usize,
    pub model_fallbacks: usize,
    pub calls_per_model: Vec<(String, usize)>,
    pub runs_started: usize,
    pub runs_cancelled: usize,
    pub batches_processed: usize,
    pub items_succeeded: usize,
    pub items_failed: usize,
    pub compositing_avg_ms: u64,
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
