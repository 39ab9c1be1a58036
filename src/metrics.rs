//! Metrics emission via an explicit registry.
//!
//! Counters, gauges and histograms are emitted as structured events through
//! a sink. The default sink logs via `tracing`; tests install a capturing
//! sink. The registry is constructed once at process start and handed by
//! reference to each component, so independent instances never share hidden
//! global state and tests can observe any number of registries in isolation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

/// Default sink that logs metric events under the `metrics` target.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) => {
                tracing::info!(target: "metrics", metric = event.name, value, labels = ?event.labels);
            }
            MetricValue::Gauge(value) => {
                tracing::info!(target: "metrics", metric = event.name, value, labels = ?event.labels);
            }
            MetricValue::Histogram(value) => {
                tracing::info!(target: "metrics", metric = event.name, value, labels = ?event.labels);
            }
        }
    }
}

/// Handle to the metrics registry. Cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    sink: Arc<dyn MetricSink>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Metrics")
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn label(key: &'static str, value: impl Into<String>) -> MetricLabel {
    MetricLabel {
        key,
        value: value.into(),
    }
}

impl Metrics {
    pub fn new(sink: Arc<dyn MetricSink>) -> Self {
        Metrics { sink }
    }

    pub fn with_tracing() -> Self {
        Metrics::new(Arc::new(TracingSink))
    }

    fn emit(&self, name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
        self.sink.record(MetricEvent {
            name,
            value,
            labels,
        });
    }

    pub fn janitor_running(&self, running: bool) {
        self.emit(
            "janitor_running",
            MetricValue::Gauge(u64::from(running)),
            Vec::new(),
        );
    }

    pub fn janitor_duration(&self, duration: Duration) {
        self.emit(
            "janitor_duration_ms",
            MetricValue::Histogram(duration_ms(duration)),
            Vec::new(),
        );
    }

    pub fn job_duration(&self, job: &'static str, ok: bool, duration: Duration) {
        self.emit(
            "janitor_job_duration_ms",
            MetricValue::Histogram(duration_ms(duration)),
            vec![label("job", job), label("success", ok.to_string())],
        );
    }

    pub fn repo_removed(&self, reason: &str) {
        self.emit(
            "repos_removed",
            MetricValue::Counter(1),
            vec![label("reason", reason)],
        );
    }

    pub fn repo_recloned(&self) {
        self.emit("repos_recloned", MetricValue::Counter(1), Vec::new());
    }

    pub fn repo_removed_disk_pressure(&self) {
        self.emit(
            "repos_removed_disk_pressure",
            MetricValue::Counter(1),
            Vec::new(),
        );
    }

    pub fn non_existing_repo_removed(&self) {
        self.emit(
            "non_existing_repos_removed",
            MetricValue::Counter(1),
            Vec::new(),
        );
    }

    pub fn wrong_shard_repos(&self, count: u64, bytes: u64) {
        self.emit("repo_wrong_shard", MetricValue::Gauge(count), Vec::new());
        self.emit(
            "repo_wrong_shard_bytes",
            MetricValue::Gauge(bytes),
            Vec::new(),
        );
    }

    pub fn wrong_shard_repos_deleted(&self, count: u64) {
        self.emit(
            "repo_wrong_shard_deleted",
            MetricValue::Counter(count),
            Vec::new(),
        );
    }

    pub fn optimize_duration(&self, ok: bool, duration: Duration) {
        self.emit(
            "optimize_duration_ms",
            MetricValue::Histogram(duration_ms(duration)),
            vec![label("success", ok.to_string())],
        );
    }

    pub fn queue_depth(&self, queue: &'static str, depth: u64) {
        self.emit(
            "queue_depth",
            MetricValue::Gauge(depth),
            vec![label("queue", queue)],
        );
    }

    pub fn queue_wait(&self, queue: &'static str, duration: Duration) {
        self.emit(
            "queue_wait_ms",
            MetricValue::Histogram(duration_ms(duration)),
            vec![label("queue", queue)],
        );
    }

    pub fn queue_processing(&self, queue: &'static str, duration: Duration) {
        self.emit(
            "queue_processing_ms",
            MetricValue::Histogram(duration_ms(duration)),
            vec![label("queue", queue)],
        );
    }
}
