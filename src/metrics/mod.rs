//! Metric families.
//!
//! The concrete backend is treated as an opaque registry: this module only
//! defines *which* counters/gauges/histograms exist and what labels they
//! carry, backed by OpenTelemetry's `Meter`/`Counter`/`Histogram`/
//! `UpDownCounter` instrument model (the same choice `rama-http`'s
//! `RequestMetricsLayer` makes for its own HTTP metrics).
//!
//! Every family name is `<instance_name>_<suffix>`, and every point carries
//! a `source` label that defaults to the instance name — overriding it lets
//! several instances share one dashboard.

pub mod client;
pub mod server;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Default histogram bucket boundaries (seconds) for response-delay metrics,
/// used when a caller doesn't supply its own via `enable_metrics`.
pub const DEFAULT_DELAY_BUCKETS_SECONDS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.19, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Default histogram bucket boundaries (bytes) for message-size metrics.
pub const DEFAULT_SIZE_BUCKETS_BYTES: &[f64] = &[
    64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0,
];

/// Identifies an instance for metric naming/labeling purposes.
#[derive(Debug, Clone)]
pub struct MetricsSource {
    pub instance_name: String,
    pub source_label: String,
}

impl MetricsSource {
    pub fn new(instance_name: impl Into<String>, source_label: Option<String>) -> Self {
        let instance_name = instance_name.into();
        let source_label = source_label.unwrap_or_else(|| instance_name.clone());
        MetricsSource {
            instance_name,
            source_label,
        }
    }

    pub(crate) fn family(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.instance_name)
    }

    pub(crate) fn source_kv(&self) -> KeyValue {
        KeyValue::new("source", self.source_label.clone())
    }
}

pub(crate) fn counter(meter: &Meter, name: String, description: &'static str) -> Counter<u64> {
    meter.u64_counter(name).with_description(description).build()
}

pub(crate) fn delay_histogram(meter: &Meter, name: String) -> Histogram<f64> {
    meter
        .f64_histogram(name)
        .with_description("response delay, in seconds, from reception to write")
        .with_unit("s")
        .build()
}

pub(crate) fn size_histogram(meter: &Meter, name: String) -> Histogram<u64> {
    meter
        .u64_histogram(name)
        .with_description("message body size, in bytes")
        .with_unit("By")
        .build()
}

/// Boundaries requested for a histogram family, kept around so an embedder
/// assembling its own `SdkMeterProvider` can register a matching `View`
/// (OpenTelemetry has no way to set per-instrument boundaries through the
/// `Meter` API itself).
#[derive(Debug, Clone, Default)]
pub struct HistogramBuckets {
    pub delay_seconds: Vec<f64>,
    pub size_bytes: Vec<f64>,
}

impl HistogramBuckets {
    pub fn new(delay_seconds: Vec<f64>, size_bytes: Vec<f64>) -> Self {
        HistogramBuckets {
            delay_seconds,
            size_bytes,
        }
    }
}
