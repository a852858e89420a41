//! OpenTelemetry metrics for the forwarder
//!
//! - Forwarded requests (count, latency) per cluster and path kind
//! - Pipeline cache lookups and builds

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("trellis"));

/// Counter of forwarded requests
///
/// Labels:
/// - `cluster`: target cluster name
/// - `target`: kube, service
/// - `status`: success, client_error, server_error, failed
pub static FORWARD_REQUESTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("trellis_forward_requests_total")
        .with_description("Total number of forwarded requests")
        .with_unit("{requests}")
        .build()
});

/// Histogram of time until the downstream response headers arrive
///
/// Labels:
/// - `cluster`: target cluster name
/// - `target`: kube, service
pub static FORWARD_REQUEST_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("trellis_forward_request_duration_seconds")
        .with_description("Duration of forwarded requests up to response headers in seconds")
        .with_unit("s")
        .build()
});

/// Counter of pipeline cache lookups
///
/// Labels:
/// - `result`: hit, miss
pub static PIPELINE_CACHE_LOOKUPS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("trellis_pipeline_cache_lookups_total")
        .with_description("Total number of pipeline cache lookups")
        .with_unit("{lookups}")
        .build()
});

/// Counter of pipeline builds
///
/// Labels:
/// - `cluster`: target cluster name
/// - `result`: success, error
pub static PIPELINE_BUILDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("trellis_pipeline_builds_total")
        .with_description("Total number of forwarding pipeline builds")
        .with_unit("{builds}")
        .build()
});

/// Which kind of downstream a request was forwarded to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardTarget {
    /// The cluster's Kubernetes API server
    Kube,
    /// An in-cluster service
    Service,
}

impl ForwardTarget {
    /// Label value for this target
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardTarget::Kube => "kube",
            ForwardTarget::Service => "service",
        }
    }
}

/// Outcome of a forwarded request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardStatus {
    /// Downstream answered below 400
    Success,
    /// Downstream answered 4xx
    ClientError,
    /// Downstream answered 5xx
    ServerError,
    /// The forwarder could not obtain a response
    Failed,
}

impl ForwardStatus {
    /// Classify a downstream status code
    pub fn from_status_code(code: u16) -> Self {
        match code {
            400..=499 => ForwardStatus::ClientError,
            500..=599 => ForwardStatus::ServerError,
            _ => ForwardStatus::Success,
        }
    }

    /// Label value for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardStatus::Success => "success",
            ForwardStatus::ClientError => "client_error",
            ForwardStatus::ServerError => "server_error",
            ForwardStatus::Failed => "failed",
        }
    }
}

/// Timer for a single forwarded request
pub struct ForwardTimer {
    cluster: String,
    target: ForwardTarget,
    start: std::time::Instant,
}

impl ForwardTimer {
    /// Start timing a forwarded request
    pub fn start(cluster: impl Into<String>, target: ForwardTarget) -> Self {
        Self {
            cluster: cluster.into(),
            target,
            start: std::time::Instant::now(),
        }
    }

    /// Record the outcome and elapsed time
    pub fn complete(self, status: ForwardStatus) {
        let duration = self.start.elapsed().as_secs_f64();

        FORWARD_REQUESTS.add(
            1,
            &[
                KeyValue::new("cluster", self.cluster.clone()),
                KeyValue::new("target", self.target.as_str()),
                KeyValue::new("status", status.as_str()),
            ],
        );

        FORWARD_REQUEST_DURATION.record(
            duration,
            &[
                KeyValue::new("cluster", self.cluster),
                KeyValue::new("target", self.target.as_str()),
            ],
        );
    }
}

/// Record a pipeline cache lookup
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    PIPELINE_CACHE_LOOKUPS.add(1, &[KeyValue::new("result", result)]);
}

/// Record a pipeline build attempt
pub fn record_pipeline_build(cluster: &str, success: bool) {
    let result = if success { "success" } else { "error" };
    PIPELINE_BUILDS.add(
        1,
        &[
            KeyValue::new("cluster", cluster.to_string()),
            KeyValue::new("result", result),
        ],
    );
}
