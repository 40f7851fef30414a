use std::time::Instant;

use http_body::SizeHint;
use hyper::{Method, StatusCode};
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    exponential_buckets, opts, register_counter_vec, register_histogram_vec, CounterVec,
    HistogramVec,
};

const HTTP_LABEL_NAMES: [&str; 3] = ["rule", "method", "status_code"];
const UPSTREAM_LABEL_NAMES: [&str; 1] = ["rule"];

static METRICS_PREFIX: OnceCell<String> = OnceCell::new();

/// Sets the prefix of every metric name. Must run before the first metric is
/// recorded, later calls are ignored.
pub fn init_metrics_prefix(prefix: &str) {
    if METRICS_PREFIX.set(prefix.to_string()).is_err() {
        warn!("event='Metrics prefix already set'");
    }
}

/// Update HTTP metrics with a newly processed request.
#[inline(always)]
pub(crate) fn commit_http_metrics(
    rule: &str,
    method: &Method,
    start_time: &Instant,
    status_code: StatusCode,
    req_size: &SizeHint,
    res_size: &SizeHint,
) {
    let labels = [rule, method.as_str(), status_code.as_str()];
    HTTP_COUNTER.with_label_values(&labels).inc();

    HTTP_REQ_LAT_HISTOGRAM
        .with_label_values(&labels)
        .observe(start_time.elapsed().as_secs_f64());

    HTTP_REQ_SIZE_HISTOGRAM_LOW
        .with_label_values(&labels)
        .observe(req_size.lower() as f64);

    if let Some(size) = req_size.upper() {
        HTTP_REQ_SIZE_HISTOGRAM_HIGH
            .with_label_values(&labels)
            .observe(size as f64)
    }

    HTTP_RES_SIZE_HISTOGRAM_LOW
        .with_label_values(&labels)
        .observe(res_size.lower() as f64);

    if let Some(size) = res_size.upper() {
        HTTP_RES_SIZE_HISTOGRAM_HIGH
            .with_label_values(&labels)
            .observe(size as f64)
    }
}

pub(crate) fn commit_upstream_error(rule: &str) {
    UPSTREAM_ERROR_COUNTER.with_label_values(&[rule]).inc();
}

fn get_metric_name(name: &str) -> String {
    match METRICS_PREFIX.get() {
        Some(prefix) if !prefix.is_empty() => format!("gateway_{prefix}_http_{name}"),
        _ => format!("gateway_http_{name}"),
    }
}

static HTTP_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(get_metric_name("requests_total"), "Number of HTTP requests made."),
        &HTTP_LABEL_NAMES
    )
    .unwrap()
});

static HTTP_REQ_LAT_HISTOGRAM: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        get_metric_name("request_duration_seconds"),
        "The HTTP request latencies in seconds.",
        &HTTP_LABEL_NAMES
    )
    .unwrap()
});

static HTTP_REQ_SIZE_HISTOGRAM_LOW: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        get_metric_name("request_size_low_bytes"),
        "The HTTP request size in bytes (lower bound).",
        &HTTP_LABEL_NAMES,
        exponential_buckets(1.0, 2.0, 35).unwrap()
    )
    .unwrap()
});

static HTTP_REQ_SIZE_HISTOGRAM_HIGH: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        get_metric_name("request_size_high_bytes"),
        "The HTTP request size in bytes (upper bound).",
        &HTTP_LABEL_NAMES,
        exponential_buckets(1.0, 2.0, 35).unwrap()
    )
    .unwrap()
});

static HTTP_RES_SIZE_HISTOGRAM_LOW: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        get_metric_name("response_size_low_bytes"),
        "The HTTP response size in bytes (lower bound).",
        &HTTP_LABEL_NAMES,
        exponential_buckets(1.0, 2.0, 35).unwrap()
    )
    .unwrap()
});

static HTTP_RES_SIZE_HISTOGRAM_HIGH: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        get_metric_name("response_size_high_bytes"),
        "The HTTP response size in bytes (upper bound).",
        &HTTP_LABEL_NAMES,
        exponential_buckets(1.0, 2.0, 35).unwrap()
    )
    .unwrap()
});

static UPSTREAM_ERROR_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        get_metric_name("upstream_errors_total"),
        "Number of requests that could not reach their destination.",
        &UPSTREAM_LABEL_NAMES
    )
    .unwrap()
});
