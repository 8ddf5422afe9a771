//! HTTP metrics via the `metrics` facade with a Prometheus exporter.
//!
//! Three series are recorded for every request, labeled by `status` and
//! `route`: a request counter, an error counter for non-2xx responses, and a
//! duration histogram.

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const REQUESTS_TOTAL: &str = "http_requests_total";
pub const ERRORS_TOTAL: &str = "http_errors_total";
pub const REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 60.0, 300.0, 1200.0,
];

/// Install the process-global Prometheus recorder and return the handle the
/// `/__metrics` endpoint renders from. Call once at startup.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(REQUEST_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()?;
    metrics::describe_counter!(REQUESTS_TOTAL, "Total number of HTTP requests");
    metrics::describe_counter!(
        ERRORS_TOTAL,
        "Total number of responses with a status outside 2xx"
    );
    metrics::describe_histogram!(REQUEST_DURATION_SECONDS, "Duration of all HTTP requests");
    Ok(handle)
}

/// axum middleware recording the three request series.
pub async fn track_http(request: Request, next: Next) -> Response {
    let route = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let labels = [
        ("status", status.as_u16().to_string()),
        ("route", route),
    ];
    metrics::counter!(REQUESTS_TOTAL, &labels).increment(1);
    if !status.is_success() {
        metrics::counter!(ERRORS_TOTAL, &labels).increment(1);
    }
    metrics::histogram!(REQUEST_DURATION_SECONDS, &labels).record(start.elapsed().as_secs_f64());
    response
}
