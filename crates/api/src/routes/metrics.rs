//! Prometheus metrics endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics: returns Prometheus-formatted metrics.
pub async fn get(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}

/// Registers help texts for the orchestrator's metrics.
pub fn describe() {
    describe_counter!("saga_started_total", "Sagas started");
    describe_counter!("saga_completed_total", "Sagas that completed");
    describe_counter!("saga_failed_total", "Sagas that failed after compensation");
    describe_histogram!(
        "saga_duration_seconds",
        Unit::Seconds,
        "Time from start or resume to a terminal status"
    );
    describe_counter!("step_attempts_total", "Forward step attempts, by step");
    describe_counter!("step_retries_total", "Forward step retries, by step");
    describe_counter!(
        "step_heartbeat_stale_total",
        "Attempts cancelled for missing heartbeats, by step"
    );
    describe_counter!("compensation_failed_total", "Failed compensating actions, by step");
    describe_counter!("durable_log_appends_total", "Records appended to the durable log");
}
