//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use durable_log::DurableLog;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sagas: Option<usize>,
}

/// GET /health
///
/// Reports `degraded` with 503 when the durable log cannot be read.
pub async fn check<L: DurableLog + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
) -> (StatusCode, Json<HealthResponse>) {
    match state.orchestrator.log().active_sagas().await {
        Ok(active) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                active_sagas: Some(active.len()),
            }),
        ),
        Err(error) => {
            tracing::warn!(%error, "durable log unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    active_sagas: None,
                }),
            )
        }
    }
}
