//! HTTP operator surface for the order saga orchestrator.
//!
//! Starts and inspects sagas, resumes interrupted ones, and exposes
//! health and Prometheus metrics. Structured logging comes from tracing.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use durable_log::DurableLog;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    InMemoryInventoryService, InMemoryNotificationService, InMemoryOrderActivities,
    InMemoryPaymentService, InMemoryShippingService, OrderActivities, SagaError, SagaOrchestrator,
    ShippingBehaviour, order_processing,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState<L> {
    pub orchestrator: SagaOrchestrator<L, InMemoryOrderActivities>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<L: DurableLog + Clone + 'static>(
    state: Arc<AppState<L>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<L>))
        .route("/sagas", post(routes::sagas::start::<L>))
        .route("/sagas/active", get(routes::sagas::active::<L>))
        .route("/sagas/{id}", get(routes::sagas::get::<L>))
        .route("/sagas/{id}/records", get(routes::sagas::records::<L>))
        .route("/sagas/{id}/resume", post(routes::sagas::resume::<L>))
        .route("/records", get(routes::sagas::records_of_type::<L>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates application state around an order-processing orchestrator.
pub fn create_state<L: DurableLog + Clone + 'static>(
    log: L,
    activities: InMemoryOrderActivities,
) -> Result<Arc<AppState<L>>, SagaError> {
    let orchestrator = SagaOrchestrator::new(log, activities, order_processing::definition())?;
    Ok(Arc::new(AppState { orchestrator }))
}

/// Creates the default application state with simulated collaborators.
pub fn create_default_state<L: DurableLog + Clone + 'static>(
    log: L,
    shipping: ShippingBehaviour,
) -> Result<Arc<AppState<L>>, SagaError> {
    let activities = OrderActivities::new(
        InMemoryPaymentService::new(),
        InMemoryInventoryService::new(),
        InMemoryShippingService::with_behaviour(shipping),
        InMemoryNotificationService::new(),
    );
    create_state(log, activities)
}

/// Resumes every unfinished saga in the background and logs the results.
pub fn spawn_recovery<L: DurableLog + Clone + 'static>(
    state: Arc<AppState<L>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match state.orchestrator.recover_all().await {
            Ok(results) => {
                for (saga_id, result) in results {
                    match result {
                        Ok(outcome) => tracing::info!(
                            %saga_id,
                            completed = outcome.is_completed(),
                            "recovered saga finished"
                        ),
                        Err(error) => tracing::error!(%saga_id, %error, "saga recovery failed"),
                    }
                }
            }
            Err(error) => tracing::error!(%error, "could not list sagas to recover"),
        }
    })
}
