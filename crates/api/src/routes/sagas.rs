//! Saga start, inspection and recovery endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::SagaId;
use domain::{Aggregate, FailureInfo, SagaInstance, SagaOutcome, SagaStatus, StepRecord};
use durable_log::{DurableLog, LogQuery, LogRecord, RecordType};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct StartSagaRequest {
    pub order_id: String,
    /// Wait for the outcome instead of returning once the saga started.
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

/// Narrows the records of one saga.
#[derive(Deserialize)]
pub struct RecordFilter {
    #[serde(rename = "type")]
    pub record_type: Option<String>,
    pub step: Option<String>,
}

#[derive(Deserialize)]
pub struct RecordTypeQuery {
    #[serde(rename = "type")]
    pub record_type: String,
}

// -- Response types --

#[derive(Serialize)]
pub struct StartSagaResponse {
    pub saga_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SagaOutcome>,
}

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_id: String,
    pub saga_type: String,
    pub status: SagaStatus,
    pub steps: Vec<StepRecord>,
    pub failure: Option<FailureInfo>,
    pub failure_notified: Option<bool>,
    pub tracking_id: Option<String>,
    pub outcome: Option<SagaOutcome>,
    pub sequence: i64,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl SagaResponse {
    fn from_instance(saga_id: &SagaId, instance: &SagaInstance) -> Self {
        Self {
            saga_id: saga_id.to_string(),
            saga_type: instance.saga_type().to_string(),
            status: instance.status(),
            steps: instance.steps().to_vec(),
            failure: instance.failure().cloned(),
            failure_notified: instance.failure_notified(),
            tracking_id: instance.tracking_id().map(String::from),
            outcome: instance.outcome(),
            sequence: instance.sequence().as_i64(),
            created_at: instance.created_at().map(|t| t.to_rfc3339()),
            updated_at: instance.updated_at().map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
pub struct LogRecordResponse {
    pub record_id: String,
    pub saga_id: String,
    pub sequence: i64,
    pub record_type: String,
    pub step_name: Option<String>,
    pub timestamp: String,
    pub payload: serde_json::Value,
}

impl From<LogRecord> for LogRecordResponse {
    fn from(r: LogRecord) -> Self {
        Self {
            record_id: r.record_id.to_string(),
            saga_id: r.saga_id.to_string(),
            sequence: r.sequence.as_i64(),
            record_type: r.record_type.as_str().to_string(),
            step_name: r.step_name,
            timestamp: r.timestamp.to_rfc3339(),
            payload: r.payload,
        }
    }
}

#[derive(Serialize)]
pub struct ActiveSagasResponse {
    pub saga_ids: Vec<String>,
}

// -- Handlers --

/// POST /sagas: start the saga of an order.
///
/// Responds 200 with the outcome, or 202 right away when `wait` is false.
#[tracing::instrument(skip(state, req), fields(order_id = %req.order_id))]
pub async fn start<L: DurableLog + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<StartSagaResponse>), ApiError> {
    let saga_id = parse_saga_id(&req.order_id)?;
    let handle = state.orchestrator.spawn(saga_id.clone())?;

    if req.wait {
        // A client that disconnects stops waiting; the saga keeps running
        let outcome = handle.join().await?;
        return Ok((
            StatusCode::OK,
            Json(StartSagaResponse {
                saga_id: saga_id.to_string(),
                outcome: Some(outcome),
            }),
        ));
    }

    tokio::spawn(async move {
        let saga_id = handle.saga_id().clone();
        if let Err(error) = handle.join().await {
            tracing::error!(%saga_id, %error, "background saga aborted");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(StartSagaResponse {
            saga_id: saga_id.to_string(),
            outcome: None,
        }),
    ))
}

/// GET /sagas/active: sagas whose log has no terminal record yet.
#[tracing::instrument(skip(state))]
pub async fn active<L: DurableLog + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
) -> Result<Json<ActiveSagasResponse>, ApiError> {
    let active = state
        .orchestrator
        .log()
        .active_sagas()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(ActiveSagasResponse {
        saga_ids: active.iter().map(ToString::to_string).collect(),
    }))
}

/// GET /sagas/{id}: the saga's state, rebuilt from the log.
#[tracing::instrument(skip(state))]
pub async fn get<L: DurableLog + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let instance = state
        .orchestrator
        .get_saga(&saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;

    Ok(Json(SagaResponse::from_instance(&saga_id, &instance)))
}

/// GET /sagas/{id}/records: the saga's durable log.
///
/// `?type=StepHeartbeat` and `?step=shipOrder` narrow the listing.
#[tracing::instrument(skip(state, filter))]
pub async fn records<L: DurableLog + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
    Query(filter): Query<RecordFilter>,
) -> Result<Json<Vec<LogRecordResponse>>, ApiError> {
    let saga_id = parse_saga_id(&id)?;

    let records = if filter.record_type.is_none() && filter.step.is_none() {
        state.orchestrator.records(&saga_id).await?
    } else {
        let mut query = LogQuery::new();
        if let Some(record_type) = filter.record_type.as_deref() {
            query = query.record_type(parse_record_type(record_type)?);
        }
        if let Some(step) = filter.step {
            query = query.step_name(step);
        }
        state.orchestrator.query_records(&saga_id, query).await?
    };

    if records.is_empty() && !state.orchestrator.saga_exists(&saga_id).await? {
        return Err(ApiError::NotFound(format!("Saga {id} not found")));
    }

    Ok(Json(records.into_iter().map(LogRecordResponse::from).collect()))
}

/// GET /records?type=StepFailed: records of one type across every saga.
#[tracing::instrument(skip(state, query), fields(record_type = %query.record_type))]
pub async fn records_of_type<L: DurableLog + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Query(query): Query<RecordTypeQuery>,
) -> Result<Json<Vec<LogRecordResponse>>, ApiError> {
    let record_type = parse_record_type(&query.record_type)?;
    let records = state.orchestrator.records_of_type(record_type).await?;

    Ok(Json(records.into_iter().map(LogRecordResponse::from).collect()))
}

/// POST /sagas/{id}/resume: drive an interrupted saga to its end.
#[tracing::instrument(skip(state))]
pub async fn resume<L: DurableLog + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
) -> Result<Json<StartSagaResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let outcome = state.orchestrator.resume(saga_id.clone()).await?;

    Ok(Json(StartSagaResponse {
        saga_id: saga_id.to_string(),
        outcome: Some(outcome),
    }))
}

fn parse_record_type(name: &str) -> Result<RecordType, ApiError> {
    name.parse::<RecordType>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    let saga_id = SagaId::new(id.trim());
    if saga_id.is_blank() {
        return Err(ApiError::BadRequest("order_id must not be empty".to_string()));
    }
    Ok(saga_id)
}
