//! Router, handlers, and shared state for the HTTP API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::error;
use uuid::Uuid;

use tally_core::{
    Category, Error, FactOverrides, JobHandle, NewTransaction, TransactionRecord,
};
use tally_db::Storage;
use tally_jobs::Producer;

/// Generates time-ordered UUIDv7 request correlation ids, so request ids in
/// logs sort chronologically.
#[derive(Clone, Default)]
pub struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub producer: Producer,
    /// Whether a worker pool is draining the queue in this process.
    pub worker_active: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(storage: Storage, worker_active: bool) -> Self {
        let producer = Producer::new(storage.jobs.clone(), storage.transactions.clone());
        Self {
            storage,
            producer,
            worker_active: Arc::new(AtomicBool::new(worker_active)),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

pub enum ApiError {
    Internal(Error),
    NotFound(String),
    BadRequest(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match &err {
            Error::NotFound(msg) => ApiError::NotFound(msg.clone()),
            Error::TransactionNotFound(id) => {
                ApiError::NotFound(format!("Transaction {id} not found"))
            }
            Error::JobNotFound(id) => ApiError::NotFound(format!("Job {id} not found")),
            Error::InvalidInput(msg) => ApiError::BadRequest(msg.clone()),
            _ => ApiError::Internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Internal(err) => {
                error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

/// Pull the calling org out of the `X-Org-Id` header.
fn org_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get("x-org-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing X-Org-Id header".to_string()))?;
    raw.parse()
        .map_err(|_| ApiError::BadRequest("X-Org-Id must be a UUID".to_string()))
}

// =============================================================================
// REQUEST / RESPONSE SHAPES
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionRequest {
    pub description: String,
    pub amount: f64,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionResponse {
    pub transaction: TransactionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobHandle>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorizeResponse {
    pub job_id: Uuid,
    pub transaction_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCategorizeRequest {
    pub transaction_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCategorizeResponse {
    pub queued_transactions: usize,
    pub jobs: Vec<JobHandle>,
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn create_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateTransactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let org_id = org_id(&headers)?;
    if req.description.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "description must be non-empty".to_string(),
        ));
    }
    if !req.amount.is_finite() {
        return Err(ApiError::BadRequest(
            "amount must be a finite number".to_string(),
        ));
    }

    let had_category = req.category.is_some();
    let record = state
        .storage
        .transactions
        .insert(NewTransaction {
            org_id,
            description: req.description,
            amount: req.amount,
            merchant: req.merchant,
            occurred_at: req.occurred_at,
            category: req.category,
            metadata: req.metadata,
        })
        .await?;

    // Already-categorized transactions skip the pipeline.
    let job = if had_category {
        None
    } else {
        state.producer.on_transaction_created(&record).await
    };

    Ok((
        StatusCode::CREATED,
        Json(CreateTransactionResponse {
            transaction: record,
            job,
        }),
    ))
}

async fn get_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let org_id = org_id(&headers)?;
    match state.storage.transactions.get(id).await? {
        Some(record) if record.org_id == org_id => Ok(Json(record)),
        _ => Err(ApiError::NotFound(format!("Transaction {id} not found"))),
    }
}

async fn categorize_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    overrides: Option<Json<FactOverrides>>,
) -> Result<impl IntoResponse, ApiError> {
    let org_id = org_id(&headers)?;
    let overrides = overrides.map(|Json(o)| o).unwrap_or_default();
    let handle = state.producer.categorize_one(org_id, id, overrides).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CategorizeResponse {
            job_id: handle.job_id,
            transaction_id: handle.transaction_id,
            status: "queued",
        }),
    ))
}

async fn bulk_categorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BulkCategorizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let org_id = org_id(&headers)?;
    let jobs = state
        .producer
        .categorize_many(org_id, &req.transaction_ids)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(BulkCategorizeResponse {
            queued_transactions: jobs.len(),
            jobs,
        }),
    ))
}

async fn queue_status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let active = state.worker_active.load(Ordering::Relaxed);
    let status = state.producer.queue_status(active).await?;
    Ok(Json(status))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tally-api",
    }))
}

// =============================================================================
// ROUTER
// =============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/transactions", post(create_transaction))
        .route("/api/v1/transactions/:id", get(get_transaction))
        .route(
            "/api/v1/transactions/:id/categorize",
            post(categorize_transaction),
        )
        .route("/api/v1/transactions/bulk-categorize", post(bulk_categorize))
        .route("/api/v1/queue/status", get(queue_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .with_state(state)
}
