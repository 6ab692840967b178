//! Local HTTP surface over the instance-group operations.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::GroupError;
use crate::group::{InstanceGroup, MAX_SIZE};
use crate::readiness::ReadinessPolicy;

pub struct AppState {
    pub group: InstanceGroup,
    /// Root token; every request runs under a child of it.
    pub cancel: CancellationToken,
    pub readiness: ReadinessPolicy,
}

impl AppState {
    pub fn new(group: InstanceGroup, cancel: CancellationToken) -> Self {
        Self {
            group,
            cancel,
            readiness: ReadinessPolicy::default(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/instances", get(list_instances))
        .route("/instances/increase", post(increase))
        .route("/instances/decrease", post(decrease))
        .route("/instances/{name}/connect-info", get(connect_info))
        .route("/instances/{name}/wait-ready", post(wait_ready))
        .with_state(state)
}

enum ApiError {
    Group(GroupError),
    /// Rejected before it reaches the group.
    BadRequest(String),
}

impl From<GroupError> for ApiError {
    fn from(e: GroupError) -> Self {
        ApiError::Group(e)
    }
}

fn status_of(e: &GroupError) -> StatusCode {
    match e {
        e if e.is_config() => StatusCode::BAD_REQUEST,
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        GroupError::NotInitialized | GroupError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        GroupError::NoAddress(_) => StatusCode::CONFLICT,
        GroupError::ReadinessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": message, "retriable": false})),
            )
                .into_response(),
            ApiError::Group(e) => {
                let status = status_of(&e);
                if status.is_server_error() {
                    tracing::warn!("⚠️ [http] {}", e);
                }
                (
                    status,
                    Json(json!({"error": e.to_string(), "retriable": e.is_retriable()})),
                )
                    .into_response()
            }
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn info(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let info = state.group.provider_info().ok_or(GroupError::NotInitialized)?;
    Ok(Json(info.clone()))
}

async fn list_instances(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let cancel = state.cancel.child_token();
    Ok(Json(state.group.observe(&cancel).await?))
}

#[derive(Deserialize, Debug)]
struct IncreaseRequest {
    count: usize,
}

async fn increase(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IncreaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.count > MAX_SIZE {
        return Err(ApiError::BadRequest(format!(
            "count {} exceeds the group maximum of {}",
            req.count, MAX_SIZE
        )));
    }
    let cancel = state.cancel.child_token();
    Ok(Json(state.group.increase_with_report(req.count, &cancel).await?))
}

#[derive(Deserialize, Debug)]
struct DecreaseRequest {
    instances: Vec<String>,
}

async fn decrease(State(state): State<Arc<AppState>>, Json(req): Json<DecreaseRequest>) -> Response {
    let cancel = state.cancel.child_token();
    match state.group.decrease(&req.instances, &cancel).await {
        Ok(processed) => Json(json!({"processed": processed})).into_response(),
        Err(failure) => (
            status_of(&failure.source),
            Json(json!({
                "error": failure.to_string(),
                "processed": failure.processed,
                "remaining": failure.remaining,
            })),
        )
            .into_response(),
    }
}

async fn connect_info(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cancel = state.cancel.child_token();
    Ok(Json(state.group.connect_info(&name, &cancel).await?))
}

#[derive(Deserialize, Debug, Default)]
struct WaitQuery {
    timeout_secs: Option<u64>,
}

async fn wait_ready(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(q): Query<WaitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let cancel = state.cancel.child_token();
    let policy = match q.timeout_secs {
        Some(secs) => state.readiness.clone().with_timeout(Duration::from_secs(secs)),
        None => state.readiness.clone(),
    };
    Ok(Json(
        state
            .group
            .wait_for_connect_info(&name, &policy, &cancel)
            .await?,
    ))
}
