// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The operator HTTP API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mz_rotation::controller::ClusterView;
use mz_rotation::registry::ClusterSpec;
use mz_rotation::rollback::EmergencyRollbackReport;
use mz_rotation::{
    ClusterId, GroupId, RotationController, RotationError, RotationId, RotationStatus,
    StartRotation, StepOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

const GROUPS_PATH: &str = "/api/groups";
const GROUP_PATH: &str = "/api/groups/:group";
const ROTATIONS_PATH: &str = "/api/groups/:group/rotations";
const PROMOTE_PATH: &str = "/api/groups/:group/rotations/:rotation/promote";
const ROUTING_CONFIRMED_PATH: &str = "/api/groups/:group/rotations/:rotation/routing-confirmed";
const ROLLBACK_PATH: &str = "/api/groups/:group/rotations/:rotation/rollback";
const EMERGENCY_ROLLBACK_PATH: &str = "/api/groups/:group/rotations/:rotation/emergency-rollback";
const RESOLVE_FAULT_PATH: &str = "/api/groups/:group/fault/resolve";
const STEP_PATH: &str = "/api/groups/:group/step";
const CLUSTERS_PATH: &str = "/api/clusters";
const CLUSTER_PATH: &str = "/api/clusters/:cluster";
const METRICS_PATH: &str = "/metrics";

#[derive(Clone, Debug)]
pub struct AppState {
    pub controller: Arc<RotationController>,
    pub registry: prometheus::Registry,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(GROUPS_PATH, get(list_groups).post(register_group))
        .route(GROUP_PATH, get(group_status))
        .route(ROTATIONS_PATH, post(start_rotation))
        .route(PROMOTE_PATH, post(promote))
        .route(ROUTING_CONFIRMED_PATH, post(confirm_routing))
        .route(ROLLBACK_PATH, post(rollback))
        .route(EMERGENCY_ROLLBACK_PATH, post(emergency_rollback))
        .route(RESOLVE_FAULT_PATH, post(resolve_fault))
        .route(STEP_PATH, post(step))
        .route(CLUSTERS_PATH, get(list_clusters))
        .route(CLUSTER_PATH, get(cluster))
        .route(METRICS_PATH, get(metrics))
        .with_state(Arc::new(state))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
}

#[derive(Debug)]
struct ApiError(RotationError);

impl From<RotationError> for ApiError {
    fn from(err: RotationError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            RotationError::InvariantViolation(_)
            | RotationError::ConflictingMaster { .. }
            | RotationError::SplitBrainFault { .. }
            | RotationError::RotationInProgress { .. }
            | RotationError::StaleRotation { .. }
            | RotationError::InvalidState { .. }
            | RotationError::WritesPaused { .. } => StatusCode::CONFLICT,
            RotationError::InvalidWeight { .. } | RotationError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            RotationError::UnknownGroup(_) | RotationError::UnknownCluster(_) => {
                StatusCode::NOT_FOUND
            }
            RotationError::ExternalCallFailure { .. } => StatusCode::BAD_GATEWAY,
            RotationError::Timeout { .. } | RotationError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!("request failed: {err}");
        }
        let body = ErrorBody {
            error: err.kind(),
            message: err.to_string(),
            rule: err.rule().map(|r| r.to_string()),
            state: err.phase().map(|p| p.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct RegisterGroup {
    group: GroupId,
    service: String,
    master: ClusterSpec,
}

#[derive(Debug, Deserialize)]
struct ResolveFault {
    master: ClusterId,
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RotationStatus>>, ApiError> {
    let mut statuses = Vec::new();
    for group in state.controller.groups() {
        statuses.push(state.controller.status(&group).await?);
    }
    Ok(Json(statuses))
}

async fn register_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterGroup>,
) -> Result<Json<RotationStatus>, ApiError> {
    let status = state
        .controller
        .register_group(req.group, req.service, req.master)
        .await?;
    Ok(Json(status))
}

async fn group_status(
    State(state): State<Arc<AppState>>,
    Path(group): Path<GroupId>,
) -> Result<Json<RotationStatus>, ApiError> {
    Ok(Json(state.controller.status(&group).await?))
}

async fn start_rotation(
    State(state): State<Arc<AppState>>,
    Path(group): Path<GroupId>,
    Json(req): Json<StartRotation>,
) -> Result<Json<RotationStatus>, ApiError> {
    Ok(Json(state.controller.start_rotation(&group, req).await?))
}

async fn promote(
    State(state): State<Arc<AppState>>,
    Path((group, rotation)): Path<(GroupId, RotationId)>,
) -> Result<Json<RotationStatus>, ApiError> {
    Ok(Json(state.controller.promote(&group, rotation).await?))
}

async fn confirm_routing(
    State(state): State<Arc<AppState>>,
    Path((group, rotation)): Path<(GroupId, RotationId)>,
) -> Result<Json<RotationStatus>, ApiError> {
    Ok(Json(state.controller.confirm_routing(&group, rotation).await?))
}

async fn rollback(
    State(state): State<Arc<AppState>>,
    Path((group, rotation)): Path<(GroupId, RotationId)>,
) -> Result<Json<RotationStatus>, ApiError> {
    Ok(Json(state.controller.rollback(&group, rotation).await?))
}

async fn emergency_rollback(
    State(state): State<Arc<AppState>>,
    Path((group, rotation)): Path<(GroupId, RotationId)>,
) -> Result<Json<EmergencyRollbackReport>, ApiError> {
    Ok(Json(
        state.controller.emergency_rollback(&group, rotation).await?,
    ))
}

async fn resolve_fault(
    State(state): State<Arc<AppState>>,
    Path(group): Path<GroupId>,
    Json(req): Json<ResolveFault>,
) -> Result<Json<RotationStatus>, ApiError> {
    Ok(Json(state.controller.resolve_fault(&group, req.master).await?))
}

async fn step(
    State(state): State<Arc<AppState>>,
    Path(group): Path<GroupId>,
) -> Result<Json<StepOutcome>, ApiError> {
    Ok(Json(state.controller.step_group(&group).await?))
}

async fn list_clusters(State(state): State<Arc<AppState>>) -> Json<Vec<ClusterView>> {
    Json(state.controller.list_clusters().await)
}

async fn cluster(
    State(state): State<Arc<AppState>>,
    Path(cluster): Path<ClusterId>,
) -> Result<Json<ClusterView>, ApiError> {
    Ok(Json(state.controller.cluster(&cluster).await?))
}

#[allow(clippy::unused_async)]
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if let Err(err) = prometheus::Encoder::encode(&encoder, &state.registry.gather(), &mut buffer)
    {
        warn!("encoding metrics: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], buffer).into_response()
}
