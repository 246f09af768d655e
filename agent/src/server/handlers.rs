//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backup::catalog::{BackupQuery, CatalogStats};
use crate::command::coordinator::{CommandConnection, ConnectionState};
use crate::deploy::orchestrator::OrchestratorStatus;
use crate::errors::DeployError;
use crate::models::backup::BackupRecord;
use crate::models::deployment::{DeploymentRecord, TriggerParams, WebhookDecision};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error body returned by every handler
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

/// A [`DeployError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub DeployError);

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DeployError::ValidationError(_) | DeployError::UnknownOperation(_) => {
                StatusCode::BAD_REQUEST
            }
            DeployError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployError::DuplicateTask(_) => StatusCode::CONFLICT,
            DeployError::Capacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DeployError::Permission(_) => StatusCode::FORBIDDEN,
            DeployError::Integrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy` when every command connection is up, `degraded` otherwise
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_secs: i64,
}

pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let healthy = state
        .coordinator
        .connections()
        .iter()
        .all(|c| c.state == ConnectionState::Connected);
    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        service: "confdeploy".to_string(),
        version: version_info().version,
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

pub async fn status_handler(State(state): State<Arc<ServerState>>) -> Json<OrchestratorStatus> {
    Json(state.orchestrator.status())
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DeploymentsResponse {
    pub deployments: Vec<DeploymentRecord>,
    pub total: usize,
}

/// Recent deployments, newest first
pub async fn deployments_handler(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<DeploymentsResponse>, ApiError> {
    let deployments = state
        .orchestrator
        .history(params.limit.unwrap_or(50))
        .await?;
    Ok(Json(DeploymentsResponse {
        total: deployments.len(),
        deployments,
    }))
}

pub async fn deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentRecord>, ApiError> {
    let record = state
        .orchestrator
        .deployment(&id)
        .await?
        .ok_or_else(|| DeployError::NotFound(format!("deployment {}", id)))?;
    Ok(Json(record))
}

/// Response to a trigger
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub deployment_id: String,
}

pub async fn trigger_handler(
    State(state): State<Arc<ServerState>>,
    Json(params): Json<TriggerParams>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let deployment_id = state.orchestrator.trigger_deployment(params).await?;
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { deployment_id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    pub requested_by: Option<String>,
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    // the body is optional
    let request: RollbackRequest = if body.is_empty() {
        RollbackRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| DeployError::ValidationError(format!("rollback request: {}", e)))?
    };
    let requested_by = request.requested_by.as_deref().unwrap_or("api");
    let deployment_id = state.orchestrator.trigger_rollback(&id, requested_by).await?;
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { deployment_id })))
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub deployment_id: Option<String>,
}

pub async fn webhook_handler(
    State(state): State<Arc<ServerState>>,
    Json(decision): Json<WebhookDecision>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let deployment_id = state.orchestrator.handle_webhook(decision).await?;
    Ok(Json(WebhookResponse { deployment_id }))
}

#[derive(Debug, Serialize)]
pub struct BackupsResponse {
    pub backups: Vec<BackupRecord>,
    pub total: usize,
    pub stats: CatalogStats,
}

pub async fn backups_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<BackupQuery>,
) -> Result<Json<BackupsResponse>, ApiError> {
    let backups = state
        .backups
        .as_ref()
        .ok_or_else(|| DeployError::NotFound("backups are disabled".to_string()))?;
    let page = backups.list_backups(&query).await;
    Ok(Json(BackupsResponse {
        backups: page.backups,
        total: page.total,
        stats: backups.stats().await,
    }))
}

pub async fn connections_handler(
    State(state): State<Arc<ServerState>>,
) -> Json<Vec<CommandConnection>> {
    Json(state.coordinator.connections())
}
